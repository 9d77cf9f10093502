use crate::audit::{AuditRecord, AuditStore, NewAuditRecord};
use crate::errors::{QuotaError, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

/// Rows per multi-row statement; keeps bind parameters under SQLite's limit.
const ROWS_PER_STATEMENT: usize = 1000;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS quota_audit (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id      TEXT    NOT NULL UNIQUE,
    event_id        TEXT    NOT NULL,
    tenant_id       TEXT    NOT NULL,
    resource_key    TEXT    NOT NULL,
    tokens          INTEGER NOT NULL,
    tokens_consumed INTEGER NOT NULL,
    allowed         BOOLEAN NOT NULL,
    remaining       INTEGER NOT NULL,
    reason          TEXT    NOT NULL,
    policy_version  TEXT,
    process_path    TEXT    NOT NULL,
    trace_id        TEXT,
    client_ip       TEXT,
    user_agent      TEXT,
    latency_ms      INTEGER,
    timestamp       INTEGER NOT NULL,
    created_at      INTEGER NOT NULL
)
"#;

const CREATE_TENANT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_quota_audit_tenant_time ON quota_audit (tenant_id, timestamp)";

const INSERT_PREFIX: &str = "INSERT INTO quota_audit (request_id, event_id, tenant_id, resource_key, \
     tokens, tokens_consumed, allowed, remaining, reason, policy_version, process_path, trace_id, \
     client_ip, user_agent, latency_ms, timestamp, created_at) ";

/// Audit store on a SQLite database (`quota_audit` table).
#[derive(Debug, Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

impl SqliteAuditStore {
    /// Open (creating if needed) the database and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        info!("Audit store ready at {}", database_url);
        Ok(store)
    }

    pub async fn create_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_TENANT_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find_by_request_id(&self, request_id: &str) -> Result<Option<AuditRecord>> {
        let row = sqlx::query_as::<_, AuditRecord>("SELECT * FROM quota_audit WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn push_record(mut row: sqlx::query_builder::Separated<'_, '_, Sqlite, &'static str>, record: &NewAuditRecord, created_at: i64) {
    row.push_bind(record.request_id.clone())
        .push_bind(record.event_id.clone())
        .push_bind(record.tenant_id.clone())
        .push_bind(record.resource_key.clone())
        .push_bind(record.tokens)
        .push_bind(record.tokens_consumed)
        .push_bind(record.allowed)
        .push_bind(record.remaining)
        .push_bind(record.reason.clone())
        .push_bind(record.policy_version.clone())
        .push_bind(record.process_path.clone())
        .push_bind(record.trace_id.clone())
        .push_bind(record.client_ip.clone())
        .push_bind(record.user_agent.clone())
        .push_bind(record.latency_ms)
        .push_bind(record.timestamp)
        .push_bind(created_at);
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn existing_request_ids(&self, request_ids: &[String]) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();

        for chunk in request_ids.chunks(ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT request_id FROM quota_audit WHERE request_id IN (");
            let mut ids = query.separated(", ");
            for id in chunk {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");

            let found: Vec<(String,)> = query.build_query_as().fetch_all(&self.pool).await?;
            existing.extend(found.into_iter().map(|(id,)| id));
        }

        Ok(existing)
    }

    async fn insert_batch(&self, records: &[NewAuditRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let created_at = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(INSERT_PREFIX);
            query.push_values(chunk, |row, record| push_record(row, record, created_at));
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!("Inserted {} audit records", records.len());
        Ok(())
    }

    async fn insert_one(&self, record: &NewAuditRecord) -> Result<()> {
        let created_at = chrono::Utc::now().timestamp_millis();
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(INSERT_PREFIX);
        query.push_values(std::iter::once(record), |row, record| {
            push_record(row, record, created_at)
        });

        match query.build().execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(QuotaError::DuplicateRecord(record.request_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM quota_audit")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
