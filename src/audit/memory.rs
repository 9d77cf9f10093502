use crate::audit::{AuditRecord, AuditStore, NewAuditRecord};
use crate::errors::{QuotaError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// In-process audit store with the same uniqueness rule as the SQL table.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    rows: Mutex<HashMap<String, AuditRecord>>,
    next_id: Mutex<i64>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, request_id: &str) -> Option<AuditRecord> {
        self.rows.lock().get(request_id).cloned()
    }

    fn to_row(&self, record: &NewAuditRecord) -> AuditRecord {
        let mut next = self.next_id.lock();
        *next += 1;
        AuditRecord {
            id: *next,
            request_id: record.request_id.clone(),
            event_id: record.event_id.clone(),
            tenant_id: record.tenant_id.clone(),
            resource_key: record.resource_key.clone(),
            tokens: record.tokens,
            tokens_consumed: record.tokens_consumed,
            allowed: record.allowed,
            remaining: record.remaining,
            reason: record.reason.clone(),
            policy_version: record.policy_version.clone(),
            process_path: record.process_path.clone(),
            trace_id: record.trace_id.clone(),
            client_ip: record.client_ip.clone(),
            user_agent: record.user_agent.clone(),
            latency_ms: record.latency_ms,
            timestamp: record.timestamp,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn existing_request_ids(&self, request_ids: &[String]) -> Result<HashSet<String>> {
        let rows = self.rows.lock();
        Ok(request_ids
            .iter()
            .filter(|id| rows.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn insert_batch(&self, records: &[NewAuditRecord]) -> Result<()> {
        let mut rows = self.rows.lock();
        let mut seen = HashSet::new();
        for record in records {
            if rows.contains_key(&record.request_id) || !seen.insert(record.request_id.as_str()) {
                return Err(QuotaError::DuplicateRecord(record.request_id.clone()));
            }
        }
        for record in records {
            let row = self.to_row(record);
            rows.insert(record.request_id.clone(), row);
        }
        Ok(())
    }

    async fn insert_one(&self, record: &NewAuditRecord) -> Result<()> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&record.request_id) {
            return Err(QuotaError::DuplicateRecord(record.request_id.clone()));
        }
        let row = self.to_row(record);
        rows.insert(record.request_id.clone(), row);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.lock().len() as u64)
    }
}
