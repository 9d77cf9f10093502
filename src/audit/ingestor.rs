use crate::audit::{AuditStore, NewAuditRecord};
use crate::errors::{QuotaError, Result};
use crate::events::QuotaConsumedEvent;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What happened to one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// The bulk insert failed and records were written one at a time
    pub fell_back: bool,
}

/// Turns at-least-once event delivery into effectively-once storage.
///
/// A batch is acknowledged only when `ingest` returns `Ok`; redelivered
/// events are recognised by request id and dropped.
pub struct AuditIngestor {
    store: Arc<dyn AuditStore>,
}

impl AuditIngestor {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    pub async fn ingest(&self, events: &[QuotaConsumedEvent]) -> Result<IngestReport> {
        let started = Instant::now();
        let mut report = IngestReport {
            received: events.len(),
            ..IngestReport::default()
        };
        if events.is_empty() {
            return Ok(report);
        }

        // Same request repeated inside one batch: keep the first.
        let mut seen = HashSet::with_capacity(events.len());
        let mut unique = Vec::with_capacity(events.len());
        for event in events {
            if seen.insert(event.request_id.as_str()) {
                unique.push(NewAuditRecord::from(event));
            } else {
                report.duplicates += 1;
            }
        }

        let request_ids: Vec<String> = unique.iter().map(|r| r.request_id.clone()).collect();
        let existing = self.store.existing_request_ids(&request_ids).await?;

        let fresh: Vec<NewAuditRecord> = unique
            .into_iter()
            .filter(|r| !existing.contains(&r.request_id))
            .collect();
        report.duplicates += existing.len();

        if fresh.is_empty() {
            debug!("Audit batch of {} held only duplicates", events.len());
            crate::metrics::record_audit_records("duplicate", report.duplicates);
            return Ok(report);
        }

        match self.store.insert_batch(&fresh).await {
            Ok(()) => {
                report.inserted = fresh.len();
            }
            Err(e) => {
                warn!(
                    "Bulk audit insert of {} records failed, falling back to single inserts: {}",
                    fresh.len(),
                    e
                );
                report.fell_back = true;
                if let Err(e) = self.insert_individually(&fresh, &mut report).await {
                    record_outcome(&report);
                    return Err(e);
                }
            }
        }
        record_outcome(&report);

        info!(
            "Audit batch saved: received={}, inserted={}, duplicates={}, fallback={}, took={}ms",
            report.received,
            report.inserted,
            report.duplicates,
            report.fell_back,
            started.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Insert each record on its own. Rows that already exist count as
    /// duplicates; the first other failure is returned after every record
    /// has been attempted.
    async fn insert_individually(
        &self,
        records: &[NewAuditRecord],
        report: &mut IngestReport,
    ) -> Result<()> {
        let mut fatal: Option<QuotaError> = None;

        for record in records {
            match self.store.insert_one(record).await {
                Ok(()) => report.inserted += 1,
                Err(QuotaError::DuplicateRecord(request_id)) => {
                    debug!("Audit record {} already stored by another consumer", request_id);
                    report.duplicates += 1;
                }
                Err(e) => {
                    error!(
                        request_id = %record.request_id,
                        tenant_id = %record.tenant_id,
                        "Failed to store audit record: {}",
                        e
                    );
                    crate::metrics::record_audit_records("failed", 1);
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record_outcome(report: &IngestReport) {
    crate::metrics::record_audit_records("inserted", report.inserted);
    crate::metrics::record_audit_records("duplicate", report.duplicates);
}
