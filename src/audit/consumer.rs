//! Kafka consumer loop feeding the audit ingestor.
//!
//! Offsets are committed by hand, once per batch, and only after the batch
//! was stored. When storing fails the consumer seeks back to the start of
//! the batch so the same events come round again; if the seek itself fails
//! it rejoins the group and resumes from the last committed offset. Either
//! way no commit moves past a failed batch until that batch is stored.

use crate::audit::AuditIngestor;
use crate::config::AuditConfig;
use crate::errors::{QuotaError, Result};
use crate::events::QuotaConsumedEvent;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_ATTEMPTS: u32 = 3;

/// First and last offset seen per partition within one batch.
#[derive(Debug, Default)]
pub struct BatchOffsets {
    ranges: BTreeMap<(String, i32), (i64, i64)>,
}

impl BatchOffsets {
    pub fn observe(&mut self, topic: &str, partition: i32, offset: i64) {
        self.ranges
            .entry((topic.to_string(), partition))
            .and_modify(|(first, last)| {
                *first = (*first).min(offset);
                *last = (*last).max(offset);
            })
            .or_insert((offset, offset));
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Positions to rewind to: the first message of each partition.
    pub fn rewind_positions(&self) -> Vec<(String, i32, i64)> {
        self.ranges
            .iter()
            .map(|((topic, partition), (first, _))| (topic.clone(), *partition, *first))
            .collect()
    }
}

/// Per partition, the first offset of a batch that failed to store and has
/// not been stored since.
#[derive(Debug, Default)]
pub struct PendingRedelivery {
    floors: BTreeMap<(String, i32), i64>,
}

impl PendingRedelivery {
    /// Hold back every partition of a batch that could not be stored.
    pub fn hold(&mut self, failed: &BatchOffsets) {
        for ((topic, partition), (first, _)) in &failed.ranges {
            self.floors
                .entry((topic.clone(), *partition))
                .and_modify(|floor| *floor = (*floor).min(*first))
                .or_insert(*first);
        }
    }

    pub fn is_holding(&self) -> bool {
        !self.floors.is_empty()
    }

    /// Positions that are safe to commit after `stored` was written: one
    /// past the last message of each partition. A held partition is only committed by a batch that starts at or
    /// before its floor, and is released once such a batch reaches it.
    pub fn commit_positions(&mut self, stored: &BatchOffsets) -> Vec<(String, i32, i64)> {
        let mut positions = Vec::with_capacity(stored.ranges.len());
        for ((topic, partition), (first, last)) in &stored.ranges {
            let key = (topic.clone(), *partition);
            match self.floors.get(&key).copied() {
                None => positions.push((key.0, key.1, last + 1)),
                Some(floor) if *first > floor => {}
                Some(floor) => {
                    if *last >= floor {
                        self.floors.remove(&key);
                    }
                    positions.push((key.0, key.1, last + 1));
                }
            }
        }
        positions
    }
}

struct Batch {
    events: Vec<QuotaConsumedEvent>,
    offsets: BatchOffsets,
    undecodable: usize,
}

/// One member of the audit consumer group.
pub struct AuditConsumer {
    name: String,
    topic: String,
    consumer: StreamConsumer,
    pending: PendingRedelivery,
    ingestor: Arc<AuditIngestor>,
    batch_size: usize,
    batch_wait: Duration,
}

impl AuditConsumer {
    pub fn new(config: &AuditConfig, ingestor: Arc<AuditIngestor>, index: usize) -> Result<Self> {
        let name = format!("{}-{}", config.group_id, index);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("client.id", &name)
            .set("bootstrap.servers", &config.brokers)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!("Audit consumer {} subscribed to {}", name, config.topic);

        Ok(Self {
            name,
            topic: config.topic.clone(),
            consumer,
            pending: PendingRedelivery::default(),
            ingestor,
            batch_size: config.batch_size.max(1),
            batch_wait: config.batch_wait(),
        })
    }

    pub async fn run(mut self) {
        info!("Audit consumer {} started", self.name);
        loop {
            let batch = self.next_batch().await;
            if batch.offsets.is_empty() {
                continue;
            }
            self.process(batch).await;
        }
    }

    /// Wait for one message, then keep collecting until the batch is full or
    /// the fill window closes.
    async fn next_batch(&self) -> Batch {
        let mut batch = Batch {
            events: Vec::with_capacity(self.batch_size),
            offsets: BatchOffsets::default(),
            undecodable: 0,
        };
        let mut deadline: Option<Instant> = None;

        while batch.events.len() + batch.undecodable < self.batch_size {
            let received = match deadline {
                None => self.consumer.recv().await,
                Some(at) => match tokio::time::timeout_at(at, self.consumer.recv()).await {
                    Ok(received) => received,
                    Err(_) => break,
                },
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    warn!("Audit consumer {} receive error: {}", self.name, e);
                    if deadline.is_none() {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    break;
                }
            };

            if deadline.is_none() {
                deadline = Some(Instant::now() + self.batch_wait);
            }

            batch
                .offsets
                .observe(message.topic(), message.partition(), message.offset());

            match message.payload().map(serde_json::from_slice::<QuotaConsumedEvent>) {
                Some(Ok(event)) => batch.events.push(event),
                Some(Err(e)) => {
                    warn!(
                        "Skipping undecodable event at {}[{}]@{}: {}",
                        message.topic(),
                        message.partition(),
                        message.offset(),
                        e
                    );
                    batch.undecodable += 1;
                }
                None => {
                    warn!(
                        "Skipping empty message at {}[{}]@{}",
                        message.topic(),
                        message.partition(),
                        message.offset()
                    );
                    batch.undecodable += 1;
                }
            }
        }

        batch
    }

    async fn process(&mut self, batch: Batch) {
        crate::metrics::record_audit_records("undecodable", batch.undecodable);

        match self.ingestor.ingest(&batch.events).await {
            Ok(report) => {
                let positions = self.pending.commit_positions(&batch.offsets);
                match self.commit(&positions) {
                    Ok(()) => {
                        crate::metrics::record_audit_batch(true);
                        debug!(
                            "Audit consumer {} committed batch: inserted={}, duplicates={}, held={}",
                            self.name,
                            report.inserted,
                            report.duplicates,
                            self.pending.is_holding()
                        );
                    }
                    Err(e) => {
                        // Stored but not acknowledged; redelivery is deduplicated.
                        error!("Audit consumer {} failed to commit offsets: {}", self.name, e);
                    }
                }
            }
            Err(e) => {
                crate::metrics::record_audit_batch(false);
                error!(
                    "Audit consumer {} failed to store batch of {} events, it will be redelivered: {}",
                    self.name,
                    batch.events.len(),
                    e
                );
                self.pending.hold(&batch.offsets);
                if let Err(e) = self.rewind(&batch.offsets).await {
                    error!("Audit consumer {} could not rewind, rejoining group: {}", self.name, e);
                    self.rejoin();
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }

    fn commit(&self, positions: &[(String, i32, i64)]) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut list = TopicPartitionList::new();
        for (topic, partition, offset) in positions {
            list.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
        }
        self.consumer.commit(&list, CommitMode::Async)?;
        Ok(())
    }

    async fn rewind(&self, offsets: &BatchOffsets) -> Result<()> {
        for (topic, partition, offset) in offsets.rewind_positions() {
            let mut attempt = 1;
            loop {
                match self
                    .consumer
                    .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
                {
                    Ok(()) => break,
                    Err(e) if attempt < SEEK_ATTEMPTS => {
                        warn!(
                            "Audit consumer {} failed to seek {}[{}] back to {} (attempt {}): {}",
                            self.name, topic, partition, offset, attempt, e
                        );
                        attempt += 1;
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    Err(e) => {
                        return Err(QuotaError::KafkaError(e));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop the assignment and subscribe again, so fetching restarts from the
    /// group's committed offsets.
    fn rejoin(&self) {
        self.consumer.unsubscribe();
        if let Err(e) = self.consumer.subscribe(&[self.topic.as_str()]) {
            error!("Audit consumer {} failed to resubscribe to {}: {}", self.name, self.topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_batch_bounds_per_partition() {
        let mut offsets = BatchOffsets::default();
        offsets.observe("quota-events", 0, 10);
        offsets.observe("quota-events", 1, 4);
        offsets.observe("quota-events", 0, 12);
        offsets.observe("quota-events", 0, 11);

        assert_eq!(
            PendingRedelivery::default().commit_positions(&offsets),
            vec![
                ("quota-events".to_string(), 0, 13),
                ("quota-events".to_string(), 1, 5)
            ]
        );
        assert_eq!(
            offsets.rewind_positions(),
            vec![
                ("quota-events".to_string(), 0, 10),
                ("quota-events".to_string(), 1, 4)
            ]
        );
    }

    fn batch(partition: i32, first: i64, last: i64) -> BatchOffsets {
        let mut offsets = BatchOffsets::default();
        offsets.observe("quota-events", partition, first);
        offsets.observe("quota-events", partition, last);
        offsets
    }

    #[test]
    fn stored_batch_after_failed_one_does_not_commit_past_it() {
        let mut pending = PendingRedelivery::default();
        pending.hold(&batch(0, 10, 19));

        // Later messages stored while the failed ones were not redelivered.
        assert!(pending.commit_positions(&batch(0, 20, 29)).is_empty());
        assert!(pending.is_holding());

        // Redelivery from the committed offset releases the partition.
        assert_eq!(
            pending.commit_positions(&batch(0, 5, 24)),
            vec![("quota-events".to_string(), 0, 25)]
        );
        assert!(!pending.is_holding());
    }

    #[test]
    fn partial_redelivery_commits_up_to_the_failed_batch() {
        let mut pending = PendingRedelivery::default();
        pending.hold(&batch(0, 10, 19));

        assert_eq!(
            pending.commit_positions(&batch(0, 4, 8)),
            vec![("quota-events".to_string(), 0, 9)]
        );
        assert!(pending.is_holding());
    }

    #[test]
    fn held_partition_does_not_block_others() {
        let mut pending = PendingRedelivery::default();
        pending.hold(&batch(0, 10, 19));

        let mut stored = batch(0, 30, 31);
        stored.observe("quota-events", 1, 7);
        assert_eq!(
            pending.commit_positions(&stored),
            vec![("quota-events".to_string(), 1, 8)]
        );
    }

    #[test]
    fn repeated_failures_keep_the_lowest_floor() {
        let mut pending = PendingRedelivery::default();
        pending.hold(&batch(0, 10, 19));
        pending.hold(&batch(0, 20, 29));

        assert!(pending.commit_positions(&batch(0, 11, 40)).is_empty());
        assert_eq!(
            pending.commit_positions(&batch(0, 10, 40)),
            vec![("quota-events".to_string(), 0, 41)]
        );
    }

    #[test]
    fn empty_batch_has_nothing_to_commit() {
        let offsets = BatchOffsets::default();
        assert!(offsets.is_empty());
        assert!(PendingRedelivery::default().commit_positions(&offsets).is_empty());
    }
}
