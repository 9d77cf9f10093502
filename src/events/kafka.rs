use crate::config::EventsConfig;
use crate::errors::{QuotaError, Result};
use crate::events::{EventPublisher, PartitionKeySelector, QuotaConsumedEvent};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, error, warn};

/// Publishes JSON events to Kafka without waiting for delivery.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
    keys: PartitionKeySelector,
}

impl std::fmt::Debug for KafkaEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaEventPublisher")
            .field("topic", &self.topic)
            .field("strategy", &self.keys.strategy())
            .finish()
    }
}

impl KafkaEventPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>, keys: PartitionKeySelector) -> Self {
        Self {
            producer,
            topic: topic.into(),
            keys,
        }
    }

    pub fn from_config(config: &EventsConfig, brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", config.delivery_timeout_ms.to_string())
            .set("acks", "1")
            .create()?;

        Ok(Self::new(
            producer,
            config.topic.clone(),
            PartitionKeySelector::new(config.partition_strategy, config.time_slice_millis()),
        ))
    }

    fn record_failure() {
        crate::metrics::record_event_published(false);
    }
}

impl EventPublisher for KafkaEventPublisher {
    fn publish(&self, event: QuotaConsumedEvent) -> Result<()> {
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                Self::record_failure();
                return Err(e.into());
            }
        };
        let key = self.keys.key_for(&event);

        let record = FutureRecord::to(&self.topic)
            .key(key.as_str())
            .payload(payload.as_slice());

        // Enqueue only; a full local queue is reported immediately instead of waiting.
        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                Self::record_failure();
                return Err(QuotaError::KafkaError(e));
            }
        };

        let event_id = event.event_id;
        let request_id = event.request_id;
        let tenant_id = event.tenant_id;

        let observe = async move {
            match delivery.await {
                Ok(Ok(delivered)) => {
                    crate::metrics::record_event_published(true);
                    debug!(
                        "Sent quota event. EventId: {}, RequestId: {}, Delivery: {:?}",
                        event_id, request_id, delivered
                    );
                }
                Ok(Err((e, _))) => {
                    Self::record_failure();
                    error!(
                        "Failed to send quota event. EventId: {}, RequestId: {}, TenantId: {}: {}",
                        event_id, request_id, tenant_id, e
                    );
                }
                Err(_) => {
                    Self::record_failure();
                    warn!(
                        "Quota event delivery cancelled. EventId: {}, RequestId: {}",
                        event_id, request_id
                    );
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(observe);
            }
            Err(_) => debug!("No runtime to observe quota event delivery"),
        }

        Ok(())
    }
}
