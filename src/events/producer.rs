/// Kafka producer side of the event bus
use rdkafka::ClientConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;

use super::{Event, EventSink};
use crate::error::{CertError, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_TYPE_HEADER: &str = "event_type";

/// Process-wide Kafka producer; sends are thread-safe.
pub struct KafkaEventSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventSink {
    pub fn new(bootstrap_servers: &str, topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| CertError::bus(format!("Kafka producer error: {e}")))?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Create the event topic with the contract's minimum partition count
    /// when the broker allows it. "Already exists" is not an error.
    pub async fn ensure_topic(&self, bootstrap_servers: &str) -> Result<()> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .create()
            .map_err(|e| CertError::bus(format!("Kafka admin error: {e}")))?;

        let topic = NewTopic::new(&self.topic, 3, TopicReplication::Fixed(1));
        let results = admin
            .create_topics([&topic], &AdminOptions::new())
            .await
            .map_err(|e| CertError::bus(format!("Kafka create topic error: {e}")))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(CertError::bus(format!(
                        "Kafka topic '{name}' creation failed: {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Raw send used both by `publish` and by the consumer's poison
    /// forwarding.
    pub async fn send_to(
        &self,
        topic: &str,
        event_type: &str,
        payload: &[u8],
        key: Option<&str>,
    ) -> Result<()> {
        let headers = OwnedHeaders::new().insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some(event_type.as_bytes()),
        });

        let mut record: FutureRecord<'_, str, [u8]> =
            FutureRecord::to(topic).payload(payload).headers(headers);
        if let Some(key) = key {
            record = record.key(key);
        }

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| CertError::bus(format!("Kafka send error: {e}")))?;
        Ok(())
    }

    /// Drain in-flight messages before shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| CertError::bus(format!("Kafka flush error: {e}")))
    }
}

#[async_trait::async_trait]
impl EventSink for KafkaEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        let event_type = event.event_type();
        let payload = serde_json::to_vec(&event.wire_payload()?)?;
        let key = event.key();

        tracing::debug!("Publishing event: {event_type}");
        self.send_to(&self.topic, event_type, &payload, key.as_deref())
            .await
    }
}
