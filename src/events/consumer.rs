/// Kafka consumer side of the event bus
///
/// Drains the event topic with a short poll interval so shutdown is
/// prompt, dispatches through the typed router, and never lets a handler
/// error crash the loop: failing messages are logged and parked on the
/// poison topic while the offset auto-commits.
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use std::time::Duration;
use tokio::sync::watch;

use super::{EventRouter, KafkaEventSink};
use crate::config::KafkaSettings;
use crate::error::{CertError, Result};

const EVENT_TYPE_HEADER: &str = "event_type";

/// Long-lived consumer for the worker role.
pub struct KafkaEventConsumer {
    consumer: StreamConsumer,
    poison: KafkaEventSink,
    poison_topic: String,
}

impl KafkaEventConsumer {
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &settings.group_id)
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| CertError::bus(format!("Kafka consumer error: {e}")))?;

        consumer
            .subscribe(&[settings.event_topic.as_str()])
            .map_err(|e| CertError::bus(format!("Kafka subscribe error: {e}")))?;

        let poison = KafkaEventSink::new(&settings.bootstrap_servers, &settings.poison_topic)?;

        tracing::info!(
            "Kafka consumer subscribed: topic={}, group={}",
            settings.event_topic,
            settings.group_id
        );

        Ok(Self {
            consumer,
            poison,
            poison_topic: settings.poison_topic.clone(),
        })
    }

    /// Consume until the shutdown flag flips.
    pub async fn run(&self, router: &EventRouter, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => self.handle_message(router, &message).await,
                        Err(e) => {
                            tracing::error!("Kafka receive error: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        tracing::info!("Kafka consumer stopped");
    }

    async fn handle_message(
        &self,
        router: &EventRouter,
        message: &rdkafka::message::BorrowedMessage<'_>,
    ) {
        let Some(event_type) = header_value(message, EVENT_TYPE_HEADER) else {
            tracing::warn!(
                "Message without event_type header: offset={}",
                message.offset()
            );
            return;
        };
        let payload = message.payload().unwrap_or_default();

        tracing::debug!("Received event: {event_type}, offset={}", message.offset());
        if let Err(e) = router.dispatch(&event_type, payload).await {
            tracing::error!("Event handler failed: event_type={event_type}, error={e}");
            if let Err(poison_err) = self
                .poison
                .send_to(&self.poison_topic, &event_type, payload, None)
                .await
            {
                tracing::error!("Failed to park message on poison topic: {poison_err}");
            }
        }
    }
}

fn header_value(message: &rdkafka::message::BorrowedMessage<'_>, key: &str) -> Option<String> {
    let headers = message.headers()?;
    headers.iter().find_map(|header| {
        if header.key == key {
            header
                .value
                .and_then(|v| std::str::from_utf8(v).ok())
                .map(str::to_string)
        } else {
            None
        }
    })
}
