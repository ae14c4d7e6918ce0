//! Typed events carried between the API role (producer) and the worker
//! role (consumer).
//!
//! The wire format is a JSON body plus an `event_type` message header;
//! a `_timestamp` field is injected at send time when absent. Handlers
//! are idempotent and delivery is at-least-once.

pub mod consumer;
pub mod producer;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{CertError, Result};
use crate::types::CertStore;

/// Advisory trigger metadata carried by refresh and invalidate events.
/// `EVENT` marks bus-originated work and arms the refresh loop guard.
pub mod trigger {
    pub const MANUAL: &str = "manual";
    pub const SCHEDULED: &str = "scheduled";
    pub const STARTUP: &str = "startup";
    pub const EVENT: &str = "event";
    pub const APPLY: &str = "apply";
    pub const ADD: &str = "add";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
}

/// Worker should run the pool importer for `store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshEvent {
    pub store: CertStore,
    pub trigger: String,
}

/// Worker should drop all cache keys touching the listed stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidateEvent {
    pub stores: Vec<CertStore>,
    pub trigger: String,
}

/// Worker should re-parse this certificate's PEM and update the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseCertificateEvent {
    pub certificate_id: Uuid,
}

/// Worker should remove the pool folder for this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFolderEvent {
    pub store: CertStore,
    pub folder_name: String,
}

/// Worker should remove an arbitrary file or folder under a store root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileOrFolderEvent {
    pub store: CertStore,
    pub path: String,
    /// "file" or "folder"
    pub item_type: String,
}

/// Worker should write this certificate's PEMs back to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportCertificateEvent {
    pub certificate_id: Uuid,
}

/// Wire names of the event catalogue.
pub const OPERATION_REFRESH: &str = "operation.refresh";
pub const CACHE_INVALIDATE: &str = "cache.invalidate";
pub const CERTIFICATE_PARSE: &str = "certificate.parse";
pub const FOLDER_DELETE: &str = "folder.delete";
pub const FILE_OR_FOLDER_DELETE: &str = "file_or_folder.delete";
pub const CERTIFICATE_EXPORT: &str = "certificate.export";

/// One event and its payload.
#[derive(Debug, Clone)]
pub enum Event {
    Refresh(RefreshEvent),
    CacheInvalidate(CacheInvalidateEvent),
    Parse(ParseCertificateEvent),
    DeleteFolder(DeleteFolderEvent),
    DeleteFileOrFolder(DeleteFileOrFolderEvent),
    Export(ExportCertificateEvent),
}

impl Event {
    /// Header value selecting the handler on the consumer side.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Refresh(_) => OPERATION_REFRESH,
            Event::CacheInvalidate(_) => CACHE_INVALIDATE,
            Event::Parse(_) => CERTIFICATE_PARSE,
            Event::DeleteFolder(_) => FOLDER_DELETE,
            Event::DeleteFileOrFolder(_) => FILE_OR_FOLDER_DELETE,
            Event::Export(_) => CERTIFICATE_EXPORT,
        }
    }

    /// Recommended partition key; ordering per key is preserved but not
    /// relied upon.
    pub fn key(&self) -> Option<String> {
        match self {
            Event::Refresh(e) => Some(e.store.to_string()),
            Event::CacheInvalidate(_) => None,
            Event::Parse(e) => Some(e.certificate_id.to_string()),
            Event::DeleteFolder(e) => Some(e.folder_name.clone()),
            Event::DeleteFileOrFolder(e) => Some(e.path.clone()),
            Event::Export(e) => Some(e.certificate_id.to_string()),
        }
    }

    /// JSON body with `_timestamp` injected when absent. The timestamp is
    /// a serializer concern, so it lives here and not on the payloads.
    pub fn wire_payload(&self) -> Result<serde_json::Value> {
        let mut value = match self {
            Event::Refresh(e) => serde_json::to_value(e)?,
            Event::CacheInvalidate(e) => serde_json::to_value(e)?,
            Event::Parse(e) => serde_json::to_value(e)?,
            Event::DeleteFolder(e) => serde_json::to_value(e)?,
            Event::DeleteFileOrFolder(e) => serde_json::to_value(e)?,
            Event::Export(e) => serde_json::to_value(e)?,
        };
        if let serde_json::Value::Object(map) = &mut value {
            map.entry("_timestamp")
                .or_insert_with(|| serde_json::Value::String(Utc::now().to_rfc3339()));
        }
        Ok(value)
    }
}

/// Producer side of the bus.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn publish(&self, event: Event) -> Result<()> {
        (**self).publish(event).await
    }
}

/// Sink that records events in memory; used by tests and dry-run wiring.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Consumer-side handler for one event type. Implementations decode the
/// JSON body themselves; a returned error is logged by the dispatcher and
/// never crashes the consumer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

/// Typed `event_type -> handler` map, built once at worker startup.
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<&'static str, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: &'static str, handler: Arc<dyn EventHandler>) {
        tracing::info!("Registered event route: {event_type}");
        self.routes.insert(event_type, handler);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch one message. Unknown event types are an error so the
    /// caller can decide whether to park the message.
    pub async fn dispatch(&self, event_type: &str, payload: &[u8]) -> Result<()> {
        let handler = self
            .routes
            .get(event_type)
            .ok_or_else(|| CertError::bus(format!("no handler for event type '{event_type}'")))?;
        handler.handle(payload).await
    }
}

pub use consumer::KafkaEventConsumer;
pub use producer::KafkaEventSink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_payload_injects_timestamp() {
        let event = Event::Refresh(RefreshEvent {
            store: CertStore::Websites,
            trigger: trigger::MANUAL.to_string(),
        });
        let value = event.wire_payload().unwrap();
        assert_eq!(value["store"], "websites");
        assert_eq!(value["trigger"], "manual");
        assert!(value["_timestamp"].is_string());
    }

    #[test]
    fn event_types_match_wire_names() {
        let event = Event::DeleteFolder(DeleteFolderEvent {
            store: CertStore::Apis,
            folder_name: "xy".to_string(),
        });
        assert_eq!(event.event_type(), "folder.delete");
        assert_eq!(event.key().as_deref(), Some("xy"));
    }

    #[test]
    fn payload_roundtrip() {
        let payload = br#"{"stores":["websites","database"],"trigger":"delete","_timestamp":"2026-01-01T00:00:00Z"}"#;
        let decoded: CacheInvalidateEvent = serde_json::from_slice(payload).unwrap();
        assert_eq!(decoded.stores, vec![CertStore::Websites, CertStore::Database]);
        assert_eq!(decoded.trigger, "delete");
    }

    #[tokio::test]
    async fn router_rejects_unknown_event_type() {
        let router = EventRouter::new();
        assert!(router.dispatch("operation.unknown", b"{}").await.is_err());
    }
}
