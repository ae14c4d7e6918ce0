//! # certpool - TLS Certificate Lifecycle Manager
//!
//! Manages certificates for a multi-tenant web platform across three
//! origins: a reverse-proxy-managed on-disk pool, user uploads, and
//! on-demand ACME issuance. Metadata and key material live in a central
//! store, hot reads are cached, and the pool and database stay in sync
//! through an asynchronous event bus.
//!
//! Two deployment roles share the same object graph:
//!
//! - the **API role** serves reads and fast writes and produces events,
//! - the **worker role** consumes events and performs reconciliation,
//!   parsing, exports and deletes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use certpool::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> certpool::Result<()> {
//!     let repo: Arc<dyn CertificateRepository> =
//!         Arc::new(MemoryCertificateRepository::new());
//!     let cache: Arc<dyn CertCache> = Arc::new(NullCache);
//!     let bus: Arc<dyn EventSink> = Arc::new(MemoryEventSink::new());
//!     let issuer = Arc::new(CertbotClient::new(
//!         "/data/acme-challenge",
//!         "/data/certs",
//!         std::time::Duration::from_secs(300),
//!     )?);
//!
//!     let manager = CertificateManager::new(repo, cache, bus, issuer, "/data/certs");
//!     let page = manager.list(CertStore::Websites, 0, 20).await?;
//!     println!("{} certificates", page.total);
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod acme;
pub mod cache;
pub mod certificate;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod server;
pub mod types;
pub mod worker;

// Re-exports for convenience
pub use acme::{AcmeIssuer, CertbotClient, IssueOutcome, IssueRequest};
pub use cache::{CertCache, NullCache, RedisCertCache};
pub use certificate::{ParsedCertificate, parse_certificate_pem};
pub use config::Config;
pub use error::{CertError, Result};
pub use events::{Event, EventRouter, EventSink, KafkaEventConsumer, KafkaEventSink, MemoryEventSink};
pub use orchestrator::CertificateManager;
pub use repository::{
    CertificateRepository, MemoryCertificateRepository, MySqlCertificateRepository,
};
pub use scheduler::Scheduler;
pub use server::{AppState, build_router, start_server};
pub use types::{CertSource, CertStatus, CertStore, Certificate};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        acme::{AcmeIssuer, CertbotClient, IssueOutcome, IssueRequest},
        cache::{CertCache, NullCache, RedisCertCache},
        certificate::parse_certificate_pem,
        config::Config,
        error::{CertError, Result},
        events::{Event, EventRouter, EventSink, MemoryEventSink},
        orchestrator::CertificateManager,
        repository::{CertificateRepository, MemoryCertificateRepository},
        types::{CertSource, CertStatus, CertStore, Certificate},
    };
}
