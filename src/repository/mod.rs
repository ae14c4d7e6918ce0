//! Certificate persistence: the single source of truth for certificate rows.
//!
//! The repository trait exposes the narrow operation set the orchestrator
//! needs; backends must enforce `folder_name` uniqueness and the
//! status-gate semantics of `begin_processing`.

pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::certificate::ParsedCertificate;
use crate::error::Result;
use crate::types::{CertSource, CertStatus, CertStore, Certificate, Page};

/// Input for the upsert primitive. Keyed by `folder_name` when present,
/// otherwise by `(domain, source)`. On update, `source` is never
/// overwritten and only `Some` fields are written.
#[derive(Debug, Clone)]
pub struct CertificateUpsert {
    pub store: CertStore,
    pub domain: String,
    pub folder_name: Option<String>,
    /// Applied on insert only; an existing row keeps its source.
    pub source: CertSource,
    pub status: Option<CertStatus>,
    pub email: Option<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub sans: Option<Vec<String>>,
    pub issuer: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub is_valid: Option<bool>,
    pub days_remaining: Option<i64>,
}

impl CertificateUpsert {
    /// A bare upsert carrying only identity; callers fill in what they
    /// have via struct update syntax.
    pub fn new(store: CertStore, domain: impl Into<String>, source: CertSource) -> Self {
        Self {
            store,
            domain: domain.into(),
            folder_name: None,
            source,
            status: None,
            email: None,
            certificate: None,
            private_key: None,
            sans: None,
            issuer: None,
            not_before: None,
            not_after: None,
            is_valid: None,
            days_remaining: None,
        }
    }
}

/// Input for creating a user-uploaded certificate. The row is born in
/// `process` status; an asynchronous parse decides success or failure.
#[derive(Debug, Clone)]
pub struct NewManualAdd {
    pub store: CertStore,
    pub domain: String,
    pub certificate: String,
    pub private_key: String,
    pub folder_name: Option<String>,
    pub email: Option<String>,
    pub sans: Option<Vec<String>>,
    pub issuer: Option<String>,
}

/// Partial update applied by id. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CertificateChanges {
    pub store: Option<CertStore>,
    pub domain: Option<String>,
    pub folder_name: Option<String>,
    pub status: Option<CertStatus>,
    pub email: Option<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub sans: Option<Vec<String>>,
    pub issuer: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub is_valid: Option<bool>,
    pub days_remaining: Option<i64>,
    pub last_error_message: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Parse outcome written back to a row. Unlike `CertificateChanges`,
/// every field here is written verbatim: `sans: Some(vec![])` means
/// "parsed, no SANs" and is distinct from `None`.
#[derive(Debug, Clone, Default)]
pub struct ParseResultUpdate {
    pub sans: Option<Vec<String>>,
    pub issuer: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub is_valid: Option<bool>,
    pub days_remaining: Option<i64>,
}

impl ParseResultUpdate {
    /// Parse result for a readable certificate.
    pub fn from_parsed(parsed: &ParsedCertificate) -> Self {
        Self {
            sans: Some(parsed.all_domains.clone()),
            issuer: Some(parsed.issuer.clone()),
            not_before: Some(parsed.not_before),
            not_after: Some(parsed.not_after),
            is_valid: Some(parsed.is_valid),
            days_remaining: Some(parsed.days_remaining),
        }
    }

    /// Zeroed fields for an unreadable certificate; only the row identity
    /// survives.
    pub fn cleared() -> Self {
        Self {
            sans: Some(Vec::new()),
            is_valid: Some(false),
            ..Self::default()
        }
    }
}

/// Result of the daily days-remaining recompute.
#[derive(Debug, Clone)]
pub struct DaysRemainingRefresh {
    pub updated: u64,
    pub total: u64,
    /// Every row carrying `not_after`, with refreshed derived fields,
    /// for the auto-renewal follow-up.
    pub rows: Vec<Certificate>,
}

/// Keyword search with optional narrowing.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub keyword: String,
    pub store: Option<CertStore>,
    pub source: Option<CertSource>,
    pub offset: u32,
    pub limit: u32,
}

/// The authoritative store of certificate rows.
#[async_trait]
pub trait CertificateRepository: Send + Sync {
    /// One page of rows for a store, newest first, plus the total count.
    async fn list(&self, store: CertStore, offset: u32, limit: u32) -> Result<Page<Certificate>>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Certificate>>;

    async fn get_by_domain(
        &self,
        store: CertStore,
        domain: &str,
        source: CertSource,
    ) -> Result<Option<Certificate>>;

    async fn get_by_folder_name(&self, folder_name: &str) -> Result<Option<Certificate>>;

    /// Upsert keyed by `folder_name` (when present) else `(domain, source)`.
    /// Existing rows keep their `source`.
    async fn create_or_update(&self, upsert: CertificateUpsert) -> Result<Certificate>;

    /// Insert a user-uploaded row in `process` status. Fails with
    /// `Conflict` when `(store, domain, manual_add)` already exists.
    async fn create_manual_add(&self, new: NewManualAdd) -> Result<Certificate>;

    /// Partial update by id. Fails with `NotFound` when the row is absent.
    async fn update_by_id(&self, id: Uuid, changes: CertificateChanges) -> Result<Certificate>;

    /// Write a parse outcome plus the resulting status. Returns whether a
    /// row was updated.
    async fn update_parse_result(
        &self,
        id: Uuid,
        update: ParseResultUpdate,
        status: CertStatus,
    ) -> Result<bool>;

    /// Recompute `days_remaining`/`is_valid` for every row with a
    /// `not_after`, returning the refreshed rows for follow-up work.
    async fn update_all_days_remaining(&self) -> Result<DaysRemainingRefresh>;

    /// Delete by id. Returns whether a row existed.
    async fn delete_by_id(&self, id: Uuid) -> Result<bool>;

    /// Case-insensitive keyword search over domain and folder name.
    async fn search(&self, filter: SearchFilter) -> Result<Page<Certificate>>;

    /// Atomically verify the row is not already `process`, move it to
    /// `process`, and return the row as it was before the transition.
    /// Fails with `Conflict` when an issuance is already in flight; this
    /// is the single gate serializing apply/reapply/auto-renew.
    async fn begin_processing(&self, id: Uuid) -> Result<Certificate>;
}

/// Blanket implementation so `Arc<dyn CertificateRepository>` can be
/// passed wherever the trait is expected.
#[async_trait]
impl<T: CertificateRepository + ?Sized> CertificateRepository for std::sync::Arc<T> {
    async fn list(&self, store: CertStore, offset: u32, limit: u32) -> Result<Page<Certificate>> {
        (**self).list(store, offset, limit).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Certificate>> {
        (**self).get_by_id(id).await
    }

    async fn get_by_domain(
        &self,
        store: CertStore,
        domain: &str,
        source: CertSource,
    ) -> Result<Option<Certificate>> {
        (**self).get_by_domain(store, domain, source).await
    }

    async fn get_by_folder_name(&self, folder_name: &str) -> Result<Option<Certificate>> {
        (**self).get_by_folder_name(folder_name).await
    }

    async fn create_or_update(&self, upsert: CertificateUpsert) -> Result<Certificate> {
        (**self).create_or_update(upsert).await
    }

    async fn create_manual_add(&self, new: NewManualAdd) -> Result<Certificate> {
        (**self).create_manual_add(new).await
    }

    async fn update_by_id(&self, id: Uuid, changes: CertificateChanges) -> Result<Certificate> {
        (**self).update_by_id(id, changes).await
    }

    async fn update_parse_result(
        &self,
        id: Uuid,
        update: ParseResultUpdate,
        status: CertStatus,
    ) -> Result<bool> {
        (**self).update_parse_result(id, update, status).await
    }

    async fn update_all_days_remaining(&self) -> Result<DaysRemainingRefresh> {
        (**self).update_all_days_remaining().await
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        (**self).delete_by_id(id).await
    }

    async fn search(&self, filter: SearchFilter) -> Result<Page<Certificate>> {
        (**self).search(filter).await
    }

    async fn begin_processing(&self, id: Uuid) -> Result<Certificate> {
        (**self).begin_processing(id).await
    }
}

pub use memory::MemoryCertificateRepository;
pub use mysql::MySqlCertificateRepository;
