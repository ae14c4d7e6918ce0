//! Lifecycle orchestrator: decides what state a certificate is in, which
//! operations are legal on it, and which events each mutation emits.
//!
//! The manager glues the repository, the cache, the event bus, and the
//! ACME driver together. Mutations never touch the cache directly; they
//! emit `cache.invalidate` so every API node converges.

pub mod exporter;
pub mod importer;
pub mod provisioner;
pub mod renewer;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::acme::AcmeIssuer;
use crate::cache::CertCache;
use crate::error::{CertError, Result};
use crate::events::{
    CacheInvalidateEvent, Event, EventSink, ParseCertificateEvent, RefreshEvent, trigger,
};
use crate::repository::{CertificateChanges, CertificateRepository, NewManualAdd, SearchFilter};
use crate::types::{
    CertSource, CertStatus, CertStore, CertificateDetail, CertificateListPage, CertificateSummary,
};

const MAX_PAGE_SIZE: u32 = 100;

/// Acknowledgement for an operation that continues in the background.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAck {
    pub success: bool,
    pub message: String,
    pub status: CertStatus,
}

/// Outcome of a synchronous mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MutationAck {
    pub success: bool,
    pub message: String,
}

/// Input for creating a user-uploaded certificate.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCertificateInput {
    pub store: CertStore,
    pub domain: String,
    pub certificate: String,
    pub private_key: String,
    #[serde(default)]
    pub sans: Option<Vec<String>>,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
}

/// Partial update for a `manual_add` record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateManualAddInput {
    #[serde(default)]
    pub store: Option<CertStore>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub sans: Option<Vec<String>>,
    #[serde(default)]
    pub issuer: Option<String>,
}

/// Update for a `manual_apply` record, keyed by domain.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateManualApplyInput {
    pub domain: String,
    pub folder_name: String,
    #[serde(default)]
    pub store: Option<CertStore>,
}

/// Coordinates every certificate lifecycle decision.
#[derive(Clone)]
pub struct CertificateManager {
    repo: Arc<dyn CertificateRepository>,
    cache: Arc<dyn CertCache>,
    bus: Arc<dyn EventSink>,
    issuer: Arc<dyn AcmeIssuer>,
    certs_dir: PathBuf,
}

impl CertificateManager {
    pub fn new(
        repo: Arc<dyn CertificateRepository>,
        cache: Arc<dyn CertCache>,
        bus: Arc<dyn EventSink>,
        issuer: Arc<dyn AcmeIssuer>,
        certs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo,
            cache,
            bus,
            issuer,
            certs_dir: certs_dir.into(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn CertificateRepository> {
        &self.repo
    }

    pub fn cache(&self) -> &Arc<dyn CertCache> {
        &self.cache
    }

    pub fn certs_dir(&self) -> &PathBuf {
        &self.certs_dir
    }

    /// Pool directory for one record: `{certs_dir}/{Store}/{folder_name}`.
    pub(crate) fn pool_folder(&self, store: CertStore, folder_name: &str) -> PathBuf {
        self.certs_dir
            .join(store.folder_component())
            .join(folder_name)
    }

    /// Best-effort emission; mutations already committed should not be
    /// rolled back because the bus hiccupped.
    pub(crate) async fn emit(&self, event: Event) {
        let event_type = event.event_type();
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!("Failed to publish {event_type}: {e}");
        }
    }

    pub(crate) async fn emit_invalidate(&self, stores: Vec<CertStore>, trigger_name: &str) {
        self.emit(Event::CacheInvalidate(CacheInvalidateEvent {
            stores,
            trigger: trigger_name.to_string(),
        }))
        .await;
    }

    fn check_limit(limit: u32) -> Result<()> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(CertError::validation(format!(
                "limit must be in 1-{MAX_PAGE_SIZE}, got {limit}"
            )));
        }
        Ok(())
    }

    /// One page of a store's certificates, read through the cache.
    pub async fn list(
        &self,
        store: CertStore,
        offset: u32,
        limit: u32,
    ) -> Result<CertificateListPage> {
        Self::check_limit(limit)?;

        match self.cache.get_list(store, offset, limit).await {
            Ok(Some(page)) => return Ok(page),
            Ok(None) => {}
            Err(e) => tracing::debug!("Cache read failed, falling through: {e}"),
        }

        let page = self.repo.list(store, offset, limit).await?;
        let result = CertificateListPage {
            certificates: page.items.iter().map(|c| c.summary()).collect(),
            total: page.total,
        };

        if let Err(e) = self.cache.put_list(store, offset, limit, &result).await {
            tracing::debug!("Cache write failed: {e}");
        }
        Ok(result)
    }

    /// Detail view by id; no caching, the id is not a projection key.
    pub async fn get(&self, id: Uuid) -> Result<CertificateDetail> {
        let row = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;
        Ok(row.detail())
    }

    /// Detail view by `(store, domain, source)`, read through the cache.
    pub async fn detail(
        &self,
        store: CertStore,
        domain: &str,
        source: CertSource,
    ) -> Result<Option<CertificateDetail>> {
        match self.cache.get_detail(store, domain).await {
            Ok(Some(detail)) => return Ok(Some(detail)),
            Ok(None) => {}
            Err(e) => tracing::debug!("Cache read failed, falling through: {e}"),
        }

        let Some(row) = self.repo.get_by_domain(store, domain, source).await? else {
            return Ok(None);
        };
        let detail = row.detail();

        if let Err(e) = self.cache.put_detail(store, domain, &detail).await {
            tracing::debug!("Cache write failed: {e}");
        }
        Ok(Some(detail))
    }

    /// Keyword search over domain and folder name.
    pub async fn search(
        &self,
        keyword: &str,
        store: Option<CertStore>,
        source: Option<CertSource>,
        offset: u32,
        limit: u32,
    ) -> Result<(Vec<CertificateSummary>, u64)> {
        if keyword.trim().is_empty() {
            return Err(CertError::validation("search keyword cannot be blank"));
        }
        Self::check_limit(limit)?;

        let page = self
            .repo
            .search(SearchFilter {
                keyword: keyword.trim().to_string(),
                store,
                source,
                offset,
                limit,
            })
            .await?;
        Ok((page.items.iter().map(|c| c.summary()).collect(), page.total))
    }

    /// Create a user-uploaded certificate. The row is born `process`; the
    /// worker parses the PEM asynchronously and settles the status.
    pub async fn create_manual_add(
        &self,
        input: CreateCertificateInput,
    ) -> Result<CertificateDetail> {
        if input.domain.trim().is_empty() {
            return Err(CertError::validation("domain cannot be empty"));
        }
        if input.certificate.trim().is_empty() || input.private_key.trim().is_empty() {
            return Err(CertError::validation(
                "certificate and private_key cannot be empty",
            ));
        }

        let row = self
            .repo
            .create_manual_add(NewManualAdd {
                store: input.store,
                domain: input.domain,
                certificate: input.certificate,
                private_key: input.private_key,
                folder_name: input.folder_name,
                email: input.email,
                sans: input.sans,
                issuer: input.issuer,
            })
            .await?;

        self.emit_invalidate(vec![row.store], trigger::ADD).await;
        self.emit(Event::Parse(ParseCertificateEvent {
            certificate_id: row.id,
        }))
        .await;

        tracing::info!(
            "Created manual_add certificate: domain={}, id={}",
            row.domain,
            row.id
        );
        Ok(row.detail())
    }

    /// Update a `manual_add` record; any field may change. Touching the
    /// PEM resets the row to `process` and schedules a re-parse.
    pub async fn update_manual_add(
        &self,
        id: Uuid,
        input: UpdateManualAddInput,
    ) -> Result<CertificateDetail> {
        let row = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;

        match row.source {
            CertSource::ManualAdd => {}
            CertSource::Auto => {
                return Err(CertError::validation(
                    "auto certificates are derived from the pool and cannot be edited",
                ));
            }
            CertSource::ManualApply => {
                return Err(CertError::validation(
                    "manual_apply certificates can only change folder_name and store",
                ));
            }
        }

        let certificate_touched = input.certificate.is_some();
        let old_store = row.store;

        let updated = self
            .repo
            .update_by_id(
                id,
                CertificateChanges {
                    store: input.store,
                    domain: input.domain,
                    folder_name: input.folder_name,
                    email: input.email,
                    certificate: input.certificate,
                    private_key: input.private_key,
                    sans: input.sans,
                    issuer: input.issuer,
                    status: certificate_touched.then_some(CertStatus::Process),
                    ..CertificateChanges::default()
                },
            )
            .await?;

        let mut stores = vec![updated.store];
        if old_store != updated.store {
            stores.push(old_store);
        }
        self.emit_invalidate(stores, trigger::UPDATE).await;

        if certificate_touched {
            self.emit(Event::Parse(ParseCertificateEvent {
                certificate_id: id,
            }))
            .await;
        }
        Ok(updated.detail())
    }

    /// Update a `manual_apply` record; only `folder_name` and `store` may
    /// change, and the target store must be pool-backed.
    pub async fn update_manual_apply(&self, input: UpdateManualApplyInput) -> Result<MutationAck> {
        if input.folder_name.trim().is_empty() {
            return Err(CertError::validation(
                "folder_name is required for manual_apply certificates",
            ));
        }
        if input.store == Some(CertStore::Database) {
            return Err(CertError::validation(
                "manual_apply certificates already live in the database store; \
                 pick websites or apis as a target",
            ));
        }

        let row = self
            .repo
            .get_by_domain(CertStore::Database, &input.domain, CertSource::ManualApply)
            .await?
            .ok_or_else(|| {
                CertError::not_found(format!(
                    "certificate not found: domain='{}', source='manual_apply'",
                    input.domain
                ))
            })?;

        let updated = self
            .repo
            .update_by_id(
                row.id,
                CertificateChanges {
                    folder_name: Some(input.folder_name),
                    store: input.store,
                    ..CertificateChanges::default()
                },
            )
            .await?;

        let mut stores = vec![CertStore::Database];
        if updated.store != CertStore::Database {
            stores.push(updated.store);
        }
        self.emit_invalidate(stores, trigger::UPDATE).await;

        Ok(MutationAck {
            success: true,
            message: format!(
                "Certificate updated successfully for domain '{}'",
                input.domain
            ),
        })
    }

    /// Delete a record. Pool-backed rows additionally schedule removal of
    /// the on-disk folder; caches for all stores are invalidated.
    pub async fn delete(&self, id: Uuid) -> Result<MutationAck> {
        let row = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;

        if !self.repo.delete_by_id(id).await? {
            return Err(CertError::not_found(format!("certificate {id} not found")));
        }

        if row.store.is_pool_backed() {
            if let Some(folder_name) = &row.folder_name {
                self.emit(Event::DeleteFolder(crate::events::DeleteFolderEvent {
                    store: row.store,
                    folder_name: folder_name.clone(),
                }))
                .await;
            }
        }
        self.emit_invalidate(CertStore::ALL.to_vec(), trigger::DELETE)
            .await;

        tracing::info!("Deleted certificate: domain={}, id={id}", row.domain);
        Ok(MutationAck {
            success: true,
            message: format!("Certificate deleted for domain '{}'", row.domain),
        })
    }

    /// Emit-only: schedule a pool import on the worker role.
    pub async fn refresh(&self, store: CertStore, trigger_name: &str) -> Result<()> {
        self.bus
            .publish(Event::Refresh(RefreshEvent {
                store,
                trigger: trigger_name.to_string(),
            }))
            .await
    }

    /// Emit-only: schedule a cache invalidation on the worker role.
    pub async fn invalidate_cache(
        &self,
        stores: Vec<CertStore>,
        trigger_name: &str,
    ) -> Result<()> {
        if stores.is_empty() {
            return Err(CertError::validation("stores cannot be empty"));
        }
        self.bus
            .publish(Event::CacheInvalidate(CacheInvalidateEvent {
                stores,
                trigger: trigger_name.to_string(),
            }))
            .await
    }
}

pub use exporter::ExportReport;
pub use importer::ImportReport;
pub use provisioner::{ApplyInput, ReapplyAutoInput, ReapplyManualAddInput, ReapplyManualApplyInput};
pub use renewer::RenewalReport;
