//! Worker role: event handlers behind the bus consumer.
//!
//! Every handler decodes its payload, performs the work through the
//! orchestrator, and logs failures instead of propagating them; recovery
//! happens on the next event, not inside the handler.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{CertError, Result};
use crate::events::{
    self, CacheInvalidateEvent, DeleteFileOrFolderEvent, DeleteFolderEvent, EventHandler,
    EventRouter, ExportCertificateEvent, ParseCertificateEvent, RefreshEvent, trigger,
};
use crate::certificate::parse_certificate_pem;
use crate::orchestrator::CertificateManager;
use crate::repository::{CertificateRepository, ParseResultUpdate};
use crate::types::CertStatus;

/// Build the typed router with every handler registered, once at startup.
pub fn build_router(manager: CertificateManager) -> EventRouter {
    let mut router = EventRouter::new();
    router.register(
        events::OPERATION_REFRESH,
        Arc::new(RefreshHandler {
            manager: manager.clone(),
        }),
    );
    router.register(
        events::CACHE_INVALIDATE,
        Arc::new(CacheInvalidateHandler {
            manager: manager.clone(),
        }),
    );
    router.register(
        events::CERTIFICATE_PARSE,
        Arc::new(ParseHandler {
            manager: manager.clone(),
        }),
    );
    router.register(
        events::FOLDER_DELETE,
        Arc::new(DeleteFolderHandler {
            manager: manager.clone(),
        }),
    );
    router.register(
        events::FILE_OR_FOLDER_DELETE,
        Arc::new(DeleteFileOrFolderHandler {
            manager: manager.clone(),
        }),
    );
    router.register(events::CERTIFICATE_EXPORT, Arc::new(ExportHandler { manager }));
    router
}

/// `operation.refresh`: run the pool importer. The importer is invoked
/// with `trigger = "event"` so a refresh can never echo another refresh.
struct RefreshHandler {
    manager: CertificateManager,
}

#[async_trait]
impl EventHandler for RefreshHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: RefreshEvent = serde_json::from_slice(payload)?;
        tracing::info!("Refresh event: store={}, trigger={}", event.store, event.trigger);
        match self.manager.import_store(event.store, trigger::EVENT).await {
            Ok(report) => {
                tracing::info!(
                    "Refresh handled: store={}, processed={}, failed={}",
                    event.store,
                    report.processed,
                    report.failed
                );
            }
            Err(e) => tracing::error!("Refresh failed: store={}, error={e}", event.store),
        }
        Ok(())
    }
}

/// `cache.invalidate`: drop every key touching the listed stores.
struct CacheInvalidateHandler {
    manager: CertificateManager,
}

#[async_trait]
impl EventHandler for CacheInvalidateHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: CacheInvalidateEvent = serde_json::from_slice(payload)?;
        for store in event.stores {
            match self.manager.cache().clear_store(store).await {
                Ok(count) => {
                    tracing::info!("Cache cleared: store={store}, keys={count}");
                }
                Err(e) => tracing::error!("Cache clear failed: store={store}, error={e}"),
            }
        }
        Ok(())
    }
}

/// `certificate.parse`: re-parse the row's PEM and settle its status.
/// Unreadable PEMs fail the row and zero the derived fields.
struct ParseHandler {
    manager: CertificateManager,
}

#[async_trait]
impl EventHandler for ParseHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: ParseCertificateEvent = serde_json::from_slice(payload)?;
        let repo = self.manager.repository();

        let Some(row) = repo.get_by_id(event.certificate_id).await? else {
            tracing::warn!("Parse event for missing certificate: {}", event.certificate_id);
            return Ok(());
        };

        let (update, status) = match row.certificate.as_deref() {
            Some(pem) if !pem.is_empty() => match parse_certificate_pem(pem) {
                Ok(parsed) => (ParseResultUpdate::from_parsed(&parsed), CertStatus::Success),
                Err(e) => {
                    tracing::error!(
                        "Certificate parse failed: id={}, error={e}",
                        event.certificate_id
                    );
                    (ParseResultUpdate::cleared(), CertStatus::Fail)
                }
            },
            _ => {
                tracing::warn!("Certificate has no PEM to parse: id={}", event.certificate_id);
                (ParseResultUpdate::cleared(), CertStatus::Fail)
            }
        };

        repo.update_parse_result(event.certificate_id, update, status)
            .await?;
        tracing::info!(
            "Parse handled: id={}, domain={}, status={status}",
            event.certificate_id,
            row.domain
        );
        Ok(())
    }
}

/// `folder.delete`: remove one pool folder by its name.
struct DeleteFolderHandler {
    manager: CertificateManager,
}

#[async_trait]
impl EventHandler for DeleteFolderHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: DeleteFolderEvent = serde_json::from_slice(payload)?;
        let relative = sanitize_relative_path(&event.folder_name)?;
        let folder = self
            .manager
            .certs_dir()
            .join(event.store.folder_component())
            .join(relative);

        if !folder.is_dir() {
            tracing::warn!("Pool folder already gone: {}", folder.display());
            return Ok(());
        }
        std::fs::remove_dir_all(&folder)?;
        tracing::info!("Deleted pool folder: {}", folder.display());
        Ok(())
    }
}

/// `file_or_folder.delete`: remove an arbitrary entry under a store root.
struct DeleteFileOrFolderHandler {
    manager: CertificateManager,
}

#[async_trait]
impl EventHandler for DeleteFileOrFolderHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: DeleteFileOrFolderEvent = serde_json::from_slice(payload)?;
        let relative = sanitize_relative_path(&event.path)?;
        let target = self
            .manager
            .certs_dir()
            .join(event.store.folder_component())
            .join(relative);

        match event.item_type.as_str() {
            "file" => {
                if !target.is_file() {
                    tracing::warn!("Path is not a file: {}", target.display());
                    return Ok(());
                }
                std::fs::remove_file(&target)?;
            }
            "folder" => {
                if !target.is_dir() {
                    tracing::warn!("Path is not a folder: {}", target.display());
                    return Ok(());
                }
                std::fs::remove_dir_all(&target)?;
            }
            other => {
                return Err(CertError::validation(format!(
                    "item_type must be 'file' or 'folder', got '{other}'"
                )));
            }
        }
        tracing::info!("Deleted {}: {}", event.item_type, target.display());
        Ok(())
    }
}

/// `certificate.export`: write PEMs back to the pool folder.
struct ExportHandler {
    manager: CertificateManager,
}

#[async_trait]
impl EventHandler for ExportHandler {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: ExportCertificateEvent = serde_json::from_slice(payload)?;
        match self.manager.export_certificate(event.certificate_id).await {
            Ok(report) => tracing::info!("Export handled: {}", report.message),
            Err(e) => tracing::error!(
                "Export failed: id={}, error={e}",
                event.certificate_id
            ),
        }
        Ok(())
    }
}

/// Reject absolute paths and any `..` traversal; the result always stays
/// under the store root it is joined to.
pub fn sanitize_relative_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if candidate.is_absolute() || path.is_empty() {
        return Err(CertError::validation(format!(
            "path must be relative and non-empty: '{path}'"
        )));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(CertError::validation(format!(
                    "path may not traverse outside the store root: '{path}'"
                )));
            }
        }
    }
    Ok(candidate.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_plain_relative_paths() {
        assert_eq!(
            sanitize_relative_path("folder/cert.crt").unwrap(),
            PathBuf::from("folder/cert.crt")
        );
        assert_eq!(sanitize_relative_path("folder").unwrap(), PathBuf::from("folder"));
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_relative_path("../etc/passwd").is_err());
        assert!(sanitize_relative_path("a/../../b").is_err());
        assert!(sanitize_relative_path("/etc/passwd").is_err());
        assert!(sanitize_relative_path("").is_err());
        assert!(sanitize_relative_path("./a").is_err());
    }
}
