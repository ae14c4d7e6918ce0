//! Pool importer: reconcile `{certs_dir}/{Store}` folders into the store.
//!
//! Each immediate subfolder holding both `cert.crt` and `key.key` becomes
//! one row keyed by its folder name. Re-imports update PEMs and parsed
//! fields but never change an existing row's source, so two consecutive
//! imports over an unchanged tree are a no-op.

use serde::Serialize;

use super::CertificateManager;
use crate::certificate::parse_certificate_pem;
use crate::error::{CertError, Result};
use crate::events::trigger;
use crate::repository::CertificateUpsert;
use crate::types::{CertSource, CertStatus, CertStore};

/// Outcome of one import pass.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub failed: usize,
}

impl CertificateManager {
    /// Import every certificate folder of a pool-backed store.
    ///
    /// The loop guard: a bus-originated run (`trigger = "event"`) emits
    /// nothing, so refresh events can never echo through the worker.
    pub async fn import_store(&self, store: CertStore, trigger_name: &str) -> Result<ImportReport> {
        if !store.is_pool_backed() {
            return Err(CertError::validation(format!(
                "store '{store}' is not backed by a pool folder"
            )));
        }

        let store_dir = self.certs_dir().join(store.folder_component());
        if !store_dir.is_dir() {
            tracing::warn!("Pool directory not found: {}", store_dir.display());
            return Ok(ImportReport {
                success: true,
                message: format!("Directory not found: {}", store_dir.display()),
                processed: 0,
                failed: 0,
            });
        }

        let mut processed = 0usize;
        let mut failed = 0usize;

        for entry in std::fs::read_dir(&store_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Unreadable pool entry: {e}");
                    failed += 1;
                    continue;
                }
            };
            let folder_path = entry.path();
            let folder_name = entry.file_name().to_string_lossy().into_owned();

            if !folder_path.is_dir() || folder_name.starts_with('.') {
                continue;
            }

            let cert_file = folder_path.join("cert.crt");
            let key_file = folder_path.join("key.key");
            if !cert_file.is_file() || !key_file.is_file() {
                continue;
            }

            match self.import_folder(store, &folder_name, &cert_file, &key_file).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to import folder '{folder_name}': {e}");
                    failed += 1;
                }
            }
        }

        if trigger_name != trigger::EVENT {
            self.emit_invalidate(vec![store], trigger_name).await;
        }

        tracing::info!(
            "Pool import finished: store={store}, processed={processed}, failed={failed}"
        );
        Ok(ImportReport {
            success: true,
            message: format!("Successfully processed {processed} certificates from {store}"),
            processed,
            failed,
        })
    }

    /// Import one folder. Returns `false` when the folder is skipped
    /// (no common name in the certificate).
    async fn import_folder(
        &self,
        store: CertStore,
        folder_name: &str,
        cert_file: &std::path::Path,
        key_file: &std::path::Path,
    ) -> Result<bool> {
        let cert_pem = std::fs::read_to_string(cert_file)?;
        let key_pem = std::fs::read_to_string(key_file)?;

        let parsed = parse_certificate_pem(&cert_pem)?;
        let Some(domain) = parsed.common_name.clone() else {
            tracing::warn!("Certificate without common name, skipping: {folder_name}");
            return Ok(false);
        };

        self.repository()
            .create_or_update(CertificateUpsert {
                folder_name: Some(folder_name.to_string()),
                status: Some(CertStatus::Success),
                certificate: Some(cert_pem),
                private_key: Some(key_pem),
                sans: Some(parsed.all_domains.clone()),
                issuer: Some(parsed.issuer.clone()),
                not_before: Some(parsed.not_before),
                not_after: Some(parsed.not_after),
                is_valid: Some(parsed.is_valid),
                days_remaining: Some(parsed.days_remaining),
                ..CertificateUpsert::new(store, domain, CertSource::Auto)
            })
            .await?;
        Ok(true)
    }
}
