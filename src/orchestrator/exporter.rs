//! Export: write a record's PEMs back into its pool folder and mirror it
//! as a `source=auto` sibling row, so the next pool import is a no-op.

use serde::Serialize;
use uuid::Uuid;

use super::CertificateManager;
use super::provisioner::write_pool_files;
use crate::certificate::parse_certificate_pem;
use crate::error::{CertError, Result};
use crate::repository::{CertificateChanges, CertificateUpsert};
use crate::types::{CertSource, CertStatus, CertStore, Certificate};

/// Outcome of one export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub success: bool,
    pub message: String,
    pub store: CertStore,
    pub folder_name: String,
    pub domain: String,
}

impl CertificateManager {
    /// Write `cert.crt`/`key.key` for a record into
    /// `{certs_dir}/{Store}/{folder_name}` and upsert the auto sibling.
    /// The origin row is never mutated.
    pub async fn export_certificate(&self, id: Uuid) -> Result<ExportReport> {
        let row = self
            .repository()
            .get_by_id(id)
            .await?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;

        let folder_name = row.folder_name.clone().ok_or_else(|| {
            CertError::validation(format!("certificate {id} has no folder_name"))
        })?;
        let certificate = row
            .certificate
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CertError::validation(format!("certificate {id} has no PEM content")))?;
        let private_key = row
            .private_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CertError::validation(format!("certificate {id} has no private key")))?;

        let folder = self.pool_folder(row.store, &folder_name);
        write_pool_files(&folder, &certificate, &private_key)?;
        tracing::info!(
            "Exported certificate to {}: domain={}, id={id}",
            folder.display(),
            row.domain
        );

        self.mirror_auto_sibling(&row, &folder_name, &certificate, &private_key)
            .await;

        Ok(ExportReport {
            success: true,
            message: format!(
                "Successfully exported certificate for {} to {}/{folder_name}",
                row.domain, row.store
            ),
            store: row.store,
            folder_name,
            domain: row.domain,
        })
    }

    /// Keep a `(domain, source=auto, store)` row in sync with the files
    /// just written, so the weekly import finds nothing to change. Row
    /// conflicts are logged, never fatal: the files on disk are already
    /// correct and the importer will reconcile.
    async fn mirror_auto_sibling(
        &self,
        origin: &Certificate,
        folder_name: &str,
        certificate: &str,
        private_key: &str,
    ) {
        // When the origin itself is the auto row, there is nothing to
        // mirror and the origin must stay untouched.
        match self
            .repository()
            .get_by_domain(origin.store, &origin.domain, CertSource::Auto)
            .await
        {
            Ok(Some(existing)) if existing.id == origin.id => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Sibling lookup failed for '{}': {e}", origin.domain);
                return;
            }
        }

        let parsed = parse_certificate_pem(certificate).ok();
        let sans = parsed
            .as_ref()
            .map(|p| {
                let mut all = p.all_domains.clone();
                if !all.contains(&origin.domain) {
                    all.insert(0, origin.domain.clone());
                }
                all
            })
            .or_else(|| origin.sans.clone());

        // Keyed by (domain, source=auto): the folder_name is attached in a
        // second step so the unique constraint can be handled gracefully.
        let sibling = match self
            .repository()
            .create_or_update(CertificateUpsert {
                status: Some(CertStatus::Success),
                email: origin.email.clone(),
                certificate: Some(certificate.to_string()),
                private_key: Some(private_key.to_string()),
                sans,
                issuer: parsed
                    .as_ref()
                    .map(|p| p.issuer.clone())
                    .or_else(|| origin.issuer.clone()),
                not_before: parsed.as_ref().map(|p| p.not_before).or(origin.not_before),
                not_after: parsed.as_ref().map(|p| p.not_after).or(origin.not_after),
                is_valid: parsed.as_ref().map(|p| p.is_valid).or(origin.is_valid),
                days_remaining: parsed
                    .as_ref()
                    .map(|p| p.days_remaining)
                    .or(origin.days_remaining),
                ..CertificateUpsert::new(origin.store, origin.domain.clone(), CertSource::Auto)
            })
            .await
        {
            Ok(sibling) => sibling,
            Err(e) => {
                tracing::warn!("Sibling upsert failed for '{}': {e}", origin.domain);
                return;
            }
        };

        if sibling.folder_name.as_deref() != Some(folder_name) {
            if let Err(e) = self
                .repository()
                .update_by_id(
                    sibling.id,
                    CertificateChanges {
                        folder_name: Some(folder_name.to_string()),
                        ..CertificateChanges::default()
                    },
                )
                .await
            {
                tracing::warn!(
                    "Could not link sibling row to folder '{folder_name}' for '{}': {e}",
                    origin.domain
                );
            }
        }
    }
}
