//! Issuance workflows: `apply` and the three reapply variants.
//!
//! Every workflow acknowledges immediately and finishes in a background
//! task. The row's `process` status is the single concurrency gate: it is
//! checked and set inside one repository transaction, so two concurrent
//! calls against the same certificate cannot both start.

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::{CertificateManager, TaskAck};
use crate::acme::{IssueOutcome, IssueRequest};
use crate::certificate::parse_certificate_pem;
use crate::error::{CertError, Result};
use crate::events::trigger;
use crate::repository::CertificateChanges;
use crate::types::{CertSource, CertStatus, CertStore, Certificate};

/// Request a brand-new ACME certificate.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplyInput {
    pub domain: String,
    pub email: String,
    pub folder_name: String,
    #[serde(default)]
    pub sans: Option<Vec<String>>,
    /// Accepted for contract compatibility; the driver always validates
    /// against its configured webroot.
    #[serde(default)]
    pub webroot: Option<String>,
}

/// Re-issue an `auto` record in place and write the PEMs back to its
/// pool folder.
#[derive(Debug, Clone, Deserialize)]
pub struct ReapplyAutoInput {
    pub email: String,
    #[serde(default)]
    pub sans: Option<Vec<String>>,
    #[serde(default)]
    pub force_renewal: bool,
}

/// Re-run the apply flow for a `manual_apply` record with new inputs.
#[derive(Debug, Clone, Deserialize)]
pub struct ReapplyManualApplyInput {
    pub domain: String,
    pub email: String,
    pub folder_name: String,
    #[serde(default)]
    pub sans: Option<Vec<String>>,
    #[serde(default)]
    pub force_renewal: bool,
}

/// Re-issue a `manual_add` record; only the PEMs are rewritten.
#[derive(Debug, Clone, Deserialize)]
pub struct ReapplyManualAddInput {
    pub email: String,
    #[serde(default)]
    pub sans: Option<Vec<String>>,
    #[serde(default)]
    pub force_renewal: bool,
}

/// Which reapply flavor is running; decides what gets written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapplyKind {
    Auto,
    ManualApply,
    ManualAdd,
}

fn check_email(email: &str) -> Result<()> {
    if !email.contains('@') {
        return Err(CertError::validation("Invalid email address"));
    }
    Ok(())
}

/// SAN list for the ACME client: caller-provided or carried over from
/// the row, minus the primary domain itself.
fn issue_sans(domain: &str, requested: Option<Vec<String>>, row: &Certificate) -> Vec<String> {
    requested
        .or_else(|| row.sans.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|san| san != domain)
        .collect()
}

impl CertificateManager {
    /// Start the ACME apply flow for a new `manual_apply` record.
    pub async fn apply(&self, input: ApplyInput) -> Result<TaskAck> {
        check_email(&input.email)?;
        if input.folder_name.trim().is_empty() {
            return Err(CertError::validation(
                "folder_name is required for manual_apply certificates",
            ));
        }

        // One in-flight issuance per (database, domain, manual_apply).
        if let Some(existing) = self
            .repo
            .get_by_domain(CertStore::Database, &input.domain, CertSource::ManualApply)
            .await?
        {
            if existing.status == CertStatus::Process {
                return Err(CertError::conflict(format!(
                    "Certificate for domain '{}' is already being processed. \
                     Please wait for the current request to complete.",
                    input.domain
                )));
            }
        }

        let placeholder = self
            .repo
            .create_or_update(crate::repository::CertificateUpsert {
                folder_name: Some(input.folder_name.clone()),
                status: Some(CertStatus::Process),
                email: Some(input.email.clone()),
                sans: input.sans.clone(),
                ..crate::repository::CertificateUpsert::new(
                    CertStore::Database,
                    input.domain.clone(),
                    CertSource::ManualApply,
                )
            })
            .await?;

        let manager = self.clone();
        let row_id = placeholder.id;
        let request = IssueRequest {
            domain: input.domain.clone(),
            email: input.email,
            sans: issue_sans(&input.domain, input.sans, &placeholder),
            folder_name: input.folder_name,
            force_renewal: false,
        };
        tokio::spawn(async move {
            manager.finish_apply(row_id, request).await;
        });

        tracing::info!(
            "Certificate application started: domain={}, id={row_id}",
            input.domain
        );
        Ok(TaskAck {
            success: true,
            message: format!(
                "Certificate application started for domain '{}'. \
                 Please check the status later.",
                input.domain
            ),
            status: CertStatus::Process,
        })
    }

    /// Background tail of `apply`: the placeholder row settles to
    /// `success` or `fail` and caches are invalidated either way.
    async fn finish_apply(&self, id: Uuid, request: IssueRequest) {
        let outcome = self.issuer.issue(&request).await;
        let domain = request.domain.clone();

        let changes = match issued_changes(&outcome, CertStatus::Fail) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::error!("Apply result unusable for domain '{domain}': {e}");
                failure_changes(CertStatus::Fail, &e.to_string())
            }
        };

        if let Err(e) = self.repo.update_by_id(id, changes).await {
            tracing::error!("Failed to persist apply result for domain '{domain}': {e}");
        }
        self.emit_invalidate(vec![CertStore::Database], trigger::APPLY)
            .await;

        if outcome.success {
            tracing::info!("Certificate application completed for domain '{domain}'");
        } else {
            tracing::error!(
                "Certificate application failed for domain '{domain}': {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Re-issue an `auto` certificate and write the PEMs back to its pool
    /// folder. Domain, folder and store all come from the existing row.
    pub async fn reapply_auto(&self, id: Uuid, input: ReapplyAutoInput) -> Result<TaskAck> {
        check_email(&input.email)?;
        self.start_reapply(
            id,
            ReapplyKind::Auto,
            input.email,
            input.sans,
            None,
            None,
            input.force_renewal,
        )
        .await
    }

    /// Re-run the apply flow for a `manual_apply` certificate; the caller
    /// may move it to a new domain and folder, never to a new store.
    pub async fn reapply_manual_apply(
        &self,
        id: Uuid,
        input: ReapplyManualApplyInput,
    ) -> Result<TaskAck> {
        check_email(&input.email)?;
        if input.folder_name.trim().is_empty() {
            return Err(CertError::validation(
                "folder_name is required for manual_apply certificates",
            ));
        }
        self.start_reapply(
            id,
            ReapplyKind::ManualApply,
            input.email,
            input.sans,
            Some(input.domain),
            Some(input.folder_name),
            input.force_renewal,
        )
        .await
    }

    /// Re-issue a `manual_add` certificate in place; only the PEMs and
    /// the parsed fields are rewritten.
    pub async fn reapply_manual_add(
        &self,
        id: Uuid,
        input: ReapplyManualAddInput,
    ) -> Result<TaskAck> {
        check_email(&input.email)?;
        self.start_reapply(
            id,
            ReapplyKind::ManualAdd,
            input.email,
            input.sans,
            None,
            None,
            input.force_renewal,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_reapply(
        &self,
        id: Uuid,
        kind: ReapplyKind,
        email: String,
        sans: Option<Vec<String>>,
        new_domain: Option<String>,
        new_folder: Option<String>,
        force_renewal: bool,
    ) -> Result<TaskAck> {
        let row = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| CertError::not_found(format!("certificate {id} not found")))?;

        let expected = match kind {
            ReapplyKind::Auto => CertSource::Auto,
            ReapplyKind::ManualApply => CertSource::ManualApply,
            ReapplyKind::ManualAdd => CertSource::ManualAdd,
        };
        if row.source != expected {
            return Err(CertError::validation(format!(
                "certificate for domain '{}' has source '{}', expected '{expected}'",
                row.domain, row.source
            )));
        }

        let domain = new_domain.unwrap_or_else(|| row.domain.clone());
        // Rows without a folder (possible for manual_add) get the ACME
        // client's conventional cert name derived from the domain.
        let folder_name = new_folder
            .or_else(|| row.folder_name.clone())
            .unwrap_or_else(|| domain.replace('.', "_"));

        // The gate: checked and set inside one repository transaction.
        let original = match self.repo.begin_processing(id).await {
            Ok(original) => original,
            Err(CertError::Conflict(_)) => {
                return Err(CertError::conflict(format!(
                    "Certificate for domain '{}' is already being processed. \
                     Please wait for the current request to complete.",
                    row.domain
                )));
            }
            Err(e) => return Err(e),
        };

        let manager = self.clone();
        let request = IssueRequest {
            sans: issue_sans(&domain, sans, &original),
            domain: domain.clone(),
            email,
            folder_name,
            force_renewal,
        };
        tokio::spawn(async move {
            manager.finish_reapply(id, kind, original, request).await;
        });

        tracing::info!(
            "Certificate reapplication started: domain={domain}, id={id}, kind={kind:?}"
        );
        Ok(TaskAck {
            success: true,
            message: format!(
                "Certificate reapplication started for domain '{domain}'. \
                 Please check the status later."
            ),
            status: CertStatus::Process,
        })
    }

    /// Background tail of the reapply variants. On failure the row status
    /// is restored to its pre-call value and the error is recorded.
    async fn finish_reapply(
        &self,
        id: Uuid,
        kind: ReapplyKind,
        original: Certificate,
        request: IssueRequest,
    ) {
        let outcome = self.issuer.issue(&request).await;
        let domain = request.domain.clone();

        let (mut changes, succeeded) = match issued_changes(&outcome, original.status) {
            Ok(changes) => (changes, outcome.success),
            Err(e) => {
                tracing::error!("Reapply result unusable for domain '{domain}': {e}");
                (failure_changes(original.status, &e.to_string()), false)
            }
        };

        if succeeded && kind == ReapplyKind::ManualApply {
            changes.domain = Some(request.domain.clone());
            changes.folder_name = Some(request.folder_name.clone());
        }

        if let Err(e) = self.repo.update_by_id(id, changes).await {
            tracing::error!("Failed to persist reapply result for domain '{domain}': {e}");
            return;
        }

        if !succeeded {
            tracing::error!(
                "Certificate reapplication failed for domain '{domain}': {}. \
                 Status restored to original.",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            return;
        }

        if kind == ReapplyKind::Auto {
            let folder = self.pool_folder(original.store, &request.folder_name);
            if let Err(e) = write_pool_files(
                &folder,
                outcome.certificate.as_deref().unwrap_or_default(),
                outcome.private_key.as_deref().unwrap_or_default(),
            ) {
                tracing::error!(
                    "Failed to write pool files for domain '{domain}' to {}: {e}",
                    folder.display()
                );
            }
        }

        self.emit_invalidate(vec![original.store], trigger::UPDATE)
            .await;
        tracing::info!("Certificate reapplication completed for domain '{domain}'");
    }
}

/// Changes for a settled issuance. Success carries PEMs plus parsed
/// metadata; failure restores `fallback_status` and records the error.
pub(crate) fn issued_changes(
    outcome: &IssueOutcome,
    fallback_status: CertStatus,
) -> Result<CertificateChanges> {
    if !outcome.success {
        return Ok(failure_changes(
            fallback_status,
            outcome.error.as_deref().unwrap_or("unknown error"),
        ));
    }

    let certificate = outcome
        .certificate
        .clone()
        .ok_or_else(|| CertError::acme("issuance succeeded but returned no certificate"))?;
    let private_key = outcome
        .private_key
        .clone()
        .ok_or_else(|| CertError::acme("issuance succeeded but returned no private key"))?;
    let parsed = parse_certificate_pem(&certificate)?;

    Ok(CertificateChanges {
        certificate: Some(certificate),
        private_key: Some(private_key),
        status: Some(CertStatus::Success),
        sans: Some(parsed.all_domains.clone()),
        issuer: Some(parsed.issuer.clone()),
        not_before: Some(parsed.not_before),
        not_after: Some(parsed.not_after),
        is_valid: Some(parsed.is_valid),
        days_remaining: Some(parsed.days_remaining),
        ..CertificateChanges::default()
    })
}

fn failure_changes(status: CertStatus, error: &str) -> CertificateChanges {
    CertificateChanges {
        status: Some(status),
        last_error_message: Some(error.to_string()),
        last_error_time: Some(Utc::now()),
        ..CertificateChanges::default()
    }
}

/// Whole-file overwrites at deterministic paths; naturally idempotent.
pub(crate) fn write_pool_files(
    folder: &std::path::Path,
    certificate: &str,
    private_key: &str,
) -> Result<()> {
    std::fs::create_dir_all(folder)?;
    std::fs::write(folder.join("cert.crt"), certificate)?;
    std::fs::write(folder.join("key.key"), private_key)?;
    Ok(())
}
