//! Daily expiry sweep: recompute days remaining for every row, then
//! force-renew pool-imported certificates that are about to lapse.

use serde::Serialize;

use super::CertificateManager;
use crate::acme::IssueRequest;
use crate::error::Result;
use crate::events::{Event, ExportCertificateEvent};
use crate::repository::CertificateChanges;
use crate::types::{CertSource, CertStatus, CertStore, Certificate};

/// Renew when fewer than this many days remain.
const RENEW_THRESHOLD_DAYS: i64 = 10;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Serialize)]
pub struct RenewalReport {
    pub updated: u64,
    pub total: u64,
    pub candidates: usize,
    pub renewed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CertificateManager {
    /// Refresh every row's `days_remaining`, then renew expiring `auto`
    /// certificates synchronously, one at a time. Successful renewals
    /// emit `certificate.export` so the worker role persists the pool
    /// files.
    pub async fn renew_expiring(&self) -> Result<RenewalReport> {
        let refresh = self.repository().update_all_days_remaining().await?;
        tracing::info!(
            "Days-remaining refresh: updated {}/{} certificates",
            refresh.updated,
            refresh.total
        );

        let mut report = RenewalReport {
            updated: refresh.updated,
            total: refresh.total,
            candidates: 0,
            renewed: 0,
            failed: 0,
            skipped: 0,
        };

        for row in refresh.rows {
            if row.source != CertSource::Auto {
                continue;
            }
            let Some(days) = row.days_remaining else {
                continue;
            };
            if days >= RENEW_THRESHOLD_DAYS {
                continue;
            }

            // Auto rows must never live in the database store; skip with
            // a warning instead of issuing against a phantom pool folder.
            if row.store == CertStore::Database {
                tracing::warn!(
                    "auto certificate in database store, skipping renewal: id={}, domain={}",
                    row.id,
                    row.domain
                );
                report.skipped += 1;
                continue;
            }

            report.candidates += 1;
            tracing::info!(
                "Renewing expiring certificate: domain={}, days_remaining={days}",
                row.domain
            );
            if self.renew_one(&row).await {
                report.renewed += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.candidates > 0 {
            tracing::info!(
                "Auto-renewal finished: renewed {}/{} certificates",
                report.renewed,
                report.candidates
            );
        }
        Ok(report)
    }

    /// Renew one row in place. Returns whether the renewal succeeded; on
    /// failure the pre-call status is restored.
    async fn renew_one(&self, row: &Certificate) -> bool {
        let Some(email) = row.email.clone().filter(|e| !e.is_empty()) else {
            tracing::error!(
                "Certificate has no contact email, cannot renew: id={}, domain={}",
                row.id,
                row.domain
            );
            return false;
        };
        let Some(folder_name) = row.folder_name.clone() else {
            tracing::error!(
                "Certificate has no folder_name, cannot renew: id={}, domain={}",
                row.id,
                row.domain
            );
            return false;
        };

        let original = match self.repository().begin_processing(row.id).await {
            Ok(original) => original,
            Err(e) => {
                tracing::warn!("Skipping renewal for domain '{}': {e}", row.domain);
                return false;
            }
        };

        let sans: Vec<String> = original
            .sans
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|san| san != &original.domain)
            .collect();

        let outcome = self
            .issuer
            .issue(&IssueRequest {
                domain: original.domain.clone(),
                email,
                sans,
                folder_name,
                force_renewal: true,
            })
            .await;

        let changes = match super::provisioner::issued_changes(&outcome, original.status) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::error!(
                    "Renewal result unusable for domain '{}': {e}",
                    original.domain
                );
                restore_changes(original.status, &e.to_string())
            }
        };

        if let Err(e) = self.repository().update_by_id(row.id, changes).await {
            tracing::error!(
                "Failed to persist renewal for domain '{}': {e}",
                original.domain
            );
            return false;
        }

        if outcome.success {
            // The worker role writes the pool files back.
            self.emit(Event::Export(ExportCertificateEvent {
                certificate_id: row.id,
            }))
            .await;
            tracing::info!("Certificate renewed: domain={}", original.domain);
            true
        } else {
            tracing::error!(
                "Certificate renewal failed for domain '{}': {}. Status restored.",
                original.domain,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            false
        }
    }
}

fn restore_changes(status: CertStatus, error: &str) -> CertificateChanges {
    CertificateChanges {
        status: Some(status),
        last_error_message: Some(error.to_string()),
        last_error_time: Some(chrono::Utc::now()),
        ..CertificateChanges::default()
    }
}
