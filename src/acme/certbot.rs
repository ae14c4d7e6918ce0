/// Certbot subprocess driver
///
/// Runs `certbot certonly --webroot` under isolated state directories so
/// a host-installed ACME client never sees or touches our certificates.
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use super::{AcmeIssuer, IssueOutcome, IssueRequest, parse_rate_limit};
use crate::certificate::parse_certificate_pem;
use crate::error::{CertError, Result};

/// PEMs found under the client's `live/` directory during the pre-check.
#[derive(Debug, Clone)]
pub struct ExistingCertificate {
    pub certificate: String,
    pub private_key: String,
    /// Valid for at least another 24 hours.
    pub reusable: bool,
}

/// Certbot-backed ACME issuer.
pub struct CertbotClient {
    challenge_dir: PathBuf,
    certs_dir: PathBuf,
    max_wait: Duration,
}

impl CertbotClient {
    pub fn new(
        challenge_dir: impl Into<PathBuf>,
        certs_dir: impl Into<PathBuf>,
        max_wait: Duration,
    ) -> Result<Self> {
        let challenge_dir = challenge_dir.into();
        let certs_dir = certs_dir.into();
        if max_wait.is_zero() {
            return Err(CertError::configuration(
                "cert_max_wait_time must be greater than 0",
            ));
        }

        // Certbot webroot mode writes tokens under
        // {challenge_dir}/.well-known/acme-challenge/.
        std::fs::create_dir_all(challenge_dir.join(".well-known/acme-challenge"))?;
        std::fs::create_dir_all(&certs_dir)?;

        tracing::info!(
            "Certbot client initialized: challenge_dir={}, certs_dir={}, max_wait={}s",
            challenge_dir.display(),
            certs_dir.display(),
            max_wait.as_secs()
        );

        Ok(Self {
            challenge_dir,
            certs_dir,
            max_wait,
        })
    }

    fn config_dir(&self) -> PathBuf {
        self.certs_dir.join(".certbot/config")
    }

    fn work_dir(&self) -> PathBuf {
        self.certs_dir.join(".certbot/work")
    }

    fn logs_dir(&self) -> PathBuf {
        self.certs_dir.join(".certbot/logs")
    }

    fn live_dir(&self, folder_name: &str) -> PathBuf {
        self.config_dir().join("live").join(folder_name)
    }

    /// Look for PEMs from a previous issuance of the same cert name.
    /// A certificate counts as reusable when it stays valid for 24 hours.
    pub fn check_existing(&self, folder_name: &str) -> Option<ExistingCertificate> {
        let live = self.live_dir(folder_name);
        let cert_file = live.join("fullchain.pem");
        let key_file = live.join("privkey.pem");

        let certificate = std::fs::read_to_string(&cert_file).ok()?;
        let private_key = std::fs::read_to_string(&key_file).ok()?;
        if certificate.is_empty() || private_key.is_empty() {
            return None;
        }

        let reusable = match parse_certificate_pem(&certificate) {
            Ok(parsed) => parsed.not_after > Utc::now() + ChronoDuration::hours(24),
            Err(e) => {
                tracing::warn!(
                    "Failed to check existing certificate for '{folder_name}': {e}"
                );
                return None;
            }
        };

        Some(ExistingCertificate {
            certificate,
            private_key,
            reusable,
        })
    }

    fn build_command(&self, request: &IssueRequest) -> Command {
        let mut cmd = Command::new("certbot");
        cmd.arg("certonly")
            .arg("--webroot")
            .arg("--webroot-path")
            .arg(&self.challenge_dir)
            .arg("--email")
            .arg(&request.email)
            .arg("--agree-tos")
            .arg("--non-interactive")
            .arg("--cert-name")
            .arg(&request.folder_name)
            .arg("--config-dir")
            .arg(self.config_dir())
            .arg("--work-dir")
            .arg(self.work_dir())
            .arg("--logs-dir")
            .arg(self.logs_dir());

        if request.force_renewal {
            cmd.arg("--force-renewal");
        }

        cmd.arg("-d").arg(&request.domain);
        for san in &request.sans {
            cmd.arg("-d").arg(san);
        }

        cmd.kill_on_drop(true);
        cmd
    }

    fn read_issued(&self, request: &IssueRequest) -> IssueOutcome {
        let live = self.live_dir(&request.folder_name);
        let cert = std::fs::read_to_string(live.join("fullchain.pem"));
        let key = std::fs::read_to_string(live.join("privkey.pem"));
        match (cert, key) {
            (Ok(certificate), Ok(private_key)) => {
                tracing::info!(
                    "Certificate issued: domain={}, folder={}",
                    request.domain,
                    request.folder_name
                );
                IssueOutcome::issued(&request.domain, certificate, private_key)
            }
            _ => IssueOutcome::failed(format!(
                "Certificate files not found in {}",
                live.display()
            )),
        }
    }

    fn classify_failure(&self, request: &IssueRequest, output: &Output) -> IssueOutcome {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let error_output = if stderr.trim().is_empty() {
            stdout.to_string()
        } else {
            stderr.to_string()
        };
        tracing::error!(
            "Certbot failed: domain={}, code={:?}",
            request.domain,
            output.status.code()
        );

        if let Some(retry_after) = parse_rate_limit(&error_output) {
            if !request.force_renewal {
                if let Some(existing) = self.check_existing(&request.folder_name) {
                    tracing::warn!(
                        "Rate limit reached, using existing certificate for domain '{}'",
                        request.domain
                    );
                    return IssueOutcome::degraded(
                        &request.domain,
                        existing.certificate,
                        existing.private_key,
                        &retry_after,
                    );
                }
            }
            return IssueOutcome::rate_limited(&retry_after);
        }

        IssueOutcome::failed(error_output)
    }
}

#[async_trait]
impl AcmeIssuer for CertbotClient {
    async fn issue(&self, request: &IssueRequest) -> IssueOutcome {
        if !request.force_renewal {
            if let Some(existing) = self.check_existing(&request.folder_name) {
                if existing.reusable {
                    tracing::info!(
                        "Using existing certificate for domain '{}' (force_renewal=false)",
                        request.domain
                    );
                    return IssueOutcome::reused(
                        &request.domain,
                        existing.certificate,
                        existing.private_key,
                    );
                }
                tracing::info!(
                    "Existing certificate for domain '{}' expires within 24h, requesting a new one",
                    request.domain
                );
            }
        }

        for dir in [self.config_dir(), self.work_dir(), self.logs_dir()] {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                return IssueOutcome::failed(format!(
                    "Failed to prepare certbot directory {}: {e}",
                    dir.display()
                ));
            }
        }

        let mut cmd = self.build_command(request);
        tracing::info!(
            "Starting certbot: domain={}, folder={}, force_renewal={}",
            request.domain,
            request.folder_name,
            request.force_renewal
        );

        let output = match tokio::time::timeout(self.max_wait, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return IssueOutcome::failed(format!("Failed to run certbot: {e}")),
            Err(_) => {
                return IssueOutcome::failed(format!(
                    "Certbot command timeout after {}s",
                    self.max_wait.as_secs()
                ));
            }
        };

        log_challenge_dir(&self.challenge_dir);

        if output.status.success() {
            self.read_issued(request)
        } else {
            self.classify_failure(request, &output)
        }
    }
}

fn log_challenge_dir(challenge_dir: &Path) {
    let path = challenge_dir.join(".well-known/acme-challenge");
    match std::fs::read_dir(&path) {
        Ok(entries) => {
            let names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            tracing::debug!("Challenge files after certbot: {names:?}");
        }
        Err(_) => tracing::warn!("Challenge directory missing: {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::IssueRequest;
    use rcgen::{CertificateParams, KeyPair};

    fn write_live_cert(certs_dir: &Path, folder: &str, days: i64) {
        let mut params = CertificateParams::new(vec!["site.example".to_string()]).unwrap();
        let now = std::time::SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + Duration::from_secs((days * 86_400) as u64)).into();
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let live = certs_dir.join(".certbot/config/live").join(folder);
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("fullchain.pem"), cert.pem()).unwrap();
        std::fs::write(live.join("privkey.pem"), key_pair.serialize_pem()).unwrap();
    }

    fn client(root: &Path) -> CertbotClient {
        CertbotClient::new(
            root.join("challenge"),
            root.join("certs"),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn check_existing_flags_short_lived_certs() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path());

        write_live_cert(&tmp.path().join("certs"), "long", 30);
        let existing = client.check_existing("long").unwrap();
        assert!(existing.reusable);

        // Valid now but expiring inside the 24h reuse window.
        write_live_cert(&tmp.path().join("certs"), "short", 0);
        let existing = client.check_existing("short").unwrap();
        assert!(!existing.reusable);

        assert!(client.check_existing("absent").is_none());
    }

    #[tokio::test]
    async fn reuses_valid_certificate_without_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path());
        write_live_cert(&tmp.path().join("certs"), "acme_site", 30);

        // No certbot binary is involved: the pre-check short-circuits, so
        // this succeeds even on machines without an ACME client.
        let outcome = client
            .issue(&IssueRequest {
                domain: "site.example".to_string(),
                email: "a@b.c".to_string(),
                sans: vec![],
                folder_name: "acme_site".to_string(),
                force_renewal: false,
            })
            .await;

        assert!(outcome.success);
        assert!(outcome.message.contains("Using existing certificate"));
        assert!(outcome.certificate.is_some());
        assert!(outcome.private_key.is_some());
    }
}
