//! ACME issuance driver.
//!
//! Obtains certificates from Let's Encrypt through the HTTP-01 webroot
//! flow by invoking an external ACME client as a subprocess. The driver
//! is stateless; concurrent calls for different folder names are safe,
//! and same-folder calls are serialized by the orchestrator's status gate
//! plus the client's own file lock.

pub mod certbot;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::types::CertStatus;

/// One issuance request.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub domain: String,
    pub email: String,
    pub sans: Vec<String>,
    /// Certificate name inside the ACME client's state directory.
    pub folder_name: String,
    /// Reissue even when a valid certificate already exists.
    pub force_renewal: bool,
}

/// Union outcome of one issuance attempt. The driver never fails across
/// this boundary; callers branch on the fields.
#[derive(Debug, Clone, Serialize)]
pub struct IssueOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub status: CertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rate_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}

impl IssueOutcome {
    /// Fresh PEMs obtained from the CA.
    pub fn issued(domain: &str, certificate: String, private_key: String) -> Self {
        Self {
            success: true,
            message: format!("Certificate issued successfully for domain '{domain}'"),
            certificate: Some(certificate),
            private_key: Some(private_key),
            status: CertStatus::Success,
            error: None,
            warning: None,
            rate_limit: false,
            retry_after: None,
        }
    }

    /// Existing PEMs reused without contacting the CA.
    pub fn reused(domain: &str, certificate: String, private_key: String) -> Self {
        Self {
            success: true,
            message: format!(
                "Certificate already exists and is valid for domain '{domain}'. \
                 Using existing certificate."
            ),
            certificate: Some(certificate),
            private_key: Some(private_key),
            status: CertStatus::Success,
            error: None,
            warning: None,
            rate_limit: false,
            retry_after: None,
        }
    }

    /// Rate limit hit but existing PEMs could be served; non-fatal.
    pub fn degraded(
        domain: &str,
        certificate: String,
        private_key: String,
        retry_after: &str,
    ) -> Self {
        Self {
            success: true,
            message: format!(
                "Rate limit reached for domain '{domain}', but using existing certificate. \
                 New certificate can be requested after {retry_after} UTC."
            ),
            certificate: Some(certificate),
            private_key: Some(private_key),
            status: CertStatus::Success,
            error: None,
            warning: Some(format!(
                "Rate limit reached. New certificate can be requested after {retry_after} UTC."
            )),
            rate_limit: false,
            retry_after: Some(retry_after.to_string()),
        }
    }

    /// Rate limit hit with nothing to fall back to.
    pub fn rate_limited(retry_after: &str) -> Self {
        let message = format!(
            "Let's Encrypt rate limit reached: too many certificates already issued for this \
             exact set of identifiers. Retry after {retry_after} UTC."
        );
        Self {
            success: false,
            message: message.clone(),
            certificate: None,
            private_key: None,
            status: CertStatus::Fail,
            error: Some(message),
            warning: None,
            rate_limit: true,
            retry_after: Some(retry_after.to_string()),
        }
    }

    /// Any other failure.
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            message: format!("Certificate application failed: {error}"),
            certificate: None,
            private_key: None,
            status: CertStatus::Fail,
            error: Some(error),
            warning: None,
            rate_limit: false,
            retry_after: None,
        }
    }
}

/// Drives an external ACME client to completion.
#[async_trait]
pub trait AcmeIssuer: Send + Sync {
    async fn issue(&self, request: &IssueRequest) -> IssueOutcome;
}

#[async_trait]
impl<T: AcmeIssuer + ?Sized> AcmeIssuer for std::sync::Arc<T> {
    async fn issue(&self, request: &IssueRequest) -> IssueOutcome {
        (**self).issue(request).await
    }
}

// Public ACME-client string; the phrase must match exactly.
// "too many certificates (5) already issued for this exact set of
//  identifiers in the last 168h0m0s, retry after 2026-01-18 16:49:07 UTC"
static RATE_LIMIT_RE: OnceLock<Regex> = OnceLock::new();

/// Extract the retry-after timestamp from a rate-limit rejection, if the
/// output contains one.
pub fn parse_rate_limit(output: &str) -> Option<String> {
    let re = RATE_LIMIT_RE.get_or_init(|| {
        Regex::new(r"(?i)too many certificates.*?retry after (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})")
            .expect("rate limit pattern is valid")
    });
    re.captures(output)
        .map(|caps| caps[1].to_string())
}

pub use certbot::CertbotClient;
