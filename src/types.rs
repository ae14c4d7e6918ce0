//! Core domain types: stores, sources, statuses, and the certificate entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CertError;

/// Where a certificate is materialized.
///
/// `websites` and `apis` are backed by a named folder in the reverse
/// proxy's certificate pool; `database` records live only in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStore {
    Websites,
    Apis,
    Database,
}

impl CertStore {
    pub const ALL: [CertStore; 3] = [CertStore::Websites, CertStore::Apis, CertStore::Database];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertStore::Websites => "websites",
            CertStore::Apis => "apis",
            CertStore::Database => "database",
        }
    }

    /// Capitalized directory name under the pool root (`Websites`, `Apis`).
    pub fn folder_component(&self) -> &'static str {
        match self {
            CertStore::Websites => "Websites",
            CertStore::Apis => "Apis",
            CertStore::Database => "Database",
        }
    }

    /// Whether records in this store mirror a pool folder on disk.
    pub fn is_pool_backed(&self) -> bool {
        matches!(self, CertStore::Websites | CertStore::Apis)
    }
}

impl fmt::Display for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertStore {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websites" => Ok(CertStore::Websites),
            "apis" => Ok(CertStore::Apis),
            "database" => Ok(CertStore::Database),
            other => Err(CertError::validation(format!(
                "store must be one of websites/apis/database, got '{other}'"
            ))),
        }
    }
}

/// Provenance of a certificate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertSource {
    /// Discovered by importing a pool folder; all fields derived, edits forbidden.
    Auto,
    /// User requested ACME issuance; content produced by the ACME driver.
    ManualApply,
    /// User pasted PEMs; all fields editable.
    ManualAdd,
}

impl CertSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertSource::Auto => "auto",
            CertSource::ManualApply => "manual_apply",
            CertSource::ManualAdd => "manual_add",
        }
    }
}

impl fmt::Display for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertSource {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CertSource::Auto),
            "manual_apply" => Ok(CertSource::ManualApply),
            "manual_add" => Ok(CertSource::ManualAdd),
            other => Err(CertError::validation(format!(
                "source must be one of auto/manual_apply/manual_add, got '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of a certificate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Success,
    Fail,
    /// In-flight: a parse or an ACME issuance is running against this row.
    Process,
}

impl CertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertStatus::Success => "success",
            CertStatus::Fail => "fail",
            CertStatus::Process => "process",
        }
    }
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertStatus {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CertStatus::Success),
            "fail" => Ok(CertStatus::Fail),
            "process" => Ok(CertStatus::Process),
            other => Err(CertError::validation(format!(
                "status must be one of success/fail/process, got '{other}'"
            ))),
        }
    }
}

/// A certificate row as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub store: CertStore,
    pub domain: String,
    /// Globally-unique pool folder name, when the record is folder-backed.
    pub folder_name: Option<String>,
    pub source: CertSource,
    pub status: CertStatus,
    pub email: Option<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    /// DNS names: CN first (when present), then SAN entries, deduplicated.
    pub sans: Option<Vec<String>>,
    pub issuer: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub is_valid: Option<bool>,
    pub days_remaining: Option<i64>,
    pub last_error_message: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Certificate {
    /// List-row projection without PEM material.
    pub fn summary(&self) -> CertificateSummary {
        CertificateSummary {
            id: self.id,
            store: self.store,
            domain: self.domain.clone(),
            folder_name: self.folder_name.clone(),
            source: self.source,
            status: self.status,
            email: self.email.clone(),
            issuer: self.issuer.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            is_valid: self.is_valid,
            days_remaining: self.days_remaining,
            last_error_message: self.last_error_message.clone(),
            last_error_time: self.last_error_time,
        }
    }

    /// Detail projection including PEM material. Absent fields are omitted
    /// when serialized so the value stands on its own in the cache.
    pub fn detail(&self) -> CertificateDetail {
        CertificateDetail {
            id: self.id,
            store: self.store,
            domain: self.domain.clone(),
            folder_name: self.folder_name.clone(),
            source: self.source,
            status: self.status,
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone(),
            sans: self.sans.clone().unwrap_or_default(),
            issuer: self.issuer.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            is_valid: self.is_valid,
            days_remaining: self.days_remaining,
        }
    }
}

/// Self-describing list row, cached and served as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub id: Uuid,
    pub store: CertStore,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
    pub source: CertSource,
    pub status: CertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Self-describing detail view, cached and served as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateDetail {
    pub id: Uuid,
    pub store: CertStore,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
    pub source: CertSource,
    pub status: CertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub sans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
}

/// One page of a paginated query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Cached value for the list projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateListPage {
    pub certificates: Vec<CertificateSummary>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_roundtrip() {
        for store in CertStore::ALL {
            assert_eq!(store.as_str().parse::<CertStore>().unwrap(), store);
        }
        assert!("postgres".parse::<CertStore>().is_err());
    }

    #[test]
    fn pool_backed_stores() {
        assert!(CertStore::Websites.is_pool_backed());
        assert!(CertStore::Apis.is_pool_backed());
        assert!(!CertStore::Database.is_pool_backed());
    }

    #[test]
    fn serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&CertSource::ManualApply).unwrap(),
            "\"manual_apply\""
        );
        assert_eq!(
            serde_json::from_str::<CertStatus>("\"process\"").unwrap(),
            CertStatus::Process
        );
    }

    #[test]
    fn folder_component_is_capitalized() {
        assert_eq!(CertStore::Websites.folder_component(), "Websites");
        assert_eq!(CertStore::Apis.folder_component(), "Apis");
    }
}
