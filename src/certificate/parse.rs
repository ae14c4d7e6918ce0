/// PEM parsing and metadata extraction for leaf certificates
use chrono::{DateTime, Utc};
use pem::parse_many;
use x509_parser::asn1_rs::FromDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::GeneralName;
use x509_parser::prelude::ParsedExtension;

use crate::error::{CertError, Result};

/// Metadata extracted from the leaf certificate of a PEM bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCertificate {
    pub common_name: Option<String>,
    /// SAN DNS entries in declaration order.
    pub sans: Vec<String>,
    /// CN first (when present), then SAN entries, deduplicated.
    pub all_domains: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_valid: bool,
    pub days_remaining: i64,
}

/// Whole days until `not_after`, floored. Negative once expired.
pub fn days_remaining(not_after: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds().div_euclid(86_400)
}

/// Parse the first CERTIFICATE block of a PEM bundle and extract the
/// fields the store keeps alongside the raw material.
pub fn parse_certificate_pem(pem_text: &str) -> Result<ParsedCertificate> {
    let leaf = parse_many(pem_text.as_bytes())
        .map_err(|e| CertError::parse(format!("Failed to parse PEM: {e}")))?
        .into_iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .ok_or_else(|| CertError::parse("No certificate found in PEM data"))?;

    let (_, cert) = X509Certificate::from_der(leaf.contents())
        .map_err(|e| CertError::parse(format!("Invalid X.509 certificate: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .find_map(|cn| cn.as_str().ok().map(str::to_string));

    let mut sans = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san_ext) = ext.parsed_extension() {
            for name in &san_ext.general_names {
                if let GeneralName::DNSName(dns) = name {
                    sans.push(dns.to_string());
                }
            }
        }
    }

    // Issuer organization reads better than the full DN; fall back to its CN.
    let issuer = cert
        .issuer()
        .iter_organization()
        .find_map(|o| o.as_str().ok().map(str::to_string))
        .or_else(|| {
            cert.issuer()
                .iter_common_name()
                .find_map(|cn| cn.as_str().ok().map(str::to_string))
        })
        .unwrap_or_else(|| cert.issuer().to_string());

    let not_before = timestamp_to_utc(cert.validity().not_before.timestamp())?;
    let not_after = timestamp_to_utc(cert.validity().not_after.timestamp())?;

    let now = Utc::now();
    let days = days_remaining(not_after, now);

    let mut all_domains: Vec<String> = Vec::with_capacity(sans.len() + 1);
    if let Some(cn) = &common_name {
        all_domains.push(cn.clone());
    }
    for san in &sans {
        if !all_domains.contains(san) {
            all_domains.push(san.clone());
        }
    }

    Ok(ParsedCertificate {
        common_name,
        sans,
        all_domains,
        issuer,
        not_before,
        not_after,
        is_valid: days >= 0,
        days_remaining: days,
    })
}

fn timestamp_to_utc(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertError::parse(format!("Validity timestamp out of range: {secs}")))
}
