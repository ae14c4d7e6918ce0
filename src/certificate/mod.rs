//! Certificate material handling: PEM parsing and derived metadata.

pub mod parse;

pub use parse::{ParsedCertificate, days_remaining, parse_certificate_pem};
