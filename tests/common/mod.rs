//! Shared test harness: in-memory collaborators around a real manager.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use certpool::acme::{AcmeIssuer, IssueOutcome, IssueRequest};
use certpool::cache::{CertCache, NullCache};
use certpool::events::MemoryEventSink;
use certpool::orchestrator::CertificateManager;
use certpool::repository::{CertificateRepository, MemoryCertificateRepository};
use certpool::types::{CertStatus, Certificate};

/// Issuer double returning a canned outcome and counting spawns.
pub struct MockIssuer {
    outcome: Mutex<IssueOutcome>,
    calls: AtomicUsize,
    last_request: Mutex<Option<IssueRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl MockIssuer {
    pub fn new(outcome: IssueOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    /// Hold each issuance open for a while, keeping the row in `process`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn succeeding(domains: &[&str]) -> Self {
        let (cert, key) = leaf_pem(domains, 90);
        Self::new(IssueOutcome::issued(domains[0], cert, key))
    }

    pub fn failing(error: &str) -> Self {
        Self::new(IssueOutcome::failed(error))
    }

    pub fn set_outcome(&self, outcome: IssueOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<IssueRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcmeIssuer for MockIssuer {
    async fn issue(&self, request: &IssueRequest) -> IssueOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.lock().unwrap().clone()
    }
}

/// Everything a test needs, with handles kept on the doubles.
pub struct Harness {
    pub manager: CertificateManager,
    pub repo: Arc<MemoryCertificateRepository>,
    pub sink: Arc<MemoryEventSink>,
    pub issuer: Arc<MockIssuer>,
    pub certs_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(issuer: MockIssuer) -> Self {
        let repo = Arc::new(MemoryCertificateRepository::new());
        let sink = Arc::new(MemoryEventSink::new());
        let issuer = Arc::new(issuer);
        let certs_dir = tempfile::tempdir().unwrap();

        let repo_dyn: Arc<dyn CertificateRepository> = repo.clone();
        let sink_dyn: Arc<dyn certpool::events::EventSink> = sink.clone();
        let issuer_dyn: Arc<dyn AcmeIssuer> = issuer.clone();
        let cache: Arc<dyn CertCache> = Arc::new(NullCache);

        let manager =
            CertificateManager::new(repo_dyn, cache, sink_dyn, issuer_dyn, certs_dir.path());
        Self {
            manager,
            repo,
            sink,
            issuer,
            certs_dir,
        }
    }
}

/// Self-signed leaf certificate plus key, both PEM.
pub fn leaf_pem(domains: &[&str], days_valid: i64) -> (String, String) {
    let mut params =
        rcgen::CertificateParams::new(domains.iter().map(|d| d.to_string()).collect::<Vec<_>>())
            .unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, domains[0]);
    let now = std::time::SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs((days_valid * 86_400) as u64)).into();

    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    (cert.pem(), key_pair.serialize_pem())
}

/// Poll until the row leaves `process` or the deadline passes, returning
/// the settled row.
pub async fn wait_until_settled(
    repo: &Arc<MemoryCertificateRepository>,
    id: Uuid,
) -> Certificate {
    for _ in 0..200 {
        if let Some(row) = repo.get_by_id(id).await.unwrap() {
            if row.status != CertStatus::Process {
                return row;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("certificate {id} never left process status");
}
