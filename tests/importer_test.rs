mod common;

use certpool::error::CertError;
use certpool::events::Event;
use certpool::repository::CertificateRepository;
use certpool::types::{CertSource, CertStatus, CertStore};
use certpool::worker::build_router;
use std::path::Path;

use common::{Harness, MockIssuer, leaf_pem};

fn write_pool_folder(certs_dir: &Path, store: &str, folder: &str, cert: &str, key: &str) {
    let path = certs_dir.join(store).join(folder);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("cert.crt"), cert).unwrap();
    std::fs::write(path.join("key.key"), key).unwrap();
}

#[tokio::test]
async fn import_creates_auto_row_from_fresh_folder() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["example.com", "www.example.com"], 90);
    write_pool_folder(
        harness.certs_dir.path(),
        "Websites",
        "acme_example_com",
        &cert,
        &key,
    );

    let report = harness
        .manager
        .import_store(CertStore::Websites, "manual")
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 0);

    let row = harness
        .repo
        .get_by_folder_name("acme_example_com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.store, CertStore::Websites);
    assert_eq!(row.domain, "example.com");
    assert_eq!(row.source, CertSource::Auto);
    assert_eq!(row.status, CertStatus::Success);
    assert_eq!(
        row.sans.unwrap(),
        vec!["example.com".to_string(), "www.example.com".to_string()]
    );
    assert!(row.certificate.is_some());
    assert!(row.is_valid.unwrap());

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CacheInvalidate(ev)
            if ev.stores == vec![CertStore::Websites] && ev.trigger == "manual"
    )));
    // The importer never echoes a refresh.
    assert!(!events.iter().any(|e| matches!(e, Event::Refresh(_))));
}

#[tokio::test]
async fn two_imports_over_unchanged_tree_are_identical() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["stable.example"], 90);
    write_pool_folder(harness.certs_dir.path(), "Apis", "stable_f", &cert, &key);

    harness
        .manager
        .import_store(CertStore::Apis, "manual")
        .await
        .unwrap();
    let first = harness
        .repo
        .get_by_folder_name("stable_f")
        .await
        .unwrap()
        .unwrap();

    harness
        .manager
        .import_store(CertStore::Apis, "manual")
        .await
        .unwrap();
    let second = harness
        .repo
        .get_by_folder_name("stable_f")
        .await
        .unwrap()
        .unwrap();

    // Same row, same content; only one row exists in total.
    assert_eq!(first.id, second.id);
    assert_eq!(first.domain, second.domain);
    assert_eq!(first.source, second.source);
    assert_eq!(first.sans, second.sans);
    assert_eq!(first.certificate, second.certificate);
    let page = harness.repo.list(CertStore::Apis, 0, 100).await.unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn import_preserves_source_of_existing_rows() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["owned.example"], 90);

    harness
        .repo
        .create_or_update(certpool::repository::CertificateUpsert {
            folder_name: Some("owned_f".to_string()),
            status: Some(CertStatus::Success),
            ..certpool::repository::CertificateUpsert::new(
                CertStore::Websites,
                "owned.example",
                CertSource::ManualApply,
            )
        })
        .await
        .unwrap();

    write_pool_folder(harness.certs_dir.path(), "Websites", "owned_f", &cert, &key);
    harness
        .manager
        .import_store(CertStore::Websites, "manual")
        .await
        .unwrap();

    let row = harness
        .repo
        .get_by_folder_name("owned_f")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source, CertSource::ManualApply);
    assert!(row.certificate.is_some());
}

#[tokio::test]
async fn import_skips_hidden_incomplete_and_unparseable_folders() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let certs_dir = harness.certs_dir.path();
    let (cert, key) = leaf_pem(&["good.example"], 90);

    write_pool_folder(certs_dir, "Websites", "good_f", &cert, &key);
    // Hidden folder.
    write_pool_folder(certs_dir, "Websites", ".certbot_state", &cert, &key);
    // Folder missing key.key.
    let half = certs_dir.join("Websites/half_f");
    std::fs::create_dir_all(&half).unwrap();
    std::fs::write(half.join("cert.crt"), &cert).unwrap();
    // Folder with garbage PEM.
    write_pool_folder(certs_dir, "Websites", "garbage_f", "not a pem", "not a key");
    // Stray file at the store root.
    std::fs::write(certs_dir.join("Websites/readme.txt"), "hi").unwrap();

    let report = harness
        .manager
        .import_store(CertStore::Websites, "manual")
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);

    let page = harness.repo.list(CertStore::Websites, 0, 100).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].folder_name.as_deref(), Some("good_f"));
}

#[tokio::test]
async fn import_rejects_database_store_and_tolerates_missing_dir() {
    let harness = Harness::new(MockIssuer::failing("unused"));

    assert!(matches!(
        harness.manager.import_store(CertStore::Database, "manual").await,
        Err(CertError::Validation(_))
    ));

    // Store directory absent: success with nothing processed.
    let report = harness
        .manager
        .import_store(CertStore::Apis, "manual")
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn refresh_event_runs_import_without_emitting_more_events() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["loop.example"], 90);
    write_pool_folder(harness.certs_dir.path(), "Websites", "loop_f", &cert, &key);

    let router = build_router(harness.manager.clone());
    let payload = serde_json::json!({ "store": "websites", "trigger": "manual" }).to_string();
    router
        .dispatch("operation.refresh", payload.as_bytes())
        .await
        .unwrap();

    // The import ran...
    let row = harness.repo.get_by_folder_name("loop_f").await.unwrap();
    assert!(row.is_some());

    // ...but a bus-originated import emits nothing: no refresh echo, no
    // cache.invalidate.
    let events = harness.sink.snapshot();
    assert!(events.is_empty(), "expected no events, got {events:?}");
}
