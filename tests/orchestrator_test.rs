mod common;

use certpool::acme::IssueOutcome;
use certpool::error::CertError;
use certpool::events::Event;
use certpool::orchestrator::{
    ApplyInput, CreateCertificateInput, ReapplyAutoInput, ReapplyManualAddInput,
    UpdateManualAddInput, UpdateManualApplyInput,
};
use certpool::repository::{CertificateRepository, CertificateUpsert};
use certpool::types::{CertSource, CertStatus, CertStore};
use certpool::worker::build_router;
use chrono::{Duration, Utc};

use common::{Harness, MockIssuer, leaf_pem, wait_until_settled};

fn create_input(domain: &str, cert: &str, key: &str) -> CreateCertificateInput {
    CreateCertificateInput {
        store: CertStore::Database,
        domain: domain.to_string(),
        certificate: cert.to_string(),
        private_key: key.to_string(),
        sans: None,
        folder_name: None,
        email: None,
        issuer: None,
    }
}

async fn seed_auto(
    harness: &Harness,
    domain: &str,
    store: CertStore,
    folder: &str,
    days: i64,
) -> certpool::types::Certificate {
    let (cert, key) = leaf_pem(&[domain], days);
    harness
        .repo
        .create_or_update(CertificateUpsert {
            folder_name: Some(folder.to_string()),
            status: Some(CertStatus::Success),
            email: Some("ops@example.com".to_string()),
            certificate: Some(cert),
            private_key: Some(key),
            sans: Some(vec![domain.to_string()]),
            not_after: Some(Utc::now() + Duration::days(days)),
            days_remaining: Some(days),
            is_valid: Some(true),
            ..CertificateUpsert::new(store, domain, CertSource::Auto)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn manual_add_creates_in_process_and_emits_parse() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["foo.test"], 90);

    let detail = harness
        .manager
        .create_manual_add(create_input("foo.test", &cert, &key))
        .await
        .unwrap();
    assert_eq!(detail.status, CertStatus::Process);
    assert_eq!(detail.source, CertSource::ManualAdd);

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CacheInvalidate(ev) if ev.stores == vec![CertStore::Database] && ev.trigger == "add"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Parse(ev) if ev.certificate_id == detail.id
    )));

    // Same (store, domain, manual_add) again is a conflict.
    let err = harness
        .manager
        .create_manual_add(create_input("foo.test", &cert, &key))
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Conflict(_)));
}

#[tokio::test]
async fn parse_event_settles_manual_add_and_search_finds_it() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["foo.test", "www.foo.test"], 90);

    let detail = harness
        .manager
        .create_manual_add(create_input("foo.test", &cert, &key))
        .await
        .unwrap();

    // Feed the emitted parse event through the worker router.
    let router = build_router(harness.manager.clone());
    let payload = serde_json::json!({ "certificate_id": detail.id }).to_string();
    router
        .dispatch("certificate.parse", payload.as_bytes())
        .await
        .unwrap();

    let row = harness.repo.get_by_id(detail.id).await.unwrap().unwrap();
    assert_eq!(row.status, CertStatus::Success);
    let sans = row.sans.unwrap();
    assert_eq!(sans[0], "foo.test");
    assert!(sans.contains(&"www.foo.test".to_string()));
    assert!(row.not_after.is_some());
    assert!(row.days_remaining.unwrap() > 80);

    let (items, total) = harness
        .manager
        .search("foo", None, None, 0, 20)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(items[0].domain, "foo.test");
}

#[tokio::test]
async fn parse_event_fails_unreadable_pem() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let detail = harness
        .manager
        .create_manual_add(create_input("bad.test", "not a pem", "not a key"))
        .await
        .unwrap();

    let router = build_router(harness.manager.clone());
    let payload = serde_json::json!({ "certificate_id": detail.id }).to_string();
    router
        .dispatch("certificate.parse", payload.as_bytes())
        .await
        .unwrap();

    let row = harness.repo.get_by_id(detail.id).await.unwrap().unwrap();
    assert_eq!(row.status, CertStatus::Fail);
    // Derived fields are zeroed; identity survives.
    assert_eq!(row.sans, Some(Vec::new()));
    assert_eq!(row.is_valid, Some(false));
    assert!(row.not_after.is_none());
    assert_eq!(row.domain, "bad.test");
}

#[tokio::test]
async fn apply_spawns_background_issuance_and_settles() {
    let harness = Harness::new(MockIssuer::succeeding(&["site.example"]));

    let ack = harness
        .manager
        .apply(ApplyInput {
            domain: "site.example".to_string(),
            email: "a@b.c".to_string(),
            folder_name: "acme_site".to_string(),
            sans: None,
            webroot: None,
        })
        .await
        .unwrap();
    assert!(ack.success);
    assert_eq!(ack.status, CertStatus::Process);

    let row = harness
        .repo
        .get_by_domain(CertStore::Database, "site.example", CertSource::ManualApply)
        .await
        .unwrap()
        .unwrap();
    let row = wait_until_settled(&harness.repo, row.id).await;
    assert_eq!(row.status, CertStatus::Success);
    assert!(row.certificate.is_some());
    assert!(row.private_key.is_some());
    assert_eq!(row.sans.as_ref().unwrap()[0], "site.example");
    assert_eq!(harness.issuer.calls(), 1);

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CacheInvalidate(ev) if ev.trigger == "apply"
    )));
}

#[tokio::test]
async fn apply_rejects_bad_inputs_and_inflight_duplicates() {
    let harness = Harness::new(MockIssuer::failing("unused"));

    let err = harness
        .manager
        .apply(ApplyInput {
            domain: "site.example".to_string(),
            email: "not-an-email".to_string(),
            folder_name: "x".to_string(),
            sans: None,
            webroot: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Validation(_)));

    let err = harness
        .manager
        .apply(ApplyInput {
            domain: "site.example".to_string(),
            email: "a@b.c".to_string(),
            folder_name: "  ".to_string(),
            sans: None,
            webroot: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Validation(_)));

    // An in-flight row for the same domain blocks a second apply.
    harness
        .repo
        .create_or_update(CertificateUpsert {
            folder_name: Some("busy_site".to_string()),
            status: Some(CertStatus::Process),
            ..CertificateUpsert::new(CertStore::Database, "busy.example", CertSource::ManualApply)
        })
        .await
        .unwrap();
    let err = harness
        .manager
        .apply(ApplyInput {
            domain: "busy.example".to_string(),
            email: "a@b.c".to_string(),
            folder_name: "busy_site".to_string(),
            sans: None,
            webroot: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Conflict(_)));
}

#[tokio::test]
async fn concurrent_reapply_yields_exactly_one_process_transition() {
    // The issuance is held open so the second caller arrives while the
    // row is still in process.
    let issuer = MockIssuer::succeeding(&["gate.example"])
        .with_delay(std::time::Duration::from_millis(300));
    let harness = Harness::new(issuer);
    let row = seed_auto(&harness, "gate.example", CertStore::Apis, "gate_folder", 30).await;

    let input = || ReapplyAutoInput {
        email: "a@b.c".to_string(),
        sans: None,
        force_renewal: true,
    };
    let (first, second) = tokio::join!(
        harness.manager.reapply_auto(row.id, input()),
        harness.manager.reapply_auto(row.id, input()),
    );

    // The gate admits exactly one of the two.
    let oks = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1);
    let conflict = if first.is_err() { first } else { second };
    match conflict {
        Err(CertError::Conflict(msg)) => assert!(msg.contains("already being processed")),
        other => panic!("expected conflict, got {other:?}"),
    }

    let settled = wait_until_settled(&harness.repo, row.id).await;
    assert_eq!(settled.status, CertStatus::Success);
    assert_eq!(harness.issuer.calls(), 1);
}

#[tokio::test]
async fn reapply_auto_writes_back_to_pool_folder() {
    let harness = Harness::new(MockIssuer::succeeding(&["xy.example"]));
    let row = seed_auto(&harness, "xy.example", CertStore::Apis, "xy", 30).await;

    harness
        .manager
        .reapply_auto(
            row.id,
            ReapplyAutoInput {
                email: "a@b.c".to_string(),
                sans: Some(vec![]),
                force_renewal: true,
            },
        )
        .await
        .unwrap();

    let settled = wait_until_settled(&harness.repo, row.id).await;
    assert_eq!(settled.status, CertStatus::Success);
    assert_eq!(settled.source, CertSource::Auto);

    let folder = harness.certs_dir.path().join("Apis/xy");
    let written = std::fs::read_to_string(folder.join("cert.crt")).unwrap();
    assert_eq!(Some(written), settled.certificate);
    assert!(folder.join("key.key").is_file());

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CacheInvalidate(ev) if ev.stores == vec![CertStore::Apis]
    )));
    assert_eq!(
        harness.issuer.last_request().unwrap().force_renewal,
        true
    );
}

#[tokio::test]
async fn failed_reapply_restores_status_and_records_error() {
    let harness = Harness::new(MockIssuer::failing("DNS problem: NXDOMAIN"));
    let row = seed_auto(&harness, "broken.example", CertStore::Websites, "broken", 30).await;

    harness
        .manager
        .reapply_auto(
            row.id,
            ReapplyAutoInput {
                email: "a@b.c".to_string(),
                sans: None,
                force_renewal: true,
            },
        )
        .await
        .unwrap();

    let settled = wait_until_settled(&harness.repo, row.id).await;
    assert_eq!(settled.status, CertStatus::Success); // restored pre-call status
    assert!(settled
        .last_error_message
        .as_deref()
        .unwrap()
        .contains("NXDOMAIN"));
    assert!(settled.last_error_time.is_some());
    // No pool write on failure.
    assert!(!harness.certs_dir.path().join("Websites/broken/cert.crt").exists());
}

#[tokio::test]
async fn reapply_manual_add_only_rewrites_material() {
    let harness = Harness::new(MockIssuer::succeeding(&["upload.example"]));
    let (cert, key) = leaf_pem(&["upload.example"], 90);
    let detail = harness
        .manager
        .create_manual_add(create_input("upload.example", &cert, &key))
        .await
        .unwrap();
    // Settle the freshly-created row so the gate admits the reapply.
    harness
        .repo
        .update_parse_result(
            detail.id,
            certpool::repository::ParseResultUpdate::default(),
            CertStatus::Success,
        )
        .await
        .unwrap();
    harness
        .repo
        .update_by_id(
            detail.id,
            certpool::repository::CertificateChanges {
                folder_name: Some("upload_folder".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    harness
        .manager
        .reapply_manual_add(
            detail.id,
            ReapplyManualAddInput {
                email: "a@b.c".to_string(),
                sans: None,
                force_renewal: true,
            },
        )
        .await
        .unwrap();

    let settled = wait_until_settled(&harness.repo, detail.id).await;
    assert_eq!(settled.status, CertStatus::Success);
    assert_eq!(settled.source, CertSource::ManualAdd);
    assert_eq!(settled.store, CertStore::Database);
    assert_eq!(settled.domain, "upload.example");
    assert_ne!(settled.certificate.as_deref(), Some(cert.as_str()));
}

#[tokio::test]
async fn reapply_manual_apply_moves_domain_and_folder_but_not_store() {
    let harness = Harness::new(MockIssuer::succeeding(&["new.example"]));
    let row = harness
        .repo
        .create_or_update(certpool::repository::CertificateUpsert {
            folder_name: Some("old_folder".to_string()),
            status: Some(CertStatus::Success),
            ..certpool::repository::CertificateUpsert::new(
                CertStore::Database,
                "old.example",
                CertSource::ManualApply,
            )
        })
        .await
        .unwrap();

    harness
        .manager
        .reapply_manual_apply(
            row.id,
            certpool::orchestrator::ReapplyManualApplyInput {
                domain: "new.example".to_string(),
                email: "a@b.c".to_string(),
                folder_name: "new_folder".to_string(),
                sans: None,
                force_renewal: true,
            },
        )
        .await
        .unwrap();

    let settled = wait_until_settled(&harness.repo, row.id).await;
    assert_eq!(settled.status, CertStatus::Success);
    assert_eq!(settled.domain, "new.example");
    assert_eq!(settled.folder_name.as_deref(), Some("new_folder"));
    assert_eq!(settled.store, CertStore::Database);
    assert_eq!(settled.source, CertSource::ManualApply);
    assert_eq!(harness.issuer.last_request().unwrap().domain, "new.example");
}

#[tokio::test]
async fn update_rules_follow_source() {
    let harness = Harness::new(MockIssuer::failing("unused"));

    // auto is immutable.
    let auto_row = seed_auto(&harness, "ro.example", CertStore::Websites, "ro", 30).await;
    let err = harness
        .manager
        .update_manual_add(auto_row.id, UpdateManualAddInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Validation(_)));

    // manual_apply may move folder and pool store, never to database.
    harness
        .repo
        .create_or_update(CertificateUpsert {
            folder_name: Some("ma_folder".to_string()),
            status: Some(CertStatus::Success),
            ..CertificateUpsert::new(CertStore::Database, "ma.example", CertSource::ManualApply)
        })
        .await
        .unwrap();
    let err = harness
        .manager
        .update_manual_apply(UpdateManualApplyInput {
            domain: "ma.example".to_string(),
            folder_name: "ma_folder".to_string(),
            store: Some(CertStore::Database),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Validation(_)));

    let ack = harness
        .manager
        .update_manual_apply(UpdateManualApplyInput {
            domain: "ma.example".to_string(),
            folder_name: "ma_folder_2".to_string(),
            store: None,
        })
        .await
        .unwrap();
    assert!(ack.success);

    // Source survives every update path.
    let row = harness
        .repo
        .get_by_folder_name("ma_folder_2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source, CertSource::ManualApply);
}

#[tokio::test]
async fn touching_manual_add_pem_resets_to_process_and_reparses() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["edit.example"], 90);
    let detail = harness
        .manager
        .create_manual_add(create_input("edit.example", &cert, &key))
        .await
        .unwrap();
    harness
        .repo
        .update_parse_result(
            detail.id,
            certpool::repository::ParseResultUpdate::default(),
            CertStatus::Success,
        )
        .await
        .unwrap();
    let before_events = harness.sink.drain();
    assert!(!before_events.is_empty());

    let (new_cert, _) = leaf_pem(&["edit.example"], 120);
    let updated = harness
        .manager
        .update_manual_add(
            detail.id,
            UpdateManualAddInput {
                certificate: Some(new_cert),
                ..UpdateManualAddInput::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, CertStatus::Process);

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Parse(ev) if ev.certificate_id == detail.id
    )));
}

#[tokio::test]
async fn delete_cascades_folder_delete_and_full_invalidate() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let row = seed_auto(&harness, "gone.example", CertStore::Websites, "yz", 30).await;
    harness.sink.drain();

    let ack = harness.manager.delete(row.id).await.unwrap();
    assert!(ack.success);
    assert!(harness.repo.get_by_id(row.id).await.unwrap().is_none());

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::DeleteFolder(ev) if ev.store == CertStore::Websites && ev.folder_name == "yz"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::CacheInvalidate(ev)
            if ev.stores == CertStore::ALL.to_vec() && ev.trigger == "delete"
    )));
}

#[tokio::test]
async fn delete_of_database_row_emits_no_folder_delete() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["db.example"], 30);
    let detail = harness
        .manager
        .create_manual_add(create_input("db.example", &cert, &key))
        .await
        .unwrap();
    harness.sink.drain();

    harness.manager.delete(detail.id).await.unwrap();
    let events = harness.sink.snapshot();
    assert!(!events.iter().any(|e| matches!(e, Event::DeleteFolder(_))));
}

#[tokio::test]
async fn renewal_skips_auto_rows_in_database_store() {
    let harness = Harness::new(MockIssuer::succeeding(&["skip.example"]));
    // Violates the store invariant; the sweep must warn and skip.
    seed_auto(&harness, "skip.example", CertStore::Database, "skip_f", 3).await;

    let report = harness.manager.renew_expiring().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.candidates, 0);
    assert_eq!(harness.issuer.calls(), 0);

    let row = harness
        .repo
        .get_by_folder_name("skip_f")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, CertStatus::Success);
}

#[tokio::test]
async fn renewal_reissues_expiring_auto_rows_and_emits_export() {
    let harness = Harness::new(MockIssuer::succeeding(&["soon.example"]));
    let row = seed_auto(&harness, "soon.example", CertStore::Websites, "soon_f", 5).await;
    seed_auto(&harness, "fine.example", CertStore::Websites, "fine_f", 60).await;
    harness.sink.drain();

    let report = harness.manager.renew_expiring().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.renewed, 1);
    assert_eq!(harness.issuer.calls(), 1);
    assert!(harness.issuer.last_request().unwrap().force_renewal);

    let renewed = harness.repo.get_by_id(row.id).await.unwrap().unwrap();
    assert_eq!(renewed.status, CertStatus::Success);
    assert!(renewed.days_remaining.unwrap() > 30);

    let events = harness.sink.snapshot();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Export(ev) if ev.certificate_id == row.id
    )));
}

#[tokio::test]
async fn failed_renewal_restores_status() {
    let harness = Harness::new(MockIssuer::failing("rate limited hard"));
    let row = seed_auto(&harness, "fails.example", CertStore::Apis, "fails_f", 2).await;

    let report = harness.manager.renew_expiring().await.unwrap();
    assert_eq!(report.failed, 1);

    let restored = harness.repo.get_by_id(row.id).await.unwrap().unwrap();
    assert_eq!(restored.status, CertStatus::Success);
    assert!(restored.last_error_message.is_some());
}

#[tokio::test]
async fn export_writes_files_and_mirrors_auto_sibling() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    let (cert, key) = leaf_pem(&["mirror.example"], 60);
    let origin = harness
        .repo
        .create_or_update(CertificateUpsert {
            folder_name: Some("mirror_f".to_string()),
            status: Some(CertStatus::Success),
            certificate: Some(cert.clone()),
            private_key: Some(key),
            ..CertificateUpsert::new(CertStore::Websites, "mirror.example", CertSource::ManualApply)
        })
        .await
        .unwrap();

    let report = harness.manager.export_certificate(origin.id).await.unwrap();
    assert!(report.success);
    assert_eq!(report.folder_name, "mirror_f");

    let folder = harness.certs_dir.path().join("Websites/mirror_f");
    assert_eq!(std::fs::read_to_string(folder.join("cert.crt")).unwrap(), cert);

    // Origin row untouched, sibling carries source=auto.
    let origin_after = harness.repo.get_by_id(origin.id).await.unwrap().unwrap();
    assert_eq!(origin_after.source, CertSource::ManualApply);
    let sibling = harness
        .repo
        .get_by_domain(CertStore::Websites, "mirror.example", CertSource::Auto)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(sibling.id, origin.id);
    assert_eq!(sibling.status, CertStatus::Success);
    assert!(sibling.not_after.is_some());
}

#[tokio::test]
async fn search_rejects_blank_keyword_and_bad_limits() {
    let harness = Harness::new(MockIssuer::failing("unused"));
    assert!(matches!(
        harness.manager.search("   ", None, None, 0, 20).await,
        Err(CertError::Validation(_))
    ));
    assert!(matches!(
        harness.manager.list(CertStore::Websites, 0, 0).await,
        Err(CertError::Validation(_))
    ));
    assert!(matches!(
        harness.manager.list(CertStore::Websites, 0, 101).await,
        Err(CertError::Validation(_))
    ));
}

#[tokio::test]
async fn rate_limit_degradation_keeps_success_with_warning() {
    let (cert, key) = leaf_pem(&["limited.example"], 60);
    let issuer = MockIssuer::new(IssueOutcome::degraded(
        "limited.example",
        cert,
        key,
        "2026-01-18 16:49:07",
    ));
    let harness = Harness::new(issuer);

    let ack = harness
        .manager
        .apply(ApplyInput {
            domain: "limited.example".to_string(),
            email: "a@b.c".to_string(),
            folder_name: "limited_f".to_string(),
            sans: None,
            webroot: None,
        })
        .await
        .unwrap();
    assert!(ack.success);

    let row = harness
        .repo
        .get_by_domain(CertStore::Database, "limited.example", CertSource::ManualApply)
        .await
        .unwrap()
        .unwrap();
    let settled = wait_until_settled(&harness.repo, row.id).await;
    assert_eq!(settled.status, CertStatus::Success);
    assert!(settled.certificate.is_some());
}
