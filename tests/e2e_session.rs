mod common;

use std::sync::Arc;

use session_keeper::{
    ExpiryMode, SessionError, SessionRecord, SessionService, SqliteStorage, Storage,
};
use tempfile::TempDir;

use common::{BrokenListing, embedded_service, relational_service, sleep_ms};

async fn assert_create_then_check(service: &SessionService) {
    let created = service
        .new_session("alice", "203.0.113.5", Some(60))
        .await
        .expect("create session");

    assert_eq!(created.token.len(), 64);
    assert!(created.expiry_in > 0 && created.expiry_in <= 60);

    let checked = service
        .check_status(&created.token)
        .await
        .expect("check session");

    assert_eq!(checked.key, "alice");
    assert_eq!(checked.ip, "203.0.113.5");
    assert_eq!(checked.token, created.token);
    assert_eq!(checked.issued_at, created.issued_at);
    assert_eq!(checked.expires_at, created.expires_at);
    assert!(checked.expiry_in > 0 && checked.expiry_in <= 60);

    let fetched = service
        .fetch_session_data(&SessionRecord::with_token(&created.token))
        .await
        .expect("fetch session data");
    assert_eq!(fetched.key, "alice");
    assert_eq!(fetched.issued_at, created.issued_at);
    assert_eq!(fetched.expires_at, created.expires_at);
}

/// A session stays valid right up to `expires_at`.
async fn assert_live_until_deadline(service: &SessionService) {
    let one_second = service
        .new_session("judy", "192.0.2.8", Some(1))
        .await
        .expect("create 1s session");
    assert_eq!(one_second.expiry_in, 1);
    service
        .check_status(&one_second.token)
        .await
        .expect("1s session valid right after creation");

    let two_seconds = service
        .new_session("judy", "192.0.2.8", Some(2))
        .await
        .expect("create 2s session");

    sleep_ms(1100).await;

    let checked = service
        .check_status(&two_seconds.token)
        .await
        .expect("2s session still valid after 1.1s");
    assert_eq!(checked.expiry_in, 1);
}

#[tokio::test]
async fn test_create_and_check_embedded() {
    let service = embedded_service().await;
    assert_create_then_check(&service).await;
}

#[tokio::test]
async fn test_create_and_check_relational() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let service = relational_service(&tmp_dir.path().join("sessions.db")).await;
    assert_create_then_check(&service).await;
}

#[tokio::test]
async fn test_live_until_deadline_embedded() {
    let service = embedded_service().await;
    assert_live_until_deadline(&service).await;
}

#[tokio::test]
async fn test_live_until_deadline_relational() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let service = relational_service(&tmp_dir.path().join("sessions.db")).await;
    assert_live_until_deadline(&service).await;
}

#[tokio::test]
async fn test_short_ttl_expires_on_native_backend() {
    let service = embedded_service().await;
    let session = service
        .new_session("bob", "198.51.100.1", Some(2))
        .await
        .expect("create session");

    sleep_ms(2050).await;

    let err = service.check_status(&session.token).await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");
}

#[tokio::test]
async fn test_short_ttl_expires_on_manual_backend() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let db_path = tmp_dir.path().join("sessions.db");
    let service = relational_service(&db_path).await;
    assert_eq!(service.expiry_mode(), ExpiryMode::Manual);

    let session = service
        .new_session("bob", "198.51.100.1", Some(2))
        .await
        .expect("create session");
    assert_eq!(service.pending_expiries(), 1);

    sleep_ms(2050).await;
    let err = service.check_status(&session.token).await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");

    // The coordinator should have soft-deleted the row itself
    sleep_ms(500).await;
    assert_eq!(service.pending_expiries(), 0);
    let raw = SqliteStorage::new(&db_path).expect("open storage");
    assert!(raw.get(&session.token).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_default_ttl_is_one_day() {
    let service = embedded_service().await;
    let session = service
        .new_session("carol", "192.0.2.1", None)
        .await
        .expect("create session");

    assert_eq!((session.expires_at - session.issued_at).num_seconds(), 86_400);
}

#[tokio::test]
async fn test_configured_default_ttl_is_used() {
    let service = SessionService::builder()
        .default_expiry_seconds(90)
        .build()
        .await
        .expect("build");
    let session = service
        .new_session("carol", "192.0.2.1", Some(0))
        .await
        .expect("create session");

    assert_eq!((session.expires_at - session.issued_at).num_seconds(), 90);
}

#[tokio::test]
async fn test_double_delete_succeeds() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let services = [
        embedded_service().await,
        relational_service(&tmp_dir.path().join("sessions.db")).await,
    ];

    for service in &services {
        let session = service
            .new_session("dave", "192.0.2.2", None)
            .await
            .expect("create session");

        service.delete_session(&session.token).await.expect("first delete");
        service.delete_session(&session.token).await.expect("second delete");

        let err = service.check_status(&session.token).await.unwrap_err();
        assert!(err.is_not_found());
    }
}

#[tokio::test]
async fn test_unknown_token_is_not_found() {
    let service = embedded_service().await;
    let err = service.check_status("no-such-token").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn test_recovery_rearms_pending_expiry_after_restart() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let db_path = tmp_dir.path().join("sessions.db");

    let service = relational_service(&db_path).await;
    let session = service
        .new_session("erin", "192.0.2.3", Some(3))
        .await
        .expect("create session");
    drop(service);

    sleep_ms(1000).await;

    // Fresh process: the old schedule is gone, recovery rebuilds it
    let service = relational_service(&db_path).await;
    assert_eq!(service.pending_expiries(), 1);

    let checked = service
        .check_status(&session.token)
        .await
        .expect("still live after restart");
    assert!(checked.expiry_in >= 1 && checked.expiry_in <= 2);

    sleep_ms(2500).await;

    let raw = SqliteStorage::new(&db_path).expect("open storage");
    assert!(raw.get(&session.token).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_recovery_deletes_overdue_sessions() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let db_path = tmp_dir.path().join("sessions.db");

    let service = relational_service(&db_path).await;
    let session = service
        .new_session("frank", "192.0.2.4", Some(1))
        .await
        .expect("create session");
    drop(service);

    sleep_ms(1200).await;

    // Nobody expired the row while the service was down
    let raw = SqliteStorage::new(&db_path).expect("open storage");
    raw.get(&session.token).await.expect("row still active");

    let service = relational_service(&db_path).await;
    assert_eq!(service.pending_expiries(), 0);
    assert!(raw.get(&session.token).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_recovery_report_counts() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let db_path = tmp_dir.path().join("sessions.db");

    let service = relational_service(&db_path).await;
    service.new_session("a", "ip", Some(1)).await.expect("a");
    service.new_session("b", "ip", Some(120)).await.expect("b");
    service.new_session("c", "ip", Some(120)).await.expect("c");
    drop(service);

    sleep_ms(1100).await;

    let service = relational_service(&db_path).await;
    // Build already recovered; a second pass sees only the live rows
    let report = service.recover().await.expect("recover");
    assert_eq!(report.scanned, 2);
    assert_eq!(report.expired, 0);
    assert_eq!(report.scheduled, 2);
}

#[tokio::test]
async fn test_manual_delete_racing_scheduled_expiry() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let service = relational_service(&tmp_dir.path().join("sessions.db")).await;

    let session = service
        .new_session("grace", "192.0.2.5", Some(1))
        .await
        .expect("create session");

    sleep_ms(990).await;
    service
        .delete_session(&session.token)
        .await
        .expect("delete near expiry");

    sleep_ms(500).await;
    service
        .delete_session(&session.token)
        .await
        .expect("delete after expiry");
    assert!(service.check_status(&session.token).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_concurrent_deletes_are_safe() {
    let tmp_dir = TempDir::new().expect("create temp dir");
    let service = relational_service(&tmp_dir.path().join("sessions.db")).await;

    let session = service
        .new_session("heidi", "192.0.2.6", None)
        .await
        .expect("create session");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let token = session.token.clone();
            tokio::spawn(async move { service.delete_session(&token).await })
        })
        .collect();

    for handle in handles {
        handle.await.expect("join").expect("delete");
    }
    assert!(service.check_status(&session.token).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failed_recovery_aborts_build() {
    let result = SessionService::builder()
        .shared_storage(Arc::new(BrokenListing))
        .build()
        .await;

    match result {
        Err(SessionError::Recovery(msg)) => assert!(msg.contains("listing unavailable")),
        Err(other) => panic!("expected Recovery error, got {other:?}"),
        Ok(_) => panic!("build should fail when sessions cannot be enumerated"),
    }
}

#[tokio::test]
async fn test_closed_service_reports_backend_unavailable() {
    let service = embedded_service().await;
    service.close().await.expect("close");

    let err = service.new_session("ivan", "ip", None).await.unwrap_err();
    assert!(matches!(err, SessionError::BackendUnavailable(_)));
}
