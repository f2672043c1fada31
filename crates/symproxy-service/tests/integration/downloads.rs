use std::time::Duration;

use futures::future;
use reqwest::StatusCode;
use symproxy_service::download::FetchError;
use symproxy_service::service::Resolution;
use symproxy_service::tracking::EntryState;

use crate::{NTDLL, Upstream, ntdll_key, pdb_contents, setup_service, wait_idle};

#[tokio::test]
async fn test_concurrent_requests_share_download() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(64 * 1024));
    upstream.set_delay(Duration::from_millis(300));
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());

    let requests = (0..10).map(|_| {
        service.resolve(
            "ntdll.pdb",
            "3844DBB920174967BE7AA4A2C20430FA2",
            "ntdll.pdb",
            false,
        )
    });
    for resolution in future::join_all(requests).await {
        let resolution = resolution.unwrap();
        assert!(matches!(resolution, Resolution::Miss), "{resolution:?}");
    }
    assert_eq!(service.coordinator().in_flight_count(), 1);

    let key = ntdll_key();
    let waiters = (0..5).map(|_| service.coordinator().ensure(&key));
    for outcome in future::join_all(waiters).await {
        assert_eq!(outcome.unwrap().size, 64 * 1024);
    }
    wait_idle(&service).await;

    assert_eq!(upstream.hits(NTDLL), 1);
    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Cached);
    assert_eq!(entry.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_fetch_each_key_once() {
    let upstream = Upstream::new();
    let identifiers: Vec<_> = (0..64)
        .map(|i| format!("3844DBB920174967BE7AA4A2C2043{i:04X}"))
        .collect();
    for identifier in &identifiers {
        upstream.add_file(&format!("ntdll.pdb/{identifier}/ntdll.pdb"), pdb_contents(1024));
    }
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());

    let mut tasks = Vec::new();
    for identifier in &identifiers {
        for _ in 0..4 {
            let service = service.clone();
            let identifier = identifier.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let resolution = service
                        .resolve("ntdll.pdb", &identifier, "ntdll.pdb", false)
                        .await
                        .unwrap();
                    match resolution {
                        Resolution::Hit(_) => break,
                        Resolution::Miss => tokio::time::sleep(Duration::from_millis(1)).await,
                        other => panic!("unexpected resolution {other:?}"),
                    }
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    wait_idle(&service).await;

    for identifier in &identifiers {
        let path = format!("ntdll.pdb/{identifier}/ntdll.pdb");
        assert_eq!(upstream.hits(&path), 1, "{path}");
    }
}

#[tokio::test]
async fn test_retries_then_fails() {
    let upstream = Upstream::new();
    upstream.respond_with(NTDLL, StatusCode::SERVICE_UNAVAILABLE);
    let (service, _cache_dir) = setup_service(&[&upstream], |config| {
        config.downloads.max_retries = 3;
    });

    let err = service.coordinator().ensure(&ntdll_key()).await.unwrap_err();
    assert!(
        matches!(err, FetchError::UpstreamRejected { status: 503, .. }),
        "{err:?}"
    );
    wait_idle(&service).await;

    assert_eq!(upstream.hits(NTDLL), 3);
    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.attempt_count, 3);
    assert!(entry.last_error.unwrap().contains("status 503"));
    assert!(service.store().lookup(&ntdll_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failure_restarts_download() {
    let upstream = Upstream::new();
    upstream.respond_with(NTDLL, StatusCode::NOT_FOUND);
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());

    assert!(service.coordinator().ensure(&ntdll_key()).await.is_err());
    wait_idle(&service).await;

    upstream.clear_status(NTDLL);
    upstream.add_file(NTDLL, pdb_contents(2048));

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb", false)
        .await
        .unwrap();
    let Resolution::UpstreamFailure(error) = resolution else {
        panic!("expected a failure, got {resolution:?}");
    };
    assert!(error.contains("status 404"), "{error}");

    service.coordinator().ensure(&ntdll_key()).await.unwrap();
    wait_idle(&service).await;

    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Cached);
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.last_error, None);
    assert_eq!(upstream.hits(NTDLL), 2);
}

#[tokio::test]
async fn test_upstream_priority_fallback() {
    let primary = Upstream::new();
    let secondary = Upstream::new();
    let tertiary = Upstream::new();
    secondary.add_file(NTDLL, pdb_contents(4096));
    tertiary.add_file(NTDLL, pdb_contents(16));
    let (service, _cache_dir) = setup_service(&[&primary, &secondary, &tertiary], |_| ());

    let file = service.coordinator().ensure(&ntdll_key()).await.unwrap();
    assert_eq!(file.size, 4096);
    assert_eq!(std::fs::read(&file.path).unwrap(), pdb_contents(4096));

    assert_eq!(primary.hits(NTDLL), 1);
    assert_eq!(secondary.hits(NTDLL), 1);
    assert_eq!(tertiary.accesses(), 0);
}

#[tokio::test]
async fn test_chunked_download() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(3 * 1024 * 1024 + 17));
    let (service, cache_dir) = setup_service(&[&upstream], |config| {
        config.downloads.chunk_size = 64 * 1024;
    });

    let file = service.coordinator().ensure(&ntdll_key()).await.unwrap();
    assert_eq!(file.size, 3 * 1024 * 1024 + 17);
    assert_eq!(
        std::fs::read(&file.path).unwrap(),
        pdb_contents(3 * 1024 * 1024 + 17)
    );

    let tmp_dir = cache_dir.path().join(".tmp");
    assert_eq!(std::fs::read_dir(tmp_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_memory_ceiling() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(4096));
    let (service, cache_dir) = setup_service(&[&upstream], |config| {
        config.downloads.max_memory_mb = 0;
    });

    let err = service.coordinator().ensure(&ntdll_key()).await.unwrap_err();
    assert_eq!(err, FetchError::MemoryCeilingExceeded { limit: 0 });
    wait_idle(&service).await;

    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Failed);
    assert!(entry.last_error.unwrap().contains("memory limit"));

    let tmp_dir = cache_dir.path().join(".tmp");
    assert_eq!(std::fs::read_dir(tmp_dir).unwrap().count(), 0);
    assert!(service.store().lookup(&ntdll_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_response() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, Vec::new());
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());

    let err = service.coordinator().ensure(&ntdll_key()).await.unwrap_err();
    assert!(matches!(err, FetchError::EmptyResponse { .. }), "{err:?}");
    assert!(service.store().lookup(&ntdll_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_head_timeout() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(4096));
    upstream.set_delay(Duration::from_secs(5));
    let (service, _cache_dir) = setup_service(&[&upstream], |config| {
        config.downloads.head_timeout = Duration::from_millis(100);
    });

    let err = service.coordinator().ensure(&ntdll_key()).await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_no_upstreams() {
    let (service, _cache_dir) = setup_service(&[], |config| {
        config.downloads.max_retries = 5;
    });

    let err = service.coordinator().ensure(&ntdll_key()).await.unwrap_err();
    assert_eq!(err, FetchError::NoUpstreams);
    wait_idle(&service).await;

    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.attempt_count, 1);
}
