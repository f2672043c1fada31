use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use symproxy_service::compression::ContentEncoding;
use symproxy_service::key::SymbolKey;
use symproxy_service::service::Resolution;
use symproxy_service::tracking::EntryState;

use crate::{NTDLL, Upstream, ntdll_key, pdb_contents, setup_service, wait_idle};

#[tokio::test]
async fn test_miss_then_hit() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(128 * 1024));
    upstream.set_delay(Duration::from_millis(500));
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());
    assert!(service.entry(&ntdll_key()).await.unwrap().is_none());

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb", false)
        .await
        .unwrap();
    assert!(matches!(resolution, Resolution::Miss), "{resolution:?}");
    assert!(service.coordinator().is_in_flight(&ntdll_key()));

    // the miss is only reported once the key is tracked
    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert!(
        matches!(entry.state, EntryState::Pending | EntryState::Downloading),
        "{entry:?}"
    );
    assert_eq!(entry.raw_path, None);

    let mut state = entry.state;
    while state == EntryState::Pending {
        tokio::time::sleep(Duration::from_millis(5)).await;
        state = service.entry(&ntdll_key()).await.unwrap().unwrap().state;
    }
    assert_eq!(state, EntryState::Downloading);
    assert!(service.coordinator().is_in_flight(&ntdll_key()));

    service.coordinator().ensure(&ntdll_key()).await.unwrap();
    wait_idle(&service).await;

    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Cached);
    assert_eq!(entry.size_bytes, 128 * 1024);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.last_error, None);
    assert!(entry.raw_path.is_some());

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb", false)
        .await
        .unwrap();
    let Resolution::Hit(body) = resolution else {
        panic!("expected a hit, got {resolution:?}");
    };
    assert_eq!(body.encoding, ContentEncoding::Identity);
    assert_eq!(body.size, 128 * 1024);
    assert_eq!(std::fs::read(&body.path).unwrap(), pdb_contents(128 * 1024));

    assert_eq!(upstream.hits(NTDLL), 1);
}

#[tokio::test]
async fn test_gzip_variant_is_tracked() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(4096));
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());
    service.coordinator().ensure(&ntdll_key()).await.unwrap();

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb", true)
        .await
        .unwrap();
    let Resolution::Hit(body) = resolution else {
        panic!("expected a hit, got {resolution:?}");
    };
    assert_eq!(body.encoding, ContentEncoding::Gzip);

    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(
        entry.gzip_path.as_deref(),
        Some(&*body.path.to_string_lossy())
    );
}

#[tokio::test]
async fn test_invalid_keys() {
    let upstream = Upstream::new();
    let (service, cache_dir) = setup_service(&[&upstream], |_| ());

    let cases = [
        ("ntdll.pdb", "../../etc/passwd", "ntdll.pdb"),
        ("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", ".."),
        ("..", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb"),
        ("ntdll.pdb", "not-hex", "ntdll.pdb"),
        ("", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb"),
        ("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "nt\\dll.pdb"),
    ];

    for (module_name, identifier, file_name) in cases {
        let resolution = service
            .resolve(module_name, identifier, file_name, false)
            .await
            .unwrap();
        assert!(
            matches!(resolution, Resolution::Invalid(_)),
            "{module_name}/{identifier}/{file_name}: {resolution:?}"
        );
    }

    assert_eq!(upstream.accesses(), 0);
    assert_eq!(service.count_entries().await.unwrap(), 0);
    assert_eq!(service.coordinator().in_flight_count(), 0);
    for entry in std::fs::read_dir(cache_dir.path()).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(name.to_string_lossy().starts_with('.'), "{name:?}");
    }
}

#[tokio::test]
async fn test_case_insensitive_keys() {
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(4096));
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());
    service.coordinator().ensure(&ntdll_key()).await.unwrap();

    let resolution = service
        .resolve("NTDLL.PDB", "3844dbb920174967be7aa4a2c20430fa2", "NtDll.pdb", false)
        .await
        .unwrap();
    let Resolution::Hit(body) = resolution else {
        panic!("expected a hit, got {resolution:?}");
    };
    assert_eq!(body.path, service.store().raw_path(&ntdll_key()));

    let shouting =
        SymbolKey::parse("NTDLL.PDB", "3844dbb920174967be7aa4a2c20430fa2", "NTDLL.PDB").unwrap();
    assert_eq!(shouting.cache_key(), ntdll_key().cache_key());
    assert_eq!(service.count_entries().await.unwrap(), 1);
    assert_eq!(upstream.hits(NTDLL), 1);
}

#[tokio::test]
async fn test_repairs_missing_tracking_entry() {
    let upstream = Upstream::new();
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());

    let key = ntdll_key();
    let mut handle = service.store().begin_write(&key).await.unwrap();
    handle.write(&pdb_contents(1000)).await.unwrap();
    service.store().commit(handle).await.unwrap();
    assert!(service.entry(&key).await.unwrap().is_none());

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb", false)
        .await
        .unwrap();
    assert!(matches!(resolution, Resolution::Hit(_)), "{resolution:?}");

    let entry = service.entry(&key).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Cached);
    assert_eq!(entry.size_bytes, 1000);
    assert_eq!(upstream.accesses(), 0);
}

#[tokio::test]
async fn test_gzip_variant_is_not_a_key() {
    let upstream = Upstream::new();
    let twin = "ntdll.pdb/3844DBB920174967BE7AA4A2C20430FA2/ntdll.pdb.gz";
    upstream.add_file(NTDLL, pdb_contents(4096));
    upstream.add_file(twin, &b"OTHER FILE CONTENTS"[..]);
    let (service, _cache_dir) = setup_service(&[&upstream], |_| ());

    let twin_key =
        SymbolKey::parse("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb.gz")
            .unwrap();
    service.coordinator().ensure(&twin_key).await.unwrap();
    service.coordinator().ensure(&ntdll_key()).await.unwrap();

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb", true)
        .await
        .unwrap();
    let Resolution::Hit(body) = resolution else {
        panic!("expected a hit, got {resolution:?}");
    };
    assert_eq!(body.encoding, ContentEncoding::Gzip);
    let mut decoded = Vec::new();
    GzDecoder::new(std::fs::File::open(&body.path).unwrap())
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, pdb_contents(4096));

    let resolution = service
        .resolve("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb.gz", false)
        .await
        .unwrap();
    let Resolution::Hit(body) = resolution else {
        panic!("expected a hit, got {resolution:?}");
    };
    assert_eq!(std::fs::read(&body.path).unwrap(), b"OTHER FILE CONTENTS");

    assert_eq!(upstream.hits(NTDLL), 1);
    assert_eq!(upstream.hits(twin), 1);
}
