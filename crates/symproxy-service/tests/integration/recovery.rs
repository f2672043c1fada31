use symproxy_service::key::SymbolKey;
use symproxy_service::service::{self, SymbolService};
use symproxy_service::tracking::{EntryState, TrackingTable};

use crate::{NTDLL, Upstream, ntdll_key, pdb_contents, test_config};

#[tokio::test]
async fn test_resets_interrupted_downloads() {
    symproxy_test::setup();
    let upstream = Upstream::new();
    upstream.add_file(NTDLL, pdb_contents(4096));
    let cache_dir = symproxy_test::tempdir();
    let config = test_config(&cache_dir, &[&upstream]);

    {
        let tracking = TrackingTable::open(&config.database_path()).unwrap();
        assert_eq!(tracking.mark_downloading(&ntdll_key()).unwrap(), 1);
    }
    let tmp_dir = cache_dir.path().join(".tmp");
    std::fs::create_dir_all(&tmp_dir).unwrap();
    std::fs::write(tmp_dir.join("tmpinterrupted"), b"partial").unwrap();

    let service = SymbolService::create(&config, tokio::runtime::Handle::current()).unwrap();

    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Pending);
    assert_eq!(std::fs::read_dir(&tmp_dir).unwrap().count(), 0);
    assert_eq!(service.coordinator().in_flight_count(), 0);

    service.coordinator().ensure(&ntdll_key()).await.unwrap();
    let entry = service.entry(&ntdll_key()).await.unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Cached);
    assert_eq!(entry.attempt_count, 2);
}

#[test]
fn test_cleanup() {
    symproxy_test::setup();
    let cache_dir = symproxy_test::tempdir();
    let config = test_config(&cache_dir, &[]);

    let kernel32 =
        SymbolKey::parse("kernel32.pdb", "3844DBB920174967BE7AA4A2C20430FA1", "kernel32.pdb")
            .unwrap();
    {
        let tracking = TrackingTable::open(&config.database_path()).unwrap();
        tracking.mark_downloading(&ntdll_key()).unwrap();
        tracking.mark_pending(&kernel32).unwrap();
    }

    assert_eq!(service::cleanup(&config).unwrap(), 1);
    assert_eq!(service::cleanup(&config).unwrap(), 0);

    let tracking = TrackingTable::open(&config.database_path()).unwrap();
    let entry = tracking.get(&ntdll_key()).unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Pending);
    assert_eq!(entry.attempt_count, 1);
    let entry = tracking.get(&kernel32).unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Pending);
    assert_eq!(entry.attempt_count, 0);
}
