use std::time::Duration;

use symproxy_service::config::{Config, DownloadConfig, UpstreamConfig};
use symproxy_service::key::SymbolKey;
use symproxy_service::service::SymbolService;
use symproxy_test as test;

pub use test::{TempDir, Upstream};

/// Path of the `ntdll.pdb` fixture, relative to an upstream base URL.
pub const NTDLL: &str = "ntdll.pdb/3844DBB920174967BE7AA4A2C20430FA2/ntdll.pdb";

pub fn ntdll_key() -> SymbolKey {
    SymbolKey::parse("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb").unwrap()
}

/// Deterministic file contents of the given size, starting with a PDB header.
pub fn pdb_contents(size: usize) -> Vec<u8> {
    let mut contents = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0".to_vec();
    contents.extend((0..size).map(|i| (i % 251) as u8));
    contents.truncate(size);
    contents
}

/// Creates a config with the given upstreams, in order, and no retry delays.
pub fn test_config(cache_dir: &TempDir, upstreams: &[&Upstream]) -> Config {
    Config {
        cache_dir: cache_dir.path().to_owned(),
        upstreams: upstreams
            .iter()
            .enumerate()
            .map(|(priority, upstream)| UpstreamConfig {
                url: upstream.base_url(),
                priority: priority as u32,
            })
            .collect(),
        downloads: DownloadConfig {
            max_retries: 1,
            retry_backoff: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Setup tests and create a test service.
///
/// This function returns a tuple containing the service to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify the configuration before the service is created.
pub fn setup_service(
    upstreams: &[&Upstream],
    update_config: impl FnOnce(&mut Config),
) -> (SymbolService, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = test_config(&cache_dir, upstreams);
    update_config(&mut config);

    let service = SymbolService::create(&config, tokio::runtime::Handle::current()).unwrap();
    (service, cache_dir)
}

/// Waits until no download is running anymore.
pub async fn wait_idle(service: &SymbolService) {
    while service.coordinator().in_flight_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
