//! The retrieval facade that ties validation, storage and downloads together.

use std::io;
use std::sync::Arc;

use anyhow::Context;

use crate::compression::{self, ContentEncoding, SymbolBody};
use crate::config::Config;
use crate::download::DownloadCoordinator;
use crate::key::{InvalidKey, SymbolKey};
use crate::store::CacheStore;
use crate::tracking::{CacheEntry, EntryState, TrackingError, TrackingTable};

/// The result of resolving a symbol request.
#[derive(Debug)]
pub enum Resolution {
    /// The file is cached and can be sent.
    Hit(SymbolBody),
    /// The file is not cached yet. A download is running in the background.
    Miss,
    /// The requested key is malformed.
    Invalid(InvalidKey),
    /// All download attempts failed. A new attempt sequence has been started.
    UpstreamFailure(String),
}

impl Resolution {
    /// A short name for metrics tags.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hit(_) => "hit",
            Self::Miss => "miss",
            Self::Invalid(_) => "invalid",
            Self::UpstreamFailure(_) => "failed",
        }
    }
}

/// Local failures on the serving path.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to access the symbol store")]
    Storage(#[from] io::Error),
    #[error("failed to access the tracking table")]
    Tracking(#[from] TrackingError),
}

/// Clears leftovers of a previous process.
///
/// Removes partially written files and resets entries that were downloading when the process
/// stopped. Returns the number of reset entries.
fn recover(store: &CacheStore, tracking: &TrackingTable) -> anyhow::Result<usize> {
    store
        .clear_tmp()
        .context("failed to clear temporary files")?;
    let reset = tracking
        .reset_stale_downloads()
        .context("failed to reset interrupted downloads")?;
    if reset > 0 {
        tracing::info!("Reset {} interrupted downloads", reset);
    }
    Ok(reset)
}

fn open(config: &Config) -> anyhow::Result<(CacheStore, TrackingTable)> {
    let store = CacheStore::open(&config.cache_dir).with_context(|| {
        format!(
            "failed to open symbol store at {}",
            config.cache_dir.display()
        )
    })?;

    let database = config.database_path();
    if let Some(parent) = database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tracking = TrackingTable::open(&database)
        .with_context(|| format!("failed to open tracking database {}", database.display()))?;

    Ok((store, tracking))
}

/// Runs startup recovery without starting the service.
pub fn cleanup(config: &Config) -> anyhow::Result<usize> {
    let (store, tracking) = open(config)?;
    recover(&store, &tracking)
}

/// Serves symbol files from the local store and fills it from upstream servers.
#[derive(Clone, Debug)]
pub struct SymbolService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<CacheStore>,
    tracking: TrackingTable,
    coordinator: DownloadCoordinator,
}

impl SymbolService {
    /// Opens the store and tracking table, recovers from a previous run and starts serving.
    ///
    /// Downloads are spawned onto `runtime`.
    pub fn create(config: &Config, runtime: tokio::runtime::Handle) -> anyhow::Result<Self> {
        let (store, tracking) = open(config)?;
        recover(&store, &tracking)?;

        let store = Arc::new(store);
        let coordinator = DownloadCoordinator::new(
            &config.downloads,
            &config.sorted_upstreams(),
            Arc::clone(&store),
            tracking.clone(),
            runtime,
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                tracking,
                coordinator,
            }),
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.inner.coordinator
    }

    /// Resolves a symbol request from the raw path components.
    ///
    /// Validation happens before anything touches the file system or the network.
    pub async fn resolve(
        &self,
        module_name: &str,
        identifier: &str,
        file_name: &str,
        accepts_gzip: bool,
    ) -> Result<Resolution, ServiceError> {
        let resolution = match SymbolKey::parse(module_name, identifier, file_name) {
            Ok(key) => self.resolve_key(&key, accepts_gzip).await?,
            Err(err) => {
                tracing::debug!(reason = err.reason_code(), "Rejected symbol key: {}", err);
                Resolution::Invalid(err)
            }
        };

        metric!(counter("symbols.resolve") += 1, "result" => resolution.name());
        Ok(resolution)
    }

    async fn resolve_key(
        &self,
        key: &SymbolKey,
        accepts_gzip: bool,
    ) -> Result<Resolution, ServiceError> {
        let Inner {
            store,
            tracking,
            coordinator,
        } = &*self.inner;

        if let Some(raw) = store.lookup(key).await? {
            let (cached, stored) = (key.clone(), raw.clone());
            let entry = tracking
                .run(move |tracking| {
                    let entry = tracking.get(&cached)?;
                    let needs_repair = entry
                        .as_ref()
                        .is_none_or(|entry| entry.state != EntryState::Cached);
                    if needs_repair {
                        tracing::debug!("Repairing tracking entry of {}", cached);
                        tracking.mark_cached(&cached, &stored)?;
                    }
                    Ok(entry)
                })
                .await?;

            let body = compression::serve(store, key, raw, accepts_gzip).await?;
            let has_gzip = entry.is_some_and(|entry| entry.gzip_path.is_some());
            if body.encoding == ContentEncoding::Gzip && !has_gzip {
                let (compressed, path) = (key.clone(), body.path.clone());
                tracking
                    .run(move |tracking| tracking.set_gzip_path(&compressed, &path))
                    .await?;
            }
            return Ok(Resolution::Hit(body));
        }

        let requested = key.clone();
        let failed = tracking
            .run(move |tracking| tracking.get(&requested))
            .await?
            .filter(|entry| entry.state == EntryState::Failed && !coordinator.is_in_flight(key));

        coordinator.spawn(key).await;
        Ok(match failed {
            Some(entry) => Resolution::UpstreamFailure(
                entry
                    .last_error
                    .unwrap_or_else(|| "download failed".to_owned()),
            ),
            None => Resolution::Miss,
        })
    }

    /// Looks up the tracking entry of a validated key.
    pub async fn entry(&self, key: &SymbolKey) -> Result<Option<CacheEntry>, ServiceError> {
        let key = key.clone();
        Ok(self.inner.tracking.run(move |tracking| tracking.get(&key)).await?)
    }

    /// Returns a page of tracking entries.
    pub async fn list_entries(
        &self,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CacheEntry>, ServiceError> {
        let entries = self
            .inner
            .tracking
            .run(move |tracking| tracking.list(skip, limit))
            .await?;
        Ok(entries)
    }

    /// Total number of tracking entries.
    pub async fn count_entries(&self) -> Result<u64, ServiceError> {
        Ok(self.inner.tracking.run(|tracking| tracking.count()).await?)
    }
}
