//! Fetching of symbol files from upstream symbol servers.
//!
//! Every key has at most one fetch in flight. Requests that arrive while a fetch is running
//! attach to it instead of contacting the upstreams again.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::prelude::*;

use crate::config::{DownloadConfig, UpstreamConfig};
use crate::key::SymbolKey;
use crate::store::{CacheStore, CachedFile};
use crate::tracking::{TrackingError, TrackingTable};

mod retry;
mod upstream;

pub use self::retry::RetryPolicy;
pub use self::upstream::{StreamLimits, USER_AGENT, Upstream, create_client};

/// Errors that end a fetch attempt.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// No upstream is configured.
    #[error("no upstream symbol servers configured")]
    NoUpstreams,
    /// The upstream could not be reached, or the connection broke.
    #[error("failed to reach `{upstream}`: {reason}")]
    UpstreamUnreachable { upstream: String, reason: String },
    /// The upstream answered with a non-success status.
    #[error("`{upstream}` responded with status {status}")]
    UpstreamRejected { upstream: String, status: u16 },
    /// The upstream answered with an empty body.
    #[error("`{upstream}` returned an empty file")]
    EmptyResponse { upstream: String },
    /// The upstream did not finish in time.
    #[error("download from `{upstream}` timed out after {}", humantime::format_duration(*.after))]
    Timeout { upstream: String, after: Duration },
    /// A single network read exceeded the memory ceiling.
    #[error("download exceeded the memory limit of {limit} bytes")]
    MemoryCeilingExceeded { limit: usize },
    /// Writing to the local store failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// The fetch task went away without reporting a result.
    #[error("download was canceled")]
    Canceled,
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::NoUpstreams | Self::Storage(_) | Self::Canceled)
    }

    /// A short name for metrics tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoUpstreams => "no_upstreams",
            Self::UpstreamUnreachable { .. } => "unreachable",
            Self::UpstreamRejected { .. } => "rejected",
            Self::EmptyResponse { .. } => "empty",
            Self::Timeout { .. } => "timeout",
            Self::MemoryCeilingExceeded { .. } => "memory",
            Self::Storage(_) => "storage",
            Self::Canceled => "canceled",
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(error: io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<TrackingError> for FetchError {
    fn from(error: TrackingError) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Result of a completed fetch.
pub type FetchOutcome = Result<CachedFile, FetchError>;

type InFlight = Shared<oneshot::Receiver<FetchOutcome>>;

/// Coordinates fetches of symbol files into the [`CacheStore`].
///
/// Fetches run as tasks on the coordinator's runtime and are not tied to the request that
/// started them.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("upstreams", &self.inner.upstreams)
            .field("policy", &self.inner.policy)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

struct Inner {
    runtime: tokio::runtime::Handle,
    client: reqwest::Client,
    upstreams: Vec<Upstream>,
    store: Arc<CacheStore>,
    tracking: TrackingTable,
    policy: RetryPolicy,
    limits: StreamLimits,
    download_timeout: Duration,
    in_flight: Mutex<BTreeMap<String, InFlight>>,
}

impl DownloadCoordinator {
    /// Creates a coordinator that tries `upstreams` in the given order.
    pub fn new(
        config: &DownloadConfig,
        upstreams: &[UpstreamConfig],
        store: Arc<CacheStore>,
        tracking: TrackingTable,
        runtime: tokio::runtime::Handle,
    ) -> anyhow::Result<Self> {
        let upstreams = upstreams
            .iter()
            .map(|upstream| Upstream::new(upstream.url.clone()))
            .collect::<anyhow::Result<_>>()?;

        let inner = Inner {
            runtime,
            client: create_client(config)?,
            upstreams,
            store,
            tracking,
            policy: RetryPolicy::from_config(config),
            limits: StreamLimits::from_config(config),
            download_timeout: config.max_download_timeout,
            in_flight: Mutex::new(BTreeMap::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Whether a fetch for `key` is currently running.
    pub fn is_in_flight(&self, key: &SymbolKey) -> bool {
        self.inner.lock_in_flight().contains_key(&key.cache_key())
    }

    /// Number of fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Starts fetching `key` in the background unless a fetch is already running.
    ///
    /// Returns once a newly started fetch has recorded the key as pending.
    pub async fn spawn(&self, key: &SymbolKey) {
        let (_, registered) = self.join(key);
        if let Some(registered) = registered {
            registered.await.ok();
        }
    }

    /// Returns the cached file for `key`, fetching it first if needed.
    ///
    /// Joins a running fetch instead of starting another one.
    pub async fn ensure(&self, key: &SymbolKey) -> FetchOutcome {
        if !self.is_in_flight(key) {
            if let Some(file) = self.inner.store.lookup(key).await? {
                return Ok(file);
            }
        }
        let (outcome, _) = self.join(key);
        outcome.await
    }

    /// Attaches to the running fetch of `key`, or starts a new one.
    ///
    /// Returns a future resolving to the fetch outcome, and for a new fetch a receiver that fires
    /// once the key is tracked as pending. Dropping either does not cancel the fetch.
    fn join(
        &self,
        key: &SymbolKey,
    ) -> (
        BoxFuture<'static, FetchOutcome>,
        Option<oneshot::Receiver<()>>,
    ) {
        let cache_key = key.cache_key();
        let (sender, channel) = {
            let mut in_flight = self.inner.lock_in_flight();
            if let Some(channel) = in_flight.get(&cache_key) {
                metric!(counter("download.coalesced") += 1);
                return (wait(channel.clone()), None);
            }

            let (sender, receiver) = oneshot::channel();
            let channel = receiver.shared();
            in_flight.insert(cache_key.clone(), channel.clone());
            metric!(gauge("download.in_flight") = in_flight.len() as u64);
            (sender, channel)
        };

        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            cache_key,
        };
        let (registered, on_registered) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        self.inner.runtime.spawn(async move {
            let outcome = inner.run(&key, registered).await;
            drop(guard);
            sender.send(outcome).ok();
        });

        (wait(channel), Some(on_registered))
    }
}

fn wait(channel: InFlight) -> BoxFuture<'static, FetchOutcome> {
    channel
        .map(|outcome| outcome.unwrap_or(Err(FetchError::Canceled)))
        .boxed()
}

/// Removes the in-flight entry once its task finishes, even if it panicked.
struct InFlightGuard {
    inner: Arc<Inner>,
    cache_key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.lock_in_flight().remove(&self.cache_key);
    }
}

impl Inner {
    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a newly registered fetch.
    ///
    /// A fetch that finished right before this one was registered has already stored the file,
    /// which is then returned without contacting any upstream.
    async fn run(&self, key: &SymbolKey, registered: oneshot::Sender<()>) -> FetchOutcome {
        if let Some(file) = self.store.lookup(key).await? {
            metric!(counter("download.already_cached") += 1);
            let (cached, stored) = (key.clone(), file.clone());
            if let Err(err) = self
                .tracking
                .run(move |tracking| tracking.mark_cached(&cached, &stored))
                .await
            {
                tracing::error!(error = %err, "Failed to track cached file of {}", key);
            }
            return Ok(file);
        }

        let pending = key.clone();
        if let Err(err) = self
            .tracking
            .run(move |tracking| tracking.mark_pending(&pending))
            .await
        {
            tracing::error!(error = %err, "Failed to track pending download of {}", key);
        }
        registered.send(()).ok();

        self.fetch(key).await
    }

    async fn fetch(&self, key: &SymbolKey) -> FetchOutcome {
        let start = Instant::now();
        let outcome = self.fetch_with_retries(key).await;

        match &outcome {
            Ok(file) => {
                tracing::info!("Cached {} ({} bytes)", key, file.size);
                metric!(timer("download.duration") = start.elapsed(), "result" => "cached");
                metric!(time_raw("download.size") = file.size);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to download {}", key);
                metric!(timer("download.duration") = start.elapsed(), "result" => "failed");
                let (failed, error) = (key.clone(), err.to_string());
                if let Err(err) = self
                    .tracking
                    .run(move |tracking| tracking.mark_failed(&failed, &error))
                    .await
                {
                    tracing::error!(error = %err, "Failed to track failed download of {}", key);
                }
            }
        }

        outcome
    }

    async fn fetch_with_retries(&self, key: &SymbolKey) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let downloading = key.clone();
            let total_attempts = self
                .tracking
                .run(move |tracking| tracking.mark_downloading(&downloading))
                .await?;
            metric!(counter("download.attempt") += 1);
            tracing::debug!("Download attempt {} for {} ({} overall)", attempt, key, total_attempts);

            match self.try_upstreams(key).await {
                Ok(file) => {
                    let (cached, stored) = (key.clone(), file.clone());
                    self.tracking
                        .run(move |tracking| tracking.mark_cached(&cached, &stored))
                        .await?;
                    return Ok(file);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => match self.policy.next_delay(attempt) {
                    Some(delay) => {
                        tracing::debug!(error = %err, "Retrying {} in {:?}", key, delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Tries all upstreams in order and returns the first success or the last error.
    async fn try_upstreams(&self, key: &SymbolKey) -> FetchOutcome {
        let mut last_error = FetchError::NoUpstreams;
        for upstream in &self.upstreams {
            match self.try_upstream(upstream, key).await {
                Ok(file) => {
                    metric!(counter("download.upstream") += 1, "result" => "ok");
                    return Ok(file);
                }
                Err(err) => {
                    metric!(counter("download.upstream") += 1, "result" => err.kind());
                    if !err.is_transient() {
                        return Err(err);
                    }
                    tracing::debug!(error = %err, "Upstream `{}` failed for {}", upstream.name(), key);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn try_upstream(&self, upstream: &Upstream, key: &SymbolKey) -> FetchOutcome {
        let transfer = async {
            let response = upstream
                .request(&self.client, key, self.limits.head_timeout)
                .await?;

            let mut handle = self.store.begin_write(key).await?;
            match upstream
                .stream_body(response, &mut handle, &self.limits)
                .await
            {
                Ok(()) => Ok(self.store.commit(handle).await?),
                Err(err) => {
                    self.store.abort(handle);
                    Err(err)
                }
            }
        };

        tokio::time::timeout(self.download_timeout, transfer)
            .await
            .unwrap_or_else(|_| {
                Err(FetchError::Timeout {
                    upstream: upstream.name().to_owned(),
                    after: self.download_timeout,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rejected = FetchError::UpstreamRejected {
            upstream: "msdl.microsoft.com".into(),
            status: 404,
        };
        assert!(rejected.is_transient());
        assert_eq!(
            rejected.to_string(),
            "`msdl.microsoft.com` responded with status 404"
        );

        assert!(FetchError::MemoryCeilingExceeded { limit: 1024 }.is_transient());
        assert!(!FetchError::Storage("disk full".into()).is_transient());
        assert!(!FetchError::NoUpstreams.is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = FetchError::Timeout {
            upstream: "symbols.mozilla.org".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "download from `symbols.mozilla.org` timed out after 30s"
        );
    }

    #[tokio::test]
    async fn test_no_upstreams() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::open(dir.path()).unwrap());
        let tracking = TrackingTable::memory().unwrap();
        let coordinator = DownloadCoordinator::new(
            &DownloadConfig::default(),
            &[],
            store,
            tracking.clone(),
            tokio::runtime::Handle::current(),
        )
        .unwrap();

        let key = SymbolKey::parse("ntdll.pdb", "3844DBB920174967BE7AA4A2C20430FA2", "ntdll.pdb")
            .unwrap();
        assert_eq!(coordinator.ensure(&key).await, Err(FetchError::NoUpstreams));
        assert!(!coordinator.is_in_flight(&key));

        let entry = tracking.get(&key).unwrap().unwrap();
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(
            entry.last_error.as_deref(),
            Some("no upstream symbol servers configured")
        );
    }
}
