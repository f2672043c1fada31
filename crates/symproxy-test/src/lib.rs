//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the store will silently recreate the
//!    directory and leak it. Assign it to a variable in the test function (e.g.
//!    `let _cache_dir = tempdir()`).
//!
//!  - When using [`Upstream`], make sure that the server is held until all requests to it have
//!    been made. Dropping it stops the server and all connections to it fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{self, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `symproxy` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("symproxy=trace,symproxy_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Starts serving `router` on an ephemeral port.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct UpstreamState {
    files: Mutex<BTreeMap<String, Bytes>>,
    statuses: Mutex<BTreeMap<String, StatusCode>>,
    delay: Mutex<Option<Duration>>,
    hits: Mutex<BTreeMap<String, usize>>,
}

/// A mock upstream symbol server.
///
/// Files are served below `/symbols/`, so [`Upstream::base_url`] can be configured as an
/// upstream directly. Unknown files respond with `404`. Every request is counted.
#[derive(Debug)]
pub struct Upstream {
    server: Server,
    state: Arc<UpstreamState>,
}

async fn serve_symbol(
    State(state): State<Arc<UpstreamState>>,
    extract::Path(path): extract::Path<String>,
) -> Response {
    let delay = *state.delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let status = state.statuses.lock().unwrap().get(&path).copied();
    if let Some(status) = status {
        return status.into_response();
    }

    let file = state.files.lock().unwrap().get(&path).cloned();
    match file {
        Some(contents) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            contents,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn count_hits(
    State(state): State<Arc<UpstreamState>>,
    extract::OriginalUri(uri): extract::OriginalUri,
    request: Request,
    next: Next,
) -> Response {
    {
        let mut hits = state.hits.lock().unwrap();
        *hits.entry(uri.path().to_owned()).or_default() += 1;
    }

    next.run(request).await
}

impl Upstream {
    pub fn new() -> Self {
        let state = Arc::new(UpstreamState::default());

        let router = Router::new()
            .route("/symbols/*path", get(serve_symbol))
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// The URL to configure as upstream.
    ///
    /// This URL uses the IP address, so it does not depend on resolving `localhost`.
    pub fn base_url(&self) -> Url {
        format!("http://{}/symbols/", self.server.addr())
            .parse()
            .unwrap()
    }

    /// Serves `contents` at `path`, relative to [`base_url`](Self::base_url).
    pub fn add_file(&self, path: &str, contents: impl Into<Bytes>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), contents.into());
    }

    /// Makes `path` respond with `status` until [`clear_status`](Self::clear_status) is called.
    pub fn respond_with(&self, path: &str, status: StatusCode) {
        self.state
            .statuses
            .lock()
            .unwrap()
            .insert(path.to_owned(), status);
    }

    pub fn clear_status(&self, path: &str) {
        self.state.statuses.lock().unwrap().remove(path);
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    /// Number of requests for `path` so far, relative to [`base_url`](Self::base_url).
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.state.hits.lock().unwrap();
        hits.get(&format!("/symbols/{path}")).copied().unwrap_or(0)
    }

    /// Returns and resets the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}
