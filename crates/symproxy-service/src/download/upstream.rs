use std::io;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{StatusCode, Url, redirect};

use crate::config::DownloadConfig;
use crate::key::SymbolKey;
use crate::store::WriteHandle;

use super::FetchError;

/// The user agent sent to upstream symbol servers.
pub const USER_AGENT: &str = concat!("symproxy/", env!("CARGO_PKG_VERSION"));

/// Creates the [`reqwest::Client`] used for all upstream requests.
///
/// Responses with a `Content-Encoding` are decoded transparently, so the stored artifact is
/// always the plain file.
pub fn create_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout)
        .timeout(config.max_download_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
}

/// Limits applied while streaming a single response.
#[derive(Clone, Copy, Debug)]
pub struct StreamLimits {
    /// Bytes collected before they are written out.
    pub chunk_size: usize,
    /// Ceiling on bytes that are buffered but not yet written.
    pub max_buffered: usize,
    /// Timeout for receiving the response head.
    pub head_timeout: Duration,
}

impl StreamLimits {
    pub fn from_config(config: &DownloadConfig) -> Self {
        let max_buffered = config.max_buffered_bytes();
        Self {
            chunk_size: config.chunk_size.clamp(1, max_buffered.max(1)),
            max_buffered,
            head_timeout: config.head_timeout,
        }
    }
}

/// An upstream symbol server.
#[derive(Clone, Debug)]
pub struct Upstream {
    url: Url,
    name: String,
}

impl Upstream {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !url.cannot_be_a_base() && matches!(url.scheme(), "http" | "https"),
            "invalid upstream url `{url}`"
        );
        let name = url.host_str().unwrap_or("unknown").to_owned();
        Ok(Self { url, name })
    }

    /// The host name, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `{base}/{module}/{identifier}/{file}` with the key's original casing.
    pub fn symbol_url(&self, key: &SymbolKey) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(key.upstream_segments());
        }
        url
    }

    /// Sends the request for `key` and returns the successful response.
    pub async fn request(
        &self,
        client: &reqwest::Client,
        key: &SymbolKey,
        head_timeout: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        let url = self.symbol_url(key);
        tracing::debug!("Fetching debug file from `{}`", url);

        let response = tokio::time::timeout(head_timeout, client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout {
                upstream: self.name.clone(),
                after: head_timeout,
            })?
            .map_err(|err| self.unreachable(&err))?;

        let status = response.status();
        if status.is_success() && status != StatusCode::NO_CONTENT {
            Ok(response)
        } else {
            tracing::debug!("Upstream `{}` responded with {}", self.name, status);
            Err(FetchError::UpstreamRejected {
                upstream: self.name.clone(),
                status: status.as_u16(),
            })
        }
    }

    fn unreachable(&self, error: &reqwest::Error) -> FetchError {
        let mut source: &dyn std::error::Error = error;
        while let Some(inner) = source.source() {
            source = inner;
        }
        FetchError::UpstreamUnreachable {
            upstream: self.name.clone(),
            reason: source.to_string(),
        }
    }

    /// Streams the body of `response` into `handle`.
    ///
    /// Bytes are collected into chunks of [`StreamLimits::chunk_size`] and written out before
    /// the next part of the body is polled.
    pub async fn stream_body(
        &self,
        response: reqwest::Response,
        handle: &mut WriteHandle,
        limits: &StreamLimits,
    ) -> Result<(), FetchError> {
        let expected = expected_size(response.headers());
        let mut progress = Progress::new(expected);
        let mut buffer = BytesMut::with_capacity(limits.chunk_size.min(64 * 1024));
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| self.unreachable(&err))?;

            if buffer.len() + chunk.len() > limits.max_buffered {
                flush(handle, &mut buffer).await?;
                if chunk.len() > limits.max_buffered {
                    return Err(FetchError::MemoryCeilingExceeded {
                        limit: limits.max_buffered,
                    });
                }
            }
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= limits.chunk_size {
                let part = buffer.split_to(limits.chunk_size);
                handle.write(&part).await?;
            }

            if let Some(percent) = progress.advance(handle.written() + buffer.len() as u64) {
                tracing::debug!("Downloading from `{}`: {}%", self.name, percent);
            }
        }
        flush(handle, &mut buffer).await?;

        if handle.written() == 0 {
            return Err(FetchError::EmptyResponse {
                upstream: self.name.clone(),
            });
        }
        Ok(())
    }
}

async fn flush(handle: &mut WriteHandle, buffer: &mut BytesMut) -> io::Result<()> {
    if !buffer.is_empty() {
        handle.write(buffer).await?;
        buffer.clear();
    }
    Ok(())
}

/// The announced size of the body, if any.
fn expected_size(headers: &HeaderMap) -> Option<u64> {
    [header::CONTENT_LENGTH.as_str(), "x-goog-stored-content-length"]
        .into_iter()
        .find_map(|name| headers.get(name)?.to_str().ok()?.parse().ok())
        .filter(|size| *size > 0)
}

/// Reports download progress in steps of 25%.
struct Progress {
    expected: Option<u64>,
    reported: u64,
}

impl Progress {
    fn new(expected: Option<u64>) -> Self {
        Self {
            expected,
            reported: 0,
        }
    }

    fn advance(&mut self, received: u64) -> Option<u64> {
        let expected = self.expected?;
        let percent = (received.saturating_mul(100) / expected).min(100);
        let step = percent / 25 * 25;
        if step > self.reported {
            self.reported = step;
            Some(step)
        } else {
            None
        }
    }
}
