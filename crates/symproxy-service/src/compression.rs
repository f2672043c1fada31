//! Content negotiation for symbol responses.

use std::io;
use std::path::PathBuf;

use crate::key::SymbolKey;
use crate::store::{CacheStore, CachedFile};

/// Encoding of a symbol response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    /// The `Content-Encoding` header value, if one is sent.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
        }
    }
}

/// Whether an `Accept-Encoding` header value admits gzip.
///
/// Both `gzip` and the `*` wildcard count, unless they carry `q=0`.
pub fn accepts_gzip(header: &str) -> bool {
    header.split(',').any(|item| {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or_default().trim();
        if !coding.eq_ignore_ascii_case("gzip") && coding != "*" {
            return false;
        }

        let quality = parts.find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("q")
                .then(|| value.trim().parse::<f32>().ok())
                .flatten()
        });
        quality.is_none_or(|q| q > 0.0)
    })
}

/// A file ready to be sent as a response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolBody {
    pub path: PathBuf,
    pub size: u64,
    pub encoding: ContentEncoding,
}

impl SymbolBody {
    /// Opens the file for streaming.
    pub async fn open(&self) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// Picks the variant of the cached `raw` artifact to send.
///
/// The gzip variant is created on first use when the client accepts it.
pub async fn serve(
    store: &CacheStore,
    key: &SymbolKey,
    raw: CachedFile,
    accepts_gzip: bool,
) -> io::Result<SymbolBody> {
    let (file, encoding) = if accepts_gzip {
        (store.get_or_create_gzip(key).await?, ContentEncoding::Gzip)
    } else {
        (raw, ContentEncoding::Identity)
    };

    Ok(SymbolBody {
        path: file.path,
        size: file.size,
        encoding,
    })
}
