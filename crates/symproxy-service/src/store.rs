//! On-disk storage of symbol files.
//!
//! The layout mirrors the symbol key:
//!
//! ```text
//! <root>/
//!   .tmp/                                  in-progress writes
//!   ntdll.pdb/
//!     3844dbb920174967be7aa4a2c20430fa2/
//!       ntdll.pdb                          raw artifact
//!       .ntdll.pdb.gz                      gzip variant, created on demand
//! ```
//!
//! Files only ever become visible through an atomic rename out of the `.tmp` directory, so
//! readers never observe partially written content.
//!
//! Gzip variants are hidden files. Key components never start with a dot, so no key maps onto
//! the variant of another key.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::key::SymbolKey;

/// Name of the directory holding in-progress writes, relative to the storage root.
const TMP_DIR: &str = ".tmp";

/// A complete, non-empty file in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedFile {
    /// Absolute location of the file.
    pub path: PathBuf,
    /// Size of the file in bytes.
    pub size: u64,
}

/// Returns the file at `path` if it exists and is not empty.
async fn stat(path: &Path) -> io::Result<Option<CachedFile>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(Some(CachedFile {
            path: path.to_owned(),
            size: metadata.len(),
        })),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Creates a fresh temporary file in `dir`.
fn create_tempfile(dir: &Path) -> io::Result<NamedTempFile> {
    // The temp directory could have been removed by a concurrent `cleanup` run, so retry the
    // fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(dir) {
            sentry::with_scope(
                |scope| scope.set_extra("path", dir.display().to_string().into()),
                || tracing::error!("Failed to create temp directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", dir.display().to_string().into()),
                    || tracing::error!("Failed to create temp file: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Atomically moves `temp_file` to `target`, creating parent directories as needed.
fn persist_tempfile(mut temp_file: NamedTempFile, target: &Path) -> io::Result<File> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(target) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", target.display().to_string().into()),
                    || tracing::error!("Failed to persist cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Removes a gzip variant that no longer matches its raw artifact.
fn remove_stale_variant(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed stale gzip variant {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Compresses `source` into a temporary file and persists it at `target`.
fn compress_file(source: &Path, tmp_dir: &Path, target: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    let temp_file = create_tempfile(tmp_dir)?;

    let mut encoder = GzEncoder::new(BufWriter::new(temp_file), Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    let temp_file = encoder
        .finish()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    temp_file.as_file().sync_all()?;

    let file = persist_tempfile(temp_file, target)?;
    Ok(file.metadata()?.len())
}

/// A set of async mutexes, one per key.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: String) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Only entries held by somebody else are still in use.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

/// An in-progress write of a raw artifact.
///
/// Dropping the handle without calling [`CacheStore::commit`] discards everything written so far.
#[derive(Debug)]
pub struct WriteHandle {
    temp_file: NamedTempFile,
    file: tokio::fs::File,
    cache_key: String,
    target: PathBuf,
    variant: PathBuf,
    written: u64,
}

impl WriteHandle {
    /// Appends `buf` to the file.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// The symbol file store.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    gzip_locks: KeyedLocks,
}

impl CacheStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let tmp_dir = root.join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            root,
            tmp_dir,
            gzip_locks: KeyedLocks::default(),
        })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the raw artifact for `key`.
    pub fn raw_path(&self, key: &SymbolKey) -> PathBuf {
        let mut path = self.root.join(key.relative_dir());
        path.push(key.normalized_file_name());
        path
    }

    /// Location of the gzip variant for `key`.
    pub fn gzip_path(&self, key: &SymbolKey) -> PathBuf {
        let mut path = self.root.join(key.relative_dir());
        path.push(format!(".{}.gz", key.normalized_file_name()));
        path
    }

    /// Looks up the raw artifact for `key`.
    pub async fn lookup(&self, key: &SymbolKey) -> io::Result<Option<CachedFile>> {
        stat(&self.raw_path(key)).await
    }

    /// Starts writing the raw artifact for `key` into a private temporary file.
    pub async fn begin_write(&self, key: &SymbolKey) -> io::Result<WriteHandle> {
        let tmp_dir = self.tmp_dir.clone();
        let temp_file = tokio::task::spawn_blocking(move || create_tempfile(&tmp_dir))
            .await
            .map_err(io::Error::other)??;
        let file = tokio::fs::File::from_std(temp_file.as_file().try_clone()?);

        Ok(WriteHandle {
            temp_file,
            file,
            cache_key: key.cache_key(),
            target: self.raw_path(key),
            variant: self.gzip_path(key),
            written: 0,
        })
    }

    /// Flushes the handle and atomically moves the file into its final location.
    ///
    /// A gzip variant left over from a previous artifact is removed first.
    pub async fn commit(&self, handle: WriteHandle) -> io::Result<CachedFile> {
        let WriteHandle {
            temp_file,
            mut file,
            cache_key,
            target,
            variant,
            written,
        } = handle;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let _guard = self.gzip_locks.acquire(cache_key).await;
        let path = target.clone();
        tokio::task::spawn_blocking(move || {
            remove_stale_variant(&variant)?;
            persist_tempfile(temp_file, &target)
        })
        .await
        .map_err(io::Error::other)??;

        Ok(CachedFile {
            path,
            size: written,
        })
    }

    /// Discards an in-progress write.
    pub fn abort(&self, handle: WriteHandle) {
        let WriteHandle {
            temp_file, file, ..
        } = handle;
        drop(file);
        if let Err(err) = temp_file.close() {
            tracing::warn!("Failed to remove temp file: {}", err);
        }
    }

    /// Returns the gzip variant of the raw artifact for `key`, compressing it on first use.
    ///
    /// Concurrent callers for the same key wait for a single compression pass.
    pub async fn get_or_create_gzip(&self, key: &SymbolKey) -> io::Result<CachedFile> {
        let target = self.gzip_path(key);
        if let Some(file) = stat(&target).await? {
            return Ok(file);
        }

        let _guard = self.gzip_locks.acquire(key.cache_key()).await;
        if let Some(file) = stat(&target).await? {
            return Ok(file);
        }

        let source = self.raw_path(key);
        let tmp_dir = self.tmp_dir.clone();
        let path = target.clone();
        let size = tokio::task::spawn_blocking(move || compress_file(&source, &tmp_dir, &target))
            .await
            .map_err(io::Error::other)??;

        metric!(counter("gzip.created") += 1);
        metric!(time_raw("gzip.size") = size);
        tracing::debug!("Created gzip variant of {}", key);

        Ok(CachedFile { path, size })
    }

    /// Clears the temporary files.
    ///
    /// This needs to happen on startup, as files surviving a hard crash are never cleaned up
    /// otherwise.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }
}
