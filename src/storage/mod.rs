//! Pluggable storage backends.
//!
//! One trait covers the POSIX filesystem and the object stores. Paths use
//! `/` separators; a trailing slash signals directory intent. Cloud
//! backends resolve relative paths against a working directory derived
//! from the home URI they were constructed with.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::error::{GridError, GridResult};
use crate::uri::Uri;

#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "gcs")]
pub mod gcs;
pub mod posix;
#[cfg(feature = "s3")]
pub mod s3;

/// Environment variable overriding the read chunk size, in bytes.
pub const DOWNLOAD_BUFFER_SIZE_VAR: &str = "TILEDB_DOWNLOAD_BUFFER_SIZE";
/// Environment variable overriding the write chunk size, in bytes.
pub const UPLOAD_BUFFER_SIZE_VAR: &str = "TILEDB_UPLOAD_BUFFER_SIZE";

/// Uniform file-system interface over POSIX and the object stores.
pub trait StorageBackend: Send + Sync {
    /// The working directory paths are resolved against.
    fn current_dir(&self) -> String;

    /// Whether `path` refers to a directory.
    fn is_dir(&self, path: &str) -> bool;

    /// Whether `path` refers to a file (object).
    fn is_file(&self, path: &str) -> bool;

    /// Resolves `path` to a backend-absolute form.
    fn real_dir(&self, path: &str) -> GridResult<String>;

    /// Creates a directory. Object stores treat this as a marker no-op.
    fn create_dir(&self, path: &str) -> GridResult<()>;

    /// Removes a directory and everything beneath it.
    fn delete_dir(&self, path: &str) -> GridResult<()>;

    /// Lists immediate subdirectories.
    fn get_dirs(&self, path: &str) -> GridResult<Vec<String>>;

    /// Lists immediate files.
    fn get_files(&self, path: &str) -> GridResult<Vec<String>>;

    /// Creates an empty file, failing if the path already exists.
    fn create_file(&self, path: &str) -> GridResult<()>;

    /// Deletes a file.
    fn delete_file(&self, path: &str) -> GridResult<()>;

    /// Size of a file in bytes.
    fn file_size(&self, path: &str) -> GridResult<u64>;

    /// Reads exactly `buf.len()` bytes at `offset`. Reading past the end
    /// of the file is a [`GridError::ShortRead`].
    fn read_from_file(&self, path: &str, offset: u64, buf: &mut [u8]) -> GridResult<()>;

    /// Appends `buf` to the file. Object-store writes become parts that
    /// are only visible after [`StorageBackend::close_file`].
    fn write_to_file(&self, path: &str, buf: &[u8]) -> GridResult<()>;

    /// Moves a path. Object stores return [`GridError::Unsupported`].
    fn move_path(&self, old_path: &str, new_path: &str) -> GridResult<()>;

    /// Flushes a path to stable storage. Object stores treat this as a
    /// no-op, since nothing is visible before close.
    fn sync_path(&self, path: &str) -> GridResult<()>;

    /// Completes any pending writes to the file (committing object-store
    /// multipart uploads) and releases write handles.
    fn close_file(&self, path: &str) -> GridResult<()>;

    /// Whether the backend supports advisory file locking.
    fn locking_support(&self) -> bool {
        false
    }

    /// Whether reads may be served as memory-mapped regions.
    fn mmap_support(&self) -> bool {
        false
    }

    /// Maps `len` bytes of `path` at `offset` into memory. Only
    /// meaningful when [`StorageBackend::mmap_support`] returns true.
    fn map_region(&self, path: &str, offset: u64, len: usize) -> GridResult<posix::MappedRegion> {
        let _ = (path, offset, len);
        Err(GridError::Unsupported {
            backend: "generic",
            operation: "memory-mapped reads",
        })
    }

    /// Read chunk size: the env override if set, the configured value
    /// otherwise.
    fn download_buffer_size(&self) -> usize {
        env_size(DOWNLOAD_BUFFER_SIZE_VAR).unwrap_or_else(|| self.buffer_sizes().download())
    }

    /// Write chunk size: the env override if set, the configured value
    /// otherwise.
    fn upload_buffer_size(&self) -> usize {
        env_size(UPLOAD_BUFFER_SIZE_VAR).unwrap_or_else(|| self.buffer_sizes().upload())
    }

    /// The adjustable buffer-size knobs of this backend.
    fn buffer_sizes(&self) -> &BufferSizes;
}

/// Adjustable download/upload chunk sizes, shared by composition across
/// backends.
#[derive(Debug)]
pub struct BufferSizes {
    download: AtomicUsize,
    upload: AtomicUsize,
}

impl BufferSizes {
    /// Creates knobs with the given defaults.
    pub fn new(download: usize, upload: usize) -> Self {
        Self {
            download: AtomicUsize::new(download),
            upload: AtomicUsize::new(upload),
        }
    }

    /// The configured download chunk size.
    pub fn download(&self) -> usize {
        self.download.load(Ordering::Relaxed)
    }

    /// The configured upload chunk size.
    pub fn upload(&self) -> usize {
        self.upload.load(Ordering::Relaxed)
    }

    /// Overrides the download chunk size.
    pub fn set_download(&self, bytes: usize) {
        self.download.store(bytes, Ordering::Relaxed);
    }

    /// Overrides the upload chunk size.
    pub fn set_upload(&self, bytes: usize) {
        self.upload.store(bytes, Ordering::Relaxed);
    }
}

fn env_size(var: &str) -> Option<usize> {
    std::env::var(var).ok()?.parse().ok()
}

/// Ensures `path` ends with a slash; the empty path becomes `/`.
pub fn slashify(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Strips a trailing slash from `path`, if any.
pub fn unslashify(path: &str) -> String {
    path.strip_suffix('/').unwrap_or(path).to_string()
}

/// Joins two path components with exactly one slash.
pub fn append_paths(path1: &str, path2: &str) -> String {
    format!("{}{}", slashify(path1), path2)
}

/// Well-known Linux CA bundle locations, probed in order by the cloud
/// backends; missing bundles fall through to system defaults.
#[cfg(feature = "__http")]
pub(crate) const CA_CERTS_LOCATIONS: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

#[cfg(feature = "__http")]
pub(crate) fn locate_ca_certs() -> Option<std::path::PathBuf> {
    for location in CA_CERTS_LOCATIONS {
        let path = std::path::Path::new(location);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
    }
    debug!("CA certs bundle not located, using system defaults");
    None
}

/// Resolves a home URI to the backend serving it.
///
/// Plain paths and `file://` URIs map to POSIX; `az://`/`azb://`, `gs://`
/// and `s3://` map to their object stores. `hdfs://` is recognized but
/// delegated elsewhere.
pub fn resolve_backend(home: &str) -> GridResult<Arc<dyn StorageBackend>> {
    if !home.contains("://") {
        return Ok(Arc::new(posix::PosixFs::new()));
    }
    let uri = Uri::parse(home)?;
    debug!("resolving storage backend for scheme {}", uri.scheme());
    match uri.scheme() {
        "file" => Ok(Arc::new(posix::PosixFs::new())),
        #[cfg(feature = "azure")]
        "az" | "azb" => Ok(Arc::new(azure::AzureBlobFs::connect(home)?)),
        #[cfg(feature = "gcs")]
        "gs" => Ok(Arc::new(gcs::GcsFs::connect(home)?)),
        #[cfg(feature = "s3")]
        "s3" => Ok(Arc::new(s3::S3Fs::connect(home)?)),
        "hdfs" => Err(GridError::Unsupported {
            backend: "hdfs",
            operation: "delegated file system",
        }),
        other => Err(GridError::InvalidUri {
            uri: home.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{append_paths, resolve_backend, slashify, unslashify};

    #[test]
    fn slash_helpers() {
        assert_eq!(slashify(""), "/");
        assert_eq!(slashify("a/b"), "a/b/");
        assert_eq!(slashify("a/b/"), "a/b/");
        assert_eq!(unslashify("a/b/"), "a/b");
        assert_eq!(unslashify("a/b"), "a/b");
        assert_eq!(unslashify(""), "");
        assert_eq!(append_paths("a", "b"), "a/b");
        assert_eq!(append_paths("a/", "b"), "a/b");
    }

    #[test]
    fn plain_paths_resolve_to_posix() {
        let fs = resolve_backend("/tmp/workspace").expect("backend");
        assert!(fs.locking_support(), "POSIX supports advisory locks");
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        assert!(resolve_backend("carrier-pigeon://nest/egg").is_err());
        assert!(resolve_backend("hdfs://namenode:9000/data").is_err());
    }
}
