use std::io;

use thiserror::Error;

/// Convenience alias for all fallible gridstore operations.
pub type GridResult<T> = Result<T, GridError>;

/// All errors the storage core can surface.
///
/// Buffer overflow during a cell copy is *not* an error: it is reported
/// through the read state's overflow flags.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GridError {
    /// Malformed URI or unsupported scheme.
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri {
        /// The offending URI text.
        uri: String,
        /// What made it unusable.
        reason: String,
    },

    /// Missing or invalid credentials at backend construction.
    #[error("{backend} authentication failed: {reason}")]
    Auth {
        /// The backend that failed to authenticate.
        backend: &'static str,
        /// What went wrong while resolving credentials.
        reason: String,
    },

    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A strict create collided with an existing resource.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Read/write/close/sync failure reported by a backend.
    #[error("I/O error on {path}")]
    Io {
        /// The path the operation targeted.
        path: String,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// A read returned fewer bytes than requested within file bounds.
    #[error("short read on {path}: {wanted} bytes at offset {offset}, file holds {available}")]
    ShortRead {
        /// The file that came up short.
        path: String,
        /// Requested absolute offset.
        offset: u64,
        /// Requested length in bytes.
        wanted: usize,
        /// Total file size reported by the backend.
        available: u64,
    },

    /// Arity, count, or decompression failure while loading a fragment manifest.
    #[error("corrupt manifest for fragment {fragment}: {reason}")]
    ManifestCorrupt {
        /// The fragment directory the manifest belongs to.
        fragment: String,
        /// What failed during the load.
        reason: String,
    },

    /// Codec failure or decompressed-length mismatch while preparing a tile.
    #[error("corrupt tile {tile} of attribute {attribute}: {reason}")]
    TileCorrupt {
        /// The attribute id the tile belongs to.
        attribute: usize,
        /// The tile position within the fragment.
        tile: i64,
        /// What failed.
        reason: String,
    },

    /// Tile read failure, with the offending attribute and tile attached.
    #[error("read failed for attribute {attribute}, tile {tile}")]
    ReadIo {
        /// The attribute id the read was for.
        attribute: usize,
        /// The tile position within the fragment.
        tile: i64,
        /// The underlying storage error.
        #[source]
        source: Box<GridError>,
    },

    /// Compression or decompression failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Optional operation not available on this backend.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        /// The backend that declined.
        backend: &'static str,
        /// The operation that is unavailable.
        operation: &'static str,
    },

    /// Allocation failure, propagated instead of masked.
    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory {
        /// The requested allocation size.
        bytes: usize,
    },
}

impl GridError {
    /// Wraps an `io::Error` with the path it occurred on.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds an I/O error from a plain message, for backends whose SDK
    /// errors do not expose an `io::Error`.
    pub fn io_msg(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            source: io::Error::other(msg.into()),
        }
    }

    /// Attaches attribute and tile context to a storage error.
    pub fn for_tile(self, attribute: usize, tile: i64) -> Self {
        Self::ReadIo {
            attribute,
            tile,
            source: Box::new(self),
        }
    }
}
