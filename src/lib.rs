//! Storage core for tiled multidimensional array fragments.
//!
//! A fragment is an immutable batch of writes: one binary file per
//! attribute plus a compressed bookkeeping manifest. This crate provides
//! the manifest machinery, the per-fragment read cursor that locates and
//! decompresses tiles and copies cells under buffer backpressure, and a
//! uniform storage interface over the local filesystem and the Azure
//! Blob, Google Cloud Storage, and Amazon S3 object stores.

mod bookkeeping;
mod buffer;
mod codec;
mod coords;
mod error;
mod fragment;
mod read_state;
mod schema;
mod storage;
mod uri;

pub use bookkeeping::{BOOKKEEPING_FILENAME, Bookkeeping};
pub use buffer::{CompressedStorageBuffer, StorageBuffer};
pub use codec::{Codec, CompressionKind};
pub use coords::{Coord, HilbertOrder};
pub use error::{GridError, GridResult};
pub use fragment::{
    CellValue, Fragment, FragmentWriter, attr_file_name, attr_var_file_name, coords_file_name,
};
pub use read_state::{
    CellPosRange, EnclosingCoords, FragmentCellPosRange, FragmentInfo, ReadState,
};
pub use schema::{
    ArraySchema, Attribute, CellOrder, CellValNum, Datatype, Overlap, TileOrder, VAR_OFFSET_SIZE,
};
#[cfg(feature = "azure")]
pub use storage::azure::{AzureBlobFs, AzureCredentials};
#[cfg(feature = "gcs")]
pub use storage::gcs::GcsFs;
pub use storage::posix::{FileLock, MappedRegion, PosixFs, ReadMethod};
#[cfg(feature = "s3")]
pub use storage::s3::S3Fs;
pub use storage::{
    BufferSizes, DOWNLOAD_BUFFER_SIZE_VAR, StorageBackend, UPLOAD_BUFFER_SIZE_VAR, append_paths,
    resolve_backend, slashify, unslashify,
};
pub use uri::{AzureUri, GcsUri, S3Uri, Uri};
