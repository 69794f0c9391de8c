//! Chunked read-through / write-behind buffering over a storage backend.
//!
//! A buffer is read-only or write-only for its lifetime. Writers
//! accumulate bytes and flush whole chunks with single
//! `write_to_file` calls; readers keep a cached window of the file.
//! `CompressedStorageBuffer` layers a streaming gzip codec on top, which
//! is how the fragment manifest travels to and from storage.

use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::codec::CompressionKind;
use crate::error::{GridError, GridResult};
use crate::storage::StorageBackend;

/// A chunked buffer in front of one backend file.
pub struct StorageBuffer {
    fs: Arc<dyn StorageBackend>,
    path: String,
    read_only: bool,
    chunk_size: usize,
    /// Read mode: cached window. Write mode: pending bytes.
    buffer: Vec<u8>,
    /// Absolute offset of the window start (read mode).
    window_start: u64,
    /// Sequential cursor (read mode).
    cursor: u64,
    file_size: u64,
    finalized: bool,
}

impl StorageBuffer {
    /// Opens a read-only buffer over an existing file.
    pub fn new_reader(
        fs: Arc<dyn StorageBackend>,
        path: impl Into<String>,
        chunk_size: usize,
    ) -> GridResult<Self> {
        let path = path.into();
        let file_size = fs.file_size(&path)?;
        Ok(Self {
            fs,
            path,
            read_only: true,
            chunk_size: chunk_size.max(1),
            buffer: Vec::new(),
            window_start: 0,
            cursor: 0,
            file_size,
            finalized: false,
        })
    }

    /// Opens a write-only (append) buffer.
    pub fn new_writer(
        fs: Arc<dyn StorageBackend>,
        path: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            fs,
            path: path.into(),
            read_only: false,
            chunk_size: chunk_size.max(1),
            buffer: Vec::new(),
            window_start: 0,
            cursor: 0,
            file_size: 0,
            finalized: false,
        }
    }

    /// The file this buffer fronts.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The size of the underlying file (read mode).
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn check_open(&self) -> GridResult<()> {
        if self.finalized {
            return Err(GridError::io_msg(&self.path, "buffer already finalized"));
        }
        Ok(())
    }

    /// Reads `out.len()` bytes at the implicit cursor, advancing it.
    pub fn read_buffer(&mut self, out: &mut [u8]) -> GridResult<()> {
        let offset = self.cursor;
        self.read_buffer_at(offset, out)?;
        self.cursor += out.len() as u64;
        Ok(())
    }

    /// Reads `out.len()` bytes at an absolute offset.
    pub fn read_buffer_at(&mut self, offset: u64, out: &mut [u8]) -> GridResult<()> {
        self.check_open()?;
        if !self.read_only {
            return Err(GridError::io_msg(&self.path, "read from a write-only buffer"));
        }
        if out.is_empty() {
            return Ok(());
        }
        if offset + out.len() as u64 > self.file_size {
            return Err(GridError::ShortRead {
                path: self.path.clone(),
                offset,
                wanted: out.len(),
                available: self.file_size,
            });
        }

        // Serve from the cached window when the range is inside it.
        let window_end = self.window_start + self.buffer.len() as u64;
        if offset >= self.window_start && offset + out.len() as u64 <= window_end {
            let start = (offset - self.window_start) as usize;
            out.copy_from_slice(&self.buffer[start..start + out.len()]);
            return Ok(());
        }

        // Oversized requests bypass the window.
        if out.len() >= self.chunk_size {
            return self.fs.read_from_file(&self.path, offset, out);
        }

        // Refill the window at the requested offset, clamped to file size.
        let refill = self
            .chunk_size
            .min((self.file_size - offset) as usize);
        self.buffer.resize(refill, 0);
        self.fs.read_from_file(&self.path, offset, &mut self.buffer)?;
        self.window_start = offset;
        out.copy_from_slice(&self.buffer[..out.len()]);
        Ok(())
    }

    /// Appends bytes, flushing to the backend once a whole chunk has
    /// accumulated.
    pub fn append_buffer(&mut self, data: &[u8]) -> GridResult<()> {
        self.check_open()?;
        if self.read_only {
            return Err(GridError::io_msg(&self.path, "append to a read-only buffer"));
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes any pending bytes through to the backend.
    pub fn flush(&mut self) -> GridResult<()> {
        if self.read_only || self.buffer.is_empty() {
            return Ok(());
        }
        self.fs.write_to_file(&self.path, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Flushes the residual tail, closes the file, and releases the
    /// buffer. Further I/O is an error.
    pub fn finalize(&mut self) -> GridResult<()> {
        self.check_open()?;
        if !self.read_only {
            self.flush()?;
            self.fs.close_file(&self.path)?;
        }
        self.buffer = Vec::new();
        self.finalized = true;
        Ok(())
    }
}

impl Read for StorageBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.file_size.saturating_sub(self.cursor) as usize;
        let n = buf.len().min(remaining);
        if n == 0 {
            return Ok(0);
        }
        self.read_buffer(&mut buf[..n]).map_err(io::Error::other)?;
        Ok(n)
    }
}

/// `io::Write` adapter feeding compressed bytes into a `StorageBuffer`.
struct FsSink {
    inner: StorageBuffer,
}

impl Write for FsSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.append_buffer(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn unwrap_grid_err(path: &str, e: io::Error) -> GridError {
    match e.downcast::<GridError>() {
        Ok(inner) => inner,
        Err(e) => GridError::io(path, e),
    }
}

enum CompressedInner {
    Reader(MultiGzDecoder<StorageBuffer>),
    PlainReader(StorageBuffer),
    Writer(GzEncoder<FsSink>),
    PlainWriter(StorageBuffer),
    Finalized,
}

/// A storage buffer with a streaming gzip layer.
pub struct CompressedStorageBuffer {
    path: String,
    inner: CompressedInner,
}

impl CompressedStorageBuffer {
    /// Opens a decompressing reader over a file.
    pub fn new_reader(
        fs: Arc<dyn StorageBackend>,
        path: impl Into<String>,
        chunk_size: usize,
        compression: CompressionKind,
    ) -> GridResult<Self> {
        let path = path.into();
        let raw = StorageBuffer::new_reader(fs, path.clone(), chunk_size)?;
        let inner = match compression {
            CompressionKind::None => CompressedInner::PlainReader(raw),
            CompressionKind::Gzip => CompressedInner::Reader(MultiGzDecoder::new(raw)),
            other => {
                return Err(GridError::Codec(format!(
                    "unsupported stream compression {other:?}"
                )));
            }
        };
        Ok(Self { path, inner })
    }

    /// Opens a compressing writer with the default gzip level.
    pub fn new_writer(
        fs: Arc<dyn StorageBackend>,
        path: impl Into<String>,
        chunk_size: usize,
        compression: CompressionKind,
    ) -> GridResult<Self> {
        let path = path.into();
        let raw = StorageBuffer::new_writer(fs, path.clone(), chunk_size);
        let inner = match compression {
            CompressionKind::None => CompressedInner::PlainWriter(raw),
            CompressionKind::Gzip => CompressedInner::Writer(GzEncoder::new(
                FsSink { inner: raw },
                Compression::default(),
            )),
            other => {
                return Err(GridError::Codec(format!(
                    "unsupported stream compression {other:?}"
                )));
            }
        };
        Ok(Self { path, inner })
    }

    /// Reads exactly `out.len()` decompressed bytes.
    pub fn read_buffer(&mut self, out: &mut [u8]) -> GridResult<()> {
        match &mut self.inner {
            CompressedInner::Reader(decoder) => decoder.read_exact(out).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    GridError::ShortRead {
                        path: self.path.clone(),
                        offset: 0,
                        wanted: out.len(),
                        available: 0,
                    }
                } else {
                    unwrap_grid_err(&self.path, e)
                }
            }),
            CompressedInner::PlainReader(raw) => raw.read_buffer(out),
            _ => Err(GridError::io_msg(&self.path, "read from a write-only buffer")),
        }
    }

    /// Appends cleartext bytes to the compressed stream.
    pub fn append_buffer(&mut self, data: &[u8]) -> GridResult<()> {
        match &mut self.inner {
            CompressedInner::Writer(encoder) => encoder
                .write_all(data)
                .map_err(|e| unwrap_grid_err(&self.path, e)),
            CompressedInner::PlainWriter(raw) => raw.append_buffer(data),
            _ => Err(GridError::io_msg(&self.path, "append to a read-only buffer")),
        }
    }

    /// Terminates the gzip stream, flushes, and closes the file.
    pub fn finalize(&mut self) -> GridResult<()> {
        let inner = std::mem::replace(&mut self.inner, CompressedInner::Finalized);
        match inner {
            CompressedInner::Writer(encoder) => {
                let mut sink = encoder
                    .finish()
                    .map_err(|e| unwrap_grid_err(&self.path, e))?;
                sink.inner.finalize()
            }
            CompressedInner::PlainWriter(mut raw) => raw.finalize(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{CompressedStorageBuffer, StorageBuffer};
    use crate::codec::CompressionKind;
    use crate::error::GridError;
    use crate::storage::StorageBackend;
    use crate::storage::posix::PosixFs;

    fn posix(dir: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(PosixFs::new().working_dir(dir.path().to_string_lossy().into_owned()))
    }

    #[test]
    fn appends_concatenate_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let mut buf = StorageBuffer::new_writer(fs.clone(), "out.tdb", 8);
        let chunks: &[&[u8]] = &[b"abc", b"defgh", b"ij", b"klmnopqrstuvw"];
        for c in chunks {
            buf.append_buffer(c).expect("append");
        }
        buf.finalize().expect("finalize");
        assert!(buf.append_buffer(b"x").is_err(), "I/O after finalize");

        let size = fs.file_size("out.tdb").expect("size");
        assert_eq!(size, 23);
        let mut all = vec![0u8; size as usize];
        fs.read_from_file("out.tdb", 0, &mut all).expect("read");
        assert_eq!(all, b"abcdefghijklmnopqrstuvw");
    }

    #[test]
    fn windowed_reads() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let data: Vec<u8> = (0..200u8).collect();
        fs.write_to_file("w.tdb", &data).expect("write");

        let mut buf = StorageBuffer::new_reader(fs, "w.tdb", 16).expect("reader");
        let mut out = [0u8; 4];
        buf.read_buffer_at(10, &mut out).expect("read");
        assert_eq!(out, [10, 11, 12, 13]);
        // Within the cached window.
        buf.read_buffer_at(12, &mut out).expect("read");
        assert_eq!(out, [12, 13, 14, 15]);
        // Outside it.
        buf.read_buffer_at(190, &mut out).expect("read");
        assert_eq!(out, [190, 191, 192, 193]);
        // Oversized request bypasses the window.
        let mut big = vec![0u8; 100];
        buf.read_buffer_at(50, &mut big).expect("read");
        assert_eq!(big[0], 50);
        // Past the end.
        assert!(matches!(
            buf.read_buffer_at(198, &mut out),
            Err(GridError::ShortRead { .. })
        ));
    }

    #[test]
    fn sequential_cursor() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        fs.write_to_file("c.tdb", b"0123456789").expect("write");
        let mut buf = StorageBuffer::new_reader(fs, "c.tdb", 4).expect("reader");
        let mut a = [0u8; 3];
        buf.read_buffer(&mut a).expect("read");
        assert_eq!(&a, b"012");
        buf.read_buffer(&mut a).expect("read");
        assert_eq!(&a, b"345");
    }

    #[test]
    fn compressed_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let payload: Vec<u8> = (0..10_000u32).flat_map(u32::to_le_bytes).collect();

        let mut writer = CompressedStorageBuffer::new_writer(
            fs.clone(),
            "m.tdb.gz",
            1024,
            CompressionKind::Gzip,
        )
        .expect("writer");
        for chunk in payload.chunks(997) {
            writer.append_buffer(chunk).expect("append");
        }
        writer.finalize().expect("finalize");

        let compressed_size = fs.file_size("m.tdb.gz").expect("size");
        assert!(compressed_size < payload.len() as u64);

        let mut reader = CompressedStorageBuffer::new_reader(
            fs,
            "m.tdb.gz",
            512,
            CompressionKind::Gzip,
        )
        .expect("reader");
        let mut decoded = vec![0u8; payload.len()];
        reader.read_buffer(&mut decoded).expect("read");
        assert_eq!(decoded, payload);
        // The stream is exhausted now.
        let mut extra = [0u8; 1];
        assert!(reader.read_buffer(&mut extra).is_err());
    }
}
