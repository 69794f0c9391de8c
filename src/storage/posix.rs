//! POSIX filesystem backend.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use memmap2::{Mmap, MmapOptions};

use crate::error::{GridError, GridResult};
use crate::storage::{BufferSizes, StorageBackend};

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// How tile reads are served from the local filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMethod {
    /// Positional reads into caller buffers.
    Read,
    /// Memory-mapped regions, avoiding the copy.
    Mmap,
}

/// Local filesystem backend.
///
/// Optional behaviors mirror shared-filesystem deployments: advisory
/// locking can be disabled where fcntl is unsound (e.g. some NFS mounts),
/// and write handles can be kept open to amortize open/close over many
/// appends to the same file.
pub struct PosixFs {
    working_dir: String,
    disable_file_locking: bool,
    keep_write_file_handles_open: bool,
    read_method: ReadMethod,
    write_handles: Mutex<HashMap<String, File>>,
    sizes: BufferSizes,
}

impl Default for PosixFs {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixFs {
    /// Creates a backend rooted at the process working directory.
    pub fn new() -> Self {
        let working_dir = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());
        Self {
            working_dir,
            disable_file_locking: false,
            keep_write_file_handles_open: false,
            read_method: ReadMethod::Read,
            write_handles: Mutex::new(HashMap::new()),
            sizes: BufferSizes::new(DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE),
        }
    }

    /// Disables fcntl advisory locking.
    #[must_use]
    pub fn disable_file_locking(mut self, disable: bool) -> Self {
        self.disable_file_locking = disable;
        self
    }

    /// Keeps write handles open across appends until `close_file`.
    #[must_use]
    pub fn keep_write_file_handles_open(mut self, keep: bool) -> Self {
        self.keep_write_file_handles_open = keep;
        self
    }

    /// Selects positional reads or memory-mapped reads.
    #[must_use]
    pub fn read_method(mut self, method: ReadMethod) -> Self {
        self.read_method = method;
        self
    }

    /// Changes the working directory relative paths resolve against.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = path.strip_prefix("file://").unwrap_or(path);
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(&self.working_dir).join(p)
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, File>> {
        self.write_handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Takes an advisory fcntl lock on `path`, creating the file if
    /// needed. The lock is released when the guard drops.
    pub fn lock_file(&self, path: &str, exclusive: bool) -> GridResult<FileLock> {
        if self.disable_file_locking {
            return Err(GridError::Unsupported {
                backend: "posix",
                operation: "file locking (disabled)",
            });
        }
        let resolved = self.resolve(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&resolved)
            .map_err(|e| GridError::io(path, e))?;
        fcntl_lock(
            &file,
            if exclusive {
                libc::F_WRLCK
            } else {
                libc::F_RDLCK
            },
        )
        .map_err(|e| GridError::io(path, e))?;
        Ok(FileLock { file })
    }

    /// Maps `len` bytes of `path` starting at `offset`.
    pub fn map_region(&self, path: &str, offset: u64, len: usize) -> GridResult<MappedRegion> {
        let resolved = self.resolve(path);
        let file = File::open(&resolved).map_err(|e| map_not_found(path, e))?;
        let size = file.metadata().map_err(|e| GridError::io(path, e))?.len();
        if offset + len as u64 > size {
            return Err(GridError::ShortRead {
                path: path.to_string(),
                offset,
                wanted: len,
                available: size,
            });
        }
        let page = page_size();
        let aligned = offset - offset % page;
        let delta = (offset - aligned) as usize;
        let mmap = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(len + delta)
                .map(&file)
        }
        .map_err(|e| GridError::io(path, e))?;
        Ok(MappedRegion {
            mmap,
            start: delta,
            len,
        })
    }

    /// Whether reads are served through memory maps.
    pub fn mmap_reads(&self) -> bool {
        self.read_method == ReadMethod::Mmap
    }
}

fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as u64 }
}

fn fcntl_lock(file: &File, l_type: libc::c_int) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &fl) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// An advisory fcntl lock, released on drop.
pub struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fcntl_lock(&self.file, libc::F_UNLCK);
    }
}

/// A borrowed byte range backed by a memory map.
pub struct MappedRegion {
    mmap: Mmap,
    start: usize,
    len: usize,
}

impl MappedRegion {
    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[self.start..self.start + self.len]
    }
}

fn map_not_found(path: &str, e: io::Error) -> GridError {
    if e.kind() == io::ErrorKind::NotFound {
        GridError::NotFound(path.to_string())
    } else {
        GridError::io(path, e)
    }
}

impl StorageBackend for PosixFs {
    fn current_dir(&self) -> String {
        self.working_dir.clone()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn is_file(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn real_dir(&self, path: &str) -> GridResult<String> {
        Ok(self.resolve(path).to_string_lossy().into_owned())
    }

    fn create_dir(&self, path: &str) -> GridResult<()> {
        let resolved = self.resolve(path);
        if resolved.exists() {
            return Err(GridError::AlreadyExists(path.to_string()));
        }
        std::fs::create_dir_all(&resolved).map_err(|e| GridError::io(path, e))
    }

    fn delete_dir(&self, path: &str) -> GridResult<()> {
        let resolved = self.resolve(path);
        if !resolved.is_dir() {
            return Err(GridError::NotFound(path.to_string()));
        }
        std::fs::remove_dir_all(&resolved).map_err(|e| GridError::io(path, e))
    }

    fn get_dirs(&self, path: &str) -> GridResult<Vec<String>> {
        self.list(path, true)
    }

    fn get_files(&self, path: &str) -> GridResult<Vec<String>> {
        self.list(path, false)
    }

    fn create_file(&self, path: &str) -> GridResult<()> {
        let resolved = self.resolve(path);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&resolved)
            .map(|_| ())
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    GridError::AlreadyExists(path.to_string())
                } else {
                    GridError::io(path, e)
                }
            })
    }

    fn delete_file(&self, path: &str) -> GridResult<()> {
        let resolved = self.resolve(path);
        if !resolved.is_file() {
            return Err(GridError::NotFound(path.to_string()));
        }
        std::fs::remove_file(&resolved).map_err(|e| GridError::io(path, e))
    }

    fn file_size(&self, path: &str) -> GridResult<u64> {
        let resolved = self.resolve(path);
        let meta = std::fs::metadata(&resolved).map_err(|e| map_not_found(path, e))?;
        if !meta.is_file() {
            return Err(GridError::NotFound(path.to_string()));
        }
        Ok(meta.len())
    }

    fn read_from_file(&self, path: &str, offset: u64, buf: &mut [u8]) -> GridResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.read_method == ReadMethod::Mmap {
            let region = self.map_region(path, offset, buf.len())?;
            buf.copy_from_slice(region.as_slice());
            return Ok(());
        }
        let resolved = self.resolve(path);
        let file = File::open(&resolved).map_err(|e| map_not_found(path, e))?;
        let size = file.metadata().map_err(|e| GridError::io(path, e))?.len();
        if offset + buf.len() as u64 > size {
            return Err(GridError::ShortRead {
                path: path.to_string(),
                offset,
                wanted: buf.len(),
                available: size,
            });
        }
        file.read_exact_at(buf, offset)
            .map_err(|e| GridError::io(path, e))
    }

    fn write_to_file(&self, path: &str, buf: &[u8]) -> GridResult<()> {
        let resolved = self.resolve(path);
        let key = resolved.to_string_lossy().into_owned();
        if self.keep_write_file_handles_open {
            let mut handles = self.handles();
            if !handles.contains_key(&key) {
                let file = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&resolved)
                    .map_err(|e| GridError::io(path, e))?;
                handles.insert(key.clone(), file);
            }
            let file = handles.get_mut(&key).expect("handle just inserted");
            return file.write_all(buf).map_err(|e| GridError::io(path, e));
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&resolved)
            .map_err(|e| GridError::io(path, e))?;
        file.write_all(buf).map_err(|e| GridError::io(path, e))
    }

    fn move_path(&self, old_path: &str, new_path: &str) -> GridResult<()> {
        std::fs::rename(self.resolve(old_path), self.resolve(new_path))
            .map_err(|e| GridError::io(old_path, e))
    }

    fn sync_path(&self, path: &str) -> GridResult<()> {
        let resolved = self.resolve(path);
        if !resolved.exists() {
            return Ok(());
        }
        let file = File::open(&resolved).map_err(|e| GridError::io(path, e))?;
        file.sync_all().map_err(|e| GridError::io(path, e))
    }

    fn close_file(&self, path: &str) -> GridResult<()> {
        let key = self.resolve(path).to_string_lossy().into_owned();
        if let Some(file) = self.handles().remove(&key) {
            debug!("closing kept-open write handle for {path}");
            file.sync_all().map_err(|e| GridError::io(path, e))?;
        }
        Ok(())
    }

    fn locking_support(&self) -> bool {
        !self.disable_file_locking
    }

    fn mmap_support(&self) -> bool {
        self.read_method == ReadMethod::Mmap
    }

    fn map_region(&self, path: &str, offset: u64, len: usize) -> GridResult<MappedRegion> {
        PosixFs::map_region(self, path, offset, len)
    }

    fn buffer_sizes(&self) -> &BufferSizes {
        &self.sizes
    }
}

impl PosixFs {
    fn list(&self, path: &str, dirs: bool) -> GridResult<Vec<String>> {
        let resolved = self.resolve(path);
        let entries = std::fs::read_dir(&resolved).map_err(|e| map_not_found(path, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GridError::io(path, e))?;
            let ty = entry.file_type().map_err(|e| GridError::io(path, e))?;
            if ty.is_dir() == dirs {
                out.push(entry.path().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{PosixFs, ReadMethod};
    use crate::error::GridError;
    use crate::storage::StorageBackend;

    fn fs_in(dir: &TempDir) -> PosixFs {
        PosixFs::new().working_dir(dir.path().to_string_lossy().into_owned())
    }

    #[test]
    fn file_lifecycle() {
        let dir = TempDir::new().expect("tempdir");
        let fs = fs_in(&dir);

        fs.create_dir("frag").expect("create dir");
        assert!(fs.is_dir("frag"));
        assert!(matches!(
            fs.create_dir("frag"),
            Err(GridError::AlreadyExists(_))
        ));

        fs.write_to_file("frag/a.tdb", b"hello ").expect("write");
        fs.write_to_file("frag/a.tdb", b"world").expect("append");
        fs.close_file("frag/a.tdb").expect("close");
        assert_eq!(fs.file_size("frag/a.tdb").expect("size"), 11);

        let mut buf = [0u8; 5];
        fs.read_from_file("frag/a.tdb", 6, &mut buf).expect("read");
        assert_eq!(&buf, b"world");

        assert!(matches!(
            fs.read_from_file("frag/a.tdb", 8, &mut buf),
            Err(GridError::ShortRead { .. })
        ));

        assert_eq!(fs.get_files("frag").expect("files").len(), 1);
        fs.delete_file("frag/a.tdb").expect("delete");
        assert!(matches!(
            fs.delete_file("frag/a.tdb"),
            Err(GridError::NotFound(_))
        ));
        fs.delete_dir("frag").expect("delete dir");
    }

    #[test]
    fn kept_open_handles_accumulate_appends() {
        let dir = TempDir::new().expect("tempdir");
        let fs = fs_in(&dir).keep_write_file_handles_open(true);
        for chunk in [b"aa".as_slice(), b"bb", b"cc"] {
            fs.write_to_file("x.tdb", chunk).expect("write");
        }
        fs.close_file("x.tdb").expect("close");
        assert_eq!(fs.file_size("x.tdb").expect("size"), 6);
    }

    #[test]
    fn mmap_reads_match_positional_reads() {
        let dir = TempDir::new().expect("tempdir");
        let fs = fs_in(&dir);
        let data: Vec<u8> = (0..=255).collect();
        fs.write_to_file("m.tdb", &data).expect("write");

        let mapped_fs = fs_in(&dir).read_method(ReadMethod::Mmap);
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        fs.read_from_file("m.tdb", 100, &mut a).expect("read");
        mapped_fs.read_from_file("m.tdb", 100, &mut b).expect("mmap read");
        assert_eq!(a, b);

        let region = mapped_fs.map_region("m.tdb", 10, 4).expect("map");
        assert_eq!(region.as_slice(), &[10, 11, 12, 13]);
    }

    #[test]
    fn advisory_locks() {
        let dir = TempDir::new().expect("tempdir");
        let fs = fs_in(&dir);
        assert!(fs.locking_support());
        let guard = fs.lock_file("ws.lock", true).expect("lock");
        drop(guard);

        let unlocked = fs_in(&dir).disable_file_locking(true);
        assert!(!unlocked.locking_support());
        assert!(unlocked.lock_file("ws.lock", true).is_err());
    }

    #[test]
    fn move_path_renames() {
        let dir = TempDir::new().expect("tempdir");
        let fs = fs_in(&dir);
        fs.write_to_file("a.tdb", b"x").expect("write");
        fs.move_path("a.tdb", "b.tdb").expect("move");
        assert!(!fs.is_file("a.tdb"));
        assert!(fs.is_file("b.tdb"));
    }
}
