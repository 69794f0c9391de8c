//! Fragment bookkeeping manifest.
//!
//! The manifest records, per fragment: the non-empty domain, sparse tile
//! MBRs and bounding coordinates, per-attribute tile byte offsets,
//! variable-tile offsets and uncompressed sizes, and the final tile's
//! cell count. It is serialized little-endian (i64 counts and offsets,
//! u64 sizes) inside one gzip stream named `__book_keeping.tdb.gz` in the
//! fragment directory.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::buffer::CompressedStorageBuffer;
use crate::codec::CompressionKind;
use crate::coords::Coord;
use crate::error::{GridError, GridResult};
use crate::fragment::{attr_file_name, attr_var_file_name, coords_file_name};
use crate::schema::ArraySchema;
use crate::storage::{StorageBackend, append_paths};

/// Manifest filename inside a fragment directory.
pub const BOOKKEEPING_FILENAME: &str = "__book_keeping.tdb.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Write,
    Read,
}

/// The bookkeeping structures of one fragment.
#[derive(Debug)]
pub struct Bookkeeping<T: Coord> {
    schema: Arc<ArraySchema<T>>,
    fragment_dir: String,
    dense: bool,
    mode: Mode,
    initialized: bool,
    non_empty_domain: Vec<T>,
    /// The non-empty domain expanded to tile boundaries.
    domain: Vec<T>,
    mbrs: Vec<Vec<T>>,
    bounding_coords: Vec<Vec<T>>,
    tile_offsets: Vec<Vec<i64>>,
    tile_var_offsets: Vec<Vec<i64>>,
    tile_var_sizes: Vec<Vec<u64>>,
    next_tile_offsets: Vec<i64>,
    next_tile_var_offsets: Vec<i64>,
    last_tile_cell_num: i64,
}

impl<T: Coord> Bookkeeping<T> {
    /// Creates a write-mode manifest for a new fragment.
    pub fn new_write(
        schema: Arc<ArraySchema<T>>,
        dense: bool,
        fragment_dir: impl Into<String>,
    ) -> Self {
        Self {
            schema,
            fragment_dir: fragment_dir.into(),
            dense,
            mode: Mode::Write,
            initialized: false,
            non_empty_domain: Vec::new(),
            domain: Vec::new(),
            mbrs: Vec::new(),
            bounding_coords: Vec::new(),
            tile_offsets: Vec::new(),
            tile_var_offsets: Vec::new(),
            tile_var_sizes: Vec::new(),
            next_tile_offsets: Vec::new(),
            next_tile_var_offsets: Vec::new(),
            last_tile_cell_num: 0,
        }
    }

    /// Records the non-empty domain (`None` means the whole array
    /// domain) and allocates the per-attribute offset vectors. Valid
    /// exactly once per write-mode manifest.
    pub fn init(&mut self, non_empty_domain: Option<&[T]>) -> GridResult<()> {
        if self.mode != Mode::Write || self.initialized {
            return Err(self.corrupt("init on a loaded or already-initialized manifest"));
        }
        let domain = non_empty_domain.unwrap_or_else(|| self.schema.domain());
        if domain.len() != 2 * self.schema.dim_num() {
            return Err(self.corrupt("non-empty domain arity mismatch"));
        }
        self.non_empty_domain = domain.to_vec();
        self.domain = self.schema.expand_domain(domain);

        let n = self.schema.attribute_num() + 1;
        self.tile_offsets = vec![Vec::new(); n];
        self.next_tile_offsets = vec![0; n];
        self.tile_var_offsets = vec![Vec::new(); self.schema.attribute_num()];
        self.tile_var_sizes = vec![Vec::new(); self.schema.attribute_num()];
        self.next_tile_var_offsets = vec![0; self.schema.attribute_num()];
        self.initialized = true;
        Ok(())
    }

    /// Appends the first and last coordinates of a sparse tile.
    pub fn append_bounding_coords(&mut self, bounding_coords: &[T]) {
        self.bounding_coords.push(bounding_coords.to_vec());
    }

    /// Appends a sparse tile MBR.
    pub fn append_mbr(&mut self, mbr: &[T]) {
        self.mbrs.push(mbr.to_vec());
    }

    /// Appends a tile offset for an attribute: the recorded value is the
    /// offset at which the tile begins, and `step` is the byte length the
    /// tile occupies on disk.
    pub fn append_tile_offset(&mut self, attribute_id: usize, step: u64) {
        let next = self.next_tile_offsets[attribute_id];
        self.tile_offsets[attribute_id].push(next);
        self.next_tile_offsets[attribute_id] = next + step as i64;
    }

    /// Appends a variable-tile offset for a variable attribute.
    pub fn append_tile_var_offset(&mut self, attribute_id: usize, step: u64) {
        let next = self.next_tile_var_offsets[attribute_id];
        self.tile_var_offsets[attribute_id].push(next);
        self.next_tile_var_offsets[attribute_id] = next + step as i64;
    }

    /// Appends the *uncompressed* size of a variable value tile.
    pub fn append_tile_var_size(&mut self, attribute_id: usize, size: u64) {
        self.tile_var_sizes[attribute_id].push(size);
    }

    /// Sets the number of cells in the final tile (sparse fragments).
    pub fn set_last_tile_cell_num(&mut self, cell_num: i64) {
        self.last_tile_cell_num = cell_num;
    }

    /// The expanded domain the fragment is constrained in.
    pub fn domain(&self) -> &[T] {
        &self.domain
    }

    /// The non-empty domain.
    pub fn non_empty_domain(&self) -> &[T] {
        &self.non_empty_domain
    }

    /// Whether the fragment is dense.
    pub fn dense(&self) -> bool {
        self.dense
    }

    /// The sparse tile MBRs.
    pub fn mbrs(&self) -> &[Vec<T>] {
        &self.mbrs
    }

    /// The sparse tile bounding coordinates.
    pub fn bounding_coords(&self) -> &[Vec<T>] {
        &self.bounding_coords
    }

    /// Tile offsets per attribute stream (attributes then coordinates).
    pub fn tile_offsets(&self) -> &[Vec<i64>] {
        &self.tile_offsets
    }

    /// Variable-tile offsets per attribute.
    pub fn tile_var_offsets(&self) -> &[Vec<i64>] {
        &self.tile_var_offsets
    }

    /// Uncompressed variable-tile sizes per attribute.
    pub fn tile_var_sizes(&self) -> &[Vec<u64>] {
        &self.tile_var_sizes
    }

    /// Number of cells in the final tile.
    pub fn last_tile_cell_num(&self) -> i64 {
        self.last_tile_cell_num
    }

    /// Number of tiles in the fragment.
    pub fn tile_num(&self) -> i64 {
        if self.dense {
            self.schema.tile_num_in_domain(&self.domain)
        } else {
            self.mbrs.len() as i64
        }
    }

    /// Number of cells in the tile at `tile_pos`.
    pub fn cell_num(&self, tile_pos: i64) -> i64 {
        if self.dense {
            self.schema.cell_num_per_tile()
        } else if tile_pos == self.tile_num() - 1 {
            self.last_tile_cell_num
        } else {
            self.schema.capacity()
        }
    }

    fn manifest_path(&self) -> String {
        append_paths(&self.fragment_dir, BOOKKEEPING_FILENAME)
    }

    fn corrupt(&self, reason: impl Into<String>) -> GridError {
        GridError::ManifestCorrupt {
            fragment: self.fragment_dir.clone(),
            reason: reason.into(),
        }
    }

    /// Serializes the manifest into its gzip stream and commits the
    /// file. This is the only write path; fragment validity is
    /// predicated on this commit succeeding.
    pub fn finalize(&mut self, fs: &Arc<dyn StorageBackend>) -> GridResult<()> {
        if self.mode != Mode::Write || !self.initialized {
            return Err(self.corrupt("finalize on a loaded or uninitialized manifest"));
        }
        let path = self.manifest_path();
        debug!("writing manifest {path}");
        let mut buf = CompressedStorageBuffer::new_writer(
            fs.clone(),
            path,
            fs.upload_buffer_size().max(1),
            CompressionKind::Gzip,
        )?;

        self.flush_non_empty_domain(&mut buf)?;
        self.flush_mbrs(&mut buf)?;
        self.flush_bounding_coords(&mut buf)?;
        self.flush_tile_offsets(&mut buf)?;
        self.flush_tile_var_offsets(&mut buf)?;
        self.flush_tile_var_sizes(&mut buf)?;
        write_i64(&mut buf, self.last_tile_cell_num)?;

        buf.finalize()?;
        self.mode = Mode::Read;
        Ok(())
    }

    fn flush_non_empty_domain(&self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        let bytes = crate::coords::encode_coords(&self.non_empty_domain);
        write_u64(buf, bytes.len() as u64)?;
        buf.append_buffer(&bytes)
    }

    fn flush_mbrs(&self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        write_i64(buf, self.mbrs.len() as i64)?;
        for mbr in &self.mbrs {
            buf.append_buffer(&crate::coords::encode_coords(mbr))?;
        }
        Ok(())
    }

    fn flush_bounding_coords(&self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        write_i64(buf, self.bounding_coords.len() as i64)?;
        for bc in &self.bounding_coords {
            buf.append_buffer(&crate::coords::encode_coords(bc))?;
        }
        Ok(())
    }

    fn flush_tile_offsets(&self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        for offsets in &self.tile_offsets {
            write_i64(buf, offsets.len() as i64)?;
            for off in offsets {
                write_i64(buf, *off)?;
            }
        }
        Ok(())
    }

    fn flush_tile_var_offsets(&self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        for (a, attr) in self.schema.attributes().iter().enumerate() {
            if !attr.is_var() {
                continue;
            }
            let offsets = &self.tile_var_offsets[a];
            write_i64(buf, offsets.len() as i64)?;
            for off in offsets {
                write_i64(buf, *off)?;
            }
        }
        Ok(())
    }

    fn flush_tile_var_sizes(&self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        for (a, attr) in self.schema.attributes().iter().enumerate() {
            if !attr.is_var() {
                continue;
            }
            let sizes = &self.tile_var_sizes[a];
            write_i64(buf, sizes.len() as i64)?;
            for size in sizes {
                write_u64(buf, *size)?;
            }
        }
        Ok(())
    }

    /// Loads and validates a manifest from storage. Any arity mismatch,
    /// short read, or decompression failure aborts with
    /// [`GridError::ManifestCorrupt`] and leaves no partial state behind.
    pub fn load(
        fs: &Arc<dyn StorageBackend>,
        schema: Arc<ArraySchema<T>>,
        dense: bool,
        fragment_dir: impl Into<String>,
    ) -> GridResult<Self> {
        let mut book = Self::new_write(schema, dense, fragment_dir);
        book.mode = Mode::Read;
        let path = book.manifest_path();
        if !fs.is_file(&path) {
            return Err(book.corrupt("manifest file is absent"));
        }
        debug!("loading manifest {path}");
        let mut buf = CompressedStorageBuffer::new_reader(
            fs.clone(),
            path,
            fs.download_buffer_size().max(1),
            CompressionKind::Gzip,
        )?;

        book.load_non_empty_domain(&mut buf)?;
        book.load_mbrs(&mut buf)?;
        book.load_bounding_coords(&mut buf)?;
        book.load_tile_offsets(&mut buf)?;
        book.load_tile_var_offsets(&mut buf)?;
        book.load_tile_var_sizes(&mut buf)?;
        book.last_tile_cell_num = read_i64(&mut buf).map_err(|e| book.map_load_err(&e))?;

        book.validate(fs)?;
        book.initialized = true;
        Ok(book)
    }

    fn map_load_err(&self, e: &GridError) -> GridError {
        self.corrupt(format!("{e}"))
    }

    fn load_non_empty_domain(&mut self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        let size = read_u64(buf).map_err(|e| self.map_load_err(&e))? as usize;
        let expected = 2 * self.schema.dim_num() * T::SIZE;
        if size != expected {
            return Err(self.corrupt(format!(
                "non-empty domain holds {size} bytes, schema expects {expected}"
            )));
        }
        let mut bytes = vec![0u8; size];
        buf.read_buffer(&mut bytes).map_err(|e| self.map_load_err(&e))?;
        self.non_empty_domain = crate::coords::decode_coords(&bytes, 2 * self.schema.dim_num());
        self.domain = self.schema.expand_domain(&self.non_empty_domain);
        Ok(())
    }

    fn load_coord_list(
        &mut self,
        buf: &mut CompressedStorageBuffer,
        what: &str,
    ) -> GridResult<Vec<Vec<T>>> {
        let num = read_i64(buf).map_err(|e| self.map_load_err(&e))?;
        if num < 0 {
            return Err(self.corrupt(format!("negative {what} count")));
        }
        if self.dense && num != 0 {
            return Err(self.corrupt(format!("dense fragment carries {num} {what}")));
        }
        let width = 2 * self.schema.dim_num();
        let mut out = Vec::with_capacity(num as usize);
        let mut bytes = vec![0u8; width * T::SIZE];
        for _ in 0..num {
            buf.read_buffer(&mut bytes).map_err(|e| self.map_load_err(&e))?;
            out.push(crate::coords::decode_coords(&bytes, width));
        }
        Ok(out)
    }

    fn load_mbrs(&mut self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        self.mbrs = self.load_coord_list(buf, "MBRs")?;
        Ok(())
    }

    fn load_bounding_coords(&mut self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        self.bounding_coords = self.load_coord_list(buf, "bounding coordinates")?;
        if self.bounding_coords.len() != self.mbrs.len() {
            return Err(self.corrupt(format!(
                "{} bounding coordinates for {} MBRs",
                self.bounding_coords.len(),
                self.mbrs.len()
            )));
        }
        Ok(())
    }

    fn load_tile_offsets(&mut self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        let n = self.schema.attribute_num() + 1;
        let mut all = Vec::with_capacity(n);
        for _ in 0..n {
            let num = read_i64(buf).map_err(|e| self.map_load_err(&e))?;
            if num < 0 {
                return Err(self.corrupt("negative tile offset count"));
            }
            let mut offsets = Vec::with_capacity(num as usize);
            for _ in 0..num {
                offsets.push(read_i64(buf).map_err(|e| self.map_load_err(&e))?);
            }
            all.push(offsets);
        }
        self.tile_offsets = all;
        Ok(())
    }

    fn load_tile_var_offsets(&mut self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        let attr_num = self.schema.attribute_num();
        let mut all = vec![Vec::new(); attr_num];
        for (a, attr) in self.schema.attributes().iter().enumerate() {
            if !attr.is_var() {
                continue;
            }
            let num = read_i64(buf).map_err(|e| self.map_load_err(&e))?;
            if num < 0 {
                return Err(self.corrupt("negative variable tile offset count"));
            }
            let mut offsets = Vec::with_capacity(num as usize);
            for _ in 0..num {
                offsets.push(read_i64(buf).map_err(|e| self.map_load_err(&e))?);
            }
            all[a] = offsets;
        }
        self.tile_var_offsets = all;
        Ok(())
    }

    fn load_tile_var_sizes(&mut self, buf: &mut CompressedStorageBuffer) -> GridResult<()> {
        let attr_num = self.schema.attribute_num();
        let mut all = vec![Vec::new(); attr_num];
        for (a, attr) in self.schema.attributes().iter().enumerate() {
            if !attr.is_var() {
                continue;
            }
            let num = read_i64(buf).map_err(|e| self.map_load_err(&e))?;
            if num < 0 {
                return Err(self.corrupt("negative variable tile size count"));
            }
            let mut sizes = Vec::with_capacity(num as usize);
            for _ in 0..num {
                sizes.push(read_u64(buf).map_err(|e| self.map_load_err(&e))?);
            }
            all[a] = sizes;
        }
        self.tile_var_sizes = all;
        Ok(())
    }

    /// Post-load validation: arities against the schema, non-empty
    /// domain containment, offset monotonicity, and offsets against the
    /// file sizes the backend reports.
    fn validate(&self, fs: &Arc<dyn StorageBackend>) -> GridResult<()> {
        let schema_domain = self.schema.domain();
        for d in 0..self.schema.dim_num() {
            let lo = self.non_empty_domain[2 * d];
            let hi = self.non_empty_domain[2 * d + 1];
            if lo < schema_domain[2 * d] || hi > schema_domain[2 * d + 1] {
                return Err(self.corrupt("non-empty domain outside the schema domain"));
            }
        }

        let tile_num = if self.dense {
            self.schema.tile_num_in_domain(&self.domain)
        } else {
            self.mbrs.len() as i64
        };
        for (a, offsets) in self.tile_offsets.iter().enumerate() {
            if offsets.len() as i64 != tile_num {
                return Err(self.corrupt(format!(
                    "attribute {a} has {} tile offsets for {tile_num} tiles",
                    offsets.len()
                )));
            }
            if offsets.windows(2).any(|w| w[0] > w[1]) {
                return Err(self.corrupt(format!("attribute {a} tile offsets decrease")));
            }
        }
        for (a, attr) in self.schema.attributes().iter().enumerate() {
            if !attr.is_var() {
                continue;
            }
            if self.tile_var_offsets[a].len() != self.tile_offsets[a].len()
                || self.tile_var_sizes[a].len() != self.tile_offsets[a].len()
            {
                return Err(self.corrupt(format!(
                    "attribute {a} variable vectors disagree with its tile count"
                )));
            }
        }

        // Every recorded offset must fall inside the backing file.
        let attr_num = self.schema.attribute_num();
        for a in 0..=attr_num {
            let file = if a == attr_num {
                append_paths(&self.fragment_dir, &coords_file_name())
            } else {
                append_paths(
                    &self.fragment_dir,
                    &attr_file_name(self.schema.attributes()[a].name()),
                )
            };
            let Ok(size) = fs.file_size(&file) else {
                continue; // attribute never written
            };
            if self.tile_offsets[a].iter().any(|off| *off >= size as i64 && size > 0)
                || (size == 0 && !self.tile_offsets[a].is_empty())
            {
                return Err(self.corrupt(format!(
                    "attribute {a} holds offsets beyond its file size {size}"
                )));
            }
            if a < attr_num && self.schema.attributes()[a].is_var() {
                let var_file = append_paths(
                    &self.fragment_dir,
                    &attr_var_file_name(self.schema.attributes()[a].name()),
                );
                let Ok(var_size) = fs.file_size(&var_file) else {
                    continue;
                };
                if self.tile_var_offsets[a].iter().any(|off| *off >= var_size as i64) {
                    return Err(self.corrupt(format!(
                        "attribute {a} holds variable offsets beyond its file size {var_size}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn write_i64(buf: &mut CompressedStorageBuffer, v: i64) -> GridResult<()> {
    let mut bytes = [0u8; 8];
    LittleEndian::write_i64(&mut bytes, v);
    buf.append_buffer(&bytes)
}

fn write_u64(buf: &mut CompressedStorageBuffer, v: u64) -> GridResult<()> {
    let mut bytes = [0u8; 8];
    LittleEndian::write_u64(&mut bytes, v);
    buf.append_buffer(&bytes)
}

fn read_i64(buf: &mut CompressedStorageBuffer) -> GridResult<i64> {
    let mut bytes = [0u8; 8];
    buf.read_buffer(&mut bytes)?;
    Ok(LittleEndian::read_i64(&bytes))
}

fn read_u64(buf: &mut CompressedStorageBuffer) -> GridResult<u64> {
    let mut bytes = [0u8; 8];
    buf.read_buffer(&mut bytes)?;
    Ok(LittleEndian::read_u64(&bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{BOOKKEEPING_FILENAME, Bookkeeping};
    use crate::codec::CompressionKind;
    use crate::error::GridError;
    use crate::schema::{ArraySchema, Attribute, Datatype};
    use crate::storage::posix::PosixFs;
    use crate::storage::{StorageBackend, append_paths};

    fn sparse_schema() -> Arc<ArraySchema<i64>> {
        Arc::new(
            ArraySchema::sparse("arr", &["x", "y"], &[0, 99, 0, 99], 5)
                .expect("schema")
                .attribute(Attribute::fixed("a1", Datatype::Int32, 1))
                .attribute(
                    Attribute::var("a2", Datatype::Char).compression(CompressionKind::Gzip, 6),
                ),
        )
    }

    fn posix(dir: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(PosixFs::new().working_dir(dir.path().to_string_lossy().into_owned()))
    }

    fn write_attr_files(fs: &Arc<dyn StorageBackend>, frag: &str) {
        // Backing files large enough for the offsets recorded below.
        fs.write_to_file(&format!("{frag}/a1.tdb"), &[0u8; 64]).expect("a1");
        fs.write_to_file(&format!("{frag}/a2.tdb"), &[0u8; 128]).expect("a2");
        fs.write_to_file(&format!("{frag}/a2_var.tdb"), &[0u8; 256]).expect("a2 var");
        fs.write_to_file(&format!("{frag}/__coords.tdb"), &[0u8; 256]).expect("coords");
    }

    fn build_sparse(fs: &Arc<dyn StorageBackend>, frag: &str) -> Bookkeeping<i64> {
        fs.create_dir(frag).expect("fragment dir");
        write_attr_files(fs, frag);
        let mut book = Bookkeeping::new_write(sparse_schema(), false, frag);
        book.init(Some(&[0, 40, 0, 60])).expect("init");
        for t in 0..3i64 {
            book.append_mbr(&[t * 10, t * 10 + 5, t * 20, t * 20 + 5]);
            book.append_bounding_coords(&[t * 10, t * 20, t * 10 + 5, t * 20 + 5]);
            book.append_tile_offset(0, 20);
            book.append_tile_offset(1, 40);
            book.append_tile_offset(2, 80);
            book.append_tile_var_offset(1, 70);
            book.append_tile_var_size(1, 100);
        }
        book.set_last_tile_cell_num(4);
        book
    }

    #[test]
    fn sparse_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let mut book = build_sparse(&fs, "frag1");
        book.finalize(&fs).expect("finalize");

        let loaded = Bookkeeping::<i64>::load(&fs, sparse_schema(), false, "frag1")
            .expect("load");
        assert_eq!(loaded.non_empty_domain(), &[0, 40, 0, 60]);
        assert_eq!(loaded.mbrs(), book.mbrs());
        assert_eq!(loaded.bounding_coords(), book.bounding_coords());
        assert_eq!(loaded.tile_offsets(), book.tile_offsets());
        assert_eq!(loaded.tile_offsets()[0], vec![0, 20, 40]);
        assert_eq!(loaded.tile_var_offsets()[1], vec![0, 70, 140]);
        assert_eq!(loaded.tile_var_sizes()[1], vec![100, 100, 100]);
        assert_eq!(loaded.last_tile_cell_num(), 4);
        assert_eq!(loaded.tile_num(), 3);
        assert_eq!(loaded.cell_num(0), 5);
        assert_eq!(loaded.cell_num(2), 4);
    }

    #[test]
    fn dense_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let schema = Arc::new(
            ArraySchema::dense("arr", &["x"], &[0, 99], &[10])
                .expect("schema")
                .attribute(Attribute::fixed("a", Datatype::Int64, 1)),
        );
        fs.create_dir("frag2").expect("fragment dir");
        fs.write_to_file("frag2/a.tdb", &[0u8; 256]).expect("a");

        let mut book = Bookkeeping::new_write(schema.clone(), true, "frag2");
        book.init(Some(&[15, 34])).expect("init");
        // Expanded domain [10, 39] holds three tiles.
        assert_eq!(book.domain(), &[10, 39]);
        for _ in 0..3 {
            book.append_tile_offset(0, 80);
            book.append_tile_offset(1, 0);
        }
        book.finalize(&fs).expect("finalize");

        let loaded = Bookkeeping::<i64>::load(&fs, schema, true, "frag2").expect("load");
        assert!(loaded.dense());
        assert_eq!(loaded.tile_num(), 3);
        assert_eq!(loaded.mbrs().len(), 0);
        assert_eq!(loaded.last_tile_cell_num(), 0);
        assert_eq!(loaded.cell_num(2), 10);
    }

    #[test]
    fn absent_manifest_is_corrupt() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        fs.create_dir("frag3").expect("fragment dir");
        fs.write_to_file("frag3/a1.tdb", &[0u8; 8]).expect("stray attribute file");
        let err = Bookkeeping::<i64>::load(&fs, sparse_schema(), false, "frag3")
            .expect_err("no manifest");
        assert!(matches!(err, GridError::ManifestCorrupt { .. }));
    }

    #[test]
    fn truncated_manifest_is_corrupt() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let mut book = build_sparse(&fs, "frag4");
        book.finalize(&fs).expect("finalize");

        let path = append_paths("frag4", BOOKKEEPING_FILENAME);
        let size = fs.file_size(&path).expect("size");
        let mut bytes = vec![0u8; size as usize / 2];
        fs.read_from_file(&path, 0, &mut bytes).expect("read");
        fs.delete_file(&path).expect("delete");
        fs.write_to_file(&path, &bytes).expect("rewrite truncated");

        let err = Bookkeeping::<i64>::load(&fs, sparse_schema(), false, "frag4")
            .expect_err("truncated");
        assert!(matches!(err, GridError::ManifestCorrupt { .. }));
    }

    #[test]
    fn init_is_single_shot() {
        let mut book = Bookkeeping::new_write(sparse_schema(), false, "frag5");
        book.init(None).expect("first init");
        assert!(book.init(None).is_err());
    }
}
