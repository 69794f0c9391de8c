//! Fragments: immutable write units of an array.
//!
//! A fragment is a directory holding one file per fixed-size attribute,
//! two per variable-size attribute (offsets and values), a coordinate
//! file for sparse fragments, and the bookkeeping manifest. The manifest
//! is written last: a fragment is valid only once its manifest commit
//! succeeded.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use crate::bookkeeping::Bookkeeping;
use crate::codec::Codec;
use crate::coords::Coord;
use crate::error::{GridError, GridResult};
use crate::read_state::ReadState;
use crate::schema::{ArraySchema, VAR_OFFSET_SIZE};
use crate::storage::{StorageBackend, append_paths};

const ATTR_FILE_SUFFIX: &str = ".tdb";
const ATTR_VAR_FILE_SUFFIX: &str = "_var.tdb";
const COORDS_FILE_NAME: &str = "__coords.tdb";

/// File name of a fixed attribute (or the offsets stream of a variable
/// attribute).
pub fn attr_file_name(attribute_name: &str) -> String {
    format!("{attribute_name}{ATTR_FILE_SUFFIX}")
}

/// File name of the values stream of a variable attribute.
pub fn attr_var_file_name(attribute_name: &str) -> String {
    format!("{attribute_name}{ATTR_VAR_FILE_SUFFIX}")
}

/// File name of the sparse coordinate stream.
pub fn coords_file_name() -> String {
    COORDS_FILE_NAME.to_string()
}

/// A loaded, immutable fragment.
pub struct Fragment<T: Coord> {
    fs: Arc<dyn StorageBackend>,
    schema: Arc<ArraySchema<T>>,
    dir: String,
    dense: bool,
    book: Bookkeeping<T>,
}

impl<T: Coord> Fragment<T> {
    /// Opens a fragment directory for reading, loading and validating
    /// its manifest.
    pub fn open(
        fs: Arc<dyn StorageBackend>,
        schema: Arc<ArraySchema<T>>,
        dir: impl Into<String>,
        dense: bool,
    ) -> GridResult<Self> {
        let dir = dir.into();
        let book = Bookkeeping::load(&fs, schema.clone(), dense, dir.clone())?;
        Ok(Self {
            fs,
            schema,
            dir,
            dense,
            book,
        })
    }

    /// The fragment directory (its name is the fragment id).
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Whether the fragment is dense.
    pub fn dense(&self) -> bool {
        self.dense
    }

    /// The schema the fragment was written under.
    pub fn schema(&self) -> &Arc<ArraySchema<T>> {
        &self.schema
    }

    /// The loaded manifest.
    pub fn bookkeeping(&self) -> &Bookkeeping<T> {
        &self.book
    }

    /// The backend the fragment lives on.
    pub fn fs(&self) -> &Arc<dyn StorageBackend> {
        &self.fs
    }

    /// Full path of the file backing an attribute id. The coordinates
    /// pseudo-attribute maps to the coordinate file; `var` selects the
    /// values file of a variable attribute.
    pub fn attr_file_path(&self, attribute_id: usize, var: bool) -> String {
        let name = if attribute_id >= self.schema.attribute_num() {
            coords_file_name()
        } else if var {
            attr_var_file_name(self.schema.attributes()[attribute_id].name())
        } else {
            attr_file_name(self.schema.attributes()[attribute_id].name())
        };
        append_paths(&self.dir, &name)
    }

    /// Starts a read pass over the given query subarray.
    pub fn read_state(&self, subarray: &[T]) -> GridResult<ReadState<'_, T>> {
        ReadState::new(self, subarray)
    }
}

/// One cell's worth of payload for one attribute.
#[derive(Debug, Clone, Copy)]
pub enum CellValue<'a> {
    /// A fixed-size payload of exactly the attribute's cell size.
    Fixed(&'a [u8]),
    /// A variable-size payload.
    Var(&'a [u8]),
}

/// Writes a fragment cell by cell, batching into tiles.
///
/// Cells must arrive in cell order (the schema's order for sparse
/// fragments; fill order of the tile grid for dense ones); each full
/// tile is compressed with the attribute codec and appended to the
/// attribute files, and the manifest accumulates offsets. `finalize`
/// flushes the last partial tile, closes the attribute files, and
/// commits the manifest last.
pub struct FragmentWriter<T: Coord> {
    fs: Arc<dyn StorageBackend>,
    schema: Arc<ArraySchema<T>>,
    dir: String,
    dense: bool,
    book: Bookkeeping<T>,
    codecs: Vec<Option<Codec>>,
    offsets_codecs: Vec<Option<Codec>>,
    coords_codec: Option<Codec>,
    tile_data: Vec<Vec<u8>>,
    tile_var_data: Vec<Vec<u8>>,
    coords_data: Vec<u8>,
    var_next_offset: Vec<u64>,
    cells_in_tile: i64,
    last_flushed_cell_num: i64,
    tile_first_coords: Vec<T>,
    tile_last_coords: Vec<T>,
    tile_mbr: Vec<T>,
    written_files: HashSet<String>,
}

impl<T: Coord> FragmentWriter<T> {
    /// Creates the fragment directory and a write-mode manifest.
    ///
    /// `non_empty_domain` bounds the cells this fragment will hold;
    /// `None` means the whole array domain.
    pub fn create(
        fs: Arc<dyn StorageBackend>,
        schema: Arc<ArraySchema<T>>,
        dir: impl Into<String>,
        dense: bool,
        non_empty_domain: Option<&[T]>,
    ) -> GridResult<Self> {
        let dir = dir.into();
        fs.create_dir(&dir)?;
        let mut book = Bookkeeping::new_write(schema.clone(), dense, dir.clone());
        book.init(non_empty_domain)?;

        let attr_num = schema.attribute_num();
        let mut codecs = Vec::with_capacity(attr_num);
        let mut offsets_codecs = Vec::with_capacity(attr_num);
        for (a, attr) in schema.attributes().iter().enumerate() {
            let (kind, level) = schema.compression(a);
            let element = attr.datatype().size();
            codecs.push(Codec::for_kind(kind, level, element)?);
            let (okind, olevel) = schema.offsets_compression(a);
            offsets_codecs.push(Codec::for_kind(okind, olevel, VAR_OFFSET_SIZE)?);
        }
        let (ckind, clevel) = schema.compression(attr_num);
        let coords_codec = Codec::for_kind(ckind, clevel, T::SIZE)?;

        Ok(Self {
            fs,
            schema,
            dir,
            dense,
            book,
            codecs,
            offsets_codecs,
            coords_codec,
            tile_data: vec![Vec::new(); attr_num],
            tile_var_data: vec![Vec::new(); attr_num],
            coords_data: Vec::new(),
            var_next_offset: vec![0; attr_num],
            cells_in_tile: 0,
            last_flushed_cell_num: 0,
            tile_first_coords: Vec::new(),
            tile_last_coords: Vec::new(),
            tile_mbr: Vec::new(),
            written_files: HashSet::new(),
        })
    }

    fn contract_err(&self, msg: &str) -> GridError {
        GridError::io_msg(&self.dir, msg)
    }

    /// Appends one cell. Sparse fragments require coordinates; dense
    /// fragments forbid them.
    pub fn write_cell(&mut self, coords: Option<&[T]>, values: &[CellValue<'_>]) -> GridResult<()> {
        if values.len() != self.schema.attribute_num() {
            return Err(self.contract_err("cell value arity does not match the schema"));
        }
        match (self.dense, coords) {
            (false, None) => return Err(self.contract_err("sparse cells need coordinates")),
            (true, Some(_)) => return Err(self.contract_err("dense cells carry no coordinates")),
            _ => {}
        }

        for (a, value) in values.iter().enumerate() {
            let attr = &self.schema.attributes()[a];
            match (attr.is_var(), value) {
                (false, CellValue::Fixed(bytes)) => {
                    let expected = attr.cell_size().unwrap_or(0);
                    if bytes.len() != expected {
                        return Err(self.contract_err("fixed cell payload size mismatch"));
                    }
                    self.tile_data[a].extend_from_slice(bytes);
                }
                (true, CellValue::Var(bytes)) => {
                    self.tile_data[a].extend_from_slice(&self.var_next_offset[a].to_le_bytes());
                    self.tile_var_data[a].extend_from_slice(bytes);
                    self.var_next_offset[a] += bytes.len() as u64;
                }
                _ => return Err(self.contract_err("cell value kind does not match the attribute")),
            }
        }

        if let Some(coords) = coords {
            if coords.len() != self.schema.dim_num() {
                return Err(self.contract_err("coordinate arity does not match the schema"));
            }
            for c in coords {
                c.write_le(&mut self.coords_data);
            }
            if self.cells_in_tile == 0 {
                self.tile_first_coords = coords.to_vec();
                self.tile_mbr = coords.iter().flat_map(|c| [*c, *c]).collect();
            } else {
                for d in 0..coords.len() {
                    if coords[d] < self.tile_mbr[2 * d] {
                        self.tile_mbr[2 * d] = coords[d];
                    }
                    if coords[d] > self.tile_mbr[2 * d + 1] {
                        self.tile_mbr[2 * d + 1] = coords[d];
                    }
                }
            }
            self.tile_last_coords = coords.to_vec();
        }

        self.cells_in_tile += 1;
        let full = if self.dense {
            self.schema.cell_num_per_tile()
        } else {
            self.schema.capacity()
        };
        if self.cells_in_tile >= full {
            self.flush_tile()?;
        }
        Ok(())
    }

    fn write_stream(&mut self, path: String, data: &[u8]) -> GridResult<()> {
        self.fs.write_to_file(&path, data)?;
        self.written_files.insert(path);
        Ok(())
    }

    fn flush_tile(&mut self) -> GridResult<()> {
        if self.cells_in_tile == 0 {
            return Ok(());
        }
        let attr_num = self.schema.attribute_num();
        for a in 0..attr_num {
            let payload = std::mem::take(&mut self.tile_data[a]);
            let on_disk = match self.offsets_or_value_codec(a) {
                Some(codec) => codec.compress(&payload)?,
                None => payload,
            };
            let path = append_paths(&self.dir, &attr_file_name(self.schema.attributes()[a].name()));
            self.write_stream(path, &on_disk)?;
            self.book.append_tile_offset(a, on_disk.len() as u64);

            if self.schema.var_size(a) {
                let var_payload = std::mem::take(&mut self.tile_var_data[a]);
                let var_disk = match &self.codecs[a] {
                    Some(codec) => codec.compress(&var_payload)?,
                    None => var_payload.clone(),
                };
                let var_path = append_paths(
                    &self.dir,
                    &attr_var_file_name(self.schema.attributes()[a].name()),
                );
                self.write_stream(var_path, &var_disk)?;
                self.book.append_tile_var_offset(a, var_disk.len() as u64);
                self.book.append_tile_var_size(a, var_payload.len() as u64);
            }
        }

        if !self.dense {
            let coords_payload = std::mem::take(&mut self.coords_data);
            let coords_disk = match &self.coords_codec {
                Some(codec) => codec.compress(&coords_payload)?,
                None => coords_payload,
            };
            let coords_path = append_paths(&self.dir, &coords_file_name());
            self.write_stream(coords_path, &coords_disk)?;
            self.book.append_tile_offset(attr_num, coords_disk.len() as u64);
            self.book.append_mbr(&self.tile_mbr.clone());
            let mut bounding = self.tile_first_coords.clone();
            bounding.extend_from_slice(&self.tile_last_coords);
            self.book.append_bounding_coords(&bounding);
        } else {
            self.book.append_tile_offset(attr_num, 0);
        }

        self.last_flushed_cell_num = self.cells_in_tile;
        self.cells_in_tile = 0;
        Ok(())
    }

    /// The codec applied to the `.tdb` stream of attribute `a`: the
    /// offsets codec for variable attributes, the value codec otherwise.
    fn offsets_or_value_codec(&self, a: usize) -> Option<&Codec> {
        if self.schema.var_size(a) {
            self.offsets_codecs[a].as_ref()
        } else {
            self.codecs[a].as_ref()
        }
    }

    /// Flushes the trailing partial tile, closes the attribute files,
    /// and commits the manifest last.
    pub fn finalize(mut self) -> GridResult<Fragment<T>> {
        self.flush_tile()?;
        if !self.dense {
            self.book.set_last_tile_cell_num(self.last_flushed_cell_num);
        }
        let files: Vec<String> = self.written_files.drain().collect();
        for path in files {
            self.fs.close_file(&path)?;
        }
        debug!("committing fragment {}", self.dir);
        self.book.finalize(&self.fs)?;

        Fragment::open(self.fs, self.schema, self.dir, self.dense)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{CellValue, Fragment, FragmentWriter};
    use crate::codec::CompressionKind;
    use crate::schema::{ArraySchema, Attribute, Datatype};
    use crate::storage::StorageBackend;
    use crate::storage::posix::PosixFs;

    fn posix(dir: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(PosixFs::new().working_dir(dir.path().to_string_lossy().into_owned()))
    }

    fn schema() -> Arc<ArraySchema<i64>> {
        Arc::new(
            ArraySchema::sparse("arr", &["x", "y", "z"], &[0, 9, 0, 9, 0, 9], 5)
                .expect("schema")
                .attribute(Attribute::fixed("a1", Datatype::Int32, 1))
                .attribute(
                    Attribute::var("a2", Datatype::Char).compression(CompressionKind::Gzip, 6),
                ),
        )
    }

    fn write_cells(fs: &Arc<dyn StorageBackend>) -> Fragment<i64> {
        let mut writer =
            FragmentWriter::create(fs.clone(), schema(), "frag_w", false, None).expect("writer");
        let coords = [[0i64, 0, 0], [0, 0, 1], [0, 2, 3], [2, 1, 1]];
        let a1: [i32; 4] = [0, 1, 2, 3];
        let a2 = ["first", "second", "third", "fourth"];
        for i in 0..4 {
            let v0 = a1[i].to_le_bytes();
            writer
                .write_cell(
                    Some(&coords[i]),
                    &[CellValue::Fixed(&v0), CellValue::Var(a2[i].as_bytes())],
                )
                .expect("write cell");
        }
        writer.finalize().expect("finalize")
    }

    #[test]
    fn writes_expected_files_and_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_cells(&fs);

        assert!(fs.is_file("frag_w/a1.tdb"));
        assert!(fs.is_file("frag_w/a2.tdb"));
        assert!(fs.is_file("frag_w/a2_var.tdb"));
        assert!(fs.is_file("frag_w/__coords.tdb"));
        assert!(fs.is_file("frag_w/__book_keeping.tdb.gz"));

        let book = fragment.bookkeeping();
        assert_eq!(book.tile_num(), 1);
        assert_eq!(book.last_tile_cell_num(), 4);
        assert_eq!(book.mbrs(), &[vec![0, 2, 0, 2, 0, 3]]);
        assert_eq!(book.bounding_coords(), &[vec![0, 0, 0, 2, 1, 1]]);
        assert_eq!(book.tile_offsets()[0], vec![0]);
        assert_eq!(book.tile_var_sizes()[1], vec![22], "sum of value lengths");
        // The offsets stream stores 4 u64 cells uncompressed.
        assert_eq!(fs.file_size("frag_w/a2.tdb").expect("size"), 32);
        assert_eq!(fs.file_size("frag_w/a1.tdb").expect("size"), 16);
    }

    #[test]
    fn reopen_sees_identical_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let written = write_cells(&fs);
        let reopened =
            Fragment::open(fs, schema(), "frag_w", false).expect("reopen");
        assert_eq!(
            written.bookkeeping().tile_offsets(),
            reopened.bookkeeping().tile_offsets()
        );
        assert_eq!(
            written.bookkeeping().non_empty_domain(),
            reopened.bookkeeping().non_empty_domain()
        );
    }

    #[test]
    fn capacity_splits_tiles() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let mut writer =
            FragmentWriter::create(fs.clone(), schema(), "frag_c", false, None).expect("writer");
        for i in 0..12i64 {
            let v = (i as i32).to_le_bytes();
            writer
                .write_cell(
                    Some(&[i / 4, i % 4, 0]),
                    &[CellValue::Fixed(&v), CellValue::Var(b"x")],
                )
                .expect("write cell");
        }
        let fragment = writer.finalize().expect("finalize");
        let book = fragment.bookkeeping();
        assert_eq!(book.tile_num(), 3, "12 cells at capacity 5");
        assert_eq!(book.last_tile_cell_num(), 2);
        assert_eq!(book.cell_num(0), 5);
        assert_eq!(book.cell_num(2), 2);
    }
}
