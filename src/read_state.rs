//! Per-fragment read cursor.
//!
//! A `ReadState` drives one query pass over one fragment: it computes the
//! range of tiles that may overlap the query subarray, iterates those
//! tiles (dense bijection, sparse binary search over bounding
//! coordinates, or conservative Hilbert search), fetches and decompresses
//! tile bytes on demand, and copies cell ranges into caller buffers.
//! When a destination buffer cannot hold a full range the copy stops at
//! the truncation point and the attribute's overflow flag is raised;
//! overflow is backpressure, not an error.

use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;

use crate::bookkeeping::Bookkeeping;
use crate::codec::Codec;
use crate::coords::{Coord, decode_coords};
use crate::error::{GridError, GridResult};
use crate::fragment::Fragment;
use crate::schema::{ArraySchema, CellOrder, Overlap, TileOrder, VAR_OFFSET_SIZE};
use crate::storage::StorageBackend;
use crate::storage::posix::MappedRegion;

/// An inclusive cell position range `[first, last]` within a tile.
pub type CellPosRange = (i64, i64);

/// A `(fragment id, tile position)` pair.
pub type FragmentInfo = (usize, i64);

/// A cell position range attached to the fragment and tile it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentCellPosRange {
    /// The fragment and tile the range refers to.
    pub fragment_info: FragmentInfo,
    /// The inclusive cell position range within that tile.
    pub cell_pos_range: CellPosRange,
}

/// Predecessor/successor lookup result around a target coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclosingCoords<T> {
    /// The immediate predecessor within the probed range, if any.
    pub left: Option<Vec<T>>,
    /// The immediate successor within the probed range, if any.
    pub right: Option<Vec<T>>,
    /// Whether the target itself exists in the tile.
    pub target_exists: bool,
}

enum TileBuf {
    None,
    Owned(Vec<u8>),
    Mapped(MappedRegion),
}

impl TileBuf {
    fn bytes(&self) -> &[u8] {
        match self {
            TileBuf::None => &[],
            TileBuf::Owned(v) => v,
            TileBuf::Mapped(m) => m.as_slice(),
        }
    }
}

const NO_TILE: i64 = -1;

/// The read cursor over one fragment for one query pass.
pub struct ReadState<'a, T: Coord> {
    fragment: &'a Fragment<T>,
    schema: &'a ArraySchema<T>,
    book: &'a Bookkeeping<T>,
    fs: Arc<dyn StorageBackend>,
    subarray: Vec<T>,

    done: bool,
    search_tile_pos: i64,
    tile_search_range: Option<[i64; 2]>,
    search_tile_overlap: Overlap,
    search_tile_overlap_subarray: Vec<T>,
    mbr_tile_overlap: Overlap,
    subarray_area_covered: bool,
    last_tile_coords: Option<Vec<i64>>,

    overflow: Vec<bool>,

    /// Tile slots: one per attribute, one for the coordinate stream, and
    /// one more for coordinate searches.
    fetched_tile: Vec<i64>,
    tiles: Vec<TileBuf>,
    tile_sizes: Vec<usize>,
    fetched_var_tile: Vec<i64>,
    tiles_var: Vec<Vec<u8>>,
    /// The pre-shift first offset of the resident variable tile, which
    /// recovers the original file offsets.
    var_tile_shift: Vec<u64>,

    file_size_cache: Vec<Option<u64>>,
    file_var_size_cache: Vec<Option<u64>>,

    codecs: Vec<Option<Codec>>,
    offsets_codecs: Vec<Option<Codec>>,
}

impl<'a, T: Coord> ReadState<'a, T> {
    /// Creates a read state over `fragment` for the given query subarray.
    pub fn new(fragment: &'a Fragment<T>, subarray: &[T]) -> GridResult<Self> {
        let schema = fragment.schema().as_ref();
        let book = fragment.bookkeeping();
        if subarray.len() != 2 * schema.dim_num() {
            return Err(GridError::io_msg(
                fragment.dir(),
                "subarray arity does not match the schema",
            ));
        }
        let attr_num = schema.attribute_num();
        let slots = attr_num + 2;

        let mut codecs = Vec::with_capacity(attr_num + 1);
        let mut offsets_codecs = Vec::with_capacity(attr_num);
        for (a, attr) in schema.attributes().iter().enumerate() {
            let (kind, level) = schema.compression(a);
            codecs.push(Codec::for_kind(kind, level, attr.datatype().size())?);
            let (okind, olevel) = schema.offsets_compression(a);
            offsets_codecs.push(Codec::for_kind(okind, olevel, VAR_OFFSET_SIZE)?);
        }
        let (ckind, clevel) = schema.compression(attr_num);
        codecs.push(Codec::for_kind(ckind, clevel, T::SIZE)?);

        Ok(Self {
            fragment,
            schema,
            book,
            fs: fragment.fs().clone(),
            subarray: subarray.to_vec(),
            done: false,
            search_tile_pos: NO_TILE,
            tile_search_range: None,
            search_tile_overlap: Overlap::None,
            search_tile_overlap_subarray: Vec::new(),
            mbr_tile_overlap: Overlap::None,
            subarray_area_covered: false,
            last_tile_coords: None,
            overflow: vec![false; attr_num + 1],
            fetched_tile: vec![NO_TILE; slots],
            tiles: (0..slots).map(|_| TileBuf::None).collect(),
            tile_sizes: vec![0; slots],
            fetched_var_tile: vec![NO_TILE; attr_num],
            tiles_var: vec![Vec::new(); attr_num],
            var_tile_shift: vec![0; attr_num],
            file_size_cache: vec![None; attr_num + 1],
            file_var_size_cache: vec![None; attr_num],
            codecs,
            offsets_codecs,
        })
    }

    /// Whether the read pass over this fragment is finished.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Whether the fragment is dense.
    pub fn dense(&self) -> bool {
        self.book.dense()
    }

    /// Whether the destination buffers overflowed for an attribute.
    pub fn overflow(&self, attribute_id: usize) -> bool {
        self.overflow[attribute_id]
    }

    /// Clears every attribute's overflow flag.
    pub fn reset_overflow(&mut self) {
        self.overflow.iter_mut().for_each(|f| *f = false);
    }

    /// Restarts the pass with a new subarray. Resident tiles stay
    /// buffered so an overlapping request can reuse them.
    pub fn reset(&mut self, subarray: &[T]) {
        self.subarray = subarray.to_vec();
        self.done = false;
        self.search_tile_pos = NO_TILE;
        self.tile_search_range = None;
        self.search_tile_overlap = Overlap::None;
        self.search_tile_overlap_subarray.clear();
        self.mbr_tile_overlap = Overlap::None;
        self.subarray_area_covered = false;
        self.last_tile_coords = None;
        self.reset_overflow();
    }

    /// The tile position currently under investigation.
    pub fn search_tile_pos(&self) -> i64 {
        self.search_tile_pos
    }

    /// The inclusive bounds of tiles that may overlap the query;
    /// `[1, 0]` when the range is empty.
    pub fn tile_search_range(&mut self) -> [i64; 2] {
        self.ensure_tile_search_range()
    }

    /// The classification of the current search tile against the query.
    pub fn search_tile_overlap(&self) -> Overlap {
        self.search_tile_overlap
    }

    /// Whether the fragment non-empty domain fully covers the query area
    /// of the current overlapping tile.
    pub fn subarray_area_covered(&self) -> bool {
        self.subarray_area_covered
    }

    /// Whether the current sparse tile's MBR overlaps the dense driver's
    /// tile (sparse fragments queried through a dense array).
    pub fn mbr_overlaps_tile(&self) -> bool {
        self.mbr_tile_overlap != Overlap::None
    }

    /// The bounding coordinates of the current search tile.
    pub fn get_bounding_coords(&self) -> GridResult<Vec<T>> {
        let pos = self.search_tile_pos;
        if pos < 0 {
            return Err(GridError::io_msg(self.fragment.dir(), "no current search tile"));
        }
        self.book
            .bounding_coords()
            .get(pos as usize)
            .cloned()
            .ok_or_else(|| GridError::io_msg(self.fragment.dir(), "no current search tile"))
    }

    // ----- tile search range -----------------------------------------

    fn ensure_tile_search_range(&mut self) -> [i64; 2] {
        if let Some(range) = self.tile_search_range {
            return range;
        }
        let range = if self.book.dense() {
            self.compute_tile_search_range_dense()
        } else {
            // A query disjoint from the non-empty domain searches nothing.
            let (_, kind) = self
                .schema
                .subarray_overlap(&self.subarray, self.book.non_empty_domain());
            if kind == Overlap::None {
                [1, 0]
            } else if self.schema.cell_order() == CellOrder::Hilbert {
                self.compute_tile_search_range_hil()
            } else {
                self.compute_tile_search_range_col_or_row()
            }
        };
        debug!(
            "fragment {}: tile search range [{}, {}]",
            self.fragment.dir(),
            range[0],
            range[1]
        );
        self.tile_search_range = Some(range);
        range
    }

    fn compute_tile_search_range_dense(&self) -> [i64; 2] {
        let fd = self.book.domain();
        let (inter, kind) = self.schema.subarray_overlap(&self.subarray, fd);
        if kind == Overlap::None {
            return [1, 0];
        }
        let tpd = self.schema.tiles_per_dim(fd);
        let n = self.schema.dim_num();
        let lo: Vec<T> = (0..n).map(|d| inter[2 * d]).collect();
        let hi: Vec<T> = (0..n).map(|d| inter[2 * d + 1]).collect();
        let tc_lo = self.schema.tile_coords_of_cell(fd, &lo);
        let tc_hi = self.schema.tile_coords_of_cell(fd, &hi);
        [
            self.schema.tile_pos(&tpd, &tc_lo),
            self.schema.tile_pos(&tpd, &tc_hi),
        ]
    }

    fn subarray_corners(&self) -> (Vec<T>, Vec<T>) {
        let n = self.schema.dim_num();
        let lo = (0..n).map(|d| self.subarray[2 * d]).collect();
        let hi = (0..n).map(|d| self.subarray[2 * d + 1]).collect();
        (lo, hi)
    }

    fn compute_tile_search_range_col_or_row(&self) -> [i64; 2] {
        let n = self.book.tile_num();
        if n == 0 {
            return [1, 0];
        }
        let (lo, hi) = self.subarray_corners();
        let bc = self.book.bounding_coords();
        let dims = self.schema.dim_num();

        // First tile whose last bounding coordinate is at or after the
        // subarray's lower corner.
        let start = partition_point(n, |i| {
            let last = &bc[i as usize][dims..];
            self.schema.cmp_cells(last, &lo) == Ordering::Less
        });
        // Last tile whose first bounding coordinate is at or before the
        // subarray's upper corner.
        let after_end = partition_point(n, |i| {
            let first = &bc[i as usize][..dims];
            self.schema.cmp_cells(first, &hi) != Ordering::Greater
        });

        if start >= n || after_end == 0 || start > after_end - 1 {
            [1, 0]
        } else {
            [start, after_end - 1]
        }
    }

    /// Hilbert search ranges are conservative: the subarray corners map
    /// to a Hilbert value interval that is binary-searched against the
    /// Hilbert spans of each tile's bounding coordinates. False
    /// positives are filtered later by per-cell tests.
    fn compute_tile_search_range_hil(&self) -> [i64; 2] {
        let n = self.book.tile_num();
        if n == 0 {
            return [1, 0];
        }
        let dims = self.schema.dim_num();
        let bc = self.book.bounding_coords();

        let (lo, hi) = self.subarray_corners();
        let h_lo = self.schema.hilbert_index(&lo);
        let h_hi = self.schema.hilbert_index(&hi);
        let (h_min, h_max) = (h_lo.min(h_hi), h_lo.max(h_hi));

        // First tile whose span ends at or after the low value, and the
        // last whose span starts at or before the high value.
        let start = partition_point(n, |i| {
            self.schema.hilbert_index(&bc[i as usize][dims..]) < h_min
        });
        let after_end = partition_point(n, |i| {
            self.schema.hilbert_index(&bc[i as usize][..dims]) <= h_max
        });
        if start >= n || after_end == 0 || start > after_end - 1 {
            [1, 0]
        } else {
            [start, after_end - 1]
        }
    }

    // ----- per-tile iteration ----------------------------------------

    /// Advances to the fragment tile matching the dense driver's tile
    /// coordinates (given on the array tile grid), classifying its
    /// overlap with the query subarray.
    pub fn get_next_overlapping_tile_dense(&mut self, tile_coords: &[i64]) {
        if self.done {
            return;
        }
        let range = self.ensure_tile_search_range();
        if range[0] > range[1] {
            self.done = true;
            return;
        }

        let fd = self.book.domain().to_vec();
        let tpd = self.schema.tiles_per_dim(&fd);
        // The fragment grid is offset from the array grid.
        let array_domain = self.schema.domain().to_vec();
        let n = self.schema.dim_num();
        let fd_lo: Vec<T> = (0..n).map(|d| fd[2 * d]).collect();
        let grid_offset = self.schema.tile_coords_of_cell(&array_domain, &fd_lo);
        let frag_tc: Vec<i64> = (0..n).map(|d| tile_coords[d] - grid_offset[d]).collect();

        let inside = (0..n).all(|d| frag_tc[d] >= 0 && frag_tc[d] < tpd[d]);
        if !inside {
            // Past the fragment's last searched tile means this pass is
            // over; before it, the driver just has not reached us yet.
            let last_tc = tile_coords_of_pos(&tpd, range[1], self.schema.tile_order());
            if cmp_tile_order(&frag_tc, &last_tc, self.schema.tile_order()) == Ordering::Greater {
                self.done = true;
            }
            self.search_tile_overlap = Overlap::None;
            return;
        }

        let pos = self.schema.tile_pos(&tpd, &frag_tc);
        self.search_tile_pos = pos;
        if pos > range[1] {
            self.done = true;
            self.search_tile_overlap = Overlap::None;
            return;
        }
        if pos < range[0] {
            self.search_tile_overlap = Overlap::None;
            return;
        }

        let tile_domain = self.schema.tile_domain_of(&fd, &frag_tc);
        let (inter, kind) = self.schema.subarray_overlap(&self.subarray, &tile_domain);
        self.search_tile_overlap = kind;
        if kind == Overlap::None {
            return;
        }
        // Does the fragment's non-empty domain cover the whole query
        // area inside this tile?
        let (_, covered) = self
            .schema
            .subarray_overlap(self.book.non_empty_domain(), &inter);
        self.subarray_area_covered = covered == Overlap::Full;
        self.search_tile_overlap_subarray = inter;
    }

    /// Advances to the next sparse tile whose MBR overlaps the query.
    pub fn get_next_overlapping_tile_sparse(&mut self) {
        if self.done {
            return;
        }
        let range = self.ensure_tile_search_range();
        if range[0] > range[1] {
            self.done = true;
            return;
        }
        let mut pos = if self.search_tile_pos == NO_TILE {
            range[0]
        } else {
            self.search_tile_pos + 1
        };
        while pos <= range[1] {
            self.search_tile_pos = pos;
            let mbr = &self.book.mbrs()[pos as usize];
            let (inter, kind) = self.schema.subarray_overlap(&self.subarray, mbr);
            if kind != Overlap::None {
                self.search_tile_overlap = kind;
                self.search_tile_overlap_subarray = inter;
                return;
            }
            pos += 1;
        }
        self.search_tile_pos = pos;
        self.search_tile_overlap = Overlap::None;
        self.done = true;
    }

    /// Advances to the next sparse tile whose MBR overlaps the dense
    /// driver's current tile (given on the array tile grid). The cursor
    /// does not move when the driver revisits the same tile coordinates
    /// with no intervening advance, so a sparse tile spanning several
    /// driver tiles is reported once per driver tile.
    pub fn get_next_overlapping_tile_sparse_in_dense(&mut self, tile_coords: &[i64]) {
        if self.done {
            return;
        }
        let range = self.ensure_tile_search_range();
        if range[0] > range[1] {
            self.done = true;
            self.mbr_tile_overlap = Overlap::None;
            return;
        }

        let tile_domain = self
            .schema
            .tile_domain_of(&self.schema.domain().to_vec(), tile_coords);

        let same_driver_tile = self.last_tile_coords.as_deref() == Some(tile_coords);
        if same_driver_tile {
            self.search_tile_pos += 1;
        } else {
            self.last_tile_coords = Some(tile_coords.to_vec());
            if self.search_tile_pos == NO_TILE {
                self.search_tile_pos = range[0];
            }
        }

        loop {
            if self.search_tile_pos > range[1] {
                self.done = true;
                self.mbr_tile_overlap = Overlap::None;
                self.search_tile_overlap = Overlap::None;
                return;
            }
            let mbr = self.book.mbrs()[self.search_tile_pos as usize].clone();
            let (_, mbr_kind) = self.schema.subarray_overlap(&tile_domain, &mbr);
            if mbr_kind == Overlap::None {
                if self.mbr_before_tile(&mbr, tile_coords) {
                    self.search_tile_pos += 1;
                    continue;
                }
                // The sparse tile is ahead of the driver; wait for it.
                self.mbr_tile_overlap = Overlap::None;
                self.search_tile_overlap = Overlap::None;
                return;
            }
            self.mbr_tile_overlap = mbr_kind;
            let (inter, kind) = self.schema.subarray_overlap(&self.subarray, &mbr);
            self.search_tile_overlap = kind;
            self.search_tile_overlap_subarray = inter;
            let (query_in_tile, qt_kind) =
                self.schema.subarray_overlap(&self.subarray, &tile_domain);
            self.subarray_area_covered = qt_kind != Overlap::None && {
                let (_, covered) = self
                    .schema
                    .subarray_overlap(self.book.non_empty_domain(), &query_in_tile);
                covered == Overlap::Full
            };
            return;
        }
    }

    fn mbr_before_tile(&self, mbr: &[T], tile_coords: &[i64]) -> bool {
        let n = self.schema.dim_num();
        let hi: Vec<T> = (0..n).map(|d| mbr[2 * d + 1]).collect();
        let domain = self.schema.domain().to_vec();
        let mbr_tc = self.schema.tile_coords_of_cell(&domain, &hi);
        cmp_tile_order(&mbr_tc, tile_coords, self.schema.tile_order()) == Ordering::Less
    }

    // ----- tile fetch -------------------------------------------------

    fn attr_num(&self) -> usize {
        self.schema.attribute_num()
    }

    fn search_slot(&self) -> usize {
        self.attr_num() + 1
    }

    fn stream_of_slot(&self, slot: usize) -> usize {
        slot.min(self.attr_num())
    }

    fn file_size_of(&mut self, attribute_id: usize, var: bool) -> GridResult<u64> {
        let cache = if var {
            &mut self.file_var_size_cache[attribute_id]
        } else {
            &mut self.file_size_cache[attribute_id]
        };
        if let Some(size) = *cache {
            return Ok(size);
        }
        let path = self.fragment.attr_file_path(attribute_id, var);
        let size = match self.fs.file_size(&path) {
            Ok(size) => size,
            Err(GridError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        let cache = if var {
            &mut self.file_var_size_cache[attribute_id]
        } else {
            &mut self.file_size_cache[attribute_id]
        };
        *cache = Some(size);
        Ok(size)
    }

    fn is_empty_attribute(&mut self, attribute_id: usize, var: bool) -> GridResult<bool> {
        Ok(self.file_size_of(attribute_id, var)? == 0)
    }

    /// On-disk byte range `[offset, offset + len)` of a tile within its
    /// stream file: middle tiles span to the next offset, the last tile
    /// spans to the end of the file.
    fn tile_disk_range(
        &mut self,
        attribute_id: usize,
        tile_i: i64,
        var: bool,
    ) -> GridResult<(u64, usize)> {
        let book = self.book;
        let offsets = if var {
            &book.tile_var_offsets()[attribute_id]
        } else {
            &book.tile_offsets()[attribute_id]
        };
        let i = tile_i as usize;
        if i >= offsets.len() {
            return Err(GridError::TileCorrupt {
                attribute: attribute_id,
                tile: tile_i,
                reason: "tile position beyond the manifest".to_string(),
            });
        }
        let offset = offsets[i] as u64;
        let len = if i + 1 < offsets.len() {
            (offsets[i + 1] - offsets[i]) as usize
        } else {
            let file_size = self.file_size_of(attribute_id, var)?;
            (file_size - offset) as usize
        };
        Ok((offset, len))
    }

    /// Makes the tile of `slot`'s stream resident, reusing the buffer if
    /// it already holds this tile.
    fn prepare_tile_for_reading(&mut self, slot: usize, tile_i: i64) -> GridResult<()> {
        if self.fetched_tile[slot] == tile_i {
            return Ok(());
        }
        let attr = self.stream_of_slot(slot);
        if self.is_empty_attribute(attr, false)? {
            self.tiles[slot] = TileBuf::None;
            self.tile_sizes[slot] = 0;
            self.fetched_tile[slot] = tile_i;
            return Ok(());
        }

        let cell_size = self.schema.cell_size(attr);
        let tile_size = cell_size * self.book.cell_num(tile_i) as usize;
        let (offset, disk_len) = self.tile_disk_range(attr, tile_i, false)?;
        let path = self.fragment.attr_file_path(attr, false);

        let codec = if self.schema.var_size(attr) {
            self.offsets_codecs[attr].clone()
        } else {
            self.codecs[attr].clone()
        };

        let buf = match codec {
            Some(codec) => {
                let mut compressed = vec![0u8; disk_len];
                self.fs
                    .read_from_file(&path, offset, &mut compressed)
                    .map_err(|e| e.for_tile(attr, tile_i))?;
                let tile = codec.decompress(&compressed, tile_size).map_err(|e| {
                    GridError::TileCorrupt {
                        attribute: attr,
                        tile: tile_i,
                        reason: e.to_string(),
                    }
                })?;
                TileBuf::Owned(tile)
            }
            None => {
                if disk_len != tile_size {
                    return Err(GridError::TileCorrupt {
                        attribute: attr,
                        tile: tile_i,
                        reason: format!(
                            "uncompressed tile spans {disk_len} bytes, expected {tile_size}"
                        ),
                    });
                }
                if self.fs.mmap_support() {
                    TileBuf::Mapped(
                        self.fs
                            .map_region(&path, offset, tile_size)
                            .map_err(|e| e.for_tile(attr, tile_i))?,
                    )
                } else {
                    let mut tile = vec![0u8; tile_size];
                    self.fs
                        .read_from_file(&path, offset, &mut tile)
                        .map_err(|e| e.for_tile(attr, tile_i))?;
                    TileBuf::Owned(tile)
                }
            }
        };
        self.tiles[slot] = buf;
        self.tile_sizes[slot] = tile_size;
        self.fetched_tile[slot] = tile_i;
        Ok(())
    }

    /// Makes the offsets and values tiles of a variable attribute
    /// resident, shifting the offsets so the first is zero.
    fn prepare_tile_for_reading_var(&mut self, attribute_id: usize, tile_i: i64) -> GridResult<()> {
        if !self.schema.var_size(attribute_id) {
            return Err(GridError::io_msg(
                self.fragment.dir(),
                "variable tile requested for a fixed attribute",
            ));
        }
        let offsets_resident = self.fetched_tile[attribute_id] == tile_i;
        if !offsets_resident {
            self.prepare_tile_for_reading(attribute_id, tile_i)?;
            self.shift_var_offsets(attribute_id);
        }
        if self.fetched_var_tile[attribute_id] == tile_i {
            return Ok(());
        }

        let expected = self.book.tile_var_sizes()[attribute_id][tile_i as usize] as usize;
        let (offset, disk_len) = self.tile_disk_range(attribute_id, tile_i, true)?;
        let path = self.fragment.attr_file_path(attribute_id, true);
        let tile = match &self.codecs[attribute_id] {
            Some(codec) => {
                let codec = codec.clone();
                let mut compressed = vec![0u8; disk_len];
                self.fs
                    .read_from_file(&path, offset, &mut compressed)
                    .map_err(|e| e.for_tile(attribute_id, tile_i))?;
                codec
                    .decompress(&compressed, expected)
                    .map_err(|e| GridError::TileCorrupt {
                        attribute: attribute_id,
                        tile: tile_i,
                        reason: e.to_string(),
                    })?
            }
            None => {
                if disk_len != expected {
                    return Err(GridError::TileCorrupt {
                        attribute: attribute_id,
                        tile: tile_i,
                        reason: format!(
                            "variable tile spans {disk_len} bytes, expected {expected}"
                        ),
                    });
                }
                let mut tile = vec![0u8; expected];
                self.fs
                    .read_from_file(&path, offset, &mut tile)
                    .map_err(|e| e.for_tile(attribute_id, tile_i))?;
                tile
            }
        };
        self.tiles_var[attribute_id] = tile;
        self.fetched_var_tile[attribute_id] = tile_i;
        Ok(())
    }

    /// Rebases the resident offsets tile so the first offset is zero,
    /// remembering the shift to recover file-absolute offsets.
    fn shift_var_offsets(&mut self, attribute_id: usize) {
        let tile = match &mut self.tiles[attribute_id] {
            TileBuf::Owned(v) => v,
            // Uncompressed offset tiles load into owned buffers; mapped
            // tiles are converted before shifting.
            other => {
                let owned = other.bytes().to_vec();
                *other = TileBuf::Owned(owned);
                match other {
                    TileBuf::Owned(v) => v,
                    _ => return,
                }
            }
        };
        if tile.len() < VAR_OFFSET_SIZE {
            self.var_tile_shift[attribute_id] = 0;
            return;
        }
        let first = u64::from_le_bytes(tile[..8].try_into().expect("8-byte offset cell"));
        for cell in tile.chunks_exact_mut(VAR_OFFSET_SIZE) {
            let v = u64::from_le_bytes(cell.try_into().expect("8-byte offset cell"));
            cell.copy_from_slice(&(v - first).to_le_bytes());
        }
        self.var_tile_shift[attribute_id] = first;
    }

    /// The in-tile offset of cell `i` in the resident offsets tile.
    fn var_offset_at(&self, attribute_id: usize, i: i64) -> u64 {
        let bytes = self.tiles[attribute_id].bytes();
        let start = i as usize * VAR_OFFSET_SIZE;
        u64::from_le_bytes(bytes[start..start + 8].try_into().expect("8-byte offset cell"))
    }

    /// The pre-shift file offset of the first cell of the resident
    /// variable tile.
    pub fn var_tile_file_offset(&self, attribute_id: usize) -> u64 {
        self.var_tile_shift[attribute_id]
    }

    fn read_from_tile(
        &self,
        slot: usize,
        dest: &mut [u8],
        tile_offset: usize,
    ) -> GridResult<()> {
        let bytes = self.tiles[slot].bytes();
        let end = tile_offset + dest.len();
        if end > bytes.len() {
            return Err(GridError::TileCorrupt {
                attribute: self.stream_of_slot(slot),
                tile: self.fetched_tile[slot],
                reason: format!("copy of {end} bytes from a {}-byte tile", bytes.len()),
            });
        }
        dest.copy_from_slice(&bytes[tile_offset..end]);
        Ok(())
    }

    // ----- cell copy --------------------------------------------------

    /// Copies cells of a fixed-size attribute (or the coordinates) from
    /// a tile into `buffer`, starting at `buffer_offset`.
    ///
    /// `remaining_skip_count` cells of the range are dropped before
    /// emitting; the count is consumed on return. Sets the attribute's
    /// overflow flag when the buffer could not hold the whole range.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_cells(
        &mut self,
        attribute_id: usize,
        tile_i: i64,
        buffer: &mut [u8],
        buffer_offset: &mut usize,
        cell_pos_range: CellPosRange,
        remaining_skip_count: &mut i64,
    ) -> GridResult<()> {
        if self.schema.var_size(attribute_id) {
            return Err(GridError::io_msg(
                self.fragment.dir(),
                "copy_cells on a variable attribute",
            ));
        }
        let (p0, p1) = cell_pos_range;
        let range_cells = p1 - p0 + 1;
        if range_cells <= 0 {
            return Ok(());
        }
        if *remaining_skip_count >= range_cells {
            *remaining_skip_count -= range_cells;
            return Ok(());
        }

        self.prepare_tile_for_reading(attribute_id, tile_i)?;
        if self.tile_sizes[attribute_id] == 0 {
            return Ok(()); // attribute was never written
        }

        let cell_size = self.schema.cell_size(attribute_id);
        let start = p0 + *remaining_skip_count;
        let remaining = p1 - start + 1;
        *remaining_skip_count = 0;

        let free = buffer.len().saturating_sub(*buffer_offset);
        let fit = (free / cell_size) as i64;
        let to_copy = remaining.min(fit);
        if to_copy > 0 {
            let bytes = to_copy as usize * cell_size;
            let dest = &mut buffer[*buffer_offset..*buffer_offset + bytes];
            self.read_from_tile(attribute_id, dest, start as usize * cell_size)?;
            *buffer_offset += bytes;
        }
        if to_copy < remaining {
            self.overflow[attribute_id] = true;
        }
        Ok(())
    }

    /// Determines how many cells of `[start_cell_pos, end_cell_pos]`
    /// fit in both destination buffers, shrinking `end_cell_pos`
    /// accordingly, and returns the offsets-bytes and value-bytes to
    /// copy.
    fn compute_bytes_to_copy(
        &self,
        attribute_id: usize,
        start_cell_pos: i64,
        end_cell_pos: &mut i64,
        buffer_free_space: usize,
        buffer_var_free_space: usize,
    ) -> GridResult<(usize, usize)> {
        let last_cell = self.book.cell_num(self.fetched_var_tile[attribute_id]) - 1;
        let tile_var_size =
            self.book.tile_var_sizes()[attribute_id][self.fetched_var_tile[attribute_id] as usize];

        // Cap by the offsets buffer first.
        let mut cells = *end_cell_pos - start_cell_pos + 1;
        let fit = (buffer_free_space / VAR_OFFSET_SIZE) as i64;
        if cells > fit {
            cells = fit;
        }
        if cells <= 0 {
            return Ok((0, 0));
        }
        let mut end = start_cell_pos + cells - 1;

        let var_end = |e: i64| -> u64 {
            if e >= last_cell {
                tile_var_size
            } else {
                self.var_offset_at(attribute_id, e + 1)
            }
        };
        let var_start = self.var_offset_at(attribute_id, start_cell_pos);

        // Then cap by the values buffer, binary searching the largest
        // end position whose values still fit.
        if (var_end(end) - var_start) as usize > buffer_var_free_space {
            let mut lo = start_cell_pos;
            let mut hi = end;
            let mut best = start_cell_pos - 1;
            while lo <= hi {
                let mid = (lo + hi) / 2;
                if (var_end(mid) - var_start) as usize <= buffer_var_free_space {
                    best = mid;
                    lo = mid + 1;
                } else {
                    hi = mid - 1;
                }
            }
            end = best;
        }
        if end < start_cell_pos {
            return Ok((0, 0));
        }

        *end_cell_pos = end;
        let bytes = (end - start_cell_pos + 1) as usize * VAR_OFFSET_SIZE;
        let bytes_var = (var_end(end) - var_start) as usize;
        Ok((bytes, bytes_var))
    }

    /// Copies cells of a variable-size attribute into an offsets buffer
    /// and a values buffer. Emitted offsets are running write positions
    /// in the values buffer. Raises the overflow flag when either buffer
    /// truncates the range.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_cells_var(
        &mut self,
        attribute_id: usize,
        tile_i: i64,
        buffer: &mut [u8],
        buffer_offset: &mut usize,
        remaining_skip_count: &mut i64,
        buffer_var: &mut [u8],
        buffer_var_offset: &mut usize,
        remaining_skip_count_var: &mut i64,
        cell_pos_range: CellPosRange,
    ) -> GridResult<()> {
        if !self.schema.var_size(attribute_id) {
            return Err(GridError::io_msg(
                self.fragment.dir(),
                "copy_cells_var on a fixed attribute",
            ));
        }
        let (p0, p1) = cell_pos_range;
        let range_cells = p1 - p0 + 1;
        if range_cells <= 0 {
            return Ok(());
        }
        let skip = (*remaining_skip_count).max(*remaining_skip_count_var);
        if skip >= range_cells {
            *remaining_skip_count = (*remaining_skip_count - range_cells).max(0);
            *remaining_skip_count_var = (*remaining_skip_count_var - range_cells).max(0);
            return Ok(());
        }

        self.prepare_tile_for_reading_var(attribute_id, tile_i)?;

        let start = p0 + skip;
        *remaining_skip_count = 0;
        *remaining_skip_count_var = 0;

        let free = buffer.len().saturating_sub(*buffer_offset);
        let free_var = buffer_var.len().saturating_sub(*buffer_var_offset);
        let mut end = p1;
        let (bytes, bytes_var) =
            self.compute_bytes_to_copy(attribute_id, start, &mut end, free, free_var)?;
        if bytes == 0 {
            self.overflow[attribute_id] = true;
            return Ok(());
        }

        // Offsets are rebased to the running position in the values
        // buffer.
        let var_start = self.var_offset_at(attribute_id, start);
        let mut write_pos = *buffer_offset;
        for i in start..=end {
            let rebased =
                *buffer_var_offset as u64 + (self.var_offset_at(attribute_id, i) - var_start);
            buffer[write_pos..write_pos + VAR_OFFSET_SIZE]
                .copy_from_slice(&rebased.to_le_bytes());
            write_pos += VAR_OFFSET_SIZE;
        }
        *buffer_offset = write_pos;

        let dest = &mut buffer_var[*buffer_var_offset..*buffer_var_offset + bytes_var];
        let src = &self.tiles_var[attribute_id][var_start as usize..var_start as usize + bytes_var];
        dest.copy_from_slice(src);
        *buffer_var_offset += bytes_var;

        if end < p1 {
            self.overflow[attribute_id] = true;
        }
        Ok(())
    }

    // ----- coordinate searches ---------------------------------------

    fn prepare_search_tile(&mut self, tile_i: i64) -> GridResult<()> {
        let slot = self.search_slot();
        self.prepare_tile_for_reading(slot, tile_i)
    }

    fn search_tile_cell_num(&self, tile_i: i64) -> i64 {
        self.book.cell_num(tile_i)
    }

    fn coords_at(&self, i: i64) -> Vec<T> {
        let slot = self.search_slot();
        let size = self.schema.coords_size();
        let bytes = self.tiles[slot].bytes();
        decode_coords(&bytes[i as usize * size..(i as usize + 1) * size], self.schema.dim_num())
    }

    /// First cell position in the search tile at or after `coords`.
    pub fn get_cell_pos_at_or_after(&mut self, coords: &[T]) -> GridResult<i64> {
        self.prepare_search_tile(self.search_tile_pos)?;
        let n = self.search_tile_cell_num(self.search_tile_pos);
        Ok(partition_point(n, |i| {
            self.schema.cmp_cells(&self.coords_at(i), coords) == Ordering::Less
        }))
    }

    /// Last cell position in the search tile at or before `coords`.
    pub fn get_cell_pos_at_or_before(&mut self, coords: &[T]) -> GridResult<i64> {
        self.prepare_search_tile(self.search_tile_pos)?;
        let n = self.search_tile_cell_num(self.search_tile_pos);
        Ok(partition_point(n, |i| {
            self.schema.cmp_cells(&self.coords_at(i), coords) != Ordering::Greater
        }) - 1)
    }

    /// First cell position in the search tile strictly after `coords`.
    pub fn get_cell_pos_after(&mut self, coords: &[T]) -> GridResult<i64> {
        self.prepare_search_tile(self.search_tile_pos)?;
        let n = self.search_tile_cell_num(self.search_tile_pos);
        Ok(partition_point(n, |i| {
            self.schema.cmp_cells(&self.coords_at(i), coords) != Ordering::Greater
        }))
    }

    /// The coordinates following `coords` in the search tile, if any.
    pub fn get_coords_after(&mut self, coords: &[T]) -> GridResult<Option<Vec<T>>> {
        let pos = self.get_cell_pos_after(coords)?;
        let n = self.search_tile_cell_num(self.search_tile_pos);
        if pos < n {
            Ok(Some(self.coords_at(pos)))
        } else {
            Ok(None)
        }
    }

    /// Locates `target_coords` within tile `tile_i`, restricted to the
    /// coordinate range `[start_coords, end_coords]`, and reports its
    /// immediate neighbors inside that range.
    pub fn get_enclosing_coords(
        &mut self,
        tile_i: i64,
        target_coords: &[T],
        start_coords: &[T],
        end_coords: &[T],
    ) -> GridResult<EnclosingCoords<T>> {
        self.prepare_search_tile(tile_i)?;
        let n = self.search_tile_cell_num(tile_i);
        let at_or_after = |this: &Self, c: &[T]| {
            partition_point(n, |i| this.schema.cmp_cells(&this.coords_at(i), c) == Ordering::Less)
        };
        let after = |this: &Self, c: &[T]| {
            partition_point(n, |i| {
                this.schema.cmp_cells(&this.coords_at(i), c) != Ordering::Greater
            })
        };

        let range_start = at_or_after(self, start_coords);
        let range_end = after(self, end_coords) - 1;
        if range_start > range_end {
            return Ok(EnclosingCoords {
                left: None,
                right: None,
                target_exists: false,
            });
        }

        let target_at_or_after = at_or_after(self, target_coords);
        let target_exists = target_at_or_after <= range_end
            && target_at_or_after < n
            && self
                .schema
                .cmp_cells(&self.coords_at(target_at_or_after), target_coords)
                == Ordering::Equal
            && target_at_or_after >= range_start;

        let left_pos = target_at_or_after - 1;
        let left = if left_pos >= range_start {
            Some(self.coords_at(left_pos))
        } else {
            None
        };
        let right_pos = after(self, target_coords);
        let right = if right_pos <= range_end {
            Some(self.coords_at(right_pos))
        } else {
            None
        };
        Ok(EnclosingCoords {
            left,
            right,
            target_exists,
        })
    }

    // ----- cell range production -------------------------------------

    /// Translates a coordinate range within a sparse tile into the cell
    /// position range holding it, or `None` when no cells fall inside.
    pub fn get_fragment_cell_pos_range_sparse(
        &mut self,
        fragment_info: FragmentInfo,
        cell_range: &[T],
    ) -> GridResult<Option<FragmentCellPosRange>> {
        let dims = self.schema.dim_num();
        self.prepare_search_tile(fragment_info.1)?;
        let n = self.search_tile_cell_num(fragment_info.1);
        let start = partition_point(n, |i| {
            self.schema.cmp_cells(&self.coords_at(i), &cell_range[..dims]) == Ordering::Less
        });
        let end = partition_point(n, |i| {
            self.schema.cmp_cells(&self.coords_at(i), &cell_range[dims..]) != Ordering::Greater
        }) - 1;
        if start > end {
            return Ok(None);
        }
        Ok(Some(FragmentCellPosRange {
            fragment_info,
            cell_pos_range: (start, end),
        }))
    }

    /// Produces the cell position ranges of the current dense search
    /// tile that fall inside the query subarray.
    pub fn get_fragment_cell_ranges_dense(
        &mut self,
        fragment_i: usize,
    ) -> GridResult<Vec<FragmentCellPosRange>> {
        if self.search_tile_overlap == Overlap::None {
            return Ok(Vec::new());
        }
        let info = (fragment_i, self.search_tile_pos);
        let cells = self.book.cell_num(self.search_tile_pos);
        if self.search_tile_overlap == Overlap::Full {
            return Ok(vec![FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (0, cells - 1),
            }]);
        }

        let fd = self.book.domain().to_vec();
        let tpd = self.schema.tiles_per_dim(&fd);
        let tc = tile_coords_of_pos(&tpd, self.search_tile_pos, self.schema.tile_order());
        let tile_domain = self.schema.tile_domain_of(&fd, &tc);
        let inter = self.search_tile_overlap_subarray.clone();
        let n = self.schema.dim_num();

        if self.search_tile_overlap == Overlap::PartialContig {
            let lo: Vec<T> = (0..n).map(|d| inter[2 * d]).collect();
            let hi: Vec<T> = (0..n).map(|d| inter[2 * d + 1]).collect();
            return Ok(vec![FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (
                    self.schema.cell_pos_in_tile(&tile_domain, &lo),
                    self.schema.cell_pos_in_tile(&tile_domain, &hi),
                ),
            }]);
        }

        // Partial non-contiguous: one contiguous run per slab along the
        // fastest-varying dimension.
        let fastest = match self.schema.cell_order() {
            CellOrder::ColMajor => 0,
            _ => n - 1,
        };
        let mut ranges = Vec::new();
        let mut cursor: Vec<i64> = (0..n).map(|d| inter[2 * d].to_index()).collect();
        loop {
            let mut lo: Vec<T> = cursor.iter().map(|v| T::from_index(*v)).collect();
            let mut hi = lo.clone();
            lo[fastest] = inter[2 * fastest];
            hi[fastest] = inter[2 * fastest + 1];
            ranges.push(FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (
                    self.schema.cell_pos_in_tile(&tile_domain, &lo),
                    self.schema.cell_pos_in_tile(&tile_domain, &hi),
                ),
            });

            // Odometer over the non-fastest dimensions.
            let mut d = n;
            let mut advanced = false;
            while d > 0 {
                d -= 1;
                if d == fastest {
                    continue;
                }
                if cursor[d] < inter[2 * d + 1].to_index() {
                    cursor[d] += 1;
                    for reset in d + 1..n {
                        if reset != fastest {
                            cursor[reset] = inter[2 * reset].to_index();
                        }
                    }
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
        }
        Ok(ranges)
    }

    /// Produces the cell position ranges of the current sparse search
    /// tile that fall inside the query subarray.
    pub fn get_fragment_cell_ranges_sparse(
        &mut self,
        fragment_i: usize,
    ) -> GridResult<Vec<FragmentCellPosRange>> {
        if self.search_tile_overlap == Overlap::None {
            return Ok(Vec::new());
        }
        let info = (fragment_i, self.search_tile_pos);
        let cells = self.book.cell_num(self.search_tile_pos);
        if self.search_tile_overlap == Overlap::Full {
            return Ok(vec![FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (0, cells - 1),
            }]);
        }

        // Partial overlap: bound the candidate band, then emit maximal
        // runs of cells that really fall inside the subarray.
        self.prepare_search_tile(self.search_tile_pos)?;
        let (band_start, band_end) = if self.schema.cell_order() == CellOrder::Hilbert {
            (0, cells - 1)
        } else {
            let (lo, hi) = self.subarray_corners();
            (
                self.get_cell_pos_at_or_after(&lo)?,
                self.get_cell_pos_at_or_before(&hi)?,
            )
        };

        let subarray = self.subarray.clone();
        let mut ranges = Vec::new();
        let mut run_start: Option<i64> = None;
        for pos in band_start..=band_end {
            let inside = self
                .schema
                .coords_in_subarray(&self.coords_at(pos), &subarray);
            match (inside, run_start) {
                (true, None) => run_start = Some(pos),
                (false, Some(s)) => {
                    ranges.push(FragmentCellPosRange {
                        fragment_info: info,
                        cell_pos_range: (s, pos - 1),
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            ranges.push(FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (s, band_end),
            });
        }
        Ok(ranges)
    }
}

impl<T: Coord> ReadState<'_, T> {
    /// Produces the cell position ranges of the current sparse search
    /// tile that fall inside the query subarray *and* within the
    /// coordinate range `[start_coords, end_coords]`.
    pub fn get_fragment_cell_ranges_sparse_bounded(
        &mut self,
        fragment_i: usize,
        start_coords: &[T],
        end_coords: &[T],
    ) -> GridResult<Vec<FragmentCellPosRange>> {
        if self.search_tile_overlap == Overlap::None {
            return Ok(Vec::new());
        }
        let info = (fragment_i, self.search_tile_pos);
        self.prepare_search_tile(self.search_tile_pos)?;
        let band_start = self.get_cell_pos_at_or_after(start_coords)?;
        let band_end = self.get_cell_pos_at_or_before(end_coords)?;
        if band_start > band_end {
            return Ok(Vec::new());
        }
        if self.search_tile_overlap == Overlap::Full {
            return Ok(vec![FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (band_start, band_end),
            }]);
        }

        let subarray = self.subarray.clone();
        let mut ranges = Vec::new();
        let mut run_start: Option<i64> = None;
        for pos in band_start..=band_end {
            let inside = self
                .schema
                .coords_in_subarray(&self.coords_at(pos), &subarray);
            match (inside, run_start) {
                (true, None) => run_start = Some(pos),
                (false, Some(s)) => {
                    ranges.push(FragmentCellPosRange {
                        fragment_info: info,
                        cell_pos_range: (s, pos - 1),
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            ranges.push(FragmentCellPosRange {
                fragment_info: info,
                cell_pos_range: (s, band_end),
            });
        }
        Ok(ranges)
    }
}

/// First index in `[0, n)` where `pred` turns false; `n` if it never
/// does. `pred` must be monotone.
fn partition_point(n: i64, pred: impl Fn(i64) -> bool) -> i64 {
    let mut lo = 0;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn cmp_tile_order(a: &[i64], b: &[i64], order: TileOrder) -> Ordering {
    match order {
        TileOrder::RowMajor => a.cmp(b),
        TileOrder::ColMajor => {
            for (x, y) in a.iter().zip(b.iter()).rev() {
                match x.cmp(y) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            Ordering::Equal
        }
    }
}

fn tile_coords_of_pos(tiles_per_dim: &[i64], mut pos: i64, order: TileOrder) -> Vec<i64> {
    let n = tiles_per_dim.len();
    let mut tc = vec![0i64; n];
    match order {
        TileOrder::RowMajor => {
            for d in (0..n).rev() {
                tc[d] = pos % tiles_per_dim[d];
                pos /= tiles_per_dim[d];
            }
        }
        TileOrder::ColMajor => {
            for d in 0..n {
                tc[d] = pos % tiles_per_dim[d];
                pos /= tiles_per_dim[d];
            }
        }
    }
    tc
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::FragmentCellPosRange;
    use crate::codec::CompressionKind;
    use crate::fragment::{CellValue, Fragment, FragmentWriter};
    use crate::schema::{ArraySchema, Attribute, CellOrder, Datatype, Overlap};
    use crate::storage::StorageBackend;
    use crate::storage::posix::PosixFs;

    fn posix(dir: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(PosixFs::new().working_dir(dir.path().to_string_lossy().into_owned()))
    }

    fn sparse_3d_schema() -> Arc<ArraySchema<i64>> {
        Arc::new(
            ArraySchema::sparse("arr", &["x", "y", "z"], &[0, 4, 0, 4, 0, 4], 5)
                .expect("schema")
                .attribute(Attribute::fixed("a1", Datatype::Int32, 1))
                .attribute(
                    Attribute::var("a2", Datatype::Char).compression(CompressionKind::Gzip, 6),
                ),
        )
    }

    /// The 3-D sparse fragment of the reference scenario: coordinates
    /// (0,0,0) (0,0,1) (0,2,3) (2,1,1), a1 = [0,1,2,3], a2 = first..fourth.
    pub(super) fn write_sparse_3d(
        fs: &Arc<dyn StorageBackend>,
        non_empty: Option<&[i64]>,
    ) -> Fragment<i64> {
        let mut writer =
            FragmentWriter::create(fs.clone(), sparse_3d_schema(), "sparse3d", false, non_empty)
                .expect("writer");
        let coords = [[0i64, 0, 0], [0, 0, 1], [0, 2, 3], [2, 1, 1]];
        let a2 = ["first", "second", "third", "fourth"];
        for (i, c) in coords.iter().enumerate() {
            let v = (i as i32).to_le_bytes();
            writer
                .write_cell(Some(c), &[CellValue::Fixed(&v), CellValue::Var(a2[i].as_bytes())])
                .expect("write cell");
        }
        writer.finalize().expect("finalize")
    }

    #[test]
    fn sparse_full_domain_scan() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        assert_eq!(fragment.bookkeeping().tile_num(), 1);
        assert_eq!(fragment.bookkeeping().last_tile_cell_num(), 4);

        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();
        assert!(!rs.done());
        assert_eq!(rs.search_tile_overlap(), Overlap::Full);

        let ranges = rs.get_fragment_cell_ranges_sparse(0).expect("ranges");
        assert_eq!(
            ranges,
            vec![FragmentCellPosRange {
                fragment_info: (0, 0),
                cell_pos_range: (0, 3),
            }]
        );
        let (_, range) = (ranges[0].fragment_info, ranges[0].cell_pos_range);
        let result_num = range.1 - range.0 + 1;
        assert_eq!(result_num, 4);

        // a1: four int32 values in input order.
        let mut buf = [0u8; 16];
        let mut off = 0;
        let mut skip = 0i64;
        rs.copy_cells(0, 0, &mut buf, &mut off, range, &mut skip)
            .expect("copy a1");
        assert_eq!(off, 16);
        assert!(!rs.overflow(0));
        let a1: Vec<i32> = buf.chunks(4).map(|c| i32::from_le_bytes(c.try_into().expect("i32"))).collect();
        assert_eq!(a1, vec![0, 1, 2, 3]);

        // a2: offsets are running positions in the values buffer.
        let mut offsets_buf = [0u8; 32];
        let mut values_buf = [0u8; 22];
        let (mut ob, mut vb) = (0usize, 0usize);
        let (mut s1, mut s2) = (0i64, 0i64);
        rs.copy_cells_var(
            1, 0, &mut offsets_buf, &mut ob, &mut s1, &mut values_buf, &mut vb, &mut s2, range,
        )
        .expect("copy a2");
        assert_eq!((ob, vb), (32, 22));
        assert!(!rs.overflow(1));
        let offs: Vec<u64> = offsets_buf
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("u64")))
            .collect();
        assert_eq!(offs, vec![0, 5, 11, 16]);
        assert_eq!(&values_buf, b"firstsecondthirdfourth");

        // Coordinates come back in cell order.
        let mut coords_buf = [0u8; 96];
        let (mut co, mut cs) = (0usize, 0i64);
        rs.copy_cells(2, 0, &mut coords_buf, &mut co, range, &mut cs)
            .expect("copy coords");
        let coords: Vec<i64> = coords_buf
            .chunks(8)
            .map(|c| i64::from_le_bytes(c.try_into().expect("i64")))
            .collect();
        assert_eq!(coords, vec![0, 0, 0, 0, 0, 1, 0, 2, 3, 2, 1, 1]);

        rs.get_next_overlapping_tile_sparse();
        assert!(rs.done());
    }

    #[test]
    fn overflow_backpressure_and_resume() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();

        // Room for two of the four int32 cells.
        let mut buf = [0u8; 8];
        let mut off = 0;
        let mut skip = 0i64;
        rs.copy_cells(0, 0, &mut buf, &mut off, (0, 3), &mut skip)
            .expect("copy");
        assert!(rs.overflow(0));
        assert_eq!(off, 8);
        assert_eq!(&buf[..4], &0i32.to_le_bytes());
        assert_eq!(&buf[4..], &1i32.to_le_bytes());

        // The caller drains its buffer, clears the flag, and retries
        // with the cells it already has skipped.
        rs.reset_overflow();
        let mut buf2 = [0u8; 8];
        let mut off2 = 0;
        let mut skip2 = 2i64;
        rs.copy_cells(0, 0, &mut buf2, &mut off2, (0, 3), &mut skip2)
            .expect("copy rest");
        assert!(!rs.overflow(0));
        assert_eq!(skip2, 0);
        assert_eq!(&buf2[..4], &2i32.to_le_bytes());
        assert_eq!(&buf2[4..], &3i32.to_le_bytes());

        rs.get_next_overlapping_tile_sparse();
        assert!(rs.done());
    }

    #[test]
    fn zero_sized_buffer_sets_overflow() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();

        let mut buf = [0u8; 0];
        let mut off = 0;
        let mut skip = 0i64;
        rs.copy_cells(0, 0, &mut buf, &mut off, (0, 3), &mut skip)
            .expect("copy");
        assert_eq!(off, 0);
        assert!(rs.overflow(0));
    }

    #[test]
    fn var_buffer_overflow_splits_cells() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();

        // "first" + "second" fill exactly 11 value bytes; "third" must wait.
        let mut offsets_buf = [0u8; 32];
        let mut values_buf = [0u8; 11];
        let (mut ob, mut vb) = (0usize, 0usize);
        let (mut s1, mut s2) = (0i64, 0i64);
        rs.copy_cells_var(
            1, 0, &mut offsets_buf, &mut ob, &mut s1, &mut values_buf, &mut vb, &mut s2, (0, 3),
        )
        .expect("copy");
        assert!(rs.overflow(1));
        assert_eq!((ob, vb), (16, 11));
        assert_eq!(&values_buf, b"firstsecond");

        rs.reset_overflow();
        let mut offsets2 = [0u8; 16];
        let mut values2 = [0u8; 11];
        let (mut ob2, mut vb2) = (0usize, 0usize);
        let (mut s1b, mut s2b) = (2i64, 2i64);
        rs.copy_cells_var(
            1, 0, &mut offsets2, &mut ob2, &mut s1b, &mut values2, &mut vb2, &mut s2b, (0, 3),
        )
        .expect("copy rest");
        assert!(!rs.overflow(1));
        assert_eq!((ob2, vb2), (16, 11));
        assert_eq!(&values2, b"thirdfourth");
    }

    #[test]
    fn var_offsets_shift_to_tile_relative() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let schema = Arc::new(
            ArraySchema::sparse("v", &["x"], &[0, 9], 2)
                .expect("schema")
                .attribute(Attribute::var("v", Datatype::Char)),
        );
        let mut writer =
            FragmentWriter::create(fs.clone(), schema.clone(), "varfrag", false, None)
                .expect("writer");
        let payloads: [&[u8]; 4] = [&[b'a'; 100], &[b'b'; 10], &[b'c'; 15], &[b'd'; 5]];
        for (i, p) in payloads.iter().enumerate() {
            writer
                .write_cell(Some(&[i as i64]), &[CellValue::Var(p)])
                .expect("write cell");
        }
        let fragment = writer.finalize().expect("finalize");

        // Tile 1 starts at absolute offset 110 in the values stream; its
        // stored offsets [110, 125] shift to [0, 15] in memory.
        assert_eq!(fragment.bookkeeping().tile_var_sizes()[0], vec![110, 20]);
        let mut rs = fragment.read_state(&[0, 9]).expect("read state");
        let mut offsets_buf = [0u8; 16];
        let mut values_buf = [0u8; 20];
        let (mut ob, mut vb) = (0usize, 0usize);
        let (mut s1, mut s2) = (0i64, 0i64);
        rs.copy_cells_var(
            0, 1, &mut offsets_buf, &mut ob, &mut s1, &mut values_buf, &mut vb, &mut s2, (0, 1),
        )
        .expect("copy");
        let offs: Vec<u64> = offsets_buf
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("u64")))
            .collect();
        assert_eq!(offs, vec![0, 15]);
        assert_eq!(rs.var_tile_file_offset(0), 110, "shift recovers file offsets");
        // Last cell size is the tile's var size minus the last offset.
        assert_eq!(&values_buf[..15], &[b'c'; 15]);
        assert_eq!(&values_buf[15..], &[b'd'; 5]);
    }

    #[test]
    fn sparse_disjoint_subarray_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, Some(&[0, 2, 0, 2, 0, 3]));
        let mut rs = fragment.read_state(&[4, 4, 4, 4, 4, 4]).expect("read state");
        assert_eq!(rs.tile_search_range(), [1, 0]);
        rs.get_next_overlapping_tile_sparse();
        assert!(rs.done());
    }

    fn dense_schema() -> Arc<ArraySchema<i64>> {
        Arc::new(
            ArraySchema::dense("d", &["r", "c"], &[0, 9, 0, 9], &[5, 5])
                .expect("schema")
                .attribute(Attribute::fixed("a", Datatype::Int32, 1).compression(
                    CompressionKind::Gzip,
                    6,
                )),
        )
    }

    fn write_dense(fs: &Arc<dyn StorageBackend>) -> Fragment<i64> {
        let mut writer =
            FragmentWriter::create(fs.clone(), dense_schema(), "densefrag", true, None)
                .expect("writer");
        // Cells arrive tile by tile: tile t holds values t*25 .. t*25+24.
        for v in 0..100i32 {
            writer
                .write_cell(None, &[CellValue::Fixed(&v.to_le_bytes())])
                .expect("write cell");
        }
        writer.finalize().expect("finalize")
    }

    #[test]
    fn dense_full_scan_iterates_every_tile() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_dense(&fs);
        assert_eq!(fragment.bookkeeping().tile_num(), 4);

        let whole = [0i64, 9, 0, 9];
        let mut rs = fragment.read_state(&whole).expect("read state");
        let mut visited = 0;
        for tc in [[0i64, 0], [0, 1], [1, 0], [1, 1]] {
            rs.get_next_overlapping_tile_dense(&tc);
            assert!(!rs.done());
            assert_eq!(rs.search_tile_overlap(), Overlap::Full);
            assert!(rs.subarray_area_covered());
            let ranges = rs.get_fragment_cell_ranges_dense(0).expect("ranges");
            assert_eq!(ranges.len(), 1);
            assert_eq!(ranges[0].cell_pos_range, (0, 24));
            visited += 1;
        }
        assert_eq!(visited, 4, "ceil(|domain| / tile_capacity) tiles");
        // The driver has exhausted the grid.
        rs.get_next_overlapping_tile_dense(&[2, 0]);
        assert!(rs.done());
    }

    #[test]
    fn dense_tile_contents_decompress() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_dense(&fs);
        let whole = [0i64, 9, 0, 9];
        let mut rs = fragment.read_state(&whole).expect("read state");
        // Tile 2 is the lower-left tile in row-major tile order.
        rs.get_next_overlapping_tile_dense(&[1, 0]);
        let mut buf = [0u8; 100];
        let mut off = 0;
        let mut skip = 0i64;
        rs.copy_cells(0, 2, &mut buf, &mut off, (0, 24), &mut skip)
            .expect("copy");
        let vals: Vec<i32> = buf.chunks(4).map(|c| i32::from_le_bytes(c.try_into().expect("i32"))).collect();
        assert_eq!(vals, (50..75).collect::<Vec<i32>>());
    }

    #[test]
    fn dense_partial_overlap_decomposes_into_runs() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_dense(&fs);
        // A column strip: all rows, columns 2..=3.
        let strip = [0i64, 9, 2, 3];
        let mut rs = fragment.read_state(&strip).expect("read state");
        rs.get_next_overlapping_tile_dense(&[0, 0]);
        assert_eq!(rs.search_tile_overlap(), Overlap::Partial);
        let ranges = rs.get_fragment_cell_ranges_dense(0).expect("ranges");
        // One run per row of the tile.
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[0].cell_pos_range, (2, 3));
        assert_eq!(ranges[4].cell_pos_range, (22, 23));
    }

    #[test]
    fn dense_row_band_is_contiguous() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_dense(&fs);
        // Rows 1..=2, all columns: contiguous in row-major order.
        let band = [1i64, 2, 0, 9];
        let mut rs = fragment.read_state(&band).expect("read state");
        rs.get_next_overlapping_tile_dense(&[0, 0]);
        assert_eq!(rs.search_tile_overlap(), Overlap::PartialContig);
        let ranges = rs.get_fragment_cell_ranges_dense(0).expect("ranges");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].cell_pos_range, (5, 14));
    }

    #[test]
    fn coordinate_searches_in_tile() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();

        assert_eq!(rs.get_cell_pos_at_or_after(&[0, 0, 1]).expect("pos"), 1);
        assert_eq!(rs.get_cell_pos_at_or_after(&[0, 0, 2]).expect("pos"), 2);
        assert_eq!(rs.get_cell_pos_at_or_before(&[0, 0, 2]).expect("pos"), 1);
        assert_eq!(rs.get_cell_pos_after(&[0, 0, 1]).expect("pos"), 2);

        let after = rs.get_coords_after(&[0, 0, 1]).expect("coords");
        assert_eq!(after, Some(vec![0, 2, 3]));
        let after_last = rs.get_coords_after(&[2, 1, 1]).expect("coords");
        assert_eq!(after_last, None);

        let enc = rs
            .get_enclosing_coords(0, &[0, 2, 3], &[0, 0, 0], &[2, 1, 1])
            .expect("enclosing");
        assert!(enc.target_exists);
        assert_eq!(enc.left, Some(vec![0, 0, 1]));
        assert_eq!(enc.right, Some(vec![2, 1, 1]));

        let missing = rs
            .get_enclosing_coords(0, &[0, 1, 0], &[0, 0, 0], &[2, 1, 1])
            .expect("enclosing");
        assert!(!missing.target_exists);
        assert_eq!(missing.left, Some(vec![0, 0, 1]));
        assert_eq!(missing.right, Some(vec![0, 2, 3]));
    }

    #[test]
    fn sparse_cell_pos_range_from_coords() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();

        let range = rs
            .get_fragment_cell_pos_range_sparse((0, 0), &[0, 0, 1, 2, 1, 1])
            .expect("range")
            .expect("non-empty");
        assert_eq!(range.cell_pos_range, (1, 3));

        let empty = rs
            .get_fragment_cell_pos_range_sparse((0, 0), &[3, 0, 0, 3, 0, 0])
            .expect("range");
        assert!(empty.is_none());
    }

    #[test]
    fn hilbert_search_range_is_tight_for_inner_box() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let schema = Arc::new(
            ArraySchema::sparse("h", &["x", "y"], &[0, 3, 0, 3], 4)
                .expect("schema")
                .attribute(Attribute::fixed("a", Datatype::Int32, 1))
                .with_cell_order(CellOrder::Hilbert)
                .expect("hilbert order"),
        );
        // All 16 cells, written in Hilbert order: each capacity-4 tile is
        // one quadrant of the grid.
        let mut cells: Vec<[i64; 2]> = (0..4).flat_map(|x| (0..4).map(move |y| [x, y])).collect();
        cells.sort_by(|a, b| schema.cmp_cells(a, b));
        let mut writer =
            FragmentWriter::create(fs.clone(), schema.clone(), "hilfrag", false, None)
                .expect("writer");
        for (i, c) in cells.iter().enumerate() {
            let v = (i as i32).to_le_bytes();
            writer
                .write_cell(Some(c), &[CellValue::Fixed(&v)])
                .expect("write cell");
        }
        let fragment = writer.finalize().expect("finalize");
        assert_eq!(fragment.bookkeeping().tile_num(), 4);

        // Query exactly the box of tile 1: the search range collapses to
        // that tile.
        let target = fragment.bookkeeping().mbrs()[1].clone();
        let mut rs = fragment.read_state(&target).expect("read state");
        assert_eq!(rs.tile_search_range(), [1, 1]);

        rs.get_next_overlapping_tile_sparse();
        assert!(!rs.done());
        assert_eq!(rs.search_tile_pos(), 1);
        let ranges = rs.get_fragment_cell_ranges_sparse(0).expect("ranges");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].cell_pos_range, (0, 3));
        rs.get_next_overlapping_tile_sparse();
        assert!(rs.done());
    }

    #[test]
    fn sparse_partial_overlap_filters_cells() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        // Only (0,0,0) and (0,0,1) fall inside this box.
        let corner = [0i64, 0, 0, 0, 0, 4];
        let mut rs = fragment.read_state(&corner).expect("read state");
        rs.get_next_overlapping_tile_sparse();
        assert!(!rs.done());
        let ranges = rs.get_fragment_cell_ranges_sparse(0).expect("ranges");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].cell_pos_range, (0, 1));
    }

    #[test]
    fn sparse_in_dense_driver_iteration() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        // A sparse fragment over a regular tile grid, driven by a dense
        // iteration over tile coordinates.
        let schema = Arc::new(
            ArraySchema::sparse("sd", &["x", "y"], &[0, 9, 0, 9], 4)
                .expect("schema")
                .attribute(Attribute::fixed("a", Datatype::Int32, 1))
                .with_tile_extents(&[5, 5]),
        );
        let mut writer =
            FragmentWriter::create(fs.clone(), schema.clone(), "sdfrag", false, None)
                .expect("writer");
        // Four cells in the top-left tile, then four in the bottom-right.
        for (i, c) in [[0i64, 0], [0, 1], [1, 0], [1, 1], [7, 7], [7, 8], [8, 7], [8, 8]]
            .iter()
            .enumerate()
        {
            let v = (i as i32).to_le_bytes();
            writer
                .write_cell(Some(c), &[CellValue::Fixed(&v)])
                .expect("write cell");
        }
        let fragment = writer.finalize().expect("finalize");
        let whole = [0i64, 9, 0, 9];
        let mut rs = fragment.read_state(&whole).expect("read state");

        // Driver tile (0,0): the first sparse tile overlaps.
        rs.get_next_overlapping_tile_sparse_in_dense(&[0, 0]);
        assert!(rs.mbr_overlaps_tile());
        assert_eq!(rs.search_tile_pos(), 0);
        // No further sparse tile under this driver tile; the next one is
        // ahead of the driver.
        rs.get_next_overlapping_tile_sparse_in_dense(&[0, 0]);
        assert!(!rs.mbr_overlaps_tile());
        assert!(!rs.done());
        // Driver tiles (0,1) and (1,0) hold nothing.
        rs.get_next_overlapping_tile_sparse_in_dense(&[0, 1]);
        assert!(!rs.mbr_overlaps_tile());
        rs.get_next_overlapping_tile_sparse_in_dense(&[1, 0]);
        assert!(!rs.mbr_overlaps_tile());
        // Driver tile (1,1) finds the second sparse tile.
        rs.get_next_overlapping_tile_sparse_in_dense(&[1, 1]);
        assert!(rs.mbr_overlaps_tile());
        assert_eq!(rs.search_tile_pos(), 1);
        rs.get_next_overlapping_tile_sparse_in_dense(&[1, 1]);
        assert!(rs.done());
    }

    #[test]
    fn reset_rewinds_the_cursor() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();
        rs.get_next_overlapping_tile_sparse();
        assert!(rs.done());

        rs.reset(&whole);
        assert!(!rs.done());
        rs.get_next_overlapping_tile_sparse();
        assert_eq!(rs.search_tile_pos(), 0);
        assert_eq!(rs.search_tile_overlap(), Overlap::Full);
    }
}

#[cfg(test)]
mod bounded_range_tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::storage::StorageBackend;
    use crate::storage::posix::PosixFs;

    fn posix(dir: &TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(PosixFs::new().working_dir(dir.path().to_string_lossy().into_owned()))
    }

    #[test]
    fn bounded_sparse_ranges_clip_to_coordinates() {
        let dir = TempDir::new().expect("tempdir");
        let fs = posix(&dir);
        let fragment = super::tests::write_sparse_3d(&fs, None);
        let whole = [0i64, 4, 0, 4, 0, 4];
        let mut rs = fragment.read_state(&whole).expect("read state");
        rs.get_next_overlapping_tile_sparse();

        // The middle two cells of the tile.
        let ranges = rs
            .get_fragment_cell_ranges_sparse_bounded(0, &[0, 0, 1], &[0, 2, 3])
            .expect("ranges");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].cell_pos_range, (1, 2));

        // A range holding no cells.
        let empty = rs
            .get_fragment_cell_ranges_sparse_bounded(0, &[3, 0, 0], &[3, 0, 0])
            .expect("ranges");
        assert!(empty.is_empty());
    }
}
