//! In-memory array schema.
//!
//! The schema is external input to the storage core: it arrives already
//! parsed and is immutable after construction. Everything the manifest
//! and read state need — cell sizes, tile geometry, cell-order
//! comparisons, subarray overlap classification — lives here.

use std::cmp::Ordering;

use crate::codec::CompressionKind;
use crate::coords::{Coord, HilbertOrder, cmp_col_major, cmp_row_major};
use crate::error::{GridError, GridResult};

/// Cell value datatypes for attribute payloads and coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Datatype {
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl Datatype {
    /// Size of one value of this type in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Char | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }
}

/// Linearization of cell coordinates into a one-dimensional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOrder {
    /// First dimension most significant.
    RowMajor,
    /// Last dimension most significant.
    ColMajor,
    /// Rank-D Hilbert curve over the array domain (sparse arrays only).
    Hilbert,
}

/// Linearization of tile coordinates; Hilbert does not apply to tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOrder {
    /// First dimension most significant.
    RowMajor,
    /// Last dimension most significant.
    ColMajor,
}

/// Number of values per cell of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValNum {
    /// Fixed number of values per cell.
    Fixed(u32),
    /// Variable number of values per cell (offsets file + values file).
    Var,
}

/// Classification of the overlap between a query subarray and a tile or
/// MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// No overlap.
    None,
    /// The query subarray fully covers the tile.
    Full,
    /// Partial overlap, not contiguous in cell order.
    Partial,
    /// Partial overlap forming one contiguous cell range.
    PartialContig,
}

/// One named, typed column of the array.
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: CellValNum,
    compression: CompressionKind,
    compression_level: u32,
    offsets_compression: CompressionKind,
    offsets_compression_level: u32,
}

impl Attribute {
    /// A fixed-size attribute holding `cell_val_num` values per cell.
    pub fn fixed(name: impl Into<String>, datatype: Datatype, cell_val_num: u32) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Fixed(cell_val_num),
            compression: CompressionKind::None,
            compression_level: 0,
            offsets_compression: CompressionKind::None,
            offsets_compression_level: 0,
        }
    }

    /// A variable-size attribute (offsets stream + values stream).
    pub fn var(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Var,
            compression: CompressionKind::None,
            compression_level: 0,
            offsets_compression: CompressionKind::None,
            offsets_compression_level: 0,
        }
    }

    /// Sets the value compression.
    #[must_use]
    pub fn compression(mut self, kind: CompressionKind, level: u32) -> Self {
        self.compression = kind;
        self.compression_level = level;
        self
    }

    /// Sets the compression of the offsets stream (variable attributes).
    #[must_use]
    pub fn offsets_compression(mut self, kind: CompressionKind, level: u32) -> Self {
        self.offsets_compression = kind;
        self.offsets_compression_level = level;
        self
    }

    /// The attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload datatype.
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Whether the attribute is variable-sized.
    pub fn is_var(&self) -> bool {
        matches!(self.cell_val_num, CellValNum::Var)
    }

    /// Fixed cell size in bytes; `None` for variable attributes.
    pub fn cell_size(&self) -> Option<usize> {
        match self.cell_val_num {
            CellValNum::Fixed(n) => Some(self.datatype.size() * n as usize),
            CellValNum::Var => None,
        }
    }
}

/// Cell size of one offsets-stream entry of a variable attribute.
pub const VAR_OFFSET_SIZE: usize = std::mem::size_of::<u64>();

/// An immutable array schema over coordinate type `T`.
#[derive(Debug, Clone)]
pub struct ArraySchema<T: Coord> {
    array_name: String,
    attributes: Vec<Attribute>,
    dim_names: Vec<String>,
    domain: Vec<T>,
    tile_extents: Option<Vec<T>>,
    capacity: i64,
    cell_order: CellOrder,
    tile_order: TileOrder,
    dense: bool,
    coords_compression: CompressionKind,
    coords_compression_level: u32,
    hilbert: Option<HilbertOrder<T>>,
}

impl<T: Coord> ArraySchema<T> {
    /// Creates a dense schema; `extents` impose the regular tile grid.
    pub fn dense(
        name: impl Into<String>,
        dim_names: &[&str],
        domain: &[T],
        extents: &[T],
    ) -> GridResult<Self> {
        let mut schema = Self::build(name, dim_names, domain, true)?;
        if extents.len() != schema.dim_num() {
            return Err(GridError::io_msg(
                schema.array_name,
                "tile extents arity does not match dimensions",
            ));
        }
        schema.tile_extents = Some(extents.to_vec());
        Ok(schema)
    }

    /// Creates a sparse schema with irregular tiles of `capacity` cells.
    pub fn sparse(
        name: impl Into<String>,
        dim_names: &[&str],
        domain: &[T],
        capacity: i64,
    ) -> GridResult<Self> {
        let mut schema = Self::build(name, dim_names, domain, false)?;
        schema.capacity = capacity.max(1);
        Ok(schema)
    }

    fn build(
        name: impl Into<String>,
        dim_names: &[&str],
        domain: &[T],
        dense: bool,
    ) -> GridResult<Self> {
        let array_name = name.into();
        if dim_names.is_empty() || domain.len() != 2 * dim_names.len() {
            return Err(GridError::io_msg(
                array_name,
                "domain arity does not match dimensions",
            ));
        }
        Ok(Self {
            array_name,
            attributes: Vec::new(),
            dim_names: dim_names.iter().map(|s| (*s).to_string()).collect(),
            domain: domain.to_vec(),
            tile_extents: None,
            capacity: 1,
            cell_order: CellOrder::RowMajor,
            tile_order: TileOrder::RowMajor,
            dense,
            coords_compression: CompressionKind::None,
            coords_compression_level: 0,
            hilbert: None,
        })
    }

    /// Appends an attribute.
    #[must_use]
    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Sets the cell order. Hilbert applies only to sparse arrays.
    pub fn with_cell_order(mut self, order: CellOrder) -> GridResult<Self> {
        if order == CellOrder::Hilbert {
            if self.dense {
                return Err(GridError::io_msg(
                    self.array_name,
                    "Hilbert cell order requires a sparse array",
                ));
            }
            self.hilbert = Some(HilbertOrder::new(&self.domain));
        }
        self.cell_order = order;
        Ok(self)
    }

    /// Sets the tile order.
    #[must_use]
    pub fn with_tile_order(mut self, order: TileOrder) -> Self {
        self.tile_order = order;
        self
    }

    /// Sets regular tile extents on a sparse array.
    #[must_use]
    pub fn with_tile_extents(mut self, extents: &[T]) -> Self {
        self.tile_extents = Some(extents.to_vec());
        self
    }

    /// Sets the coordinate-stream compression.
    #[must_use]
    pub fn coords_compression(mut self, kind: CompressionKind, level: u32) -> Self {
        self.coords_compression = kind;
        self.coords_compression_level = level;
        self
    }

    /// The array name.
    pub fn name(&self) -> &str {
        &self.array_name
    }

    /// Number of dimensions.
    pub fn dim_num(&self) -> usize {
        self.dim_names.len()
    }

    /// Number of attributes, excluding the coordinates pseudo-attribute.
    pub fn attribute_num(&self) -> usize {
        self.attributes.len()
    }

    /// The attribute table.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// The array domain, `[lo0, hi0, lo1, hi1, …]`.
    pub fn domain(&self) -> &[T] {
        &self.domain
    }

    /// The tile extents, if the tile grid is regular.
    pub fn tile_extents(&self) -> Option<&[T]> {
        self.tile_extents.as_deref()
    }

    /// Sparse tile capacity in cells.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// The cell order.
    pub fn cell_order(&self) -> CellOrder {
        self.cell_order
    }

    /// The tile order.
    pub fn tile_order(&self) -> TileOrder {
        self.tile_order
    }

    /// Size of one coordinate tuple in bytes.
    pub fn coords_size(&self) -> usize {
        self.dim_num() * T::SIZE
    }

    /// The id of the coordinates pseudo-attribute (`attribute_num()`).
    pub fn coords_attribute_id(&self) -> usize {
        self.attributes.len()
    }

    /// Cell size in bytes of the given attribute id. For variable
    /// attributes this is the offsets-stream cell size; the coordinates
    /// pseudo-attribute reports the coordinate tuple size.
    pub fn cell_size(&self, attribute_id: usize) -> usize {
        if attribute_id >= self.attributes.len() {
            return self.coords_size();
        }
        self.attributes[attribute_id]
            .cell_size()
            .unwrap_or(VAR_OFFSET_SIZE)
    }

    /// Whether the given attribute id is variable-sized.
    pub fn var_size(&self, attribute_id: usize) -> bool {
        attribute_id < self.attributes.len() && self.attributes[attribute_id].is_var()
    }

    /// Value compression of the given attribute id (coordinates included).
    pub fn compression(&self, attribute_id: usize) -> (CompressionKind, u32) {
        if attribute_id >= self.attributes.len() {
            (self.coords_compression, self.coords_compression_level)
        } else {
            let a = &self.attributes[attribute_id];
            (a.compression, a.compression_level)
        }
    }

    /// Offsets-stream compression of a variable attribute.
    pub fn offsets_compression(&self, attribute_id: usize) -> (CompressionKind, u32) {
        if attribute_id >= self.attributes.len() {
            (CompressionKind::None, 0)
        } else {
            let a = &self.attributes[attribute_id];
            (a.offsets_compression, a.offsets_compression_level)
        }
    }

    /// Number of cells a full tile holds: the extent product for dense
    /// arrays, the capacity for sparse arrays.
    pub fn cell_num_per_tile(&self) -> i64 {
        if self.dense {
            self.tile_extents
                .as_ref()
                .map(|e| e.iter().map(|x| x.to_index().max(1)).product())
                .unwrap_or(1)
        } else {
            self.capacity
        }
    }

    /// Expands a domain outward to tile-grid boundaries anchored at the
    /// array domain. Without tile extents the domain is returned as is.
    pub fn expand_domain(&self, domain: &[T]) -> Vec<T> {
        let Some(extents) = self.tile_extents.as_ref() else {
            return domain.to_vec();
        };
        let mut expanded = Vec::with_capacity(domain.len());
        for d in 0..self.dim_num() {
            let origin = self.domain[2 * d].to_index();
            let e = extents[d].to_index().max(1);
            let lo = domain[2 * d].to_index();
            let hi = domain[2 * d + 1].to_index();
            let lo_tile = (lo - origin).div_euclid(e);
            let hi_tile = (hi - origin).div_euclid(e);
            expanded.push(T::from_index(origin + lo_tile * e));
            expanded.push(T::from_index(origin + (hi_tile + 1) * e - 1));
        }
        expanded
    }

    /// Tiles per dimension over a (tile-aligned) domain.
    pub fn tiles_per_dim(&self, domain: &[T]) -> Vec<i64> {
        let Some(extents) = self.tile_extents.as_ref() else {
            return vec![1; self.dim_num()];
        };
        (0..self.dim_num())
            .map(|d| {
                let e = extents[d].to_index().max(1);
                let range = domain[2 * d + 1].to_index() - domain[2 * d].to_index() + 1;
                (range + e - 1) / e
            })
            .collect()
    }

    /// Total number of tiles over a (tile-aligned) domain.
    pub fn tile_num_in_domain(&self, domain: &[T]) -> i64 {
        self.tiles_per_dim(domain).iter().product()
    }

    /// Tile coordinates of a cell relative to a tile-aligned domain.
    pub fn tile_coords_of_cell(&self, domain: &[T], coords: &[T]) -> Vec<i64> {
        let Some(extents) = self.tile_extents.as_ref() else {
            return vec![0; self.dim_num()];
        };
        (0..self.dim_num())
            .map(|d| {
                let e = extents[d].to_index().max(1);
                (coords[d].to_index() - domain[2 * d].to_index()).div_euclid(e)
            })
            .collect()
    }

    /// Linear position of tile coordinates over the tile grid of a
    /// domain, following the tile order.
    pub fn tile_pos(&self, tiles_per_dim: &[i64], tile_coords: &[i64]) -> i64 {
        let n = tiles_per_dim.len();
        let mut pos = 0;
        match self.tile_order {
            TileOrder::RowMajor => {
                for d in 0..n {
                    let stride: i64 = tiles_per_dim[d + 1..].iter().product();
                    pos += tile_coords[d] * stride;
                }
            }
            TileOrder::ColMajor => {
                for d in 0..n {
                    let stride: i64 = tiles_per_dim[..d].iter().product();
                    pos += tile_coords[d] * stride;
                }
            }
        }
        pos
    }

    /// The subarray covered by the tile at `tile_coords` on the grid
    /// anchored at `domain`, clamped to that domain.
    pub fn tile_domain_of(&self, domain: &[T], tile_coords: &[i64]) -> Vec<T> {
        let Some(extents) = self.tile_extents.as_ref() else {
            return domain.to_vec();
        };
        let mut tile = Vec::with_capacity(domain.len());
        for d in 0..self.dim_num() {
            let origin = domain[2 * d].to_index();
            let e = extents[d].to_index().max(1);
            let lo = origin + tile_coords[d] * e;
            let hi = (lo + e - 1).min(domain[2 * d + 1].to_index());
            tile.push(T::from_index(lo));
            tile.push(T::from_index(hi));
        }
        tile
    }

    /// Position of a cell inside a tile whose low corner is
    /// `tile_domain[2*d]`, following the cell order. Hilbert in-tile
    /// positions are not defined (dense arrays cannot be Hilbert).
    pub fn cell_pos_in_tile(&self, tile_domain: &[T], coords: &[T]) -> i64 {
        let n = self.dim_num();
        let span = |d: usize| {
            tile_domain[2 * d + 1].to_index() - tile_domain[2 * d].to_index() + 1
        };
        let off = |d: usize| coords[d].to_index() - tile_domain[2 * d].to_index();
        let mut pos = 0;
        match self.cell_order {
            CellOrder::ColMajor => {
                for d in 0..n {
                    let stride: i64 = (0..d).map(span).product();
                    pos += off(d) * stride;
                }
            }
            _ => {
                for d in 0..n {
                    let stride: i64 = (d + 1..n).map(span).product();
                    pos += off(d) * stride;
                }
            }
        }
        pos
    }

    /// Total-order comparison of two coordinate tuples in cell order.
    pub fn cmp_cells(&self, a: &[T], b: &[T]) -> Ordering {
        match self.cell_order {
            CellOrder::RowMajor => cmp_row_major(a, b),
            CellOrder::ColMajor => cmp_col_major(a, b),
            CellOrder::Hilbert => match &self.hilbert {
                Some(h) => h.cmp(a, b),
                None => cmp_row_major(a, b),
            },
        }
    }

    /// The Hilbert index of a coordinate tuple over the array domain.
    pub fn hilbert_index(&self, coords: &[T]) -> u64 {
        match &self.hilbert {
            Some(h) => h.index(coords),
            None => HilbertOrder::new(&self.domain).index(coords),
        }
    }

    /// Whether `coords` lies inside `subarray`.
    pub fn coords_in_subarray(&self, coords: &[T], subarray: &[T]) -> bool {
        (0..self.dim_num()).all(|d| {
            coords[d] >= subarray[2 * d] && coords[d] <= subarray[2 * d + 1]
        })
    }

    /// Intersects subarray `a` with subarray `b` and classifies how `a`
    /// overlaps `b`: `Full` when `a` covers all of `b`, `PartialContig`
    /// when the intersection is one contiguous cell range of `b` in cell
    /// order, `Partial` otherwise.
    pub fn subarray_overlap(&self, a: &[T], b: &[T]) -> (Vec<T>, Overlap) {
        let n = self.dim_num();
        let mut intersection = Vec::with_capacity(2 * n);
        for d in 0..n {
            let lo = if a[2 * d] > b[2 * d] { a[2 * d] } else { b[2 * d] };
            let hi = if a[2 * d + 1] < b[2 * d + 1] {
                a[2 * d + 1]
            } else {
                b[2 * d + 1]
            };
            if lo > hi {
                return (Vec::new(), Overlap::None);
            }
            intersection.push(lo);
            intersection.push(hi);
        }

        let full = (0..n).all(|d| {
            intersection[2 * d] == b[2 * d] && intersection[2 * d + 1] == b[2 * d + 1]
        });
        if full {
            return (intersection, Overlap::Full);
        }

        // Contiguous iff every dimension except the most significant one
        // fully covers `b`.
        let contig = match self.cell_order {
            CellOrder::RowMajor => (1..n).all(|d| {
                intersection[2 * d] == b[2 * d] && intersection[2 * d + 1] == b[2 * d + 1]
            }),
            CellOrder::ColMajor => (0..n.saturating_sub(1)).all(|d| {
                intersection[2 * d] == b[2 * d] && intersection[2 * d + 1] == b[2 * d + 1]
            }),
            CellOrder::Hilbert => false,
        };
        let kind = if contig {
            Overlap::PartialContig
        } else {
            Overlap::Partial
        };
        (intersection, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::{ArraySchema, Attribute, CellOrder, Datatype, Overlap, TileOrder};
    use crate::codec::CompressionKind;

    fn schema_2d() -> ArraySchema<i64> {
        ArraySchema::dense("grid", &["x", "y"], &[0, 99, 0, 99], &[10, 10])
            .expect("schema")
            .attribute(Attribute::fixed("a", Datatype::Int32, 1))
    }

    #[test]
    fn rejects_bad_arity() {
        assert!(ArraySchema::<i64>::dense("g", &["x"], &[0, 9, 0, 9], &[3]).is_err());
        assert!(ArraySchema::<i64>::dense("g", &["x", "y"], &[0, 9, 0, 9], &[3]).is_err());
    }

    #[test]
    fn rejects_dense_hilbert() {
        assert!(schema_2d().with_cell_order(CellOrder::Hilbert).is_err());
    }

    #[test]
    fn expand_domain_aligns_to_tiles() {
        let s = schema_2d();
        assert_eq!(s.expand_domain(&[3, 17, 25, 31]), vec![0, 19, 20, 39]);
        assert_eq!(s.expand_domain(&[0, 99, 0, 99]), vec![0, 99, 0, 99]);
    }

    #[test]
    fn tile_positions_row_and_col() {
        let s = schema_2d();
        let tpd = s.tiles_per_dim(&[0, 99, 0, 99]);
        assert_eq!(tpd, vec![10, 10]);
        assert_eq!(s.tile_pos(&tpd, &[2, 3]), 23);
        let s = s.with_tile_order(TileOrder::ColMajor);
        assert_eq!(s.tile_pos(&tpd, &[2, 3]), 32);
    }

    #[test]
    fn cell_positions_in_tile() {
        let s = schema_2d();
        let tile = vec![10i64, 19, 20, 29];
        assert_eq!(s.cell_pos_in_tile(&tile, &[10, 20]), 0);
        assert_eq!(s.cell_pos_in_tile(&tile, &[10, 21]), 1);
        assert_eq!(s.cell_pos_in_tile(&tile, &[11, 20]), 10);
    }

    #[test]
    fn overlap_classification() {
        let s = schema_2d();
        let tile = vec![10i64, 19, 20, 29];
        let (_, full) = s.subarray_overlap(&[0, 99, 0, 99], &tile);
        assert_eq!(full, Overlap::Full);
        let (_, none) = s.subarray_overlap(&[50, 60, 50, 60], &tile);
        assert_eq!(none, Overlap::None);
        // Rows 12..=14, all columns of the tile: contiguous row-major.
        let (inter, contig) = s.subarray_overlap(&[12, 14, 0, 99], &tile);
        assert_eq!(contig, Overlap::PartialContig);
        assert_eq!(inter, vec![12, 14, 20, 29]);
        // A column strip is not contiguous in row-major order.
        let (_, partial) = s.subarray_overlap(&[0, 99, 22, 24], &tile);
        assert_eq!(partial, Overlap::Partial);
    }

    #[test]
    fn var_attribute_cell_sizes() {
        let s = ArraySchema::<i64>::sparse("s", &["x"], &[0, 9], 4)
            .expect("schema")
            .attribute(Attribute::var("v", Datatype::Char).compression(CompressionKind::Gzip, 6));
        assert_eq!(s.cell_size(0), super::VAR_OFFSET_SIZE);
        assert!(s.var_size(0));
        assert_eq!(s.cell_size(1), 8, "coords pseudo-attribute");
    }
}
