use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLayout {
    RowMajor,
    ColumnMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub rows: usize,
    pub cols: usize,
}

impl TensorShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub const fn size(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A 2D shape mapped onto a flat buffer through a single leading dimension.
///
/// `leading_dim` is the distance in elements between consecutive rows
/// (row-major) or columns (column-major). A compact layout has
/// `leading_dim == cols` (resp. `rows`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    pub shape: TensorShape,
    pub layout: MemoryLayout,
    pub leading_dim: usize,
}

impl TensorLayout {
    pub fn row_major(rows: usize, cols: usize) -> Self {
        Self {
            shape: TensorShape::new(rows, cols),
            layout: MemoryLayout::RowMajor,
            leading_dim: cols,
        }
    }

    pub fn column_major(rows: usize, cols: usize) -> Self {
        Self {
            shape: TensorShape::new(rows, cols),
            layout: MemoryLayout::ColumnMajor,
            leading_dim: rows,
        }
    }

    /// Same shape and major-ness with padded rows (or columns).
    pub fn with_leading_dim(self, leading_dim: usize) -> Self {
        assert!(
            leading_dim >= self.contiguous_extent(),
            "leading dimension {} is smaller than the contiguous extent {}",
            leading_dim,
            self.contiguous_extent()
        );
        Self { leading_dim, ..self }
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.shape.rows, "Row index out of bounds");
        debug_assert!(col < self.shape.cols, "Column index out of bounds");

        match self.layout {
            MemoryLayout::RowMajor => row * self.leading_dim + col,
            MemoryLayout::ColumnMajor => col * self.leading_dim + row,
        }
    }

    pub fn row_stride(&self) -> usize {
        match self.layout {
            MemoryLayout::RowMajor => self.leading_dim,
            MemoryLayout::ColumnMajor => 1,
        }
    }

    pub fn col_stride(&self) -> usize {
        match self.layout {
            MemoryLayout::RowMajor => 1,
            MemoryLayout::ColumnMajor => self.leading_dim,
        }
    }

    /// Extent of the dimension that is contiguous in memory.
    pub fn contiguous_extent(&self) -> usize {
        match self.layout {
            MemoryLayout::RowMajor => self.shape.cols,
            MemoryLayout::ColumnMajor => self.shape.rows,
        }
    }

    /// Extent of the strided dimension.
    pub fn strided_extent(&self) -> usize {
        match self.layout {
            MemoryLayout::RowMajor => self.shape.rows,
            MemoryLayout::ColumnMajor => self.shape.cols,
        }
    }

    /// Number of elements a buffer needs to back this layout.
    pub fn cosize(&self) -> usize {
        if !self.shape.is_valid() {
            return 0;
        }
        self.index(self.shape.rows - 1, self.shape.cols - 1) + 1
    }

    pub fn is_compact(&self) -> bool {
        self.leading_dim == self.contiguous_extent()
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorLayout({}, {:?}, ld={})",
            self.shape, self.layout, self.leading_dim
        )
    }
}

pub const fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// The sub-rectangle one execution group is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileShape {
    pub tile_m: usize,
    pub tile_n: usize,
}

impl TileShape {
    pub const fn new(tile_m: usize, tile_n: usize) -> Self {
        Self { tile_m, tile_n }
    }

    pub const fn tma_default() -> Self {
        Self::new(128, 128)
    }

    pub const fn size(&self) -> usize {
        self.tile_m * self.tile_n
    }

    pub const fn divides(&self, shape: &TensorShape) -> bool {
        shape.rows % self.tile_m == 0 && shape.cols % self.tile_n == 0
    }

    /// Number of tiles along each dimension, rounding partial tiles up.
    pub const fn grid(&self, shape: &TensorShape) -> GridShape {
        GridShape {
            tiles_m: ceil_div(shape.rows, self.tile_m),
            tiles_n: ceil_div(shape.cols, self.tile_n),
        }
    }
}

impl fmt::Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.tile_m, self.tile_n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub m: usize,
    pub n: usize,
}

impl TileCoord {
    pub const fn new(m: usize, n: usize) -> Self {
        Self { m, n }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.m, self.n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridShape {
    pub tiles_m: usize,
    pub tiles_n: usize,
}

impl GridShape {
    pub const fn size(&self) -> usize {
        self.tiles_m * self.tiles_n
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.m < self.tiles_m && coord.n < self.tiles_n
    }

    /// Every tile coordinate, row of tiles by row of tiles.
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> {
        let tiles_n = self.tiles_n;
        (0..self.tiles_m).flat_map(move |m| (0..tiles_n).map(move |n| TileCoord::new(m, n)))
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} tiles", self.tiles_m, self.tiles_n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape() {
        let shape = TensorShape::new(10, 20);
        assert_eq!(shape.rows, 10);
        assert_eq!(shape.cols, 20);
        assert_eq!(shape.size(), 200);
        assert!(shape.is_valid());
        assert!(!TensorShape::new(0, 4).is_valid());
    }

    #[test]
    fn test_row_major_layout() {
        let layout = TensorLayout::row_major(4, 3);
        assert_eq!(layout.index(0, 0), 0);
        assert_eq!(layout.index(0, 1), 1);
        assert_eq!(layout.index(1, 0), 3);
        assert_eq!(layout.index(1, 1), 4);
        assert_eq!(layout.cosize(), 12);
        assert!(layout.is_compact());
    }

    #[test]
    fn test_column_major_layout() {
        let layout = TensorLayout::column_major(4, 3);
        assert_eq!(layout.index(0, 0), 0);
        assert_eq!(layout.index(1, 0), 1);
        assert_eq!(layout.index(0, 1), 4);
        assert_eq!(layout.index(1, 1), 5);
        assert_eq!(layout.row_stride(), 1);
        assert_eq!(layout.col_stride(), 4);
    }

    #[test]
    fn test_padded_layout_cosize() {
        let layout = TensorLayout::row_major(4, 3).with_leading_dim(8);
        assert!(!layout.is_compact());
        assert_eq!(layout.index(3, 2), 26);
        assert_eq!(layout.cosize(), 27);
    }

    #[test]
    #[should_panic(expected = "smaller than the contiguous extent")]
    fn test_leading_dim_too_small() {
        let _ = TensorLayout::row_major(4, 8).with_leading_dim(4);
    }

    #[test]
    fn test_tile_grid() {
        let tile = TileShape::tma_default();
        assert_eq!(tile.size(), 128 * 128);

        let square = tile.grid(&TensorShape::new(256, 256));
        assert_eq!((square.tiles_m, square.tiles_n), (2, 2));

        let wide = tile.grid(&TensorShape::new(128, 384));
        assert_eq!((wide.tiles_m, wide.tiles_n), (1, 3));
        assert!(tile.divides(&TensorShape::new(128, 384)));

        let ragged = tile.grid(&TensorShape::new(130, 100));
        assert_eq!((ragged.tiles_m, ragged.tiles_n), (2, 1));
        assert!(!tile.divides(&TensorShape::new(130, 100)));
    }

    #[test]
    fn test_grid_coords_are_row_major() {
        let grid = GridShape { tiles_m: 2, tiles_n: 3 };
        let coords: Vec<_> = grid.coords().collect();
        assert_eq!(coords.len(), grid.size());
        assert_eq!(coords[0], TileCoord::new(0, 0));
        assert_eq!(coords[2], TileCoord::new(0, 2));
        assert_eq!(coords[3], TileCoord::new(1, 0));
        assert!(coords.iter().all(|c| grid.contains(*c)));
    }
}
