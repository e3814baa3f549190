use crate::tensor_defs::{TensorLayout, TensorShape, TileCoord, TileShape};

/// Read-only window of a tensor covering one tile.
///
/// The window keeps the parent layout so offsets are resolved against the
/// parent buffer. Tiles that hang over the edge of the tensor are clipped:
/// `extent` only covers the in-bounds part while `shape` stays the full tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileView {
    pub layout: TensorLayout,
    pub shape: TileShape,
    pub coord: TileCoord,
    pub origin_row: usize,
    pub origin_col: usize,
}

/// Carves the tile at `coord` out of `layout`.
pub fn local_tile(layout: &TensorLayout, shape: TileShape, coord: TileCoord) -> TileView {
    TileView {
        layout: *layout,
        shape,
        coord,
        origin_row: coord.m * shape.tile_m,
        origin_col: coord.n * shape.tile_n,
    }
}

impl TileView {
    pub fn extent(&self) -> TensorShape {
        let parent = self.layout.shape;
        TensorShape::new(
            parent.rows.saturating_sub(self.origin_row).min(self.shape.tile_m),
            parent.cols.saturating_sub(self.origin_col).min(self.shape.tile_n),
        )
    }

    pub fn is_full(&self) -> bool {
        let extent = self.extent();
        extent.rows == self.shape.tile_m && extent.cols == self.shape.tile_n
    }

    /// Whether the global element `(row, col)` lies in this tile.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        let extent = self.extent();
        (self.origin_row..self.origin_row + extent.rows).contains(&row)
            && (self.origin_col..self.origin_col + extent.cols).contains(&col)
    }

    /// Parent-buffer offset of the tile-local element `(r, c)`.
    pub fn offset(&self, r: usize, c: usize) -> usize {
        self.layout.index(self.origin_row + r, self.origin_col + c)
    }

    /// Global `(row, col)` of every in-bounds element, tile rows first.
    pub fn elements(&self) -> impl Iterator<Item = (usize, usize)> {
        let extent = self.extent();
        let (row0, col0) = (self.origin_row, self.origin_col);
        (0..extent.rows).flat_map(move |r| (0..extent.cols).map(move |c| (row0 + r, col0 + c)))
    }
}
