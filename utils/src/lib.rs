//! Layout and tiling helpers shared by the host launcher and the kernels.

pub mod tensor_defs;
pub mod tile;

pub use tensor_defs::{
    ceil_div, GridShape, MemoryLayout, TensorLayout, TensorShape, TileCoord, TileShape,
};
pub use tile::{local_tile, TileView};
