#![cfg_attr(target_arch = "nvptx64", no_std)]
#![cfg_attr(target_arch = "nvptx64", feature(abi_ptx, asm_experimental_arch))]

//! Device side of the TMA tile copy.
//!
//! Built for `nvptx64-nvidia-cuda` this crate contains `copy_tma_kernel`;
//! built for the host it only exposes the shared-memory layout and the tile
//! constants the launcher needs to size the launch.

#[cfg(target_arch = "nvptx64")]
mod kernel;
#[cfg(target_arch = "nvptx64")]
mod ptx;

#[cfg(target_arch = "nvptx64")]
pub use kernel::copy_tma_kernel;

pub const TILE_M: usize = 128;
pub const TILE_N: usize = 128;
pub const TILE_ELEMS: usize = TILE_M * TILE_N;
pub const NUM_THREADS: u32 = 32;
pub const WARP_SIZE: u32 = 32;

/// Bytes the elected thread declares on the barrier before issuing the load.
pub const TMA_TRANSACTION_BYTES: u32 = (TILE_ELEMS * core::mem::size_of::<f32>()) as u32;

/// Dynamic shared memory of one block: the staged tile followed by the
/// transaction barrier word.
#[repr(C, align(128))]
pub struct SharedStorageTma<T, const N: usize> {
    pub smem: [T; N],
    pub mbarrier: u64,
}

/// Opaque `CUtensorMap` as produced by `cuTensorMapEncodeTiled`.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct TensorMap {
    pub opaque: [u64; 16],
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_shared_storage_layout() {
        type Storage = SharedStorageTma<f32, TILE_ELEMS>;
        assert_eq!(offset_of!(Storage, smem), 0);
        assert_eq!(offset_of!(Storage, mbarrier), TILE_ELEMS * 4);
        assert_eq!(align_of::<Storage>(), 128);
        assert_eq!(size_of::<Storage>(), 65664);
    }

    #[test]
    fn test_tensor_map_is_opaque_128_bytes() {
        assert_eq!(size_of::<TensorMap>(), 128);
        assert_eq!(align_of::<TensorMap>(), 64);
    }

    #[test]
    fn test_transaction_bytes_cover_tile() {
        assert_eq!(TMA_TRANSACTION_BYTES as usize, TILE_M * TILE_N * 4);
    }
}
