use core::fmt;

use half::{bf16, f16};

/// Element encodings understood by the copy engine.
///
/// Discriminants follow the driver's `CUtensorMapDataType` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TmaDataType {
    UInt8 = 0,
    UInt16 = 1,
    UInt32 = 2,
    Int32 = 3,
    UInt64 = 4,
    Int64 = 5,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
    BFloat16 = 9,
}

impl TmaDataType {
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::UInt8 => 1,
            Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::UInt64 | Self::Int64 | Self::Float64 => 8,
        }
    }
}

impl fmt::Display for TmaDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UInt8 => "u8",
            Self::UInt16 => "u16",
            Self::UInt32 => "u32",
            Self::Int32 => "i32",
            Self::UInt64 => "u64",
            Self::Int64 => "i64",
            Self::Float16 => "f16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::BFloat16 => "bf16",
        };
        f.write_str(name)
    }
}

/// A value the copy engine can move.
pub trait TmaElement: bytemuck::Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: TmaDataType;

    /// Value stored at flat index `index` by the benchmark initialisation.
    fn from_index(index: usize) -> Self;
}

macro_rules! impl_tma_element {
    ($($ty:ty => $dtype:ident, |$i:ident| $init:expr;)*) => {
        $(
            impl TmaElement for $ty {
                const DATA_TYPE: TmaDataType = TmaDataType::$dtype;

                fn from_index($i: usize) -> Self {
                    $init
                }
            }
        )*
    };
}

impl_tma_element! {
    u8 => UInt8, |i| i as u8;
    u16 => UInt16, |i| i as u16;
    u32 => UInt32, |i| i as u32;
    i32 => Int32, |i| i as i32;
    u64 => UInt64, |i| i as u64;
    i64 => Int64, |i| i as i64;
    f32 => Float32, |i| i as f32;
    f64 => Float64, |i| i as f64;
    f16 => Float16, |i| f16::from_f32(i as f32);
    bf16 => BFloat16, |i| bf16::from_f32(i as f32);
}
