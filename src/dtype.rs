//! Numeric encodings and their block layout
//!
//! Every tensor carries one of these encodings. Dense encodings store one
//! value per element; quantized encodings store codes in fixed-size blocks
//! that share a single f32 scale. Internal arithmetic is always f32
//! regardless of the storage encoding.

use serde::{Deserialize, Serialize};

/// Numeric encoding of tensor storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE float, one value per element
    F32,
    /// 16-bit IEEE float
    F16,
    /// bfloat16 (truncated f32 exponent range)
    BF16,
    /// 8-bit symmetric block quantization, 256 elements per block
    I8,
    /// 4-bit block quantization, 32 elements per block, bias 8
    Q4,
    /// 5-bit block quantization, 32 elements per block, bias 16,
    /// fifth bit stored out of band
    Q5,
}

impl DType {
    /// Number of elements sharing one quantization scale.
    ///
    /// Dense encodings report 1.
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            DType::F32 | DType::F16 | DType::BF16 => 1,
            DType::I8 => 256,
            DType::Q4 | DType::Q5 => 32,
        }
    }

    /// True when the encoding packs blocks of codes behind a shared scale
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        matches!(self, DType::I8 | DType::Q4 | DType::Q5)
    }

    /// Code width in bits, excluding per-block scales
    #[must_use]
    pub const fn bits_per_element(self) -> usize {
        match self {
            DType::F32 => 32,
            DType::F16 | DType::BF16 => 16,
            DType::I8 => 8,
            DType::Q5 => 5,
            DType::Q4 => 4,
        }
    }

    /// Storage bytes for the element payload of `size` elements,
    /// excluding per-block scales and side arrays
    #[must_use]
    pub const fn payload_bytes(self, size: usize) -> usize {
        match self {
            DType::F32 => size * 4,
            DType::F16 | DType::BF16 => size * 2,
            DType::I8 => size,
            DType::Q4 | DType::Q5 => size / 2,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I8 => "i8",
            DType::Q4 => "q4",
            DType::Q5 => "q5",
        };
        write!(f, "{s}")
    }
}
