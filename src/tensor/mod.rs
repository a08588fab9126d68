//! Multi-precision tensors over block-quantized storage
//!
//! Storage is a closed tagged union: two dense float encodings besides f32,
//! and three block-quantized encodings where a run of elements shares one
//! f32 scale. All arithmetic decodes to f32; encodings only change how bytes
//! are laid out at rest.
//!
//! ## Block layouts
//!
//! - **I8**: 256 codes per block, symmetric, `value = code * scale` with
//!   `scale = max_abs / 127`.
//! - **Q4**: 32 codes per block, biased by 8, `scale = signed_max / -8`.
//!   Byte `j` of a block packs code `j` in its low nibble and code `j + 16`
//!   in its high nibble.
//! - **Q5**: 32 codes per block, biased by 16, `scale = signed_max / -16`.
//!   Low four bits pack pairwise (codes `2j`, `2j+1` in byte `j`); the fifth
//!   bit of each code lives in a side word, one u32 per block.
//!
//! An all-zero block stores scale 0 and decodes to exact zeros; the inverse
//! scale is forced to 0 so encoding never divides by zero.

pub mod cache;

use std::sync::Arc;

use half::{bf16, f16};

use crate::dtype::DType;
use crate::error::{InferirError, Result};
use crate::shape::TensorShape;

/// Elements per Q4/Q5 block
pub const QBLOCK: usize = 32;
/// Elements per I8 block
pub const I8_BLOCK: usize = 256;

// ============================================================================
// Storage
// ============================================================================

/// Backing storage for one tensor
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    /// Dense 32-bit floats
    F32(Vec<f32>),
    /// Dense 16-bit floats
    F16(Vec<f16>),
    /// Dense bfloat16
    BF16(Vec<bf16>),
    /// Blocked 8-bit codes with per-block scales
    I8 {
        /// One scale per 256-element block
        scales: Vec<f32>,
        /// Signed codes, `value = code * scale`
        codes: Vec<i8>,
    },
    /// Blocked 4-bit codes, two per byte
    Q4 {
        /// One scale per 32-element block
        scales: Vec<f32>,
        /// 16 bytes per block, split-half nibble layout
        packed: Vec<u8>,
    },
    /// Blocked 5-bit codes, low nibbles packed, fifth bits out of band
    Q5 {
        /// One scale per 32-element block
        scales: Vec<f32>,
        /// 16 bytes per block, pairwise nibble layout
        packed: Vec<u8>,
        /// One word of fifth bits per block
        high: Vec<u32>,
    },
}

// ============================================================================
// Tensor
// ============================================================================

/// A shaped, typed value buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: TensorShape,
    storage: Storage,
}

impl Tensor {
    /// Allocates a zeroed tensor.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::BlockMisaligned`] when a quantized encoding is
    /// requested for a size that is not a whole number of blocks.
    pub fn zeros(dtype: DType, shape: TensorShape) -> Result<Self> {
        let size = shape.size();
        let block = dtype.block_size();
        if size % block != 0 {
            return Err(InferirError::BlockMisaligned {
                size,
                block_size: block,
                dtype,
            });
        }
        let storage = match dtype {
            DType::F32 => Storage::F32(vec![0.0; size]),
            DType::F16 => Storage::F16(vec![f16::ZERO; size]),
            DType::BF16 => Storage::BF16(vec![bf16::ZERO; size]),
            DType::I8 => Storage::I8 {
                scales: vec![0.0; size / I8_BLOCK],
                codes: vec![0; size],
            },
            DType::Q4 => Storage::Q4 {
                scales: vec![0.0; size / QBLOCK],
                packed: vec![0; size / 2],
            },
            DType::Q5 => Storage::Q5 {
                scales: vec![0.0; size / QBLOCK],
                packed: vec![0; size / 2],
                high: vec![0; size / QBLOCK],
            },
        };
        Ok(Self {
            dtype,
            shape,
            storage,
        })
    }

    /// Wraps dense f32 data in a tensor.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::DataShapeMismatch`] when the data length does
    /// not match the shape.
    pub fn from_f32(shape: TensorShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.size() {
            return Err(InferirError::DataShapeMismatch {
                expected: shape.size(),
                actual: data.len(),
            });
        }
        Ok(Self {
            dtype: DType::F32,
            shape,
            storage: Storage::F32(data),
        })
    }

    /// Storage encoding
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shape metadata
    #[must_use]
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    /// Materialized element count
    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    /// Raw storage, for kernel backends
    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Decodes a single element at a linear storage offset
    #[must_use]
    pub fn get_linear(&self, idx: usize) -> f32 {
        match &self.storage {
            Storage::F32(d) => d[idx],
            Storage::F16(d) => d[idx].to_f32(),
            Storage::BF16(d) => d[idx].to_f32(),
            Storage::I8 { scales, codes } => f32::from(codes[idx]) * scales[idx / I8_BLOCK],
            Storage::Q4 { scales, packed } => {
                decode_q4(packed, idx) * scales[idx / QBLOCK]
            }
            Storage::Q5 {
                scales,
                packed,
                high,
            } => decode_q5(packed, high, idx) * scales[idx / QBLOCK],
        }
    }

    /// Decodes the element at `(row, col)` of a 2-D tensor
    #[must_use]
    pub fn get2(&self, row: usize, col: usize) -> f32 {
        self.get_linear(self.shape.offset2(row, col))
    }

    /// Writes a single f32 element at a linear storage offset.
    ///
    /// # Panics
    ///
    /// Panics on quantized storage; single-element writes into blocks are
    /// programming errors.
    pub fn set_linear(&mut self, idx: usize, value: f32) {
        match &mut self.storage {
            Storage::F32(d) => d[idx] = value,
            Storage::F16(d) => d[idx] = f16::from_f32(value),
            Storage::BF16(d) => d[idx] = bf16::from_f32(value),
            _ => panic!("single-element write into {} block storage", self.dtype),
        }
    }

    /// Writes the element at `(row, col)` of a 2-D tensor
    pub fn set2(&mut self, row: usize, col: usize, value: f32) {
        let off = self.shape.offset2(row, col);
        self.set_linear(off, value);
    }

    /// Dense f32 view when the storage is f32
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::F32(d) => Some(d),
            _ => None,
        }
    }

    /// Mutable dense f32 view when the storage is f32
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.storage {
            Storage::F32(d) => Some(d),
            _ => None,
        }
    }

    /// Resets every element (and every block scale) to zero
    pub fn fill_zero(&mut self) {
        match &mut self.storage {
            Storage::F32(d) => d.fill(0.0),
            Storage::F16(d) => d.fill(f16::ZERO),
            Storage::BF16(d) => d.fill(bf16::ZERO),
            Storage::I8 { scales, codes } => {
                scales.fill(0.0);
                codes.fill(0);
            }
            Storage::Q4 { scales, packed } => {
                scales.fill(0.0);
                packed.fill(0);
            }
            Storage::Q5 {
                scales,
                packed,
                high,
            } => {
                scales.fill(0.0);
                packed.fill(0);
                high.fill(0);
            }
        }
    }

    /// Decodes `len` elements starting at linear offset `offset` into `out`
    pub fn decode_range(&self, offset: usize, out: &mut [f32]) {
        match &self.storage {
            Storage::F32(d) => out.copy_from_slice(&d[offset..offset + out.len()]),
            Storage::F16(d) => {
                let n = out.len();
                for (o, v) in out.iter_mut().zip(&d[offset..offset + n]) {
                    *o = v.to_f32();
                }
            }
            Storage::BF16(d) => {
                let n = out.len();
                for (o, v) in out.iter_mut().zip(&d[offset..offset + n]) {
                    *o = v.to_f32();
                }
            }
            _ => {
                for (i, o) in out.iter_mut().enumerate() {
                    *o = self.get_linear(offset + i);
                }
            }
        }
    }

    /// Copies `len` f32 elements from `src` into this tensor.
    ///
    /// The source must be f32 and the destination dense; half-precision
    /// destinations round each element. Used for staging rows into caches.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::UnsupportedOperation`] when the source is not
    /// f32 or the destination is block-quantized.
    pub fn copy_from(
        &mut self,
        src: &Tensor,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        let (dst_dtype, src_dtype) = (self.dtype, src.dtype);
        match (&mut self.storage, &src.storage) {
            (Storage::F32(d), Storage::F32(s)) => {
                d[dst_offset..dst_offset + len].copy_from_slice(&s[src_offset..src_offset + len]);
                Ok(())
            }
            (Storage::F16(d), Storage::F32(s)) => {
                for (dv, sv) in d[dst_offset..dst_offset + len]
                    .iter_mut()
                    .zip(&s[src_offset..src_offset + len])
                {
                    *dv = f16::from_f32(*sv);
                }
                Ok(())
            }
            (Storage::BF16(d), Storage::F32(s)) => {
                for (dv, sv) in d[dst_offset..dst_offset + len]
                    .iter_mut()
                    .zip(&s[src_offset..src_offset + len])
                {
                    *dv = bf16::from_f32(*sv);
                }
                Ok(())
            }
            _ => Err(InferirError::UnsupportedOperation {
                op: "copy_from",
                left: dst_dtype,
                right: src_dtype,
            }),
        }
    }

    /// Re-encodes this tensor into `target`, decoding to f32 first.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::BlockMisaligned`] when the size does not fill
    /// whole blocks of the target encoding.
    pub fn to_dtype(&self, target: DType) -> Result<Tensor> {
        if target == self.dtype {
            return Ok(self.clone());
        }
        let size = self.size();
        if size % target.block_size() != 0 {
            return Err(InferirError::BlockMisaligned {
                size,
                block_size: target.block_size(),
                dtype: target,
            });
        }
        let mut values = vec![0.0f32; size];
        self.decode_range(0, &mut values);
        Ok(encode(target, self.shape.clone(), &values))
    }
}

// ============================================================================
// Block coders
// ============================================================================

/// Encodes dense f32 values into `target` storage. Size must already be
/// block-aligned.
fn encode(target: DType, shape: TensorShape, values: &[f32]) -> Tensor {
    let storage = match target {
        DType::F32 => Storage::F32(values.to_vec()),
        DType::F16 => Storage::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
        DType::BF16 => Storage::BF16(values.iter().map(|&v| bf16::from_f32(v)).collect()),
        DType::I8 => {
            let (scales, codes) = encode_i8(values);
            Storage::I8 { scales, codes }
        }
        DType::Q4 => {
            let (scales, packed) = encode_q4(values);
            Storage::Q4 { scales, packed }
        }
        DType::Q5 => {
            let (scales, packed, high) = encode_q5(values);
            Storage::Q5 {
                scales,
                packed,
                high,
            }
        }
    };
    Tensor {
        dtype: target,
        shape,
        storage,
    }
}

fn encode_i8(values: &[f32]) -> (Vec<f32>, Vec<i8>) {
    let blocks = values.len() / I8_BLOCK;
    let mut scales = vec![0.0f32; blocks];
    let mut codes = vec![0i8; values.len()];
    for b in 0..blocks {
        let chunk = &values[b * I8_BLOCK..(b + 1) * I8_BLOCK];
        let max_abs = chunk.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        let scale = max_abs / 127.0;
        let iscale = if scale != 0.0 { 1.0 / scale } else { 0.0 };
        scales[b] = scale;
        for (i, &v) in chunk.iter().enumerate() {
            let q = (v * iscale).round().clamp(-127.0, 127.0);
            codes[b * I8_BLOCK + i] = q as i8;
        }
    }
    (scales, codes)
}

/// Signed value with the largest magnitude in the block; the sign folds into
/// the scale so the code range stays [0, 15] / [0, 31].
fn signed_max(chunk: &[f32]) -> f32 {
    let mut max = 0.0f32;
    let mut amax = 0.0f32;
    for &v in chunk {
        let a = v.abs();
        if a > amax {
            amax = a;
            max = v;
        }
    }
    max
}

fn encode_q4(values: &[f32]) -> (Vec<f32>, Vec<u8>) {
    let blocks = values.len() / QBLOCK;
    let mut scales = vec![0.0f32; blocks];
    let mut packed = vec![0u8; values.len() / 2];
    let half_block = QBLOCK / 2;
    for b in 0..blocks {
        let chunk = &values[b * QBLOCK..(b + 1) * QBLOCK];
        let scale = signed_max(chunk) / -8.0;
        let iscale = if scale != 0.0 { 1.0 / scale } else { 0.0 };
        scales[b] = scale;
        for j in 0..half_block {
            let c0 = q_code(chunk[j], iscale, 8.5, 15);
            let c1 = q_code(chunk[j + half_block], iscale, 8.5, 15);
            packed[b * half_block + j] = (c0 & 0x0F) | ((c1 & 0x0F) << 4);
        }
    }
    (scales, packed)
}

fn encode_q5(values: &[f32]) -> (Vec<f32>, Vec<u8>, Vec<u32>) {
    let blocks = values.len() / QBLOCK;
    let mut scales = vec![0.0f32; blocks];
    let mut packed = vec![0u8; values.len() / 2];
    let mut high = vec![0u32; blocks];
    let half_block = QBLOCK / 2;
    for b in 0..blocks {
        let chunk = &values[b * QBLOCK..(b + 1) * QBLOCK];
        let scale = signed_max(chunk) / -16.0;
        let iscale = if scale != 0.0 { 1.0 / scale } else { 0.0 };
        scales[b] = scale;
        let mut q = 0u32;
        for j in 0..half_block {
            let c0 = q_code(chunk[2 * j], iscale, 16.5, 31);
            let c1 = q_code(chunk[2 * j + 1], iscale, 16.5, 31);
            packed[b * half_block + j] = (c0 & 0x0F) | ((c1 & 0x0F) << 4);
            q |= u32::from((c0 & 0x10) >> 4) << j;
            q |= u32::from((c1 & 0x10) >> 4) << (j + half_block);
        }
        high[b] = q;
    }
    (scales, packed, high)
}

#[inline]
fn q_code(v: f32, iscale: f32, bias: f32, max: u8) -> u8 {
    let q = (v * iscale + bias) as i32;
    q.clamp(0, i32::from(max)) as u8
}

/// Unscaled Q4 value at linear element index `idx`
#[inline]
#[must_use]
pub fn decode_q4(packed: &[u8], idx: usize) -> f32 {
    let block = idx / QBLOCK;
    let within = idx % QBLOCK;
    let half_block = QBLOCK / 2;
    let byte = packed[block * half_block + (within % half_block)];
    let code = if within < half_block {
        byte & 0x0F
    } else {
        byte >> 4
    };
    f32::from(i16::from(code) - 8)
}

/// Unscaled Q5 value at linear element index `idx`
#[inline]
#[must_use]
pub fn decode_q5(packed: &[u8], high: &[u32], idx: usize) -> f32 {
    let block = idx / QBLOCK;
    let within = idx % QBLOCK;
    let half_block = QBLOCK / 2;
    let byte = packed[block * half_block + (within / 2)];
    let low = if within % 2 == 0 { byte & 0x0F } else { byte >> 4 };
    let bit = if within % 2 == 0 {
        within / 2
    } else {
        within / 2 + half_block
    };
    let h = ((high[block] >> bit) & 1) as u8;
    let code = low | (h << 4);
    f32::from(i16::from(code) - 16)
}

// ============================================================================
// Segmented weights
// ============================================================================

/// A logical matrix stitched from independently allocated row segments.
///
/// Weight matrices can exceed a single allocation; segments split the first
/// dimension into equal row runs. Lookups resolve a logical row to a segment
/// plus a local row.
#[derive(Debug, Clone)]
pub struct SegmentedTensor {
    segments: Vec<Arc<Tensor>>,
    rows_per_segment: usize,
    rows: usize,
    cols: usize,
    dtype: DType,
}

impl SegmentedTensor {
    /// Stitches segments into one logical matrix.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidShape`] when segments disagree on
    /// dtype, column count, or row count, or when the list is empty.
    pub fn new(segments: Vec<Arc<Tensor>>) -> Result<Self> {
        let first = segments.first().ok_or_else(|| InferirError::InvalidShape {
            reason: "segmented tensor needs at least one segment".to_string(),
        })?;
        let dtype = first.dtype();
        let rows_per_segment = first.shape().first();
        let cols = first.shape().last();
        for s in &segments {
            if s.dtype() != dtype
                || s.shape().first() != rows_per_segment
                || s.shape().last() != cols
            {
                return Err(InferirError::InvalidShape {
                    reason: "segments must share dtype and dimensions".to_string(),
                });
            }
        }
        Ok(Self {
            rows: rows_per_segment * segments.len(),
            segments,
            rows_per_segment,
            cols,
            dtype,
        })
    }

    /// Logical row count
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Resolves a logical row to `(segment, local_row)`
    #[must_use]
    pub fn resolve(&self, row: usize) -> (&Tensor, usize) {
        let seg = row / self.rows_per_segment;
        (&self.segments[seg], row % self.rows_per_segment)
    }
}

/// A weight matrix, either one allocation or a segment union
#[derive(Debug, Clone)]
pub enum Weight {
    /// Single shared allocation
    Dense(Arc<Tensor>),
    /// Row-segmented union
    Segmented(SegmentedTensor),
}

impl Weight {
    /// Logical row count
    #[must_use]
    pub fn rows(&self) -> usize {
        match self {
            Weight::Dense(t) => t.shape().first(),
            Weight::Segmented(s) => s.rows(),
        }
    }

    /// Column count
    #[must_use]
    pub fn cols(&self) -> usize {
        match self {
            Weight::Dense(t) => t.shape().last(),
            Weight::Segmented(s) => s.cols(),
        }
    }

    /// Storage encoding
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Weight::Dense(t) => t.dtype(),
            Weight::Segmented(s) => s.dtype,
        }
    }

    /// Resolves a logical row to a backing tensor and its local row
    #[must_use]
    pub fn resolve(&self, row: usize) -> (&Tensor, usize) {
        match self {
            Weight::Dense(t) => (t, row),
            Weight::Segmented(s) => s.resolve(row),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32) * 0.31 - (n as f32) * 0.1).collect()
    }

    #[test]
    fn zeros_rejects_partial_blocks() {
        let shape = TensorShape::of(&[1, 48]).unwrap();
        assert!(Tensor::zeros(DType::Q4, shape.clone()).is_ok());
        let shape = TensorShape::of(&[1, 40]).unwrap();
        assert!(matches!(
            Tensor::zeros(DType::Q4, shape),
            Err(InferirError::BlockMisaligned { .. })
        ));
        let shape = TensorShape::of(&[1, 300]).unwrap();
        assert!(Tensor::zeros(DType::I8, shape).is_err());
    }

    #[test]
    fn i8_round_trip_bound() {
        let data = ramp(512);
        let t = Tensor::from_f32(TensorShape::of(&[2, 256]).unwrap(), data.clone()).unwrap();
        let q = t.to_dtype(DType::I8).unwrap();
        for b in 0..2 {
            let max_abs = data[b * 256..(b + 1) * 256]
                .iter()
                .fold(0.0f32, |m, &v| m.max(v.abs()));
            let bound = max_abs / 127.0 * 0.5 + 1e-6;
            for i in 0..256 {
                let idx = b * 256 + i;
                assert!(
                    (q.get_linear(idx) - data[idx]).abs() <= bound,
                    "i8 error at {idx}"
                );
            }
        }
    }

    #[test]
    fn q4_round_trip_bound() {
        let data = ramp(64);
        let t = Tensor::from_f32(TensorShape::of(&[1, 64]).unwrap(), data.clone()).unwrap();
        let q = t.to_dtype(DType::Q4).unwrap();
        for b in 0..2 {
            let max_abs = data[b * 32..(b + 1) * 32]
                .iter()
                .fold(0.0f32, |m, &v| m.max(v.abs()));
            for i in 0..32 {
                let idx = b * 32 + i;
                assert!(
                    (q.get_linear(idx) - data[idx]).abs() <= max_abs / 8.0 + 1e-6,
                    "q4 error at {idx}: {} vs {}",
                    q.get_linear(idx),
                    data[idx]
                );
            }
        }
    }

    #[test]
    fn q5_round_trip_bound() {
        let data = ramp(64);
        let t = Tensor::from_f32(TensorShape::of(&[1, 64]).unwrap(), data.clone()).unwrap();
        let q = t.to_dtype(DType::Q5).unwrap();
        for b in 0..2 {
            let max_abs = data[b * 32..(b + 1) * 32]
                .iter()
                .fold(0.0f32, |m, &v| m.max(v.abs()));
            for i in 0..32 {
                let idx = b * 32 + i;
                assert!(
                    (q.get_linear(idx) - data[idx]).abs() <= max_abs / 16.0 + 1e-6,
                    "q5 error at {idx}"
                );
            }
        }
    }

    #[test]
    fn q5_beats_q4_on_fine_detail() {
        let data: Vec<f32> = (0..32).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.173).collect();
        let t = Tensor::from_f32(TensorShape::of(&[1, 32]).unwrap(), data.clone()).unwrap();
        let q4 = t.to_dtype(DType::Q4).unwrap();
        let q5 = t.to_dtype(DType::Q5).unwrap();
        let err = |q: &Tensor| -> f32 {
            (0..32).map(|i| (q.get_linear(i) - data[i]).abs()).sum()
        };
        assert!(err(&q5) <= err(&q4));
    }

    #[test]
    fn zero_block_decodes_to_zero() {
        let data = vec![0.0f32; 256];
        let t = Tensor::from_f32(TensorShape::of(&[1, 256]).unwrap(), data).unwrap();
        for dtype in [DType::I8, DType::Q4, DType::Q5] {
            let q = t.to_dtype(dtype).unwrap();
            for i in 0..256 {
                let v = q.get_linear(i);
                assert_eq!(v, 0.0, "{dtype} index {i} decoded {v}");
                assert!(!v.is_nan());
            }
        }
    }

    #[test]
    fn half_precision_round_trips() {
        let data = ramp(32);
        let t = Tensor::from_f32(TensorShape::of(&[1, 32]).unwrap(), data.clone()).unwrap();
        for dtype in [DType::F16, DType::BF16] {
            let h = t.to_dtype(dtype).unwrap();
            for i in 0..32 {
                let rel = (h.get_linear(i) - data[i]).abs() / data[i].abs().max(1.0);
                assert!(rel < 0.01, "{dtype} at {i}");
            }
        }
    }

    #[test]
    fn fill_zero_clears_scales() {
        let data = ramp(32);
        let t = Tensor::from_f32(TensorShape::of(&[1, 32]).unwrap(), data).unwrap();
        let mut q = t.to_dtype(DType::Q4).unwrap();
        q.fill_zero();
        match q.storage() {
            Storage::Q4 { scales, packed } => {
                assert!(scales.iter().all(|&s| s == 0.0));
                assert!(packed.iter().all(|&b| b == 0));
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn copy_from_requires_f32() {
        let src = Tensor::from_f32(TensorShape::row(32), ramp(32)).unwrap();
        let mut dst = Tensor::zeros(DType::F32, TensorShape::row(64)).unwrap();
        dst.copy_from(&src, 0, 32, 32).unwrap();
        assert_eq!(dst.get_linear(32), src.get_linear(0));
        assert_eq!(dst.get_linear(0), 0.0);

        let mut q = Tensor::zeros(DType::Q4, TensorShape::row(32)).unwrap();
        assert!(q.copy_from(&src, 0, 0, 32).is_err());
    }

    #[test]
    fn copy_into_half_precision_rounds_per_element() {
        let src = Tensor::from_f32(TensorShape::row(32), ramp(32)).unwrap();
        for dtype in [DType::F16, DType::BF16] {
            let mut dst = Tensor::zeros(dtype, TensorShape::row(64)).unwrap();
            dst.copy_from(&src, 0, 16, 32).unwrap();
            for i in 0..32 {
                let rel = (dst.get_linear(16 + i) - src.get_linear(i)).abs()
                    / src.get_linear(i).abs().max(1.0);
                assert!(rel < 0.01, "{dtype} at {i}");
            }
            assert_eq!(dst.get_linear(0), 0.0);
        }
    }

    #[test]
    fn decode_range_reads_every_storage_kind() {
        let data = ramp(64);
        let t = Tensor::from_f32(TensorShape::of(&[1, 64]).unwrap(), data.clone()).unwrap();
        for dtype in [DType::F32, DType::F16, DType::BF16, DType::Q4, DType::Q5] {
            let enc = t.to_dtype(dtype).unwrap();
            let mut out = vec![0.0f32; 16];
            enc.decode_range(32, &mut out);
            for (i, o) in out.iter().enumerate() {
                assert_eq!(*o, enc.get_linear(32 + i), "{dtype} at {i}");
            }
        }
    }

    #[test]
    fn segmented_resolution() {
        let a = Arc::new(
            Tensor::from_f32(TensorShape::of(&[2, 4]).unwrap(), vec![1.0; 8]).unwrap(),
        );
        let b = Arc::new(
            Tensor::from_f32(TensorShape::of(&[2, 4]).unwrap(), vec![2.0; 8]).unwrap(),
        );
        let seg = SegmentedTensor::new(vec![a, b]).unwrap();
        assert_eq!(seg.rows(), 4);
        assert_eq!(seg.cols(), 4);
        let (t, local) = seg.resolve(3);
        assert_eq!(local, 1);
        assert_eq!(t.get2(local, 0), 2.0);

        let w = Weight::Segmented(seg);
        assert_eq!(w.rows(), 4);
        let (t, local) = w.resolve(0);
        assert_eq!(t.get2(local, 0), 1.0);
    }

    #[test]
    fn segmented_rejects_mismatched_segments() {
        let a = Arc::new(
            Tensor::from_f32(TensorShape::of(&[2, 4]).unwrap(), vec![1.0; 8]).unwrap(),
        );
        let b = Arc::new(
            Tensor::from_f32(TensorShape::of(&[2, 8]).unwrap(), vec![2.0; 16]).unwrap(),
        );
        assert!(SegmentedTensor::new(vec![a, b]).is_err());
        assert!(SegmentedTensor::new(vec![]).is_err());
    }
}
