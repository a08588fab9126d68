//! Portable chunked backend
//!
//! Safe Rust kernels structured around fixed-width lane accumulators so the
//! compiler can auto-vectorize them on any target. Block-quantized operands
//! take per-block fast paths when offsets are block-aligned; anything else
//! falls back to the scalar reference loops.

use crate::dtype::DType;
use crate::error::Result;
use crate::tensor::{decode_q4, decode_q5, Storage, Tensor, I8_BLOCK, QBLOCK};

use super::{check_dot_pair, dense_f32_mut, scalar::ScalarTensorOperations, TensorOperations};

const LANES: usize = 8;

/// Portable chunked backend, always available
#[derive(Debug, Default, Clone, Copy)]
pub struct SimdTensorOperations {
    fallback: ScalarTensorOperations,
}

impl SimdTensorOperations {
    /// Creates the backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            fallback: ScalarTensorOperations,
        }
    }
}

/// Lane-split dot product over dense f32 slices
#[must_use]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let chunks = a.len() / LANES;
    for c in 0..chunks {
        let ao = &a[c * LANES..(c + 1) * LANES];
        let bo = &b[c * LANES..(c + 1) * LANES];
        for l in 0..LANES {
            acc[l] = ao[l].mul_add(bo[l], acc[l]);
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for i in chunks * LANES..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

fn block_aligned(offset: usize, len: usize, block: usize) -> bool {
    offset % block == 0 && len % block == 0
}

/// f32 activation against Q4 blocks: decode one block at a time, scale once
fn dot_f32_q4(a: &[f32], scales: &[f32], packed: &[u8], b_offset: usize, len: usize) -> f32 {
    let half = QBLOCK / 2;
    let mut sum = 0.0f32;
    for blk in 0..len / QBLOCK {
        let b_base = b_offset + blk * QBLOCK;
        let bytes = &packed[b_base / 2..b_base / 2 + half];
        let a_lo = &a[blk * QBLOCK..blk * QBLOCK + half];
        let a_hi = &a[blk * QBLOCK + half..blk * QBLOCK + QBLOCK];
        let mut block_sum = 0.0f32;
        for j in 0..half {
            let lo = f32::from(i16::from(bytes[j] & 0x0F) - 8);
            let hi = f32::from(i16::from(bytes[j] >> 4) - 8);
            block_sum = a_lo[j].mul_add(lo, block_sum);
            block_sum = a_hi[j].mul_add(hi, block_sum);
        }
        sum = scales[b_base / QBLOCK].mul_add(block_sum, sum);
    }
    sum
}

/// f32 activation against Q5 blocks
fn dot_f32_q5(
    a: &[f32],
    scales: &[f32],
    packed: &[u8],
    high: &[u32],
    b_offset: usize,
    len: usize,
) -> f32 {
    let mut sum = 0.0f32;
    for blk in 0..len / QBLOCK {
        let b_base = b_offset + blk * QBLOCK;
        let mut block_sum = 0.0f32;
        for i in 0..QBLOCK {
            block_sum = a[blk * QBLOCK + i].mul_add(decode_q5(packed, high, b_base + i), block_sum);
        }
        sum = scales[b_base / QBLOCK].mul_add(block_sum, sum);
    }
    sum
}

/// f32 activation against i8 blocks
fn dot_f32_i8(a: &[f32], scales: &[f32], codes: &[i8], b_offset: usize, len: usize) -> f32 {
    let mut sum = 0.0f32;
    for blk in 0..len / I8_BLOCK {
        let b_base = b_offset + blk * I8_BLOCK;
        let mut block_sum = 0.0f32;
        for i in 0..I8_BLOCK {
            block_sum = a[blk * I8_BLOCK + i].mul_add(f32::from(codes[b_base + i]), block_sum);
        }
        sum = scales[b_base / I8_BLOCK].mul_add(block_sum, sum);
    }
    sum
}

/// i8 activation against Q4 blocks: integer code products, scales applied
/// per 32-wide weight block
fn dot_i8_q4(
    a_scales: &[f32],
    a_codes: &[i8],
    a_offset: usize,
    b_scales: &[f32],
    b_packed: &[u8],
    b_offset: usize,
    len: usize,
) -> f32 {
    let half = QBLOCK / 2;
    let mut sum = 0.0f32;
    for blk in 0..len / QBLOCK {
        let a_base = a_offset + blk * QBLOCK;
        let b_base = b_offset + blk * QBLOCK;
        let bytes = &b_packed[b_base / 2..b_base / 2 + half];
        let mut block_sum = 0i32;
        for j in 0..half {
            let lo = i32::from(bytes[j] & 0x0F) - 8;
            let hi = i32::from(bytes[j] >> 4) - 8;
            block_sum += i32::from(a_codes[a_base + j]) * lo;
            block_sum += i32::from(a_codes[a_base + half + j]) * hi;
        }
        let scale = a_scales[a_base / I8_BLOCK] * b_scales[b_base / QBLOCK];
        sum = scale.mul_add(block_sum as f32, sum);
    }
    sum
}

impl TensorOperations for SimdTensorOperations {
    fn name(&self) -> &'static str {
        "simd"
    }

    fn dot_product(
        &self,
        a: &Tensor,
        b: &Tensor,
        a_offset: usize,
        b_offset: usize,
        len: usize,
    ) -> Result<f32> {
        check_dot_pair(a.dtype(), b.dtype())?;
        match (a.storage(), b.storage()) {
            (Storage::F32(av), Storage::F32(bv)) => Ok(dot_f32(
                &av[a_offset..a_offset + len],
                &bv[b_offset..b_offset + len],
            )),
            (Storage::F32(av), Storage::Q4 { scales, packed })
                if block_aligned(b_offset, len, QBLOCK) =>
            {
                Ok(dot_f32_q4(
                    &av[a_offset..a_offset + len],
                    scales,
                    packed,
                    b_offset,
                    len,
                ))
            }
            (
                Storage::F32(av),
                Storage::Q5 {
                    scales,
                    packed,
                    high,
                },
            ) if block_aligned(b_offset, len, QBLOCK) => Ok(dot_f32_q5(
                &av[a_offset..a_offset + len],
                scales,
                packed,
                high,
                b_offset,
                len,
            )),
            (Storage::F32(av), Storage::I8 { scales, codes })
                if block_aligned(b_offset, len, I8_BLOCK) =>
            {
                Ok(dot_f32_i8(
                    &av[a_offset..a_offset + len],
                    scales,
                    codes,
                    b_offset,
                    len,
                ))
            }
            (
                Storage::I8 {
                    scales: a_scales,
                    codes: a_codes,
                },
                Storage::Q4 {
                    scales: b_scales,
                    packed: b_packed,
                },
            ) if block_aligned(a_offset, len, I8_BLOCK) && block_aligned(b_offset, len, QBLOCK) => {
                Ok(dot_i8_q4(
                    a_scales, a_codes, a_offset, b_scales, b_packed, b_offset, len,
                ))
            }
            _ => self.fallback.dot_product(a, b, a_offset, b_offset, len),
        }
    }

    fn accumulate(&self, dst: &mut Tensor, src: &Tensor, offset: usize, len: usize) -> Result<()> {
        if let Storage::F32(s) = src.storage() {
            let d = dense_f32_mut(dst, "accumulate", DType::F32)?;
            for (dv, sv) in d[offset..offset + len]
                .iter_mut()
                .zip(&s[offset..offset + len])
            {
                *dv += sv;
            }
            Ok(())
        } else {
            self.fallback.accumulate(dst, src, offset, len)
        }
    }

    fn maccumulate(
        &self,
        dst: &mut Tensor,
        src: &Tensor,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        if let Storage::F32(s) = src.storage() {
            let d = dense_f32_mut(dst, "maccumulate", DType::F32)?;
            for (dv, sv) in d[offset..offset + len]
                .iter_mut()
                .zip(&s[offset..offset + len])
            {
                *dv *= sv;
            }
            Ok(())
        } else {
            self.fallback.maccumulate(dst, src, offset, len)
        }
    }

    fn saxpy(
        &self,
        alpha: f32,
        x: &Tensor,
        y: &mut Tensor,
        x_offset: usize,
        y_offset: usize,
        len: usize,
    ) -> Result<()> {
        if let Storage::F32(xv) = x.storage() {
            let d = dense_f32_mut(y, "saxpy", DType::F32)?;
            for (dv, xv) in d[y_offset..y_offset + len]
                .iter_mut()
                .zip(&xv[x_offset..x_offset + len])
            {
                *dv = alpha.mul_add(*xv, *dv);
            }
            Ok(())
        } else {
            self.fallback.saxpy(alpha, x, y, x_offset, y_offset, len)
        }
    }

    fn sxpby(
        &self,
        beta: f32,
        x: &Tensor,
        y: &mut Tensor,
        x_offset: usize,
        y_offset: usize,
        len: usize,
    ) -> Result<()> {
        if let Storage::F32(xv) = x.storage() {
            let d = dense_f32_mut(y, "sxpby", DType::F32)?;
            for (dv, xv) in d[y_offset..y_offset + len]
                .iter_mut()
                .zip(&xv[x_offset..x_offset + len])
            {
                *dv = beta.mul_add(*dv, *xv);
            }
            Ok(())
        } else {
            self.fallback.sxpby(beta, x, y, x_offset, y_offset, len)
        }
    }

    fn scale(&self, factor: f32, t: &mut Tensor, offset: usize, len: usize) -> Result<()> {
        self.fallback.scale(factor, t, offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;

    fn row(data: Vec<f32>) -> Tensor {
        let n = data.len();
        Tensor::from_f32(TensorShape::row(n), data).unwrap()
    }

    fn reference_dot(a: &Tensor, b: &Tensor, len: usize) -> f32 {
        ScalarTensorOperations
            .dot_product(a, b, 0, 0, len)
            .unwrap()
    }

    #[test]
    fn f32_dot_matches_scalar_with_remainder() {
        let ops = SimdTensorOperations::new();
        let a = row((0..37).map(|i| (i as f32).sin()).collect());
        let b = row((0..37).map(|i| (i as f32).cos()).collect());
        let got = ops.dot_product(&a, &b, 0, 0, 37).unwrap();
        assert!((got - reference_dot(&a, &b, 37)).abs() < 1e-4);
    }

    #[test]
    fn q4_fast_path_matches_scalar() {
        let ops = SimdTensorOperations::new();
        let a = row((0..64).map(|i| (i as f32) * 0.01 - 0.3).collect());
        let b = row((0..64).map(|i| ((i * 3 % 17) as f32) - 8.0).collect())
            .to_dtype(DType::Q4)
            .unwrap();
        let got = ops.dot_product(&a, &b, 0, 0, 64).unwrap();
        assert!((got - reference_dot(&a, &b, 64)).abs() < 1e-3);
    }

    #[test]
    fn q5_fast_path_matches_scalar() {
        let ops = SimdTensorOperations::new();
        let a = row((0..64).map(|i| (i as f32) * 0.02 - 0.5).collect());
        let b = row((0..64).map(|i| ((i * 5 % 23) as f32) - 11.0).collect())
            .to_dtype(DType::Q5)
            .unwrap();
        let got = ops.dot_product(&a, &b, 0, 0, 64).unwrap();
        assert!((got - reference_dot(&a, &b, 64)).abs() < 1e-3);
    }

    #[test]
    fn i8_fast_path_matches_scalar() {
        let ops = SimdTensorOperations::new();
        let a = row((0..256).map(|i| (i as f32) * 0.003).collect());
        let b = row((0..256).map(|i| ((i % 41) as f32) - 20.0).collect())
            .to_dtype(DType::I8)
            .unwrap();
        let got = ops.dot_product(&a, &b, 0, 0, 256).unwrap();
        assert!((got - reference_dot(&a, &b, 256)).abs() < 1e-2);
    }

    #[test]
    fn i8_activation_against_q4_weights() {
        let ops = SimdTensorOperations::new();
        let a = row((0..256).map(|i| (i as f32) * 0.01 - 1.0).collect())
            .to_dtype(DType::I8)
            .unwrap();
        let b = row((0..256).map(|i| ((i * 7 % 31) as f32) - 15.0).collect())
            .to_dtype(DType::Q4)
            .unwrap();
        let got = ops.dot_product(&a, &b, 0, 0, 256).unwrap();
        let want = ScalarTensorOperations
            .dot_product(&a, &b, 0, 0, 256)
            .unwrap();
        assert!((got - want).abs() < 1e-2, "{got} vs {want}");
    }

    #[test]
    fn unaligned_quantized_offsets_fall_back() {
        let ops = SimdTensorOperations::new();
        let a = row(vec![1.0; 16]);
        let b = row((0..64).map(|i| i as f32 * 0.1).collect())
            .to_dtype(DType::Q4)
            .unwrap();
        // offset 8 is not block-aligned; must still give the scalar answer
        let got = ops.dot_product(&a, &b, 0, 8, 16).unwrap();
        let want = ScalarTensorOperations.dot_product(&a, &b, 0, 8, 16).unwrap();
        assert!((got - want).abs() < 1e-5);
    }
}
