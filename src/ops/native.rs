//! Native vector-extension backend
//!
//! Hand-written intrinsic kernels for the hot f32 dot product, runtime-gated
//! on AVX2+FMA (x86_64) or NEON (aarch64). Everything the intrinsics do not
//! cover delegates to the portable chunked backend, so this backend supports
//! exactly the same dtype pairings.

use crate::dtype::DType;
use crate::error::Result;
use crate::tensor::{Storage, Tensor};

use super::{simd::SimdTensorOperations, TensorOperations};

/// Backend built on runtime-detected CPU vector extensions
#[derive(Debug, Clone, Copy)]
pub struct NativeTensorOperations {
    delegate: SimdTensorOperations,
}

impl NativeTensorOperations {
    /// Returns the backend when the current CPU carries the required
    /// extensions, `None` otherwise
    #[must_use]
    pub fn probe() -> Option<Self> {
        if has_vector_extensions() {
            Some(Self {
                delegate: SimdTensorOperations::new(),
            })
        } else {
            None
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn has_vector_extensions() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

#[cfg(target_arch = "aarch64")]
fn has_vector_extensions() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn has_vector_extensions() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::{
        _mm256_castps256_ps128, _mm256_extractf128_ps, _mm256_fmadd_ps, _mm256_loadu_ps,
        _mm256_setzero_ps, _mm_add_ps, _mm_add_ss, _mm_cvtss_f32, _mm_movehl_ps, _mm_shuffle_ps,
    };

    let n = a.len();
    let chunks = n / 8;

    // SAFETY: loads stay within the slices; the caller runtime-checked the
    // avx2+fma features this fn is compiled with
    let mut sum = _mm256_setzero_ps();
    for i in 0..chunks {
        let av = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let bv = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        sum = _mm256_fmadd_ps(av, bv, sum);
    }

    let hi = _mm256_extractf128_ps(sum, 1);
    let lo = _mm256_castps256_ps128(sum);
    let sum128 = _mm_add_ps(lo, hi);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
    let mut result = _mm_cvtss_f32(sum32);

    for i in chunks * 8..n {
        result += a[i] * b[i];
    }
    result
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_f32_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::{vaddvq_f32, vdupq_n_f32, vfmaq_f32, vld1q_f32};

    let n = a.len();
    let chunks = n / 4;

    // SAFETY: loads stay within the slices; neon was runtime-checked
    let mut sum = vdupq_n_f32(0.0);
    for i in 0..chunks {
        let av = vld1q_f32(a.as_ptr().add(i * 4));
        let bv = vld1q_f32(b.as_ptr().add(i * 4));
        sum = vfmaq_f32(sum, av, bv);
    }

    let mut result = vaddvq_f32(sum);
    for i in chunks * 4..n {
        result += a[i] * b[i];
    }
    result
}

fn dot_f32_native(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: probe() checked avx2+fma before this backend exists
        return unsafe { dot_f32_avx2(a, b) };
    }
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: probe() checked neon before this backend exists
        return unsafe { dot_f32_neon(a, b) };
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    super::simd::dot_f32(a, b)
}

impl TensorOperations for NativeTensorOperations {
    fn name(&self) -> &'static str {
        "native"
    }

    fn dot_product(
        &self,
        a: &Tensor,
        b: &Tensor,
        a_offset: usize,
        b_offset: usize,
        len: usize,
    ) -> Result<f32> {
        if let (Storage::F32(av), Storage::F32(bv)) = (a.storage(), b.storage()) {
            return Ok(dot_f32_native(
                &av[a_offset..a_offset + len],
                &bv[b_offset..b_offset + len],
            ));
        }
        self.delegate.dot_product(a, b, a_offset, b_offset, len)
    }

    fn accumulate(&self, dst: &mut Tensor, src: &Tensor, offset: usize, len: usize) -> Result<()> {
        self.delegate.accumulate(dst, src, offset, len)
    }

    fn maccumulate(
        &self,
        dst: &mut Tensor,
        src: &Tensor,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        self.delegate.maccumulate(dst, src, offset, len)
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
        self.delegate.saxpy(alpha, x, y, x_offset, y_offset, len)
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
        self.delegate.sxpby(beta, x, y, x_offset, y_offset, len)
    }

    fn scale(&self, factor: f32, t: &mut Tensor, offset: usize, len: usize) -> Result<()> {
        self.delegate.scale(factor, t, offset, len)
    }

    fn quantize(&self, t: &Tensor, target: DType) -> Result<Tensor> {
        self.delegate.quantize(t, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::scalar::ScalarTensorOperations;
    use crate::shape::TensorShape;

    #[test]
    fn native_dot_matches_scalar_when_available() {
        let Some(ops) = NativeTensorOperations::probe() else {
            return;
        };
        let a = Tensor::from_f32(
            TensorShape::row(67),
            (0..67).map(|i| (i as f32).sin()).collect(),
        )
        .unwrap();
        let b = Tensor::from_f32(
            TensorShape::row(67),
            (0..67).map(|i| (i as f32 * 0.7).cos()).collect(),
        )
        .unwrap();
        let got = ops.dot_product(&a, &b, 0, 0, 67).unwrap();
        let want = ScalarTensorOperations.dot_product(&a, &b, 0, 0, 67).unwrap();
        assert!((got - want).abs() < 1e-4, "{got} vs {want}");
    }

    #[test]
    fn native_dot_with_offsets() {
        let Some(ops) = NativeTensorOperations::probe() else {
            return;
        };
        let a = Tensor::from_f32(TensorShape::row(32), (0..32).map(|i| i as f32).collect())
            .unwrap();
        let got = ops.dot_product(&a, &a, 8, 16, 8).unwrap();
        let want: f32 = (0..8).map(|i| ((i + 8) * (i + 16)) as f32).sum();
        assert!((got - want).abs() < 1e-3);
    }
}
