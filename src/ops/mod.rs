//! Kernel backends behind the `TensorOperations` trait
//!
//! Every numeric kernel the layers need lives behind one trait so the same
//! forward pass runs on a reference scalar backend, a portable chunked
//! backend, or runtime-detected CPU vector extensions. Backends are probed
//! in priority order at startup; the scalar backend always succeeds, so the
//! probe cannot fail.
//!
//! Accumulation is always f32 regardless of operand encodings, so results
//! agree across backends up to float reassociation.

#[cfg(feature = "gpu")]
pub mod gpu;
pub mod native;
pub mod scalar;
pub mod simd;

use std::ops::Range;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::{InferirError, Result};
use crate::tensor::{Tensor, Weight};

/// Numeric kernels over tensors.
///
/// Offsets are linear element offsets into storage. Mutating operations
/// require f32 destination storage; operand tensors may use any readable
/// encoding the backend supports.
pub trait TensorOperations: Send + Sync + std::fmt::Debug {
    /// Backend name, for probe logging and diagnostics
    fn name(&self) -> &'static str;

    /// `sum(a[a_offset + i] * b[b_offset + i])` over `len` elements
    fn dot_product(
        &self,
        a: &Tensor,
        b: &Tensor,
        a_offset: usize,
        b_offset: usize,
        len: usize,
    ) -> Result<f32>;

    /// `dst[offset + i] += src[offset + i]` over `len` elements
    fn accumulate(&self, dst: &mut Tensor, src: &Tensor, offset: usize, len: usize) -> Result<()>;

    /// `dst[offset + i] *= src[offset + i]` over `len` elements
    fn maccumulate(&self, dst: &mut Tensor, src: &Tensor, offset: usize, len: usize)
        -> Result<()>;

    /// `y[y_offset + i] = alpha * x[x_offset + i] + y[y_offset + i]`
    fn saxpy(
        &self,
        alpha: f32,
        x: &Tensor,
        y: &mut Tensor,
        x_offset: usize,
        y_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// `y[y_offset + i] = x[x_offset + i] + beta * y[y_offset + i]`
    ///
    /// The asymmetric companion of [`TensorOperations::saxpy`]: the scalar
    /// applies to the accumulator instead of the increment. The online
    /// softmax rescale step depends on it.
    fn sxpby(
        &self,
        beta: f32,
        x: &Tensor,
        y: &mut Tensor,
        x_offset: usize,
        y_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// `t[offset + i] *= factor` over `len` elements
    fn scale(&self, factor: f32, t: &mut Tensor, offset: usize, len: usize) -> Result<()>;

    /// Re-encodes `t` into `target`
    fn quantize(&self, t: &Tensor, target: DType) -> Result<Tensor> {
        t.to_dtype(target)
    }
}

/// Checks the dot-product dtype pairing shared by all backends.
///
/// f32 activations pair with every storage encoding; i8-quantized
/// activations pair with quantized weights only.
pub(crate) fn check_dot_pair(a: DType, b: DType) -> Result<()> {
    let ok = match a {
        DType::F32 => true,
        DType::I8 => matches!(b, DType::I8 | DType::Q4 | DType::Q5),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(InferirError::UnsupportedOperation {
            op: "dot_product",
            left: a,
            right: b,
        })
    }
}

pub(crate) fn dense_f32_mut<'a>(
    t: &'a mut Tensor,
    op: &'static str,
    other: DType,
) -> Result<&'a mut [f32]> {
    let dtype = t.dtype();
    t.as_f32_mut().ok_or(InferirError::UnsupportedOperation {
        op,
        left: dtype,
        right: other,
    })
}

// ============================================================================
// Probing
// ============================================================================

/// Picks the best available backend: native vector extensions, then the
/// portable chunked backend, then the scalar reference.
///
/// Probe once at startup and pass the handle down; layers hold the `Arc`.
#[must_use]
pub fn probe_backend() -> Arc<dyn TensorOperations> {
    #[cfg(feature = "gpu")]
    {
        debug_assert!(gpu::GpuTensorOperations::probe().is_none());
        tracing::debug!("accelerator backend unavailable, trying native");
    }
    if let Some(ops) = native::NativeTensorOperations::probe() {
        tracing::info!(backend = ops.name(), "tensor backend selected");
        return Arc::new(ops);
    }
    tracing::debug!("native vector extensions unavailable, trying portable simd");
    let ops = simd::SimdTensorOperations::new();
    tracing::info!(backend = ops.name(), "tensor backend selected");
    Arc::new(ops)
}

/// The always-available scalar reference backend
#[must_use]
pub fn reference_backend() -> Arc<dyn TensorOperations> {
    Arc::new(scalar::ScalarTensorOperations)
}

// ============================================================================
// Shared routines built on the trait
// ============================================================================

/// Matrix-vector product: `out[i] = w.row(rows.start + i) . x`.
///
/// Rows resolve through segment unions, and each weight row aligns to the
/// activation by its sparse column window. Rows are computed in parallel on
/// the compute pool.
///
/// # Errors
///
/// Propagates the first unsupported dtype pairing.
pub fn matvec(
    ops: &Arc<dyn TensorOperations>,
    x: &Tensor,
    w: &Weight,
    rows: Range<usize>,
    out: &mut [f32],
) -> Result<()> {
    debug_assert_eq!(out.len(), rows.len());
    let start = rows.start;
    let results = crate::parallel::pmap(rows.len(), |i| {
        let (t, local) = w.resolve(start + i);
        let width = t.shape().sparse_length();
        ops.dot_product(
            x,
            t,
            t.shape().sparse_offset(),
            local * width,
            width,
        )
    });
    for (o, r) in out.iter_mut().zip(results) {
        *o = r?;
    }
    Ok(())
}

/// Numerically stable in-place softmax
pub fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Index of the largest element; the first one wins ties
#[must_use]
pub fn argmax(x: &[f32]) -> usize {
    let mut best = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best = i;
        }
    }
    best
}
