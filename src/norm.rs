//! Normalization layers
//!
//! Both norms read a column range of a `[1, n]` activation and write a
//! fresh scratch tensor of the same shape, leaving the input untouched.
//! Statistics accumulate in f64, so a constant input centers to exactly
//! zero. Under tensor parallelism each shard feeds its partial statistics
//! through an injected [`NormReducer`]; the divisor is always the full
//! model width, not the shard's slice. A norm built `with_reduction`
//! gathers statistics over its owned columns inside `forward` and applies
//! the globally reduced result across the full width.

use std::sync::Arc;

use crate::dist::{NormReducer, Segment};
use crate::error::Result;
use crate::tensor::cache::PooledTensor;
use crate::tensor::Tensor;
use crate::Runtime;

/// A normalization layer over a column range
pub trait Norm: Send + Sync + std::fmt::Debug {
    /// Normalizes the full width, reducing statistics across shards when
    /// the layer was built with a reduction
    ///
    /// # Errors
    ///
    /// Propagates scratch-allocation and kernel errors.
    fn forward(&self, rt: &Runtime, input: &Tensor) -> Result<PooledTensor> {
        let len = input.shape().last();
        self.forward_range(rt, input, 0, len, None)
    }

    /// Normalizes `[offset, offset + length)`, reducing statistics across
    /// shards when a reducer is supplied
    ///
    /// # Errors
    ///
    /// Propagates scratch-allocation and kernel errors.
    fn forward_range(
        &self,
        rt: &Runtime,
        input: &Tensor,
        offset: usize,
        length: usize,
        reducer: Option<&dyn NormReducer>,
    ) -> Result<PooledTensor>;
}

/// Centered layer normalization with gain and optional bias
#[derive(Debug)]
pub struct LayerNorm {
    gain: Arc<Tensor>,
    bias: Option<Arc<Tensor>>,
    eps: f32,
    global_length: usize,
    reduction: Option<(Segment, Arc<dyn NormReducer>)>,
}

impl LayerNorm {
    /// Creates the layer; `global_length` is the full model width the
    /// statistics divide by
    #[must_use]
    pub fn new(
        gain: Arc<Tensor>,
        bias: Option<Arc<Tensor>>,
        eps: f32,
        global_length: usize,
    ) -> Self {
        Self {
            gain,
            bias,
            eps,
            global_length,
            reduction: None,
        }
    }

    /// Gathers statistics over `segment` and folds them through `reducer`
    /// on every `forward` call
    #[must_use]
    pub fn with_reduction(mut self, segment: Segment, reducer: Arc<dyn NormReducer>) -> Self {
        self.reduction = Some((segment, reducer));
        self
    }

    fn apply(
        &self,
        rt: &Runtime,
        input: &Tensor,
        stats: Segment,
        reducer: Option<&dyn NormReducer>,
        out: Segment,
    ) -> Result<PooledTensor> {
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for i in stats.range() {
            let v = f64::from(input.get_linear(i));
            sum += v;
            sum_sq += v * v;
        }
        if let Some(r) = reducer {
            let (s, sq) = r.reduce(sum as f32, sum_sq as f32);
            sum = f64::from(s);
            sum_sq = f64::from(sq);
        }

        let n = self.global_length as f64;
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        let inv_std = 1.0 / (variance + f64::from(self.eps)).sqrt();
        debug_assert!(inv_std.is_finite());

        let mut buf = rt
            .cache
            .acquire(input.dtype(), input.shape().clone())?;
        for i in out.range() {
            let centered = ((f64::from(input.get_linear(i)) - mean) * inv_std) as f32;
            let mut v = centered * self.gain.get_linear(i);
            if let Some(b) = &self.bias {
                v += b.get_linear(i);
            }
            buf.set_linear(i, v);
        }
        Ok(buf)
    }
}

impl Norm for LayerNorm {
    fn forward(&self, rt: &Runtime, input: &Tensor) -> Result<PooledTensor> {
        let full = Segment {
            offset: 0,
            length: input.shape().last(),
        };
        match &self.reduction {
            Some((seg, r)) => self.apply(rt, input, *seg, Some(r.as_ref()), full),
            None => self.apply(rt, input, full, None, full),
        }
    }

    fn forward_range(
        &self,
        rt: &Runtime,
        input: &Tensor,
        offset: usize,
        length: usize,
        reducer: Option<&dyn NormReducer>,
    ) -> Result<PooledTensor> {
        let seg = Segment { offset, length };
        self.apply(rt, input, seg, reducer, seg)
    }
}

/// Root-mean-square normalization, no centering, no bias
#[derive(Debug)]
pub struct RmsNorm {
    gain: Arc<Tensor>,
    eps: f32,
    global_length: usize,
    reduction: Option<(Segment, Arc<dyn NormReducer>)>,
}

impl RmsNorm {
    /// Creates the layer; `global_length` is the full model width the mean
    /// square divides by
    #[must_use]
    pub fn new(gain: Arc<Tensor>, eps: f32, global_length: usize) -> Self {
        Self {
            gain,
            eps,
            global_length,
            reduction: None,
        }
    }

    /// Gathers statistics over `segment` and folds them through `reducer`
    /// on every `forward` call
    #[must_use]
    pub fn with_reduction(mut self, segment: Segment, reducer: Arc<dyn NormReducer>) -> Self {
        self.reduction = Some((segment, reducer));
        self
    }

    fn apply(
        &self,
        rt: &Runtime,
        input: &Tensor,
        stats: Segment,
        reducer: Option<&dyn NormReducer>,
        out: Segment,
    ) -> Result<PooledTensor> {
        let mut sum_sq = 0.0f64;
        for i in stats.range() {
            let v = f64::from(input.get_linear(i));
            sum_sq += v * v;
        }
        if let Some(r) = reducer {
            sum_sq = f64::from(r.reduce(0.0, sum_sq as f32).1);
        }

        let n = self.global_length as f64;
        let inv_rms = 1.0 / (sum_sq / n + f64::from(self.eps)).sqrt();
        debug_assert!(inv_rms.is_finite());

        let mut buf = rt
            .cache
            .acquire(input.dtype(), input.shape().clone())?;
        for i in out.range() {
            let v = (f64::from(input.get_linear(i)) * inv_rms) as f32;
            buf.set_linear(i, v * self.gain.get_linear(i));
        }
        Ok(buf)
    }
}

impl Norm for RmsNorm {
    fn forward(&self, rt: &Runtime, input: &Tensor) -> Result<PooledTensor> {
        let full = Segment {
            offset: 0,
            length: input.shape().last(),
        };
        match &self.reduction {
            Some((seg, r)) => self.apply(rt, input, *seg, Some(r.as_ref()), full),
            None => self.apply(rt, input, full, None, full),
        }
    }

    fn forward_range(
        &self,
        rt: &Runtime,
        input: &Tensor,
        offset: usize,
        length: usize,
        reducer: Option<&dyn NormReducer>,
    ) -> Result<PooledTensor> {
        let seg = Segment { offset, length };
        self.apply(rt, input, seg, reducer, seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;

    fn runtime() -> Runtime {
        Runtime::reference()
    }

    fn ones(n: usize) -> Arc<Tensor> {
        Arc::new(Tensor::from_f32(TensorShape::row(n), vec![1.0; n]).unwrap())
    }

    #[test]
    fn layer_norm_centers_and_scales() {
        let rt = runtime();
        let norm = LayerNorm::new(ones(4), None, 1e-5, 4);
        let input = Tensor::from_f32(TensorShape::row(4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = norm.forward(&rt, &input).unwrap();
        let vals: Vec<f32> = (0..4).map(|i| out.get_linear(i)).collect();
        let mean: f32 = vals.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(vals[3] > vals[2] && vals[0] < vals[1]);
        // symmetric around the center
        assert!((vals[0] + vals[3]).abs() < 1e-5);
    }

    #[test]
    fn layer_norm_constant_input_is_zero_not_nan() {
        let rt = runtime();
        let norm = LayerNorm::new(ones(8), None, 1e-5, 8);
        let input = Tensor::from_f32(TensorShape::row(8), vec![3.7; 8]).unwrap();
        let out = norm.forward(&rt, &input).unwrap();
        for i in 0..8 {
            assert_eq!(out.get_linear(i), 0.0);
        }
    }

    #[test]
    fn layer_norm_constant_input_is_zero_at_any_width() {
        // widths that are not powers of two still center bit-exactly
        let rt = runtime();
        for (n, c) in [(6usize, -2.25f32), (7, 3.7), (12, 1e-3)] {
            let norm = LayerNorm::new(ones(n), None, 1e-5, n);
            let input = Tensor::from_f32(TensorShape::row(n), vec![c; n]).unwrap();
            let out = norm.forward(&rt, &input).unwrap();
            for i in 0..n {
                assert_eq!(out.get_linear(i), 0.0, "width {n}, value {c}");
            }
        }
    }

    #[test]
    fn layer_norm_applies_bias() {
        let rt = runtime();
        let bias = Arc::new(
            Tensor::from_f32(TensorShape::row(2), vec![5.0, -5.0]).unwrap(),
        );
        let norm = LayerNorm::new(ones(2), Some(bias), 1e-5, 2);
        let input = Tensor::from_f32(TensorShape::row(2), vec![1.0, 1.0]).unwrap();
        let out = norm.forward(&rt, &input).unwrap();
        assert!((out.get_linear(0) - 5.0).abs() < 1e-5);
        assert!((out.get_linear(1) + 5.0).abs() < 1e-5);
    }

    #[test]
    fn rms_norm_preserves_direction() {
        let rt = runtime();
        let norm = RmsNorm::new(ones(4), 1e-5, 4);
        let input = Tensor::from_f32(TensorShape::row(4), vec![2.0, -2.0, 2.0, -2.0]).unwrap();
        let out = norm.forward(&rt, &input).unwrap();
        // rms of input is 2, so output is ±1
        for i in 0..4 {
            let want = if i % 2 == 0 { 1.0 } else { -1.0 };
            assert!((out.get_linear(i) - want).abs() < 1e-4);
        }
    }

    #[test]
    fn rms_norm_zero_input_stays_zero() {
        let rt = runtime();
        let norm = RmsNorm::new(ones(4), 1e-5, 4);
        let input = Tensor::from_f32(TensorShape::row(4), vec![0.0; 4]).unwrap();
        let out = norm.forward(&rt, &input).unwrap();
        for i in 0..4 {
            let v = out.get_linear(i);
            assert!(!v.is_nan());
            assert_eq!(v, 0.0);
        }
    }

    #[derive(Debug)]
    struct DoubleStats;
    impl NormReducer for DoubleStats {
        fn reduce(&self, sum: f32, sum_sq: f32) -> (f32, f32) {
            (sum * 2.0, sum_sq * 2.0)
        }
    }

    #[test]
    fn sharded_range_with_reducer_matches_full_width() {
        let rt = runtime();
        // mirror-symmetric input: each half contributes identical stats
        let data = vec![1.0, -2.0, 3.0, -4.0, 1.0, -2.0, 3.0, -4.0];
        let input = Tensor::from_f32(TensorShape::row(8), data).unwrap();
        let full = LayerNorm::new(ones(8), None, 1e-5, 8);
        let want = full.forward(&rt, &input).unwrap();

        let sharded = LayerNorm::new(ones(8), None, 1e-5, 8);
        let got = sharded
            .forward_range(&rt, &input, 0, 4, Some(&DoubleStats))
            .unwrap();
        for i in 0..4 {
            assert!((got.get_linear(i) - want.get_linear(i)).abs() < 1e-5);
        }
    }

    #[test]
    fn reduction_built_layer_norm_normalizes_the_full_width() {
        let rt = runtime();
        let data = vec![1.0, -2.0, 3.0, -4.0, 1.0, -2.0, 3.0, -4.0];
        let input = Tensor::from_f32(TensorShape::row(8), data).unwrap();
        let want = LayerNorm::new(ones(8), None, 1e-5, 8)
            .forward(&rt, &input)
            .unwrap();

        let seg = Segment {
            offset: 0,
            length: 4,
        };
        let norm = LayerNorm::new(ones(8), None, 1e-5, 8)
            .with_reduction(seg, Arc::new(DoubleStats));
        let got = norm.forward(&rt, &input).unwrap();
        // statistics came from the owned half; the whole width is normalized
        for i in 0..8 {
            assert!((got.get_linear(i) - want.get_linear(i)).abs() < 1e-5, "col {i}");
        }
    }

    #[test]
    fn reduction_built_rms_norm_normalizes_the_full_width() {
        let rt = runtime();
        let data = vec![2.0, -1.0, 0.5, -3.0, 2.0, -1.0, 0.5, -3.0];
        let input = Tensor::from_f32(TensorShape::row(8), data).unwrap();
        let want = RmsNorm::new(ones(8), 1e-5, 8).forward(&rt, &input).unwrap();

        let seg = Segment {
            offset: 4,
            length: 4,
        };
        let norm = RmsNorm::new(ones(8), 1e-5, 8).with_reduction(seg, Arc::new(DoubleStats));
        let got = norm.forward(&rt, &input).unwrap();
        for i in 0..8 {
            assert!((got.get_linear(i) - want.get_linear(i)).abs() < 1e-5, "col {i}");
        }
    }
}
