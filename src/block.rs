//! Decoder layer composition
//!
//! A block strings one attention layer and one feed-forward block together
//! with their norms and residual connections:
//!
//! ```text
//! x ─ pre-norm ─ attention ─(+x)─ post-attn norm ─ feed-forward ─(+)─ [post-ff norm]
//! ```
//!
//! Residuals accumulate into the branch outputs, never into the input
//! tensor, so the caller's activation is left untouched. The trailing norm
//! is present only in architectures that carry one.

use crate::attention::CausalSelfAttention;
use crate::error::Result;
use crate::feed_forward::FeedForward;
use crate::kv::KvLayer;
use crate::norm::Norm;
use crate::tensor::cache::PooledTensor;
use crate::tensor::Tensor;
use crate::Runtime;

/// One decoder layer
#[derive(Debug)]
pub struct TransformerBlock {
    layer_index: usize,
    pre_attention_norm: Box<dyn Norm>,
    attention: CausalSelfAttention,
    post_attention_norm: Box<dyn Norm>,
    feed_forward: Box<dyn FeedForward>,
    post_ff_norm: Option<Box<dyn Norm>>,
}

impl TransformerBlock {
    /// Composes a layer without a trailing norm
    #[must_use]
    pub fn new(
        layer_index: usize,
        pre_attention_norm: Box<dyn Norm>,
        attention: CausalSelfAttention,
        post_attention_norm: Box<dyn Norm>,
        feed_forward: Box<dyn FeedForward>,
    ) -> Self {
        Self {
            layer_index,
            pre_attention_norm,
            attention,
            post_attention_norm,
            feed_forward,
            post_ff_norm: None,
        }
    }

    /// Adds the trailing norm some architectures apply after the
    /// feed-forward residual
    #[must_use]
    pub fn with_post_ff_norm(mut self, norm: Box<dyn Norm>) -> Self {
        self.post_ff_norm = Some(norm);
        self
    }

    /// This layer's index in the stack
    #[must_use]
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// Runs the layer for one token.
    ///
    /// # Errors
    ///
    /// Propagates errors from the attention, feed-forward, and norm stages.
    pub fn forward(
        &self,
        rt: &Runtime,
        input: &Tensor,
        position: usize,
        kv: &mut KvLayer<'_>,
    ) -> Result<PooledTensor> {
        let width = input.size();

        let normed = self.pre_attention_norm.forward(rt, input)?;
        let mut attended = self.attention.forward(rt, &normed, position, kv)?;
        drop(normed);
        rt.ops.accumulate(&mut attended, input, 0, width)?;

        let normed = self.post_attention_norm.forward(rt, &attended)?;
        let mut ff = self.feed_forward.forward(rt, &normed)?;
        drop(normed);
        rt.ops.accumulate(&mut ff, &attended, 0, width)?;
        drop(attended);

        match &self.post_ff_norm {
            Some(norm) => norm.forward(rt, &ff),
            None => Ok(ff),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::AttentionBiases;
    use crate::config::{ActivationFunction, Config};
    use crate::dist::DistributedContext;
    use crate::feed_forward::MlpBlock;
    use crate::kv::KvBuffer;
    use crate::norm::RmsNorm;
    use crate::shape::TensorShape;
    use crate::tensor::Weight;
    use std::sync::Arc;

    fn config() -> Arc<Config> {
        Arc::new(
            Config::new(
                4,
                4,
                8,
                2,
                2,
                1,
                1e-5,
                16,
                0,
                1,
                ActivationFunction::SiLU,
                10000.0,
                1.0,
            )
            .unwrap(),
        )
    }

    fn zeros(rows: usize, cols: usize) -> Weight {
        Weight::Dense(Arc::new(
            Tensor::zeros(
                crate::dtype::DType::F32,
                TensorShape::of(&[rows, cols]).unwrap(),
            )
            .unwrap(),
        ))
    }

    fn ones_gain(n: usize) -> Arc<Tensor> {
        Arc::new(Tensor::from_f32(TensorShape::row(n), vec![1.0; n]).unwrap())
    }

    fn zero_block(config: &Arc<Config>, dist: &Arc<DistributedContext>) -> TransformerBlock {
        let attention = CausalSelfAttention::new(
            Arc::clone(config),
            Arc::clone(dist),
            zeros(4, 4),
            zeros(4, 4),
            zeros(4, 4),
            zeros(4, 4),
            AttentionBiases::default(),
        );
        let mlp = MlpBlock::new(
            Arc::clone(config),
            Arc::clone(dist),
            zeros(8, 4),
            None,
            zeros(4, 8),
        );
        TransformerBlock::new(
            0,
            Box::new(RmsNorm::new(ones_gain(4), 1e-5, 4)),
            attention,
            Box::new(RmsNorm::new(ones_gain(4), 1e-5, 4)),
            Box::new(mlp),
        )
    }

    #[test]
    fn zero_weights_reduce_to_residual_identity() {
        let rt = Runtime::reference();
        let config = config();
        let dist = Arc::new(DistributedContext::builder().build(&config).unwrap());
        let block = zero_block(&config, &dist);
        let mut kv = KvBuffer::new(1, 4, 4, crate::dtype::DType::F32).unwrap();
        let input =
            Tensor::from_f32(TensorShape::row(4), vec![1.0, -2.0, 3.0, -4.0]).unwrap();
        let out = block
            .forward(&rt, &input, 0, &mut kv.layer_mut(0))
            .unwrap();
        for i in 0..4 {
            assert!((out.get_linear(i) - input.get_linear(i)).abs() < 1e-5);
        }
    }

    #[test]
    fn post_ff_norm_is_applied_when_present() {
        let rt = Runtime::reference();
        let config = config();
        let dist = Arc::new(DistributedContext::builder().build(&config).unwrap());
        let block = zero_block(&config, &dist)
            .with_post_ff_norm(Box::new(RmsNorm::new(ones_gain(4), 1e-5, 4)));
        let mut kv = KvBuffer::new(1, 4, 4, crate::dtype::DType::F32).unwrap();
        let input = Tensor::from_f32(TensorShape::row(4), vec![2.0, 2.0, -2.0, -2.0]).unwrap();
        let out = block
            .forward(&rt, &input, 0, &mut kv.layer_mut(0))
            .unwrap();
        // residual passthrough has rms 2, trailing norm brings it to ±1
        for i in 0..4 {
            assert!((out.get_linear(i).abs() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn input_is_left_untouched() {
        let rt = Runtime::reference();
        let config = config();
        let dist = Arc::new(DistributedContext::builder().build(&config).unwrap());
        let block = zero_block(&config, &dist);
        let mut kv = KvBuffer::new(1, 4, 4, crate::dtype::DType::F32).unwrap();
        let input = Tensor::from_f32(TensorShape::row(4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let _ = block
            .forward(&rt, &input, 0, &mut kv.layer_mut(0))
            .unwrap();
        assert_eq!(input.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
