//! Feed-forward blocks: dense MLP and mixture-of-experts
//!
//! The MLP computes `down(act(gate(x)) ⊙ up(x))`; the up branch and every
//! bias are optional. Under tensor parallelism the gate/up rows are sharded
//! by hidden index, the down projection produces full-width partials over
//! the owned hidden columns, and the injected reducer combines them.
//!
//! The MoE block routes each token through a fixed number of experts: score
//! every expert with the router matrix, softmax, take the top K with a
//! deterministic linear scan, run the dense MLP of each selected expert, and
//! sum the raw expert outputs.

use std::sync::Arc;

use crate::config::{ActivationFunction, Config};
use crate::dist::DistributedContext;
use crate::error::Result;
use crate::ops;
use crate::tensor::cache::PooledTensor;
use crate::tensor::{Tensor, Weight};
use crate::Runtime;

/// A feed-forward block applied to one normalized activation
pub trait FeedForward: Send + Sync + std::fmt::Debug {
    /// Transforms `input` (`[1, embedding]`) into a residual-width output
    ///
    /// # Errors
    ///
    /// Propagates kernel dtype mismatches and scratch-allocation failures.
    fn forward(&self, rt: &Runtime, input: &Tensor) -> Result<PooledTensor>;
}

/// Dense gated MLP
#[derive(Debug)]
pub struct MlpBlock {
    config: Arc<Config>,
    dist: Arc<DistributedContext>,
    activation: ActivationFunction,
    gate: Weight,
    gate_bias: Option<Arc<Tensor>>,
    up: Option<Weight>,
    up_bias: Option<Arc<Tensor>>,
    down: Weight,
    down_bias: Option<Arc<Tensor>>,
}

impl MlpBlock {
    /// Builds the block. `gate`/`up` span `hidden x embedding`; `down`
    /// spans `embedding x hidden`.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        dist: Arc<DistributedContext>,
        gate: Weight,
        up: Option<Weight>,
        down: Weight,
    ) -> Self {
        let activation = config.activation;
        Self {
            config,
            dist,
            activation,
            gate,
            gate_bias: None,
            up,
            up_bias: None,
            down,
            down_bias: None,
        }
    }

    /// Attaches projection biases
    #[must_use]
    pub fn with_biases(
        mut self,
        gate_bias: Option<Arc<Tensor>>,
        up_bias: Option<Arc<Tensor>>,
        down_bias: Option<Arc<Tensor>>,
    ) -> Self {
        self.gate_bias = gate_bias;
        self.up_bias = up_bias;
        self.down_bias = down_bias;
        self
    }
}

impl FeedForward for MlpBlock {
    fn forward(&self, rt: &Runtime, input: &Tensor) -> Result<PooledTensor> {
        let c = &self.config;
        let d = &self.dist;
        let hseg = d.hidden_segment;

        let squeezed;
        let x: &Tensor = if c.working_qtype.is_quantized()
            && c.working_qtype != input.dtype()
            && input.size() % c.working_qtype.block_size() == 0
        {
            squeezed = rt.ops.quantize(input, c.working_qtype)?;
            &squeezed
        } else {
            input
        };

        let mut hidden = rt.cache.acquire_row(c.hidden_length)?;
        ops::matvec(
            &rt.ops,
            x,
            &self.gate,
            hseg.range(),
            &mut hidden
                .as_f32_mut()
                .unwrap_or_else(|| unreachable!("scratch is f32"))[hseg.range()],
        )?;
        if let Some(b) = &self.gate_bias {
            rt.ops.accumulate(&mut hidden, b, hseg.offset, hseg.length)?;
        }
        {
            let h = hidden
                .as_f32_mut()
                .unwrap_or_else(|| unreachable!("scratch is f32"));
            for v in &mut h[hseg.range()] {
                *v = self.activation.apply(*v);
            }
        }

        if let Some(up) = &self.up {
            let mut up_out = rt.cache.acquire_row(c.hidden_length)?;
            ops::matvec(
                &rt.ops,
                x,
                up,
                hseg.range(),
                &mut up_out
                    .as_f32_mut()
                    .unwrap_or_else(|| unreachable!("scratch is f32"))[hseg.range()],
            )?;
            if let Some(b) = &self.up_bias {
                rt.ops.accumulate(&mut up_out, b, hseg.offset, hseg.length)?;
            }
            rt.ops
                .maccumulate(&mut hidden, &up_out, hseg.offset, hseg.length)?;
        }

        let squeezed_h;
        let h: &Tensor = if c.working_qtype.is_quantized()
            && hidden.size() % c.working_qtype.block_size() == 0
        {
            squeezed_h = rt.ops.quantize(&hidden, c.working_qtype)?;
            &squeezed_h
        } else {
            &hidden
        };
        let mut out = rt.cache.acquire_row(c.embedding_length)?;
        ops::matvec(
            &rt.ops,
            h,
            &self.down,
            0..c.embedding_length,
            out.as_f32_mut()
                .unwrap_or_else(|| unreachable!("scratch is f32")),
        )?;
        if let Some(r) = d.tensor_reducer() {
            r.reduce(&mut [&mut out])?;
        }
        if let Some(b) = &self.down_bias {
            rt.ops.accumulate(&mut out, b, 0, c.embedding_length)?;
        }
        Ok(out)
    }
}

/// Mixture-of-experts block: router plus dense expert MLPs
#[derive(Debug)]
pub struct MoeBlock {
    config: Arc<Config>,
    router: Weight,
    experts: Vec<MlpBlock>,
    experts_per_token: usize,
}

impl MoeBlock {
    /// Builds the block. `router` spans `num_experts x embedding`; each
    /// expert is a full dense MLP.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        router: Weight,
        experts: Vec<MlpBlock>,
        experts_per_token: usize,
    ) -> Self {
        Self {
            config,
            router,
            experts,
            experts_per_token,
        }
    }
}

impl FeedForward for MoeBlock {
    fn forward(&self, rt: &Runtime, input: &Tensor) -> Result<PooledTensor> {
        let mut scores = vec![0.0f32; self.experts.len()];
        ops::matvec(&rt.ops, input, &self.router, 0..self.experts.len(), &mut scores)?;
        ops::softmax_in_place(&mut scores);
        let selected = top_k_indices(&scores, self.experts_per_token);
        tracing::trace!(?selected, "moe routing");

        let mut out = rt.cache.acquire_row(self.config.embedding_length)?;
        for idx in selected {
            let expert_out = self.experts[idx].forward(rt, input)?;
            rt.ops
                .accumulate(&mut out, &expert_out, 0, self.config.embedding_length)?;
        }
        Ok(out)
    }
}

/// Indices of the `k` largest scores, found by one left-to-right scan.
///
/// While full, the current minimum is replaced only by a strictly greater
/// score; among equal minima the earliest-found one gives way first. The
/// result preserves discovery order, so routing is deterministic for tied
/// scores.
#[must_use]
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut best: Vec<usize> = Vec::with_capacity(k);
    for (i, &s) in scores.iter().enumerate() {
        if best.len() < k {
            best.push(i);
            continue;
        }
        let mut min_slot = 0;
        for slot in 1..best.len() {
            if scores[best[slot]] < scores[best[min_slot]] {
                min_slot = slot;
            }
        }
        if s > scores[best[min_slot]] {
            best[min_slot] = i;
        }
    }
    best
}
