//! Causal self-attention with rotary positions and grouped-query heads
//!
//! The forward pass for one token at `position`:
//! 1. project the activation into query/key/value rows owned by this shard,
//! 2. add projection biases within the owned ranges,
//! 3. rotate the query and the new key in half-dimension pairs (RoPE),
//! 4. stage the rotated key and the value rows into the session's kv
//!    buffer, re-encoded to the buffer's working dtype,
//! 5. score the query against every cached key position in parallel,
//! 6. fold positions in order through the online softmax, head by head,
//! 7. project the attended values back to the residual width.
//!
//! The fold keeps a running maximum `m` and mass `l` so attention weights
//! never materialize: a new maximum rescales the accumulated value vector by
//! `exp(m_old - s)` and absorbs the new row at weight 1 (`sxpby`); otherwise
//! the row is absorbed scaled by `exp(s - m)` (`saxpy`). The final vector is
//! scaled by `1/l`. Scores are precomputed in parallel; the fold itself is
//! order-dependent and stays sequential.

use std::sync::Arc;

use crate::config::Config;
use crate::dist::DistributedContext;
use crate::error::Result;
use crate::kv::KvLayer;
use crate::ops;
use crate::parallel;
use crate::tensor::cache::PooledTensor;
use crate::tensor::{Tensor, Weight};
use crate::Runtime;

/// One attention layer's weights and shard view
#[derive(Debug)]
pub struct CausalSelfAttention {
    config: Arc<Config>,
    dist: Arc<DistributedContext>,
    query: Weight,
    key: Weight,
    value: Weight,
    query_bias: Option<Arc<Tensor>>,
    key_bias: Option<Arc<Tensor>>,
    value_bias: Option<Arc<Tensor>>,
    output: Weight,
    output_bias: Option<Arc<Tensor>>,
    attention_scale: f32,
}

/// Projection biases, all optional
#[derive(Debug, Default)]
pub struct AttentionBiases {
    /// Added to the query projection
    pub query: Option<Arc<Tensor>>,
    /// Added to the key projection
    pub key: Option<Arc<Tensor>>,
    /// Added to the value projection
    pub value: Option<Arc<Tensor>>,
    /// Added after the output projection
    pub output: Option<Arc<Tensor>>,
}

impl CausalSelfAttention {
    /// Builds the layer. Query and output weights span the attention width;
    /// key/value weights span the kv width (reduced under GQA).
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        dist: Arc<DistributedContext>,
        query: Weight,
        key: Weight,
        value: Weight,
        output: Weight,
        biases: AttentionBiases,
    ) -> Self {
        let attention_scale = 1.0 / (config.head_size as f32).sqrt();
        Self {
            config,
            dist,
            query,
            key,
            value,
            query_bias: biases.query,
            key_bias: biases.key,
            value_bias: biases.value,
            output,
            output_bias: biases.output,
            attention_scale,
        }
    }

    /// Attends the single activation `input` (`[1, embedding]`) at
    /// `position`, reading and extending `kv`.
    ///
    /// # Errors
    ///
    /// Propagates kernel dtype mismatches and scratch-allocation failures.
    pub fn forward(
        &self,
        rt: &Runtime,
        input: &Tensor,
        position: usize,
        kv: &mut KvLayer<'_>,
    ) -> Result<PooledTensor> {
        let c = &self.config;
        let d = &self.dist;
        let head_size = c.head_size;
        let half = head_size / 2;

        // Shard-restricted Q/K/V projection. The activation may be squeezed
        // into the working quantized encoding before the big matvecs.
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

        let mut query = rt.cache.acquire_row(c.attention_length)?;
        let mut key = rt.cache.acquire_row(c.kv_length)?;
        let mut value = rt.cache.acquire_row(c.kv_length)?;

        let aseg = d.attention_segment;
        let kseg = d.kv_segment;
        ops::matvec(
            &rt.ops,
            x,
            &self.query,
            aseg.range(),
            &mut query.as_f32_mut().unwrap_or_else(|| unreachable!("scratch is f32"))
                [aseg.range()],
        )?;
        ops::matvec(
            &rt.ops,
            x,
            &self.key,
            kseg.range(),
            &mut key.as_f32_mut().unwrap_or_else(|| unreachable!("scratch is f32"))
                [kseg.range()],
        )?;
        ops::matvec(
            &rt.ops,
            x,
            &self.value,
            kseg.range(),
            &mut value.as_f32_mut().unwrap_or_else(|| unreachable!("scratch is f32"))
                [kseg.range()],
        )?;

        if let Some(b) = &self.query_bias {
            rt.ops.accumulate(&mut query, b, aseg.offset, aseg.length)?;
        }
        if let Some(b) = &self.key_bias {
            rt.ops.accumulate(&mut key, b, kseg.offset, kseg.length)?;
        }
        if let Some(b) = &self.value_bias {
            rt.ops.accumulate(&mut value, b, kseg.offset, kseg.length)?;
        }

        // RoPE over owned heads, pairs (i, i + head_size/2). The key rotates
        // in scratch before staging, so cached rows always hold rotated keys
        // in the buffer's own encoding.
        let rope = c.rope_at(position);
        {
            let q = query
                .as_f32_mut()
                .unwrap_or_else(|| unreachable!("scratch is f32"));
            for h in d.head_range.clone() {
                rotate_head(&mut q[h * head_size..(h + 1) * head_size], rope, half);
            }
        }
        {
            let k = key
                .as_f32_mut()
                .unwrap_or_else(|| unreachable!("scratch is f32"));
            for g in d.kv_head_range.clone() {
                rotate_head(&mut k[g * head_size..(g + 1) * head_size], rope, half);
            }
        }

        let key_base = kv.key_offset(position);
        let value_base = kv.value_offset(position);
        kv.tensor_mut()
            .copy_from(&key, kseg.offset, key_base + kseg.offset, kseg.length)?;
        kv.tensor_mut()
            .copy_from(&value, kseg.offset, value_base + kseg.offset, kseg.length)?;

        // Score every cached position per owned head, in parallel
        let heads = d.head_range.clone();
        let head_count = heads.len();
        let positions = position + 1;
        let key0 = kv.key_offset(0);
        let kv_width = kv.kv_length();
        let kv_tensor: &Tensor = kv.tensor();
        let q_ref: &Tensor = &query;
        let scale = self.attention_scale;
        let scores = parallel::pmap(head_count * positions, |i| {
            let h = heads.start + i / positions;
            let t = i % positions;
            let g = c.kv_head_for(h);
            rt.ops
                .dot_product(
                    q_ref,
                    kv_tensor,
                    h * head_size,
                    key0 + t * kv_width + g * head_size,
                    head_size,
                )
                .map(|s| s * scale)
        });
        let mut score = vec![0.0f32; head_count * positions];
        for (s, r) in score.iter_mut().zip(scores) {
            *s = r?;
        }

        // Sequential online-softmax fold per head
        let mut attended = rt.cache.acquire_row(c.attention_length)?;
        for (hi, h) in d.head_range.clone().enumerate() {
            let g = c.kv_head_for(h);
            let out_off = h * head_size;
            let row = &score[hi * positions..(hi + 1) * positions];

            let mut max = row[0];
            let mut mass = 1.0f32;
            rt.ops.saxpy(
                1.0,
                kv.tensor(),
                &mut attended,
                kv.value_offset(0) + g * head_size,
                out_off,
                head_size,
            )?;
            for t in 1..positions {
                let s = row[t];
                let v_off = kv.value_offset(t) + g * head_size;
                if s > max {
                    let e = (max - s).exp();
                    rt.ops
                        .sxpby(e, kv.tensor(), &mut attended, v_off, out_off, head_size)?;
                    mass = 1.0 + e * mass;
                    max = s;
                } else {
                    let e = (s - max).exp();
                    rt.ops
                        .saxpy(e, kv.tensor(), &mut attended, v_off, out_off, head_size)?;
                    mass += e;
                }
            }
            rt.ops.scale(1.0 / mass, &mut attended, out_off, head_size)?;
        }

        // Output projection over the shard's embedding rows
        let squeezed_att;
        let att: &Tensor = if c.working_qtype.is_quantized()
            && attended.size() % c.working_qtype.block_size() == 0
        {
            squeezed_att = rt.ops.quantize(&attended, c.working_qtype)?;
            &squeezed_att
        } else {
            &attended
        };
        // Every embedding row is a partial sum over this shard's attention
        // columns (the weight rows carry the sparse window); the reducer
        // combines partials across shards before the bias lands.
        let mut out = rt.cache.acquire_row(c.embedding_length)?;
        ops::matvec(
            &rt.ops,
            att,
            &self.output,
            0..c.embedding_length,
            out.as_f32_mut().unwrap_or_else(|| unreachable!("scratch is f32")),
        )?;
        if let Some(r) = d.tensor_reducer() {
            r.reduce(&mut [&mut out])?;
        }
        if let Some(b) = &self.output_bias {
            rt.ops.accumulate(&mut out, b, 0, c.embedding_length)?;
        }
        Ok(out)
    }
}

/// Rotates one head's slice in half-dimension pairs
fn rotate_head(head: &mut [f32], rope: &[(f32, f32)], half: usize) {
    for i in 0..half {
        let (cos, sin) = rope[i];
        let a = head[i];
        let b = head[i + half];
        head[i] = a * cos - b * sin;
        head[i + half] = a * sin + b * cos;
    }
}
