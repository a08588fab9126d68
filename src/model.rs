//! Model driver: embedding, layer stack, logits, sampling, generation
//!
//! The driver owns the runtime (kernel backend + scratch cache), the weight
//! stack, and the per-session kv registry. `generate` feeds the prompt,
//! then runs the autoregressive loop: logits → sample → decode → forward,
//! stopping on the end-of-sequence token or the token budget.
//!
//! Sampling takes an explicit uniform value so the distribution walk is
//! deterministic under test; `generate` draws from `thread_rng`.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use uuid::Uuid;

use serde::{Deserialize, Serialize};

use crate::block::TransformerBlock;
use crate::config::Config;
use crate::dist::DistributedContext;
use crate::error::{InferirError, Result};
use crate::kv::{KvBuffer, KvBufferCache};
use crate::norm::{Norm, RmsNorm};
use crate::ops;
use crate::tensor::cache::PooledTensor;
use crate::tensor::{Tensor, Weight};
use crate::weights::{TokenDecoder, WeightSource};
use crate::Runtime;

use crate::attention::{AttentionBiases, CausalSelfAttention};
use crate::feed_forward::MlpBlock;

/// Why a generation loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The token budget (or context capacity) was exhausted
    MaxTokens,
    /// The model produced the end-of-sequence token
    StopToken,
}

/// The outcome of one `generate` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Concatenated decoded fragments
    pub text: String,
    /// Why the loop stopped
    pub finish_reason: FinishReason,
    /// Tokens fed from the prompt (including an appended EOS)
    pub prompt_tokens: usize,
    /// Tokens produced by sampling (the stop token is not counted)
    pub generated_tokens: usize,
    /// Milliseconds spent feeding the prompt
    pub prompt_time_ms: u64,
    /// Milliseconds spent in the autoregressive loop
    pub generate_time_ms: u64,
}

/// A complete decoder-only transformer
pub struct Model {
    runtime: Runtime,
    config: Arc<Config>,
    dist: Arc<DistributedContext>,
    embedding: Weight,
    blocks: Vec<TransformerBlock>,
    final_norm: Box<dyn Norm>,
    output: Weight,
    kv_cache: KvBufferCache,
    decoder: Box<dyn TokenDecoder>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("layers", &self.blocks.len())
            .field("vocabulary", &self.config.vocabulary_size)
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Assembles a model from already constructed parts
    #[must_use]
    pub fn new(
        runtime: Runtime,
        config: Arc<Config>,
        dist: Arc<DistributedContext>,
        embedding: Weight,
        blocks: Vec<TransformerBlock>,
        final_norm: Box<dyn Norm>,
        output: Weight,
        decoder: Box<dyn TokenDecoder>,
    ) -> Self {
        let kv_cache = KvBufferCache::new(Arc::clone(&config));
        Self {
            runtime,
            config,
            dist,
            embedding,
            blocks,
            final_norm,
            output,
            kv_cache,
            decoder,
        }
    }

    /// Builds a llama-family model from a weight source using the standard
    /// checkpoint names (`model.layers.N.self_attn.q_proj.weight`, ...).
    /// The logits projection falls back to the tied embedding when
    /// `lm_head.weight` is absent.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::MissingWeight`] for any absent tensor.
    pub fn load_llama(
        source: &dyn WeightSource,
        runtime: Runtime,
        config: Arc<Config>,
        dist: Arc<DistributedContext>,
        decoder: Box<dyn TokenDecoder>,
    ) -> Result<Self> {
        let embedding = Weight::Dense(source.tensor("model.embed_tokens.weight")?);
        let eps = config.norm_eps;
        let width = config.embedding_length;
        // Sharded builds fold per-shard norm statistics through the
        // injected reducer; each norm owns this shard's embedding columns.
        let rms = |gain: Arc<Tensor>| {
            let norm = RmsNorm::new(gain, eps, width);
            match dist.norm_reducer() {
                Some(r) => norm.with_reduction(dist.embedding_segment, r),
                None => norm,
            }
        };

        let mut blocks = Vec::with_capacity(dist.layer_range.len());
        for layer in dist.layer_range.clone() {
            let p = format!("model.layers.{layer}.");
            let attention = CausalSelfAttention::new(
                Arc::clone(&config),
                Arc::clone(&dist),
                Weight::Dense(source.tensor(&format!("{p}self_attn.q_proj.weight"))?),
                Weight::Dense(source.tensor(&format!("{p}self_attn.k_proj.weight"))?),
                Weight::Dense(source.tensor(&format!("{p}self_attn.v_proj.weight"))?),
                Weight::Dense(source.tensor(&format!("{p}self_attn.o_proj.weight"))?),
                AttentionBiases::default(),
            );
            let mlp = MlpBlock::new(
                Arc::clone(&config),
                Arc::clone(&dist),
                Weight::Dense(source.tensor(&format!("{p}mlp.gate_proj.weight"))?),
                Some(Weight::Dense(source.tensor(&format!("{p}mlp.up_proj.weight"))?)),
                Weight::Dense(source.tensor(&format!("{p}mlp.down_proj.weight"))?),
            );
            blocks.push(TransformerBlock::new(
                layer,
                Box::new(rms(source.tensor(&format!("{p}input_layernorm.weight"))?)),
                attention,
                Box::new(rms(source.tensor(
                    &format!("{p}post_attention_layernorm.weight"),
                )?)),
                Box::new(mlp),
            ));
        }

        let final_norm = Box::new(rms(source.tensor("model.norm.weight")?));
        let output = if source.contains("lm_head.weight") {
            Weight::Dense(source.tensor("lm_head.weight")?)
        } else {
            embedding.clone()
        };
        Ok(Self::new(
            runtime, config, dist, embedding, blocks, final_norm, output, decoder,
        ))
    }

    /// The model geometry
    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The shard view this model instance runs under
    #[must_use]
    pub fn dist(&self) -> &Arc<DistributedContext> {
        &self.dist
    }

    /// Looks up a token's embedding row as an f32 activation
    ///
    /// # Errors
    ///
    /// Propagates scratch-allocation failures.
    pub fn embed(&self, token: u32) -> Result<PooledTensor> {
        let mut out = self
            .runtime
            .cache
            .acquire_row(self.config.embedding_length)?;
        let (tensor, row) = self.embedding.resolve(token as usize);
        let width = self.embedding.cols();
        tensor.decode_range(
            row * width,
            out.as_f32_mut()
                .unwrap_or_else(|| unreachable!("scratch is f32")),
        );
        Ok(out)
    }

    /// Runs one token through the shard's layer stack
    ///
    /// # Errors
    ///
    /// Propagates layer errors.
    pub fn forward(
        &self,
        token: u32,
        position: usize,
        kv: &mut KvBuffer,
    ) -> Result<PooledTensor> {
        let mut x = self.embed(token)?;
        for block in &self.blocks {
            let mut layer = kv.layer_mut(block.layer_index());
            x = block.forward(&self.runtime, &x, position, &mut layer)?;
        }
        kv.advance(position);
        Ok(x)
    }

    /// Projects a final activation to vocabulary logits
    ///
    /// # Errors
    ///
    /// Propagates kernel errors.
    pub fn logits(&self, x: &PooledTensor) -> Result<Vec<f32>> {
        let normed = self.final_norm.forward(&self.runtime, x)?;
        let mut logits = vec![0.0f32; self.config.vocabulary_size];
        ops::matvec(
            &self.runtime.ops,
            &normed,
            &self.output,
            0..self.config.vocabulary_size,
            &mut logits,
        )?;
        Ok(logits)
    }

    /// Autoregressive generation for one session.
    ///
    /// `use_eos` appends the end-of-sequence token to the prompt. The loop
    /// always stops when the model emits EOS, and otherwise at `max_tokens`
    /// or the context boundary. `on_token` observes each decoded fragment
    /// with the running milliseconds-per-token figure.
    ///
    /// # Errors
    ///
    /// Rejects an empty prompt and propagates forward-pass errors.
    pub fn generate(
        &self,
        session: Uuid,
        prompt: &[u32],
        temperature: f32,
        max_tokens: usize,
        use_eos: bool,
        mut on_token: impl FnMut(&str, f64),
    ) -> Result<GenerationResult> {
        let mut tokens = prompt.to_vec();
        if use_eos {
            tokens.push(self.config.eos_token);
        }
        if tokens.is_empty() {
            return Err(InferirError::InvalidConfig {
                reason: "generation requires a non-empty prompt".to_string(),
            });
        }

        let buffer = self.kv_cache.get(session)?;
        let mut kv = buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = kv.written();

        let prompt_started = Instant::now();
        let mut last = None;
        for (i, &token) in tokens.iter().enumerate() {
            let position = start + i;
            self.kv_cache.check_position(position)?;
            last = Some(self.forward(token, position, &mut kv)?);
        }
        let mut last = last.unwrap_or_else(|| unreachable!("prompt is non-empty"));
        let prompt_time_ms = prompt_started.elapsed().as_millis() as u64;

        let mut rng = rand::thread_rng();
        let mut text = String::new();
        let mut generated = 0usize;
        let mut finish_reason = FinishReason::MaxTokens;
        let generate_started = Instant::now();

        while generated < max_tokens {
            let mut logits = self.logits(&last)?;
            let next = sample(&mut logits, temperature, rng.gen::<f32>()) as u32;
            if next == self.config.eos_token {
                finish_reason = FinishReason::StopToken;
                break;
            }

            let position = start + tokens.len() + generated;
            if self.kv_cache.check_position(position).is_err() {
                break;
            }

            generated += 1;
            let fragment = self.decoder.decode(next);
            let ms_per_token =
                generate_started.elapsed().as_millis() as f64 / generated as f64;
            on_token(&fragment, ms_per_token);
            text.push_str(&fragment);

            last = self.forward(next, position, &mut kv)?;
        }
        let generate_time_ms = generate_started.elapsed().as_millis() as u64;

        tracing::info!(
            prompt_tokens = tokens.len(),
            generated,
            prompt_time_ms,
            generate_time_ms,
            "generation finished"
        );

        Ok(GenerationResult {
            text,
            finish_reason,
            prompt_tokens: tokens.len(),
            generated_tokens: generated,
            prompt_time_ms,
            generate_time_ms,
        })
    }
}

/// Picks a token from logits.
///
/// Temperature 0 is greedy argmax. Otherwise the logits are divided by the
/// temperature, softmaxed in place, and walked as a CDF against `uniform`
/// (in `[0, 1)`).
#[must_use]
pub fn sample(logits: &mut [f32], temperature: f32, uniform: f32) -> usize {
    if temperature == 0.0 {
        return ops::argmax(logits);
    }
    for v in logits.iter_mut() {
        *v /= temperature;
    }
    ops::softmax_in_place(logits);
    let mut acc = 0.0f32;
    for (i, &p) in logits.iter().enumerate() {
        acc += p;
        if uniform < acc {
            return i;
        }
    }
    logits.len() - 1
}
