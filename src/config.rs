//! Model hyperparameters
//!
//! One immutable `Config` shared via `Arc` by every layer. Derived fields
//! (head size, kv width, grouping factor) are computed once at construction
//! and validated there, so layers never re-check divisibility.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{InferirError, Result};
use crate::rope;

/// Nonlinearity applied inside the feed-forward gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationFunction {
    /// Sigmoid-weighted linear unit, `x * sigmoid(x)`
    SiLU,
    /// Gaussian error linear unit (tanh approximation)
    Gelu,
}

impl ActivationFunction {
    /// Applies the nonlinearity
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationFunction::SiLU => x / (1.0 + (-x).exp()),
            ActivationFunction::Gelu => {
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x.powi(3))).tanh())
            }
        }
    }
}

/// Immutable model hyperparameters plus derived attention geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum sequence length
    pub context_length: usize,
    /// Width of the residual stream
    pub embedding_length: usize,
    /// Width of the feed-forward inner projection
    pub hidden_length: usize,
    /// Number of query heads
    pub number_of_heads: usize,
    /// Number of key/value heads (< heads under GQA)
    pub number_of_kv_heads: usize,
    /// Number of decoder layers
    pub number_of_layers: usize,
    /// Epsilon inside norm denominators
    pub norm_eps: f32,
    /// Vocabulary size
    pub vocabulary_size: usize,
    /// Beginning-of-sequence token
    pub bos_token: u32,
    /// End-of-sequence token
    pub eos_token: u32,
    /// Feed-forward nonlinearity
    pub activation: ActivationFunction,
    /// Dense encoding of per-session kv working memory; activations and
    /// accumulation stay f32
    pub working_dtype: DType,
    /// Encoding activations are squeezed into before quantized-weight
    /// projections; `F32` disables the squeeze
    pub working_qtype: DType,

    /// Per-head width, `embedding_length / number_of_heads`
    pub head_size: usize,
    /// Total query width, `number_of_heads * head_size`
    pub attention_length: usize,
    /// Total key/value width, `number_of_kv_heads * head_size`
    pub kv_length: usize,
    /// Query heads sharing one kv head
    pub head_group_size: usize,
    /// True when kv heads are fewer than query heads
    pub is_gqa: bool,

    /// Precomputed `(cos, sin)` rotation table, `pos * head_size/2 + pair`
    pub rope_freqs: Vec<(f32, f32)>,
}

impl Config {
    /// Validates the raw hyperparameters and derives attention geometry.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidConfig`] when the embedding width does
    /// not divide across heads or query heads do not group evenly over kv
    /// heads.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context_length: usize,
        embedding_length: usize,
        hidden_length: usize,
        number_of_heads: usize,
        number_of_kv_heads: usize,
        number_of_layers: usize,
        norm_eps: f32,
        vocabulary_size: usize,
        bos_token: u32,
        eos_token: u32,
        activation: ActivationFunction,
        rope_theta: f64,
        rope_scaling: f64,
    ) -> Result<Self> {
        if number_of_heads == 0 || embedding_length % number_of_heads != 0 {
            return Err(InferirError::InvalidConfig {
                reason: format!(
                    "embedding length {embedding_length} must divide across {number_of_heads} heads"
                ),
            });
        }
        if number_of_kv_heads == 0 || number_of_heads % number_of_kv_heads != 0 {
            return Err(InferirError::InvalidConfig {
                reason: format!(
                    "{number_of_heads} heads must group evenly over {number_of_kv_heads} kv heads"
                ),
            });
        }
        let head_size = embedding_length / number_of_heads;
        let rope_freqs =
            rope::precompute_freqs_cis(head_size, context_length, rope_theta, rope_scaling);
        Ok(Self {
            context_length,
            embedding_length,
            hidden_length,
            number_of_heads,
            number_of_kv_heads,
            number_of_layers,
            norm_eps,
            vocabulary_size,
            bos_token,
            eos_token,
            activation,
            working_dtype: DType::F32,
            working_qtype: DType::F32,
            head_size,
            attention_length: number_of_heads * head_size,
            kv_length: number_of_kv_heads * head_size,
            head_group_size: number_of_heads / number_of_kv_heads,
            is_gqa: number_of_kv_heads < number_of_heads,
            rope_freqs,
        })
    }

    /// Sets the encoding kv rows are stored in.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidConfig`] for block-quantized
    /// encodings; kv rows are staged element-wise and must stay dense.
    pub fn with_working_dtype(mut self, dtype: DType) -> Result<Self> {
        if dtype.is_quantized() {
            return Err(InferirError::InvalidConfig {
                reason: format!("working dtype {dtype} must be a dense encoding"),
            });
        }
        self.working_dtype = dtype;
        Ok(self)
    }

    /// `(cos, sin)` rotation factors for one position, `head_size / 2` pairs
    #[must_use]
    pub fn rope_at(&self, position: usize) -> &[(f32, f32)] {
        let half = self.head_size / 2;
        &self.rope_freqs[position * half..(position + 1) * half]
    }

    /// kv head owning query head `head`
    #[must_use]
    pub fn kv_head_for(&self, head: usize) -> usize {
        head / self.head_group_size
    }
}
