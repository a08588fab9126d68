//! # Inferir
//!
//! A transformer inference core: multi-precision tensors over
//! block-quantized storage, pluggable CPU kernel backends, and the full
//! decoder forward pass — causal attention with rotary positions and
//! grouped-query heads, gated MLP and mixture-of-experts feed-forward,
//! per-session KV buffers, and greedy / temperature sampling.
//!
//! ## Design
//!
//! - **Storage is a closed enum**: f32/f16/bf16 dense plus three
//!   block-quantized encodings (i8, q4, q5). All arithmetic decodes to f32.
//! - **Kernels behind a trait**: [`ops::TensorOperations`] is probed once at
//!   startup (native intrinsics → portable chunked → scalar reference) and
//!   passed by handle; there is no global backend.
//! - **Scratch is pooled**: layers draw zeroed buffers from a
//!   [`tensor::cache::TensorCache`] through scope guards.
//! - **Sharding is arithmetic**: a [`dist::DistributedContext`] gives each
//!   shard exact segments of every axis; cross-shard reduction is an
//!   injected trait, never a transport.
//!
//! ## Example
//!
//! ```rust
//! use inferir::{Runtime, tensor::Tensor, shape::TensorShape, dtype::DType};
//!
//! let rt = Runtime::probe();
//! let a = Tensor::from_f32(TensorShape::row(64), vec![0.5; 64]).unwrap();
//! let q = a.to_dtype(DType::Q4).unwrap();
//! let d = rt.ops.dot_product(&a, &q, 0, 0, 64).unwrap();
//! assert!((d - 16.0).abs() < 0.5);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod attention;
pub mod block;
pub mod config;
pub mod dist;
pub mod dtype;
pub mod error;
pub mod feed_forward;
pub mod kv;
pub mod model;
pub mod norm;
pub mod ops;
pub mod parallel;
pub mod rope;
pub mod shape;
pub mod tensor;
pub mod weights;

use std::sync::Arc;

pub use error::{InferirError, Result};

use ops::TensorOperations;
use tensor::cache::TensorCache;

/// The pair every layer needs: a kernel backend and a scratch pool
#[derive(Debug, Clone)]
pub struct Runtime {
    /// The probed kernel backend
    pub ops: Arc<dyn TensorOperations>,
    /// The shared scratch-tensor pool
    pub cache: Arc<TensorCache>,
}

impl Runtime {
    /// Builds a runtime from explicit parts
    #[must_use]
    pub fn new(ops: Arc<dyn TensorOperations>, cache: Arc<TensorCache>) -> Self {
        Self { ops, cache }
    }

    /// Probes the best available backend and uses a default-budget pool
    #[must_use]
    pub fn probe() -> Self {
        Self::new(ops::probe_backend(), Arc::new(TensorCache::default()))
    }

    /// The scalar reference backend with a default-budget pool; the parity
    /// oracle for tests
    #[must_use]
    pub fn reference() -> Self {
        Self::new(ops::reference_backend(), Arc::new(TensorCache::default()))
    }
}
