//! Per-session key/value buffers
//!
//! One persistent tensor per generation session, shaped
//! `(layers, 2, context, kv_length)` in the configured working encoding and
//! keyed by a session id. The buffer is created at full capacity so growth
//! never reallocates mid-generation. Rows are staged element-wise, so half
//! precision halves the footprint at the cost of per-row rounding.
//! A session runs one forward pass at a time; the registry hands out the
//! buffer behind a mutex and the pass holds the lock for its duration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::config::Config;
use crate::dtype::DType;
use crate::error::{InferirError, Result};
use crate::shape::TensorShape;
use crate::tensor::Tensor;

/// Key/value history for one session
#[derive(Debug)]
pub struct KvBuffer {
    tensor: Tensor,
    context: usize,
    kv_length: usize,
    written: usize,
}

impl KvBuffer {
    /// Allocates a zeroed buffer covering `layers` layers at full context;
    /// `dtype` is the dense working encoding rows are staged into
    ///
    /// # Errors
    ///
    /// Propagates allocation shape errors.
    pub fn new(layers: usize, context: usize, kv_length: usize, dtype: DType) -> Result<Self> {
        let shape = TensorShape::of(&[layers, 2, context, kv_length])?;
        Ok(Self {
            tensor: Tensor::zeros(dtype, shape)?,
            context,
            kv_length,
            written: 0,
        })
    }

    /// Tokens written so far
    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Records that `position` has been written
    pub fn advance(&mut self, position: usize) {
        self.written = self.written.max(position + 1);
    }

    /// Forgets the history; storage stays allocated
    pub fn reset(&mut self) {
        self.tensor.fill_zero();
        self.written = 0;
    }

    /// Mutable view of one layer's key/value slab
    #[must_use]
    pub fn layer_mut(&mut self, layer: usize) -> KvLayer<'_> {
        let base = layer * 2 * self.context * self.kv_length;
        KvLayer {
            tensor: &mut self.tensor,
            base,
            context: self.context,
            kv_length: self.kv_length,
        }
    }
}

/// One layer's slice of a [`KvBuffer`]
#[derive(Debug)]
pub struct KvLayer<'a> {
    tensor: &'a mut Tensor,
    base: usize,
    context: usize,
    kv_length: usize,
}

impl KvLayer<'_> {
    /// The backing tensor, for kernel reads
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        self.tensor
    }

    /// The backing tensor, for staging writes
    pub fn tensor_mut(&mut self) -> &mut Tensor {
        self.tensor
    }

    /// kv row width
    #[must_use]
    pub fn kv_length(&self) -> usize {
        self.kv_length
    }

    /// Linear offset of the key row at `position`
    #[must_use]
    pub fn key_offset(&self, position: usize) -> usize {
        debug_assert!(position < self.context);
        self.base + position * self.kv_length
    }

    /// Linear offset of the value row at `position`
    #[must_use]
    pub fn value_offset(&self, position: usize) -> usize {
        debug_assert!(position < self.context);
        self.base + (self.context + position) * self.kv_length
    }
}

/// Session-keyed registry of kv buffers
#[derive(Debug)]
pub struct KvBufferCache {
    config: Arc<Config>,
    buffers: Mutex<HashMap<Uuid, Arc<Mutex<KvBuffer>>>>,
}

impl KvBufferCache {
    /// Creates an empty registry for models of the given geometry
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session's buffer, creating it at full capacity on first
    /// use.
    ///
    /// # Errors
    ///
    /// Propagates allocation errors for new sessions.
    pub fn get(&self, session: Uuid) -> Result<Arc<Mutex<KvBuffer>>> {
        let mut buffers = self
            .buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(buf) = buffers.get(&session) {
            return Ok(Arc::clone(buf));
        }
        tracing::debug!(%session, "allocating kv buffer");
        let buf = Arc::new(Mutex::new(KvBuffer::new(
            self.config.number_of_layers,
            self.config.context_length,
            self.config.kv_length,
            self.config.working_dtype,
        )?));
        buffers.insert(session, Arc::clone(&buf));
        Ok(buf)
    }

    /// Drops a session's history
    pub fn evict(&self, session: Uuid) {
        let mut buffers = self
            .buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffers.remove(&session);
    }

    /// Number of live sessions
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Fails when `position` would run past the configured context
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::ContextOverflow`].
    pub fn check_position(&self, position: usize) -> Result<()> {
        if position >= self.config.context_length {
            return Err(InferirError::ContextOverflow {
                position,
                context_length: self.config.context_length,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivationFunction;

    fn config() -> Arc<Config> {
        Arc::new(
            Config::new(
                8,
                16,
                32,
                4,
                2,
                2,
                1e-5,
                32,
                1,
                2,
                ActivationFunction::SiLU,
                10000.0,
                1.0,
            )
            .unwrap(),
        )
    }

    #[test]
    fn layer_offsets_are_disjoint() {
        let mut buf = KvBuffer::new(2, 8, 8, DType::F32).unwrap();
        let l0_key = buf.layer_mut(0).key_offset(0);
        let l0_val = buf.layer_mut(0).value_offset(0);
        let l1_key = buf.layer_mut(1).key_offset(0);
        assert_eq!(l0_key, 0);
        assert_eq!(l0_val, 8 * 8);
        assert_eq!(l1_key, 2 * 8 * 8);
        let last_val = buf.layer_mut(1).value_offset(7);
        assert_eq!(last_val + 8, 2 * 2 * 8 * 8);
    }

    #[test]
    fn rows_round_trip_through_the_layer_view() {
        let mut buf = KvBuffer::new(2, 8, 8, DType::F32).unwrap();
        let src = Tensor::from_f32(TensorShape::row(8), (0..8).map(|i| i as f32).collect())
            .unwrap();
        let mut layer = buf.layer_mut(1);
        let off = layer.key_offset(3);
        layer.tensor_mut().copy_from(&src, 0, off, 8).unwrap();
        assert_eq!(layer.tensor().get_linear(off + 5), 5.0);
        // other layers untouched
        let l0 = buf.layer_mut(0);
        assert_eq!(l0.tensor().get_linear(l0.key_offset(3) + 5), 0.0);
    }

    #[test]
    fn buffers_follow_the_configured_working_dtype() {
        let c = Config::new(
            8,
            16,
            32,
            4,
            2,
            2,
            1e-5,
            32,
            1,
            2,
            ActivationFunction::SiLU,
            10000.0,
            1.0,
        )
        .unwrap()
        .with_working_dtype(DType::F16)
        .unwrap();
        let cache = KvBufferCache::new(Arc::new(c));
        let buf = cache.get(Uuid::new_v4()).unwrap();
        let mut buf = buf.lock().unwrap();
        assert_eq!(buf.layer_mut(0).tensor().dtype(), DType::F16);
    }

    #[test]
    fn half_precision_rows_round_trip_with_rounding() {
        let mut buf = KvBuffer::new(1, 4, 8, DType::F16).unwrap();
        let src = Tensor::from_f32(TensorShape::row(8), vec![0.3125; 8]).unwrap();
        let mut layer = buf.layer_mut(0);
        let off = layer.key_offset(2);
        layer.tensor_mut().copy_from(&src, 0, off, 8).unwrap();
        // 0.3125 is exact in f16
        assert_eq!(layer.tensor().get_linear(off + 3), 0.3125);
    }

    #[test]
    fn registry_reuses_per_session() {
        let cache = KvBufferCache::new(config());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let buf_a = cache.get(a).unwrap();
        buf_a.lock().unwrap().advance(0);
        assert_eq!(cache.get(a).unwrap().lock().unwrap().written(), 1);
        assert_eq!(cache.get(b).unwrap().lock().unwrap().written(), 0);
        assert_eq!(cache.sessions(), 2);
        cache.evict(a);
        assert_eq!(cache.sessions(), 1);
    }

    #[test]
    fn position_bounds() {
        let cache = KvBufferCache::new(config());
        assert!(cache.check_position(7).is_ok());
        assert!(matches!(
            cache.check_position(8),
            Err(InferirError::ContextOverflow { .. })
        ));
    }

    #[test]
    fn reset_clears_history() {
        let mut buf = KvBuffer::new(1, 4, 8, DType::F32).unwrap();
        let src = Tensor::from_f32(TensorShape::row(8), vec![1.0; 8]).unwrap();
        let mut layer = buf.layer_mut(0);
        let off = layer.key_offset(0);
        layer.tensor_mut().copy_from(&src, 0, off, 8).unwrap();
        buf.advance(0);
        buf.reset();
        assert_eq!(buf.written(), 0);
        assert_eq!(buf.layer_mut(0).tensor().get_linear(0), 0.0);
    }
}
