//! Scratch tensor pool
//!
//! Every forward pass allocates the same handful of `(dtype, shape)` scratch
//! buffers. The cache keeps released buffers keyed by that pair and hands
//! them back on the next request, bounded by a byte budget. Requests the
//! budget cannot absorb are still served; the buffer is simply dropped on
//! release instead of pooled.
//!
//! Buffers are zeroed when they return to the pool, so an acquired tensor is
//! always all-zero.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::dtype::DType;
use crate::error::Result;
use crate::shape::TensorShape;
use crate::tensor::{Storage, Tensor};

/// Default pool budget, 100 MiB
pub const DEFAULT_BUDGET_BYTES: usize = 100 * 1024 * 1024;

type PoolKey = (DType, TensorShape);

/// Byte-bounded pool of scratch tensors keyed by dtype and shape
#[derive(Debug)]
pub struct TensorCache {
    budget_bytes: usize,
    held_bytes: AtomicUsize,
    pools: Mutex<HashMap<PoolKey, Vec<Tensor>>>,
}

impl Default for TensorCache {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_BYTES)
    }
}

impl TensorCache {
    /// Creates a cache with the given byte budget
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            held_bytes: AtomicUsize::new(0),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Hands out a zeroed scratch tensor, pooled when one is available.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::InferirError::BlockMisaligned`] when the
    /// requested shape does not fill whole blocks of `dtype`.
    pub fn acquire(self: &Arc<Self>, dtype: DType, shape: TensorShape) -> Result<PooledTensor> {
        let pooled = {
            let mut pools = self.pools.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pools
                .get_mut(&(dtype, shape.clone()))
                .and_then(std::vec::Vec::pop)
        };
        let tensor = match pooled {
            Some(t) => {
                self.held_bytes.fetch_sub(tensor_bytes(&t), Ordering::Relaxed);
                t
            }
            None => Tensor::zeros(dtype, shape)?,
        };
        Ok(PooledTensor {
            tensor: Some(tensor),
            cache: Arc::clone(self),
        })
    }

    /// Acquires an f32 `[1, n]` scratch row, the common case in layers
    ///
    /// # Errors
    ///
    /// Propagates allocation errors.
    pub fn acquire_row(self: &Arc<Self>, n: usize) -> Result<PooledTensor> {
        self.acquire(DType::F32, TensorShape::row(n))
    }

    /// Bytes currently parked in the pool
    #[must_use]
    pub fn held_bytes(&self) -> usize {
        self.held_bytes.load(Ordering::Relaxed)
    }

    fn release(&self, mut tensor: Tensor) {
        let sz = tensor_bytes(&tensor);
        // Opportunistic reservation; a racing release may overshoot by one
        // buffer, which the budget tolerates.
        if self.held_bytes.load(Ordering::Relaxed) + sz > self.budget_bytes {
            tracing::debug!(bytes = sz, "scratch buffer over pool budget, dropping");
            return;
        }
        tensor.fill_zero();
        self.held_bytes.fetch_add(sz, Ordering::Relaxed);
        let key = (tensor.dtype(), tensor.shape().clone());
        let mut pools = self.pools.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pools.entry(key).or_default().push(tensor);
    }
}

fn tensor_bytes(t: &Tensor) -> usize {
    match t.storage() {
        Storage::F32(d) => d.len() * 4,
        Storage::F16(d) => d.len() * 2,
        Storage::BF16(d) => d.len() * 2,
        Storage::I8 { scales, codes } => scales.len() * 4 + codes.len(),
        Storage::Q4 { scales, packed } => scales.len() * 4 + packed.len(),
        Storage::Q5 {
            scales,
            packed,
            high,
        } => scales.len() * 4 + packed.len() + high.len() * 4,
    }
}

/// Scope guard around a pooled scratch tensor.
///
/// Dereferences to [`Tensor`]; dropping it returns the buffer to its cache.
#[derive(Debug)]
pub struct PooledTensor {
    tensor: Option<Tensor>,
    cache: Arc<TensorCache>,
}

impl PooledTensor {
    /// Detaches the tensor from the pool; it will be dropped normally
    #[must_use]
    pub fn into_inner(mut self) -> Tensor {
        self.tensor.take().unwrap_or_else(|| unreachable!("guard always holds a tensor"))
    }
}

impl Deref for PooledTensor {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        self.tensor.as_ref().unwrap_or_else(|| unreachable!("guard always holds a tensor"))
    }
}

impl DerefMut for PooledTensor {
    fn deref_mut(&mut self) -> &mut Tensor {
        self.tensor.as_mut().unwrap_or_else(|| unreachable!("guard always holds a tensor"))
    }
}

impl Drop for PooledTensor {
    fn drop(&mut self) {
        if let Some(t) = self.tensor.take() {
            self.cache.release(t);
        }
    }
}
