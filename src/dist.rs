//! Static shard arithmetic for distributed execution
//!
//! A `DistributedContext` tells every layer which slice of each axis it
//! owns: embedding/attention/hidden column segments, query and kv head
//! ranges, and a contiguous run of layers. Partitions are exact — an axis
//! that does not divide by the shard count is a configuration error, not a
//! truncation.
//!
//! Cross-shard combination is injected through reducer traits; this crate
//! never sees a transport.

use std::ops::Range;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{InferirError, Result};
use crate::tensor::Tensor;

/// One owned slice of an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First owned index
    pub offset: usize,
    /// Number of owned indices
    pub length: usize,
}

impl Segment {
    /// One past the last owned index
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// The owned indices as a range
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

/// Combines per-shard partial activations in place.
///
/// The partials arrive in shard order; implementations overwrite each with
/// the combined value (an all-reduce without a transport in sight).
pub trait TensorReducer: Send + Sync + std::fmt::Debug {
    /// Reduces `partials` in place
    ///
    /// # Errors
    ///
    /// Implementations may reject mismatched partial shapes or dtypes.
    fn reduce(&self, partials: &mut [&mut Tensor]) -> Result<()>;
}

/// Combines per-shard norm statistics
pub trait NormReducer: Send + Sync + std::fmt::Debug {
    /// Returns the global `(sum, sum_sq)` given this shard's contribution
    fn reduce(&self, sum: f32, sum_sq: f32) -> (f32, f32);
}

/// Per-shard view of the model's axes
#[derive(Debug, Clone)]
pub struct DistributedContext {
    /// Tensor-parallel shard count
    pub model_shards: usize,
    /// This shard's tensor-parallel index
    pub model_shard_idx: usize,
    /// Pipeline shard count over layers
    pub layer_shards: usize,
    /// This shard's pipeline index
    pub layer_shard_idx: usize,

    /// Owned embedding columns
    pub embedding_segment: Segment,
    /// Owned attention (query) columns
    pub attention_segment: Segment,
    /// Owned key/value columns
    pub kv_segment: Segment,
    /// Owned hidden (feed-forward) columns
    pub hidden_segment: Segment,
    /// Owned query heads
    pub head_range: Range<usize>,
    /// Owned kv heads
    pub kv_head_range: Range<usize>,
    /// Owned layers, contiguous
    pub layer_range: Range<usize>,

    tensor_reducer: Option<Arc<dyn TensorReducer>>,
    norm_reducer: Option<Arc<dyn NormReducer>>,
}

impl DistributedContext {
    /// Starts a builder with a single shard on both axes
    #[must_use]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The injected activation all-reduce, when running sharded
    #[must_use]
    pub fn tensor_reducer(&self) -> Option<&dyn TensorReducer> {
        self.tensor_reducer.as_deref()
    }

    /// The injected norm-statistics reduce, when running sharded. Returned
    /// by handle so norm layers can keep it.
    #[must_use]
    pub fn norm_reducer(&self) -> Option<Arc<dyn NormReducer>> {
        self.norm_reducer.clone()
    }

    /// True when this context owns every embedding column
    #[must_use]
    pub fn is_single_shard(&self) -> bool {
        self.model_shards == 1
    }
}

/// Builder for [`DistributedContext`]
#[derive(Debug, Default)]
pub struct Builder {
    model_shard: Option<(usize, usize)>,
    layer_shard: Option<(usize, usize)>,
    tensor_reducer: Option<Arc<dyn TensorReducer>>,
    norm_reducer: Option<Arc<dyn NormReducer>>,
}

impl Builder {
    /// Sets the tensor-parallel shard `(idx, count)`
    #[must_use]
    pub fn model_shard(mut self, idx: usize, count: usize) -> Self {
        self.model_shard = Some((idx, count));
        self
    }

    /// Sets the pipeline shard `(idx, count)` over layers
    #[must_use]
    pub fn layer_shard(mut self, idx: usize, count: usize) -> Self {
        self.layer_shard = Some((idx, count));
        self
    }

    /// Injects the activation all-reduce
    #[must_use]
    pub fn tensor_reducer(mut self, r: Arc<dyn TensorReducer>) -> Self {
        self.tensor_reducer = Some(r);
        self
    }

    /// Injects the norm-statistics reduce
    #[must_use]
    pub fn norm_reducer(mut self, r: Arc<dyn NormReducer>) -> Self {
        self.norm_reducer = Some(r);
        self
    }

    /// Derives the shard's segments from the model geometry.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidPartition`] when any partitioned axis
    /// does not divide exactly by its shard count, or the shard index is out
    /// of range.
    pub fn build(self, config: &Config) -> Result<DistributedContext> {
        let (shard_idx, shards) = self.model_shard.unwrap_or((0, 1));
        let (layer_idx, layer_shards) = self.layer_shard.unwrap_or((0, 1));

        if shards == 0 || shard_idx >= shards {
            return Err(InferirError::InvalidPartition {
                axis: "model shard index",
                length: shard_idx,
                shards,
            });
        }
        if layer_shards == 0 || layer_idx >= layer_shards {
            return Err(InferirError::InvalidPartition {
                axis: "layer shard index",
                length: layer_idx,
                shards: layer_shards,
            });
        }

        let embedding_segment = split(config.embedding_length, shards, shard_idx, "embedding")?;
        let attention_segment = split(config.attention_length, shards, shard_idx, "attention")?;
        let hidden_segment = split(config.hidden_length, shards, shard_idx, "hidden")?;
        let kv_segment = split(config.kv_length, shards, shard_idx, "kv")?;
        if config.number_of_heads % shards != 0 {
            return Err(InferirError::InvalidPartition {
                axis: "heads",
                length: config.number_of_heads,
                shards,
            });
        }
        if config.number_of_kv_heads % shards != 0 {
            return Err(InferirError::InvalidPartition {
                axis: "kv heads",
                length: config.number_of_kv_heads,
                shards,
            });
        }
        let layer_span = split(config.number_of_layers, layer_shards, layer_idx, "layers")?;

        Ok(DistributedContext {
            model_shards: shards,
            model_shard_idx: shard_idx,
            layer_shards,
            layer_shard_idx: layer_idx,
            head_range: attention_segment.offset / config.head_size
                ..attention_segment.end() / config.head_size,
            kv_head_range: kv_segment.offset / config.head_size
                ..kv_segment.end() / config.head_size,
            layer_range: layer_span.range(),
            embedding_segment,
            attention_segment,
            kv_segment,
            hidden_segment,
            tensor_reducer: self.tensor_reducer,
            norm_reducer: self.norm_reducer,
        })
    }
}

fn split(length: usize, shards: usize, idx: usize, axis: &'static str) -> Result<Segment> {
    if length % shards != 0 {
        return Err(InferirError::InvalidPartition {
            axis,
            length,
            shards,
        });
    }
    let each = length / shards;
    Ok(Segment {
        offset: each * idx,
        length: each,
    })
}

/// In-process all-reduce that sums partials element by element.
///
/// Serves tests and single-host multi-context runs; a real deployment
/// injects a transport-backed implementation.
#[derive(Debug, Default)]
pub struct SumTensorReducer;

impl TensorReducer for SumTensorReducer {
    fn reduce(&self, partials: &mut [&mut Tensor]) -> Result<()> {
        let Some((first, rest)) = partials.split_first_mut() else {
            return Ok(());
        };
        for i in 0..first.size() {
            let mut acc = first.get_linear(i);
            for p in rest.iter() {
                acc += p.get_linear(i);
            }
            first.set_linear(i, acc);
        }
        for p in rest {
            p.copy_from(first, 0, 0, first.size())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivationFunction;
    use crate::shape::TensorShape;

    fn config() -> Config {
        Config::new(
            32,
            64,
            128,
            8,
            4,
            8,
            1e-5,
            64,
            1,
            2,
            ActivationFunction::SiLU,
            10000.0,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn single_shard_owns_everything() {
        let ctx = DistributedContext::builder().build(&config()).unwrap();
        assert_eq!(ctx.embedding_segment.range(), 0..64);
        assert_eq!(ctx.attention_segment.range(), 0..64);
        assert_eq!(ctx.kv_segment.range(), 0..32);
        assert_eq!(ctx.head_range, 0..8);
        assert_eq!(ctx.kv_head_range, 0..4);
        assert_eq!(ctx.layer_range, 0..8);
        assert!(ctx.is_single_shard());
    }

    fn mha_config() -> Config {
        Config::new(
            32,
            64,
            128,
            8,
            8,
            8,
            1e-5,
            64,
            1,
            2,
            ActivationFunction::SiLU,
            10000.0,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn shards_cover_each_axis_exactly() {
        let c = config();
        for shards in [1usize, 2, 4] {
            let mut embedding = vec![0u8; c.embedding_length];
            let mut heads = vec![0u8; c.number_of_heads];
            let mut kv = vec![0u8; c.kv_length];
            for idx in 0..shards {
                let ctx = DistributedContext::builder()
                    .model_shard(idx, shards)
                    .build(&c)
                    .unwrap();
                for i in ctx.embedding_segment.range() {
                    embedding[i] += 1;
                }
                for h in ctx.head_range.clone() {
                    heads[h] += 1;
                }
                for i in ctx.kv_segment.range() {
                    kv[i] += 1;
                }
            }
            assert!(embedding.iter().all(|&n| n == 1), "{shards} shards");
            assert!(heads.iter().all(|&n| n == 1));
            assert!(kv.iter().all(|&n| n == 1));
        }
    }

    #[test]
    fn eight_way_split_covers_when_heads_allow() {
        // one kv head per shard needs as many kv heads as shards
        let c = mha_config();
        let mut embedding = vec![0u8; c.embedding_length];
        let mut heads = vec![0u8; c.number_of_heads];
        for idx in 0..8 {
            let ctx = DistributedContext::builder()
                .model_shard(idx, 8)
                .build(&c)
                .unwrap();
            assert_eq!(ctx.head_range.len(), 1);
            assert_eq!(ctx.kv_head_range.len(), 1);
            for i in ctx.embedding_segment.range() {
                embedding[i] += 1;
            }
            for h in ctx.head_range.clone() {
                heads[h] += 1;
            }
        }
        assert!(embedding.iter().all(|&n| n == 1));
        assert!(heads.iter().all(|&n| n == 1));
    }

    #[test]
    fn layer_shards_are_contiguous_and_cover() {
        let c = config();
        let mut seen = vec![0u8; c.number_of_layers];
        for idx in 0..4 {
            let ctx = DistributedContext::builder()
                .layer_shard(idx, 4)
                .build(&c)
                .unwrap();
            assert_eq!(ctx.layer_range.len(), 2);
            for l in ctx.layer_range.clone() {
                seen[l] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn uneven_partitions_are_rejected() {
        let c = config();
        // 8 heads over 3 shards
        let err = DistributedContext::builder()
            .model_shard(0, 3)
            .build(&c)
            .unwrap_err();
        assert!(matches!(err, InferirError::InvalidPartition { .. }));
        // shard index out of range
        assert!(DistributedContext::builder()
            .model_shard(2, 2)
            .build(&c)
            .is_err());
        // 8 layers over 3 layer shards
        assert!(DistributedContext::builder()
            .layer_shard(0, 3)
            .build(&c)
            .is_err());
    }

    #[test]
    fn sum_reducer_combines_and_broadcasts() {
        let shape = TensorShape::row(4);
        let mut a = Tensor::from_f32(shape.clone(), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut b = Tensor::from_f32(shape, vec![10.0, 20.0, 30.0, 40.0]).unwrap();
        SumTensorReducer
            .reduce(&mut [&mut a, &mut b])
            .unwrap();
        assert_eq!(a.as_f32().unwrap(), &[11.0, 22.0, 33.0, 44.0]);
        assert_eq!(b.as_f32().unwrap(), a.as_f32().unwrap());
    }
}
