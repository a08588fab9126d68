//! External collaborator boundaries: weight sources and token decoders
//!
//! The inference core performs no I/O. Weights arrive through a
//! [`WeightSource`] as already materialized tensors, and generated token ids
//! turn into text through a [`TokenDecoder`]. File formats, downloads, and
//! tokenizer vocabularies all live on the far side of these traits.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{InferirError, Result};
use crate::tensor::Tensor;

/// Supplies named weight tensors, already decoded and shaped
pub trait WeightSource: Send + Sync {
    /// Fetches a tensor by its fully qualified name.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::MissingWeight`] when the name is unknown.
    fn tensor(&self, name: &str) -> Result<Arc<Tensor>>;

    /// True when the source carries the name
    fn contains(&self, name: &str) -> bool;
}

/// Turns generated token ids into text fragments
pub trait TokenDecoder: Send + Sync {
    /// The text fragment for one token id
    fn decode(&self, token: u32) -> String;
}

/// In-memory weight source, used by tests and by loaders that materialize
/// a checkpoint up front
#[derive(Debug, Default)]
pub struct MemoryWeightSource {
    tensors: HashMap<String, Arc<Tensor>>,
}

impl MemoryWeightSource {
    /// Creates an empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tensor under `name`, replacing any previous entry
    pub fn insert(&mut self, name: impl Into<String>, tensor: Arc<Tensor>) {
        self.tensors.insert(name.into(), tensor);
    }
}

impl WeightSource for MemoryWeightSource {
    fn tensor(&self, name: &str) -> Result<Arc<Tensor>> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| InferirError::MissingWeight {
                name: name.to_string(),
            })
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

/// Decoder backed by a fixed vocabulary list, one string per token id
#[derive(Debug)]
pub struct VocabTokenDecoder {
    vocab: Vec<String>,
}

impl VocabTokenDecoder {
    /// Wraps a vocabulary; token ids index into it
    #[must_use]
    pub fn new(vocab: Vec<String>) -> Self {
        Self { vocab }
    }
}

impl TokenDecoder for VocabTokenDecoder {
    fn decode(&self, token: u32) -> String {
        self.vocab
            .get(token as usize)
            .cloned()
            .unwrap_or_else(|| format!("<unk:{token}>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;

    #[test]
    fn memory_source_round_trips() {
        let mut src = MemoryWeightSource::new();
        let t = Arc::new(
            Tensor::from_f32(TensorShape::row(4), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        src.insert("model.norm.weight", Arc::clone(&t));
        assert!(src.contains("model.norm.weight"));
        assert_eq!(src.tensor("model.norm.weight").unwrap().get_linear(2), 3.0);
        assert!(matches!(
            src.tensor("missing"),
            Err(InferirError::MissingWeight { .. })
        ));
    }

    #[test]
    fn vocab_decoder_handles_unknown_ids() {
        let d = VocabTokenDecoder::new(vec!["a".into(), "b".into()]);
        assert_eq!(d.decode(1), "b");
        assert_eq!(d.decode(9), "<unk:9>");
    }
}
