//! Tensor shape metadata and linear offset arithmetic
//!
//! Shapes are row-major and at least two-dimensional. A shape may carry a
//! sparse window on its final dimension: the tensor is logically full-width
//! but only columns `[sparse_offset, sparse_offset + sparse_length)` are
//! materialized. Offset arithmetic subtracts the window start, so callers
//! keep addressing logical columns.

use crate::error::{InferirError, Result};

/// Row-major shape with an optional materialized window on the last axis
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorShape {
    dims: Vec<usize>,
    sparse_offset: usize,
    sparse_length: usize,
}

impl TensorShape {
    /// Builds a dense shape. A single dimension promotes to `1 x n`.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidShape`] when no dimensions are given
    /// or any dimension is zero.
    pub fn of(dims: &[usize]) -> Result<Self> {
        if dims.is_empty() {
            return Err(InferirError::InvalidShape {
                reason: "shapes require at least 1 dimension".to_string(),
            });
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(InferirError::InvalidShape {
                reason: format!("zero-length dimension in {dims:?}"),
            });
        }
        let dims: Vec<usize> = if dims.len() == 1 {
            vec![1, dims[0]]
        } else {
            dims.to_vec()
        };
        let last = dims[dims.len() - 1];
        Ok(Self {
            dims,
            sparse_offset: 0,
            sparse_length: last,
        })
    }

    /// Length of dimension `i`
    #[must_use]
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Convenience constructor for the common `[1, n]` row-vector shape
    #[must_use]
    pub fn row(n: usize) -> Self {
        Self {
            dims: vec![1, n],
            sparse_offset: 0,
            sparse_length: n,
        }
    }

    /// Logical dimensions
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// First dimension
    #[must_use]
    pub fn first(&self) -> usize {
        self.dims[0]
    }

    /// Logical width of the last dimension (ignores any sparse window)
    #[must_use]
    pub fn last(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    /// Materialized element count: the product of all dimensions with the
    /// last replaced by the sparse window length
    #[must_use]
    pub fn size(&self) -> usize {
        self.dims[..self.dims.len() - 1]
            .iter()
            .product::<usize>()
            * self.sparse_length
    }

    /// Start of the materialized window on the last axis (0 when dense)
    #[must_use]
    pub fn sparse_offset(&self) -> usize {
        self.sparse_offset
    }

    /// Width of the materialized window on the last axis
    #[must_use]
    pub fn sparse_length(&self) -> usize {
        self.sparse_length
    }

    /// True when only part of the last axis is materialized
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.sparse_length != self.last()
    }

    /// Returns a copy of this shape materializing only
    /// `[offset, offset + length)` of the last axis.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidShape`] when the window exceeds the
    /// logical width or the shape is already sparse.
    pub fn sparsify(&self, offset: usize, length: usize) -> Result<Self> {
        if self.is_sparse() {
            return Err(InferirError::InvalidShape {
                reason: "cannot sparsify an already sparse shape".to_string(),
            });
        }
        if length == 0 || offset + length > self.last() {
            return Err(InferirError::InvalidShape {
                reason: format!(
                    "window [{offset}, {}) exceeds last dimension {}",
                    offset + length,
                    self.last()
                ),
            });
        }
        Ok(Self {
            dims: self.dims.clone(),
            sparse_offset: offset,
            sparse_length: length,
        })
    }

    /// Returns a copy with the last dimension rescaled by `num / den`,
    /// for shapes counting packed or widened payload units.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidShape`] when the last dimension does
    /// not divide by `den` or the shape carries a sparse window.
    pub fn scale_last_dim(&self, num: usize, den: usize) -> Result<Self> {
        if self.is_sparse() {
            return Err(InferirError::InvalidShape {
                reason: "cannot rescale a sparse-windowed shape".to_string(),
            });
        }
        if den == 0 || self.last() % den != 0 {
            return Err(InferirError::InvalidShape {
                reason: format!("last dimension {} does not divide by {den}", self.last()),
            });
        }
        let mut dims = self.dims.clone();
        let scaled = self.last() / den * num;
        let n = dims.len();
        dims[n - 1] = scaled;
        Self::of(&dims)
    }

    /// Drops the first `n` dimensions, returning the shape of one nested
    /// sub-tensor.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidShape`] when `n` would consume every
    /// dimension or the shape carries a sparse window.
    pub fn slice(&self, n: usize) -> Result<Self> {
        if self.is_sparse() {
            return Err(InferirError::InvalidShape {
                reason: "cannot slice a sparse-windowed shape".to_string(),
            });
        }
        if n >= self.dims.len() {
            return Err(InferirError::InvalidShape {
                reason: format!("cannot drop {n} of {} dimensions", self.dims.len()),
            });
        }
        Self::of(&self.dims[n..])
    }

    /// Returns a copy with dimension `i` set to `len`.
    ///
    /// # Errors
    ///
    /// Returns [`InferirError::InvalidShape`] for a zero length, an index out
    /// of range, or a sparse-windowed shape.
    pub fn set_dim(&self, i: usize, len: usize) -> Result<Self> {
        if self.is_sparse() {
            return Err(InferirError::InvalidShape {
                reason: "cannot resize a sparse-windowed shape".to_string(),
            });
        }
        if i >= self.dims.len() {
            return Err(InferirError::InvalidShape {
                reason: format!("dimension {i} out of range for {:?}", self.dims),
            });
        }
        let mut dims = self.dims.clone();
        dims[i] = len;
        Self::of(&dims)
    }

    /// Linear storage offset of a `(row, col)` coordinate in a 2-D shape.
    ///
    /// `col` is a logical column; the sparse window start is subtracted.
    /// Out-of-window access is a programming error and panics in debug
    /// builds via the underlying storage index.
    #[must_use]
    pub fn offset2(&self, row: usize, col: usize) -> usize {
        debug_assert_eq!(self.dims.len(), 2);
        debug_assert!(col >= self.sparse_offset && col < self.sparse_offset + self.sparse_length);
        row * self.sparse_length + (col - self.sparse_offset)
    }

    /// Linear storage offset of an n-dimensional coordinate
    #[must_use]
    pub fn offset(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.dims.len());
        let n = self.dims.len();
        let mut off = 0usize;
        let mut stride = 1usize;
        for i in (0..n).rev() {
            let c = if i == n - 1 {
                coords[i] - self.sparse_offset
            } else {
                coords[i]
            };
            off += c * stride;
            stride *= if i == n - 1 { self.sparse_length } else { self.dims[i] };
        }
        off
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_sparse() {
            write!(
                f,
                "{:?}[{}..{}]",
                self.dims,
                self.sparse_offset,
                self.sparse_offset + self.sparse_length
            )
        } else {
            write!(f, "{:?}", self.dims)
        }
    }
}
