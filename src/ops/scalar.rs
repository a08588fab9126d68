//! Scalar reference backend
//!
//! Straight-line loops over element decodes. Every supported dtype pairing
//! works here; the faster backends must agree with this one up to float
//! reassociation, so it doubles as the parity oracle in tests.

use crate::dtype::DType;
use crate::error::Result;
use crate::tensor::Tensor;

use super::{check_dot_pair, dense_f32_mut, TensorOperations};

/// Reference backend, always available
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarTensorOperations;

impl TensorOperations for ScalarTensorOperations {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn dot_product(
        &self,
        a: &Tensor,
        b: &Tensor,
        a_offset: usize,
        b_offset: usize,
        len: usize,
    ) -> Result<f32> {
        check_dot_pair(a.dtype(), b.dtype())?;
        let mut acc = 0.0f32;
        for i in 0..len {
            acc += a.get_linear(a_offset + i) * b.get_linear(b_offset + i);
        }
        Ok(acc)
    }

    fn accumulate(&self, dst: &mut Tensor, src: &Tensor, offset: usize, len: usize) -> Result<()> {
        let d = dense_f32_mut(dst, "accumulate", src.dtype())?;
        for i in 0..len {
            d[offset + i] += src.get_linear(offset + i);
        }
        Ok(())
    }

    fn maccumulate(
        &self,
        dst: &mut Tensor,
        src: &Tensor,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        let d = dense_f32_mut(dst, "maccumulate", src.dtype())?;
        for i in 0..len {
            d[offset + i] *= src.get_linear(offset + i);
        }
        Ok(())
    }

    fn saxpy(
        &self,
        alpha: f32,
        x: &Tensor,
        y: &mut Tensor,
        x_offset: usize,
        y_offset: usize,
        len: usize,
    ) -> Result<()> {
        let d = dense_f32_mut(y, "saxpy", x.dtype())?;
        for i in 0..len {
            d[y_offset + i] = alpha.mul_add(x.get_linear(x_offset + i), d[y_offset + i]);
        }
        Ok(())
    }

    fn sxpby(
        &self,
        beta: f32,
        x: &Tensor,
        y: &mut Tensor,
        x_offset: usize,
        y_offset: usize,
        len: usize,
    ) -> Result<()> {
        let d = dense_f32_mut(y, "sxpby", x.dtype())?;
        for i in 0..len {
            d[y_offset + i] = beta.mul_add(d[y_offset + i], x.get_linear(x_offset + i));
        }
        Ok(())
    }

    fn scale(&self, factor: f32, t: &mut Tensor, offset: usize, len: usize) -> Result<()> {
        let d = dense_f32_mut(t, "scale", DType::F32)?;
        for v in &mut d[offset..offset + len] {
            *v *= factor;
        }
        Ok(())
    }
}
