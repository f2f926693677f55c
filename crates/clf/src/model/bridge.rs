//! Host/tensor bridge: moving state batches and QP data between `Vec<f64>`
//! and burn tensors.
//!
//! The QP solver works on plain `f64` slices, so every forward pass reads the
//! QP parameters back from the device and uploads the solutions again.

use burn::prelude::*;
use burn::tensor::{ElementConversion, TensorData};

use crate::error::ClfError;

/// Upload a single vector as a `(1, dim)` row.
pub fn row_to_tensor<B: Backend>(row: &[f64], device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(row.to_vec(), [1, row.len()]), device)
}

/// Read any tensor back as row-major `f64` values.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f64>, ClfError> {
    tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| ClfError::Tensor(format!("{e:?}")))
}

/// Read a single-element tensor as `f64`.
pub fn tensor_to_f64<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
