//! Shared parameters and the dense linear transform that adapters wrap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{Module as _, Tensor, Var};
use candle_nn::Linear;

use crate::error::{LoraError, Result};

/// A learnable tensor with a trainable flag.
///
/// Cloning a `Parameter` produces another handle onto the same storage and the
/// same flag: writes through [`Var::set`] and calls to [`Parameter::freeze`] are
/// observed by every clone.
#[derive(Clone, Debug)]
pub struct Parameter {
    var: Var,
    trainable: Arc<AtomicBool>,
}

impl Parameter {
    /// Wrap a variable as a trainable parameter.
    #[must_use]
    pub fn new(var: Var) -> Self {
        Self {
            var,
            trainable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a parameter from a tensor.
    ///
    /// Storage is shared if `tensor` is already a variable, copied otherwise.
    ///
    /// # Errors
    /// Returns an error if the copy fails.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self::new(Var::from_tensor(tensor)?))
    }

    /// The underlying variable.
    #[must_use]
    pub fn var(&self) -> &Var {
        &self.var
    }

    /// The underlying tensor, still attached to the autograd graph.
    #[must_use]
    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Tensor to use in a forward pass: detached from autograd when frozen.
    #[must_use]
    pub fn value(&self) -> Tensor {
        if self.is_trainable() {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    /// Shape of the parameter.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }

    /// Number of scalar elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }

    /// Whether the parameter belongs to the trainable set.
    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.trainable.load(Ordering::Relaxed)
    }

    /// Exclude the parameter from the trainable set.
    pub fn freeze(&self) {
        self.trainable.store(false, Ordering::Relaxed);
    }

    /// Include the parameter in the trainable set.
    pub fn unfreeze(&self) {
        self.trainable.store(true, Ordering::Relaxed);
    }

    /// Whether both handles point at the same variable.
    #[must_use]
    pub fn same_storage(&self, other: &Parameter) -> bool {
        self.var.as_tensor().id() == other.var.as_tensor().id()
    }
}

/// Dense linear transform `y = x·Wᵗ + b`.
#[derive(Clone, Debug)]
pub struct DenseLinear {
    weight: Parameter,
    bias: Option<Parameter>,
}

impl DenseLinear {
    /// Create a dense transform from a `[out_features, in_features]` weight and
    /// an optional `[out_features]` bias.
    ///
    /// # Errors
    /// Returns an error if the weight is not 2D or the bias length differs
    /// from `out_features`.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let weight = Parameter::from_tensor(&weight)?;
        let bias = bias.as_ref().map(Parameter::from_tensor).transpose()?;
        Self::from_parameters(weight, bias)
    }

    /// Create a dense transform around existing parameter handles.
    ///
    /// # Errors
    /// Returns an error on inconsistent shapes.
    pub fn from_parameters(weight: Parameter, bias: Option<Parameter>) -> Result<Self> {
        let &[out_features, _] = weight.dims() else {
            return Err(LoraError::DimensionMismatch {
                message: format!("dense weight must be 2D, got {:?}", weight.dims()),
            });
        };
        if let Some(bias) = &bias {
            if bias.dims() != [out_features] {
                return Err(LoraError::ShapeMismatch {
                    expected: vec![out_features],
                    actual: bias.dims().to_vec(),
                });
            }
        }
        Ok(Self { weight, bias })
    }

    /// Adopt the weights of a candle [`Linear`] layer.
    ///
    /// Weights coming from a `VarMap` keep sharing their storage.
    ///
    /// # Errors
    /// Returns an error on inconsistent shapes.
    pub fn from_candle(linear: &Linear) -> Result<Self> {
        Self::new(linear.weight().clone(), linear.bias().cloned())
    }

    /// Weight handle, `[out_features, in_features]`.
    #[must_use]
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Bias handle, `[out_features]`.
    #[must_use]
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Forward pass over `[..., in_features]`.
    ///
    /// # Errors
    /// Returns an error if the input's last dimension is not `in_features`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        linear_forward(&self.weight, self.bias.as_ref(), xs)
    }

    pub(crate) fn named_parameters(&self) -> Vec<(&'static str, &Parameter)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias", bias));
        }
        params
    }
}

/// Base computation shared by [`DenseLinear`] and the adapter that wraps it.
pub(crate) fn linear_forward(
    weight: &Parameter,
    bias: Option<&Parameter>,
    xs: &Tensor,
) -> Result<Tensor> {
    let linear = Linear::new(weight.value(), bias.map(Parameter::value));
    Ok(linear.forward(xs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_dense_forward() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 0., 2.], [0., 1., -1.]], &device)?;
        let bias = Tensor::new(&[0.5f32, -0.5], &device)?;
        let dense = DenseLinear::new(weight, Some(bias))?;
        assert_eq!(dense.in_features(), 3);
        assert_eq!(dense.out_features(), 2);

        let xs = Tensor::new(&[[1f32, 2., 3.]], &device)?;
        let ys = dense.forward(&xs)?.to_vec2::<f32>()?;
        assert_eq!(ys, vec![vec![7.5, -1.5]]);
        Ok(())
    }

    #[test]
    fn test_dense_rejects_bad_shapes() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::zeros((4, 3), DType::F32, &device)?;
        let bias = Tensor::zeros(3, DType::F32, &device)?;
        assert!(matches!(
            DenseLinear::new(weight, Some(bias)),
            Err(LoraError::ShapeMismatch { .. })
        ));

        let weight = Tensor::zeros((2, 4, 3), DType::F32, &device)?;
        assert!(matches!(
            DenseLinear::new(weight, None),
            Err(LoraError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_parameter_clone_aliases_storage_and_flag() -> Result<()> {
        let device = Device::Cpu;
        let param = Parameter::from_tensor(&Tensor::zeros((2, 2), DType::F32, &device)?)?;
        let alias = param.clone();
        assert!(alias.same_storage(&param));

        param.freeze();
        assert!(!alias.is_trainable());

        param.var().set(&Tensor::ones((2, 2), DType::F32, &device)?)?;
        let seen = alias.value().to_vec2::<f32>()?;
        assert_eq!(seen, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn test_from_candle_shares_varmap_storage() -> Result<()> {
        let device = Device::Cpu;
        let var_map = candle_nn::VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let linear = candle_nn::linear(4, 2, vb.pp("proj"))?;
        let dense = DenseLinear::from_candle(&linear)?;

        let vars = var_map.all_vars();
        assert!(vars
            .iter()
            .any(|v| v.as_tensor().id() == dense.weight().as_tensor().id()));
        Ok(())
    }
}
