//! Core traits for low-rank adapters.

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Core adapter trait: a trainable correction added on top of a base output.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass applying the adapter transformation.
    ///
    /// # Arguments
    /// * `input` - Input tensor
    /// * `base_output` - Optional output from the base layer
    ///
    /// # Returns
    /// `base_output + delta` when a base output is given, otherwise only the delta.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable: Adapter {
    /// Merge adapter weights into base model weights.
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Trait for trainable adapters.
pub trait Trainable: Adapter {
    /// Register trainable parameters with the variable map under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter registration fails.
    fn register_parameters(&self, var_map: &mut VarMap, prefix: &str) -> Result<()>;

    /// Freeze all adapter parameters (disable gradients).
    fn freeze(&mut self);

    /// Unfreeze all adapter parameters (enable gradients).
    fn unfreeze(&mut self);

    /// Check if the adapter is frozen.
    #[must_use]
    fn is_frozen(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DenseLinear, LoraConfig, LoraLinear};
    use candle_core::{DType, Device};

    fn delta_only(adapter: &dyn Adapter<Config = LoraConfig>, xs: &Tensor) -> Result<Tensor> {
        adapter.forward(xs, None)
    }

    fn round_trip<M: Mergeable>(adapter: &M, weight: &Tensor) -> Result<Tensor> {
        adapter.unmerge(&adapter.merge(weight)?)
    }

    #[test]
    fn test_adapter_behind_trait_object() -> Result<()> {
        let device = Device::Cpu;
        let base = DenseLinear::new(Tensor::ones((6, 4), DType::F32, &device)?, None)?;
        let lora = LoraLinear::new(&base, &LoraConfig::new(2, 4.0, 0.0))?;

        let xs = Tensor::ones((3, 4), DType::F32, &device)?;
        let delta = delta_only(&lora, &xs)?;
        assert_eq!(delta.dims(), &[3, 6]);
        assert!(delta.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| *v == 0.0));
        assert_eq!(lora.config().r, 2);
        assert!(lora.config().validate().is_ok());

        let weight = base.weight().as_tensor();
        assert_eq!(
            round_trip(&lora, weight)?.flatten_all()?.to_vec1::<f32>()?,
            weight.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }
}
