//! LoRA (Low-Rank Adaptation) linear transform.
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices: `ΔW = BA` where `B ∈ R^{d×r}` and `A ∈ R^{r×k}`.
//!
//! [`LoraLinear`] wraps a [`DenseLinear`] and computes
//! `x·Wᵗ + b + (alpha / r)·dropout(x)·Aᵗ·Bᵗ`. The base weight and bias are
//! aliased, not copied, and are frozen on construction.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use candle_core::{Module as _, ModuleT as _, Tensor};
use candle_nn::{Dropout, Linear, VarMap};

use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::linear::{linear_forward, DenseLinear, Parameter};
use crate::traits::{Adapter, AdapterConfig, Mergeable, Trainable};

/// Parameter name of the down projection.
pub const LORA_A: &str = "lora_A";
/// Parameter name of the up projection.
pub const LORA_B: &str = "lora_B";

/// Dense transform augmented with a trainable low-rank correction.
///
/// Computes: `output = base(x) + (dropout(x) @ A^T @ B^T) * scaling`
#[derive(Debug)]
pub struct LoraLinear {
    /// Base weight, shared with the wrapped transform
    weight: Parameter,
    /// Base bias, shared with the wrapped transform
    bias: Option<Parameter>,
    /// Down projection: `[r, in_features]`
    lora_a: Parameter,
    /// Up projection: `[out_features, r]`
    lora_b: Parameter,
    /// Dropout on the adapter input branch
    dropout: Dropout,
    /// Scaling factor = alpha / r
    scaling: f64,
    config: LoraConfig,
    in_features: usize,
    out_features: usize,
    training: bool,
}

impl LoraLinear {
    /// Wrap `base` with a fresh adapter.
    ///
    /// `A` is drawn from Kaiming-uniform with `a = √5` (bound `1/√in_features`),
    /// `B` starts at zero, so the output equals the base output until `B` is
    /// trained. The base weight and bias are marked non-trainable.
    ///
    /// # Errors
    /// Returns [`LoraError::InvalidAdapterConfig`] if `r == 0`, `alpha <= 0` or
    /// the dropout rate is outside `[0, 1)`.
    pub fn new(base: &DenseLinear, config: &LoraConfig) -> Result<Self> {
        config.validate()?;

        let in_features = base.in_features();
        let out_features = base.out_features();
        let weight = base.weight().clone();
        let bias = base.bias().cloned();
        let device = weight.as_tensor().device();
        let dtype = weight.as_tensor().dtype();

        #[allow(clippy::cast_precision_loss)]
        let bound = 1.0 / (in_features as f32).sqrt();
        let a_init = Tensor::rand(-bound, bound, (config.r, in_features), device)?.to_dtype(dtype)?;
        let lora_a = Parameter::from_tensor(&a_init)?;
        let lora_b = Parameter::from_tensor(&Tensor::zeros((out_features, config.r), dtype, device)?)?;

        weight.freeze();
        if let Some(bias) = &bias {
            bias.freeze();
        }

        #[allow(clippy::cast_possible_truncation)]
        let dropout = Dropout::new(config.dropout as f32);

        Ok(Self {
            weight,
            bias,
            lora_a,
            lora_b,
            dropout,
            scaling: config.scaling(),
            config: config.clone(),
            in_features,
            out_features,
            training: false,
        })
    }

    /// Full forward pass: frozen base plus scaled low-rank update.
    ///
    /// # Errors
    /// Returns an error if the input's last dimension is not `in_features`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let base_out = linear_forward(&self.weight, self.bias.as_ref(), xs)?;
        Adapter::forward(self, xs, Some(&base_out))
    }

    /// Base weight (aliased).
    #[must_use]
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Base bias (aliased).
    #[must_use]
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    /// Down projection `A`, `[r, in_features]`.
    #[must_use]
    pub fn lora_a(&self) -> &Parameter {
        &self.lora_a
    }

    /// Up projection `B`, `[out_features, r]`.
    #[must_use]
    pub fn lora_b(&self) -> &Parameter {
        &self.lora_b
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Toggle dropout on the adapter branch.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Whether dropout is active.
    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Base weight with the current update folded in.
    ///
    /// # Errors
    /// Returns an error if the matmul fails.
    pub fn merged_weight(&self) -> Result<Tensor> {
        self.merge(self.weight.as_tensor())
    }

    pub(crate) fn named_parameters(&self) -> Vec<(&'static str, &Parameter)> {
        let mut params = vec![("weight", &self.weight)];
        if let Some(bias) = &self.bias {
            params.push(("bias", bias));
        }
        params.push((LORA_A, &self.lora_a));
        params.push((LORA_B, &self.lora_b));
        params
    }

    fn delta_weight(&self) -> Result<Tensor> {
        let delta = self.lora_b.as_tensor().matmul(self.lora_a.as_tensor())?;
        Ok(delta.affine(self.scaling, 0.0)?)
    }
}

impl Adapter for LoraLinear {
    type Config = LoraConfig;

    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor> {
        // LoRA forward: dropout(x) @ A^T @ B^T * scaling
        let xs = self.dropout.forward_t(input, self.training)?;
        let lora_out = Linear::new(self.lora_a.value(), None).forward(&xs)?;
        let lora_out = Linear::new(self.lora_b.value(), None).forward(&lora_out)?;
        let lora_out = lora_out.affine(self.scaling, 0.0)?;

        match base_output {
            Some(base) => Ok(base.broadcast_add(&lora_out)?),
            None => Ok(lora_out),
        }
    }

    fn num_parameters(&self) -> usize {
        self.config.r * (self.in_features + self.out_features)
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for LoraLinear {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        Ok(base_weight.broadcast_add(&self.delta_weight()?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        Ok(merged_weight.broadcast_sub(&self.delta_weight()?)?)
    }
}

impl Trainable for LoraLinear {
    fn register_parameters(&self, var_map: &mut VarMap, prefix: &str) -> Result<()> {
        let mut data = var_map.data().lock().map_err(|e| {
            LoraError::Candle(candle_core::Error::Msg(format!(
                "variable map lock poisoned: {e}"
            )))
        })?;
        for (name, param) in [(LORA_A, &self.lora_a), (LORA_B, &self.lora_b)] {
            let key = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            };
            data.insert(key, param.var().clone());
        }
        Ok(())
    }

    fn freeze(&mut self) {
        self.lora_a.freeze();
        self.lora_b.freeze();
    }

    fn unfreeze(&mut self) {
        self.lora_a.unfreeze();
        self.lora_b.unfreeze();
    }

    fn is_frozen(&self) -> bool {
        !self.lora_a.is_trainable()
    }
}
