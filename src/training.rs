//! Parameter accounting for adapted graphs.

// Allow usize to f64 casts for human-readable counts
#![allow(clippy::cast_precision_loss)]

use crate::model::{named_parameters, Node};

/// Trainable versus total scalar parameter counts of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterCount {
    /// Elements in parameters flagged trainable
    pub trainable: usize,
    /// Elements in all parameters
    pub total: usize,
}

impl ParameterCount {
    /// Trainable share in percent.
    #[must_use]
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

/// Count trainable and total parameters below `graph`.
#[must_use]
pub fn count_parameters(graph: &Node) -> ParameterCount {
    named_parameters(graph)
        .into_iter()
        .fold(ParameterCount::default(), |mut acc, (_, param)| {
            let n = param.elem_count();
            acc.total += n;
            if param.is_trainable() {
                acc.trainable += n;
            }
            acc
        })
}

/// Format parameter count with appropriate units.
///
/// # Returns
/// Human-readable string (e.g., "12.3K", "1.5M", "2.1B")
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inject, DenseLinear, LoraConfig, Result, Sequential};
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_format_parameter_count() {
        assert_eq!(format_parameter_count(100), "100");
        assert_eq!(format_parameter_count(1_234), "1.23K");
        assert_eq!(format_parameter_count(12_345_678), "12.35M");
        assert_eq!(format_parameter_count(1_234_567_890), "1.23B");
    }

    #[test]
    fn test_count_before_and_after_injection() -> Result<()> {
        let device = Device::Cpu;
        let fc1 = DenseLinear::new(
            Tensor::zeros((32, 16), DType::F32, &device)?,
            Some(Tensor::zeros(32, DType::F32, &device)?),
        )?;
        let head = DenseLinear::new(Tensor::zeros((4, 32), DType::F32, &device)?, None)?;
        let mut graph: Node = Sequential::new().add("fc1", fc1)?.add("head", head)?.into();

        let before = count_parameters(&graph);
        assert_eq!(before.total, 32 * 16 + 32 + 4 * 32);
        assert_eq!(before.trainable, before.total);

        let config = LoraConfig::new(4, 4.0, 0.0).with_target_modules(["fc1"]);
        assert_eq!(inject(&mut graph, &config)?, 1);

        // fc1 is frozen, the untargeted head stays trainable
        let adapter = 4 * 16 + 32 * 4;
        let after = count_parameters(&graph);
        assert_eq!(after.trainable, adapter + 4 * 32);
        assert_eq!(after.total, before.total + adapter);
        assert!(after.trainable_percent() > 0.0 && after.trainable_percent() < 100.0);
        Ok(())
    }
}
