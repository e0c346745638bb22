//! I/O utilities for adapter checkpoints.
//!
//! This module provides functionality for:
//! - Extracting and restoring adapter state keyed by dotted parameter path
//! - Saving and loading adapter weights in safetensors format
//! - Saving and loading adapter configurations as JSON
//! - One-call `save_pretrained` / `load_pretrained` over a directory
//!
//! Restoring is lenient: entries that do not match a live adapter parameter by
//! path and shape are skipped and reported, never raised.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::inject::{inject, named_adapter_parameters};
use crate::model::Node;

/// File name of the adapter configuration inside a pretrained directory.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";
/// File name of the adapter weights inside a pretrained directory.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Outcome of applying saved adapter state to a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Entries written into live adapter parameters
    pub applied: usize,
    /// Entries ignored because of an unknown path or a shape mismatch
    pub skipped: usize,
    /// Keys of the skipped entries, sorted
    pub skipped_keys: Vec<String>,
    /// Live adapter parameters with no entry in the saved state
    pub missing: Vec<String>,
}

impl RestoreReport {
    /// Whether every saved entry was applied and every adapter was covered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped == 0 && self.missing.is_empty()
    }
}

/// Result of [`load_pretrained`].
#[derive(Debug, Clone)]
pub struct LoadedAdapter {
    /// Configuration read from the directory
    pub config: LoraConfig,
    /// Number of transforms wrapped by the injection
    pub wrapped: usize,
    /// Restore outcome for the saved weights
    pub report: RestoreReport,
}

/// Adapter tensors keyed by dotted path, ready to be written out.
#[must_use]
pub fn adapter_state_dict(graph: &Node) -> HashMap<String, Tensor> {
    named_adapter_parameters(graph)
        .into_iter()
        .map(|(path, var)| (path, var.as_tensor().detach()))
        .collect()
}

/// Copy saved tensors into the matching live adapter parameters.
///
/// Values are converted to the live parameter's dtype and device before being
/// written in place. Keys with no live counterpart, keys naming base
/// parameters and shape mismatches are skipped.
///
/// # Errors
/// Returns an error only if a conversion or in-place write fails.
pub fn load_adapter_state(
    graph: &Node,
    state: &HashMap<String, Tensor>,
) -> Result<RestoreReport> {
    let live = named_adapter_parameters(graph);
    let by_path: HashMap<&str, _> = live.iter().map(|(p, v)| (p.as_str(), v)).collect();

    let mut keys: Vec<&String> = state.keys().collect();
    keys.sort();

    let mut report = RestoreReport::default();
    for key in keys {
        let value = &state[key];
        match by_path.get(key.as_str()) {
            Some(var) if var.dims() == value.dims() => {
                let value = value.to_device(var.device())?.to_dtype(var.dtype())?;
                var.set(&value)?;
                report.applied += 1;
            }
            Some(var) => {
                warn!(
                    key = %key,
                    expected = ?var.dims(),
                    actual = ?value.dims(),
                    "skipping adapter tensor with mismatched shape"
                );
                report.skipped_keys.push(key.clone());
            }
            None => {
                warn!(key = %key, "skipping tensor with no matching adapter parameter");
                report.skipped_keys.push(key.clone());
            }
        }
    }
    report.skipped = report.skipped_keys.len();

    let saved: HashSet<&str> = state.keys().map(String::as_str).collect();
    report.missing = live
        .iter()
        .filter(|(path, _)| !saved.contains(path.as_str()))
        .map(|(path, _)| path.clone())
        .collect();

    if report.is_complete() {
        info!(applied = report.applied, "adapter state restored");
    } else {
        warn!(
            applied = report.applied,
            skipped = report.skipped,
            missing = report.missing.len(),
            "adapter state partially restored"
        );
    }
    Ok(report)
}

/// Save the graph's adapter tensors to a safetensors file.
///
/// # Errors
/// Returns an error if serialization or writing fails.
pub fn save_adapter_state<P: AsRef<Path>>(graph: &Node, path: P) -> Result<()> {
    let state = adapter_state_dict(graph);
    candle_core::safetensors::save(&state, path.as_ref())?;
    Ok(())
}

/// Load a safetensors file and apply it with [`load_adapter_state`].
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn load_adapter_file<P: AsRef<Path>>(
    graph: &Node,
    path: P,
    device: &Device,
) -> Result<RestoreReport> {
    let state = candle_core::safetensors::load(path.as_ref(), device)?;
    load_adapter_state(graph, &state)
}

/// Save adapter configuration to a JSON file.
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_adapter_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| LoraError::Io(format!("Failed to serialize config: {e}")))?;

    fs::write(path, json)
        .map_err(|e| LoraError::Io(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// Load adapter configuration from a JSON file.
///
/// # Errors
/// Returns an error if file reading or deserialization fails
pub fn load_adapter_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| LoraError::Io(format!("Failed to read config file: {e}")))?;

    let config = serde_json::from_str(&json)
        .map_err(|e| LoraError::Io(format!("Failed to parse config: {e}")))?;

    Ok(config)
}

/// Write the configuration and adapter weights into `dir`.
///
/// # Errors
/// Returns an error if the directory or either file cannot be written.
pub fn save_pretrained<P: AsRef<Path>>(graph: &Node, config: &LoraConfig, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .map_err(|e| LoraError::Io(format!("Failed to create {}: {e}", dir.display())))?;
    save_adapter_config(config, dir.join(ADAPTER_CONFIG_FILENAME))?;
    save_adapter_state(graph, dir.join(ADAPTER_WEIGHTS_FILENAME))
}

/// Inject adapters as described by `dir`'s configuration, then restore its weights.
///
/// Restoring is lenient, see [`load_adapter_state`].
///
/// # Errors
/// Returns an error if a file cannot be read, or if injection fails.
pub fn load_pretrained<P: AsRef<Path>>(
    graph: &mut Node,
    dir: P,
    device: &Device,
) -> Result<LoadedAdapter> {
    let dir = dir.as_ref();
    let config: LoraConfig = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
    let wrapped = inject(graph, &config)?;
    let report = load_adapter_file(graph, dir.join(ADAPTER_WEIGHTS_FILENAME), device)?;
    info!(path = %dir.display(), wrapped, applied = report.applied, "loaded adapter");
    Ok(LoadedAdapter {
        config,
        wrapped,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::DenseLinear;
    use crate::model::Sequential;
    use candle_core::DType;
    use tempfile::TempDir;

    fn graph(d: usize, device: &Device) -> Result<Node> {
        let dense = |i: usize, o: usize| -> Result<DenseLinear> {
            DenseLinear::new(
                Tensor::randn(0f32, 0.2, (o, i), device)?,
                Some(Tensor::zeros(o, DType::F32, device)?),
            )
        };
        let attn = Sequential::new()
            .add("to_q", dense(d, d)?)?
            .add("to_v", dense(d, d)?)?;
        Ok(Sequential::new()
            .add("attn", attn)?
            .add("fc1", dense(d, 2 * d)?)?
            .into())
    }

    fn perturb(graph: &Node, device: &Device) -> Result<()> {
        for (_, var) in named_adapter_parameters(graph) {
            var.set(&Tensor::randn(0f32, 0.5, var.dims(), device)?)?;
        }
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_skipped() -> Result<()> {
        let device = Device::Cpu;
        let mut live = graph(64, &device)?;
        inject(&mut live, &LoraConfig::new(8, 8.0, 0.0).with_target_modules(["to_q"]))?;

        let mut state = HashMap::new();
        state.insert(
            "attn.to_q.lora_A".to_string(),
            Tensor::ones((4, 64), DType::F32, &device)?,
        );
        state.insert(
            "attn.to_q.lora_B".to_string(),
            Tensor::ones((64, 8), DType::F32, &device)?,
        );

        let report = load_adapter_state(&live, &state)?;
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.skipped_keys, ["attn.to_q.lora_A"]);
        assert!(report.missing.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_and_base_keys_are_skipped() -> Result<()> {
        let device = Device::Cpu;
        let mut live = graph(8, &device)?;
        inject(&mut live, &LoraConfig::new(2, 2.0, 0.0).with_target_modules(["fc1"]))?;
        let weight_before = live.children()[1].1.as_adapter().map(|a| a.weight().clone());

        let mut state = HashMap::new();
        state.insert(
            "fc1.weight".to_string(),
            Tensor::ones((16, 8), DType::F32, &device)?,
        );
        state.insert(
            "decoder.fc9.lora_A".to_string(),
            Tensor::ones((2, 8), DType::F32, &device)?,
        );

        let report = load_adapter_state(&live, &state)?;
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped_keys, ["decoder.fc9.lora_A", "fc1.weight"]);
        assert_eq!(report.missing, ["fc1.lora_A", "fc1.lora_B"]);
        assert!(!report.is_complete());

        let weight = weight_before.expect("fc1 is wrapped");
        let values = weight.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().any(|v| *v != 1.0));
        Ok(())
    }

    #[test]
    fn test_restore_converts_dtype() -> Result<()> {
        let device = Device::Cpu;
        let mut live = graph(4, &device)?;
        inject(&mut live, &LoraConfig::new(2, 2.0, 0.0).with_target_modules(["fc1"]))?;

        let mut state = HashMap::new();
        state.insert(
            "fc1.lora_B".to_string(),
            Tensor::ones((8, 2), DType::F64, &device)?,
        );
        let report = load_adapter_state(&live, &state)?;
        assert_eq!(report.applied, 1);

        let b = live.children()[1].1.as_adapter().map(|a| a.lora_b().clone());
        let b = b.expect("fc1 is wrapped");
        assert_eq!(b.as_tensor().dtype(), DType::F32);
        assert_eq!(b.as_tensor().sum_all()?.to_scalar::<f32>()?, 16.0);
        Ok(())
    }

    #[test]
    fn test_save_load_adapter_file() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("adapter.safetensors");
        let config = LoraConfig::new(4, 8.0, 0.0);

        let mut trained = graph(8, &device)?;
        inject(&mut trained, &config)?;
        perturb(&trained, &device)?;
        save_adapter_state(&trained, &path)?;
        assert!(path.exists());

        let mut fresh = graph(8, &device)?;
        inject(&mut fresh, &config)?;
        let report = load_adapter_file(&fresh, &path, &device)?;
        assert_eq!(report.applied, 6);
        assert!(report.is_complete());

        let saved = adapter_state_dict(&trained);
        let loaded = adapter_state_dict(&fresh);
        for (key, tensor) in &saved {
            let a = tensor.flatten_all()?.to_vec1::<f32>()?;
            let b = loaded[key].flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(a, b, "{key}");
        }
        Ok(())
    }

    #[test]
    fn test_save_load_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.json");
        let config = LoraConfig::new(8, 16.0, 0.1).with_target_modules(["to_q", "to_v"]);

        save_adapter_config(&config, &config_path)?;
        assert!(config_path.exists());

        let loaded: LoraConfig = load_adapter_config(&config_path)?;
        assert_eq!(config, loaded);

        let missing = load_adapter_config::<LoraConfig, _>(temp_dir.path().join("nope.json"));
        assert!(matches!(missing, Err(LoraError::Io(_))));
        Ok(())
    }

    #[test]
    fn test_pretrained_round_trip() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path().join("adapter");
        let config = LoraConfig::new(2, 4.0, 0.0).with_target_modules(["attn"]);

        let mut trained = graph(8, &device)?;
        inject(&mut trained, &config)?;
        perturb(&trained, &device)?;
        save_pretrained(&trained, &config, &dir)?;
        assert!(dir.join(ADAPTER_CONFIG_FILENAME).exists());
        assert!(dir.join(ADAPTER_WEIGHTS_FILENAME).exists());

        let xs = Tensor::randn(0f32, 1.0, (3, 8), &device)?;
        let expected = trained.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;

        // same base weights, fresh adapters
        let mut serving = graph(8, &device)?;
        for ((_, src), (_, dst)) in crate::model::named_parameters(&trained)
            .into_iter()
            .filter(|(p, _)| !p.contains("lora_"))
            .zip(crate::model::named_parameters(&serving))
        {
            dst.var().set(src.as_tensor())?;
        }

        let loaded = load_pretrained(&mut serving, &dir, &device)?;
        assert_eq!(loaded.config, config);
        assert_eq!(loaded.wrapped, 2);
        assert!(loaded.report.is_complete());

        let actual = serving.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(actual, expected);
        Ok(())
    }
}
