//! In-place LoRA injection and adapter parameter collection.
//!
//! [`inject`] walks a graph in pre-order and, for every direct child that is a
//! [`Node::Dense`] whose dotted path matches the configured target patterns,
//! swaps in a [`LoraLinear`] built around it. Wrapped children are adapter
//! nodes afterwards, so running the injection again is a no-op.

use std::collections::HashSet;

use candle_core::Var;
use candle_nn::VarMap;
use tracing::{debug, info, warn};

use crate::adapters::lora::{LoraLinear, LORA_A, LORA_B};
use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::model::{join_path, named_modules, Node, TargetSelector};
use crate::training::{count_parameters, format_parameter_count};
use crate::traits::Trainable;

/// Replace every targeted dense transform below `graph` with a LoRA adapter.
///
/// Returns the number of substitutions; zero is a valid outcome and is logged
/// as a warning. The root node itself is never replaced.
///
/// # Errors
/// - [`LoraError::InvalidAdapterConfig`] if an adapter cannot be constructed.
///   Substitutions made before the failure are kept.
/// - [`LoraError::GraphTraversal`] if a module reports two children with the
///   same name, or refuses to replace a targeted child. Substitutions made
///   before the failure are kept.
pub fn inject(graph: &mut Node, config: &LoraConfig) -> Result<usize> {
    let selector = TargetSelector::from_config(config);
    let mut count = 0;
    inject_node(graph, "", &selector, config, &mut count)?;

    if count == 0 {
        warn!(
            patterns = ?selector.patterns(),
            "no dense transforms matched the target patterns"
        );
    } else {
        let params = count_parameters(graph);
        info!(
            wrapped = count,
            rank = config.r,
            trainable = %format_parameter_count(params.trainable),
            total = %format_parameter_count(params.total),
            "LoRA injection complete ({:.3}% trainable)",
            params.trainable_percent()
        );
        if config.dropout > 0.0 {
            info!(
                dropout = config.dropout,
                "adapters start in eval mode; call set_training(true) to enable dropout"
            );
        }
    }
    Ok(count)
}

fn inject_node(
    node: &mut Node,
    path: &str,
    selector: &TargetSelector,
    config: &LoraConfig,
    count: &mut usize,
) -> Result<()> {
    let Node::Opaque(module) = node else {
        return Ok(());
    };

    let mut names = HashSet::new();
    let mut targets = Vec::new();
    for (name, child) in module.children() {
        let child_path = join_path(path, name);
        if !names.insert(name) {
            return Err(LoraError::GraphTraversal {
                path: child_path,
                message: "duplicate child name".into(),
            });
        }
        if let Node::Dense(dense) = child {
            if selector.is_target(&child_path) {
                targets.push((name.to_string(), child_path, dense.clone()));
            }
        }
    }

    for (name, child_path, dense) in targets {
        let trainable: Vec<bool> = dense
            .named_parameters()
            .iter()
            .map(|(_, param)| param.is_trainable())
            .collect();
        let adapter = LoraLinear::new(&dense, config)?;
        if let Err(err) = module.replace_child(&name, Node::Adapter(adapter)) {
            // the dense child stays in place, so give back what construction froze
            for ((_, param), was_trainable) in dense.named_parameters().into_iter().zip(trainable) {
                if was_trainable {
                    param.unfreeze();
                }
            }
            return Err(err);
        }
        *count += 1;
        debug!(path = %child_path, "wrapped dense transform");
    }

    for (name, child) in module.children_mut() {
        inject_node(child, &join_path(path, name), selector, config, count)?;
    }
    Ok(())
}

/// Adapter parameters keyed by dotted path, e.g. `blocks.3.attn.to_q.lora_A`.
///
/// The returned variables share storage with the live adapters.
#[must_use]
pub fn named_adapter_parameters(graph: &Node) -> Vec<(String, Var)> {
    named_modules(graph)
        .into_iter()
        .filter_map(|(path, node)| node.as_adapter().map(|adapter| (path, adapter)))
        .flat_map(|(path, adapter)| {
            [
                (join_path(&path, LORA_A), adapter.lora_a().var().clone()),
                (join_path(&path, LORA_B), adapter.lora_b().var().clone()),
            ]
        })
        .collect()
}

/// Every `lora_A`/`lora_B` in the graph, in traversal order.
///
/// Base weights and biases are never included. Suitable for binding an
/// optimizer:
///
/// ```rust,ignore
/// let opt = candle_nn::SGD::new(collect_adapter_parameters(&graph), 1e-3)?;
/// ```
#[must_use]
pub fn collect_adapter_parameters(graph: &Node) -> Vec<Var> {
    named_adapter_parameters(graph)
        .into_iter()
        .map(|(_, var)| var)
        .collect()
}

/// Build a [`VarMap`] holding only the adapter variables, keyed by dotted path.
///
/// # Errors
/// Returns an error if registering a variable fails.
pub fn adapter_var_map(graph: &Node) -> Result<VarMap> {
    let mut var_map = VarMap::new();
    for (path, node) in named_modules(graph) {
        if let Some(adapter) = node.as_adapter() {
            adapter.register_parameters(&mut var_map, &path)?;
        }
    }
    Ok(var_map)
}
