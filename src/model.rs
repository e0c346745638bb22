//! Model graph abstraction for adapter injection.
//!
//! This module provides:
//! - The [`Module`] trait a host implements to expose its named children
//! - The [`Node`] enum distinguishing dense, adapter and opaque nodes
//! - A [`Sequential`] container for building graphs
//! - The [`TargetSelector`] name predicate
//! - Dotted-path traversal helpers

use std::fmt;

use candle_core::Tensor;

use crate::adapters::lora::LoraLinear;
use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::linear::{DenseLinear, Parameter};

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

/// A host module with named children and its own parameters.
///
/// Only containers need to override the child accessors; leaf modules keep the
/// empty defaults.
pub trait Module: fmt::Debug + Send + Sync {
    /// Forward pass.
    ///
    /// # Errors
    /// Returns an error if the computation fails.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Direct children, in a stable order.
    fn children(&self) -> Vec<(&str, &Node)> {
        Vec::new()
    }

    /// Mutable access to the direct children, in the same order as [`Module::children`].
    fn children_mut(&mut self) -> Vec<(&str, &mut Node)> {
        Vec::new()
    }

    /// Replace the child called `name`, returning the previous node.
    ///
    /// # Errors
    /// Returns [`LoraError::GraphTraversal`] if there is no such child.
    fn replace_child(&mut self, name: &str, node: Node) -> Result<Node> {
        drop(node);
        Err(LoraError::GraphTraversal {
            path: name.to_string(),
            message: "module has no replaceable children".into(),
        })
    }

    /// Parameters owned directly by this module (not its children).
    fn parameters(&self) -> Vec<(&str, &Parameter)> {
        Vec::new()
    }
}

/// A node of the model graph.
#[derive(Debug)]
pub enum Node {
    /// Dense linear transform, eligible for adaptation
    Dense(DenseLinear),
    /// Dense transform already wrapped with a LoRA adapter
    Adapter(LoraLinear),
    /// Any other host module
    Opaque(Box<dyn Module>),
}

impl Node {
    /// Box a host module.
    pub fn opaque(module: impl Module + 'static) -> Self {
        Self::Opaque(Box::new(module))
    }

    /// Short name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense(_) => "dense",
            Self::Adapter(_) => "adapter",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Forward pass.
    ///
    /// # Errors
    /// Returns an error if the computation fails.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(dense) => dense.forward(xs),
            Self::Adapter(adapter) => adapter.forward(xs),
            Self::Opaque(module) => module.forward(xs),
        }
    }

    /// Direct children. Dense and adapter nodes are leaves.
    #[must_use]
    pub fn children(&self) -> Vec<(&str, &Node)> {
        match self {
            Self::Opaque(module) => module.children(),
            _ => Vec::new(),
        }
    }

    /// Mutable direct children.
    pub fn children_mut(&mut self) -> Vec<(&str, &mut Node)> {
        match self {
            Self::Opaque(module) => module.children_mut(),
            _ => Vec::new(),
        }
    }

    /// Parameters owned directly by this node.
    #[must_use]
    pub fn parameters(&self) -> Vec<(&str, &Parameter)> {
        match self {
            Self::Dense(dense) => dense.named_parameters(),
            Self::Adapter(adapter) => adapter.named_parameters(),
            Self::Opaque(module) => module.parameters(),
        }
    }

    /// Switch every adapter below this node between training and eval mode.
    pub fn set_training(&mut self, training: bool) {
        match self {
            Self::Adapter(adapter) => adapter.set_training(training),
            Self::Dense(_) => {}
            Self::Opaque(module) => {
                for (_, child) in module.children_mut() {
                    child.set_training(training);
                }
            }
        }
    }

    /// The dense transform, if this is a dense node.
    #[must_use]
    pub fn as_dense(&self) -> Option<&DenseLinear> {
        match self {
            Self::Dense(dense) => Some(dense),
            _ => None,
        }
    }

    /// The adapter, if this node has been wrapped.
    #[must_use]
    pub fn as_adapter(&self) -> Option<&LoraLinear> {
        match self {
            Self::Adapter(adapter) => Some(adapter),
            _ => None,
        }
    }
}

impl From<DenseLinear> for Node {
    fn from(dense: DenseLinear) -> Self {
        Self::Dense(dense)
    }
}

impl From<LoraLinear> for Node {
    fn from(adapter: LoraLinear) -> Self {
        Self::Adapter(adapter)
    }
}

impl From<Sequential> for Node {
    fn from(sequential: Sequential) -> Self {
        Self::opaque(sequential)
    }
}

/// Ordered container of uniquely named children, applied one after another.
#[derive(Debug, Default)]
pub struct Sequential {
    layers: Vec<(String, Node)>,
}

impl Sequential {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a child, builder style.
    ///
    /// # Errors
    /// Returns [`LoraError::GraphTraversal`] if the name is already taken.
    pub fn add(mut self, name: impl Into<String>, node: impl Into<Node>) -> Result<Self> {
        self.push(name, node)?;
        Ok(self)
    }

    /// Append a child.
    ///
    /// # Errors
    /// Returns [`LoraError::GraphTraversal`] if the name is already taken.
    pub fn push(&mut self, name: impl Into<String>, node: impl Into<Node>) -> Result<()> {
        let name = name.into();
        if self.layers.iter().any(|(existing, _)| *existing == name) {
            return Err(LoraError::GraphTraversal {
                path: name,
                message: "duplicate child name".into(),
            });
        }
        self.layers.push((name, node.into()));
        Ok(())
    }

    /// Number of direct children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the container has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (_, layer) in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }

    fn children(&self) -> Vec<(&str, &Node)> {
        self.layers
            .iter()
            .map(|(name, node)| (name.as_str(), node))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<(&str, &mut Node)> {
        self.layers
            .iter_mut()
            .map(|(name, node)| (name.as_str(), node))
            .collect()
    }

    fn replace_child(&mut self, name: &str, node: Node) -> Result<Node> {
        let slot = self
            .layers
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .ok_or_else(|| LoraError::GraphTraversal {
                path: name.to_string(),
                message: "no such child".into(),
            })?;
        Ok(std::mem::replace(&mut slot.1, node))
    }
}

/// Decides which dense transforms are adapted, by dotted name.
///
/// A name is a target when it contains any pattern as a literal substring,
/// ignoring case. `"proj"` therefore matches `out_proj`, `q_proj` and anything
/// else containing `proj`.
#[derive(Debug, Clone, Default)]
pub struct TargetSelector {
    patterns: Vec<String>,
}

impl TargetSelector {
    /// Build a selector from a pattern set.
    #[must_use]
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Selector for the configured target modules.
    #[must_use]
    pub fn from_config(config: &LoraConfig) -> Self {
        Self::new(&config.target_modules)
    }

    /// Lowercased patterns.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check whether a dotted module name is an adaptation target.
    #[must_use]
    pub fn is_target(&self, dotted_name: &str) -> bool {
        let name = dotted_name.to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }
}

/// Join a parent path and a child name; children of the root have no prefix.
#[must_use]
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}{PATH_SEPARATOR}{name}")
    }
}

/// All nodes in pre-order with their dotted paths. The root has path `""`.
#[must_use]
pub fn named_modules(root: &Node) -> Vec<(String, &Node)> {
    fn visit<'a>(node: &'a Node, path: String, out: &mut Vec<(String, &'a Node)>) {
        let children = node.children();
        out.push((path.clone(), node));
        for (name, child) in children {
            visit(child, join_path(&path, name), out);
        }
    }

    let mut out = Vec::new();
    visit(root, String::new(), &mut out);
    out
}

/// All parameters in traversal order, keyed by dotted path.
#[must_use]
pub fn named_parameters(root: &Node) -> Vec<(String, &Parameter)> {
    named_modules(root)
        .into_iter()
        .flat_map(|(path, node)| {
            node.parameters()
                .into_iter()
                .map(move |(name, param)| (join_path(&path, name), param))
        })
        .collect()
}

/// Parameters currently in the trainable set.
#[must_use]
pub fn trainable_parameters(root: &Node) -> Vec<(String, &Parameter)> {
    named_parameters(root)
        .into_iter()
        .filter(|(_, param)| param.is_trainable())
        .collect()
}
