//! # lora-inject
//!
//! In-place LoRA (Low-Rank Adaptation) injection for candle module graphs.
//!
//! The crate walks a model graph, picks the dense linear transforms whose
//! dotted names match a set of case-insensitive substrings, and swaps each one
//! for a [`LoraLinear`] that keeps the base weights frozen and shared while
//! adding a trainable `B·A` correction. Only the adapter parameters are handed
//! out for optimization and checkpointing.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lora_inject::{collect_adapter_parameters, inject, DenseLinear, LoraConfig, Sequential};
//! use candle_core::{DType, Device, Tensor};
//!
//! let device = Device::Cpu;
//! let attn = Sequential::new()
//!     .add("to_q", DenseLinear::new(Tensor::zeros((64, 64), DType::F32, &device)?, None)?)?
//!     .add("to_v", DenseLinear::new(Tensor::zeros((64, 64), DType::F32, &device)?, None)?)?;
//! let mut graph = Sequential::new().add("attn", attn)?.into();
//!
//! let config = LoraConfig::new(8, 16.0, 0.0).with_target_modules(["to_q", "to_v"]);
//! let wrapped = inject(&mut graph, &config)?;
//! let optimizer = candle_nn::SGD::new(collect_adapter_parameters(&graph), 1e-3)?;
//! ```
//!
//! ## Architecture
//!
//! The graph is a tree of [`Node`]s: dense transforms, adapters, or opaque host
//! modules implementing [`Module`]. Injection only ever looks at a module's
//! named children and replaces them by name.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod inject;
pub mod io;
pub mod linear;
pub mod model;
pub mod training;
pub mod traits;

pub use adapters::lora::{LoraLinear, LORA_A, LORA_B};
pub use config::LoraConfig;
pub use error::{LoraError, Result};
pub use inject::{adapter_var_map, collect_adapter_parameters, inject, named_adapter_parameters};
pub use io::{
    adapter_state_dict, load_adapter_config, load_adapter_file, load_adapter_state,
    load_pretrained, save_adapter_config, save_adapter_state, save_pretrained, LoadedAdapter,
    RestoreReport, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use linear::{DenseLinear, Parameter};
pub use model::{
    join_path, named_modules, named_parameters, trainable_parameters, Module, Node, Sequential,
    TargetSelector,
};
pub use training::{count_parameters, format_parameter_count, ParameterCount};
pub use traits::{Adapter, AdapterConfig, Mergeable, Trainable};
