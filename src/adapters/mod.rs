//! Adapter transforms substituted into a model graph.

pub mod lora;
