//! Inject LoRA adapters into a small transformer-style block.
//!
//! This example demonstrates:
//! - Building a graph of named dense transforms
//! - Injecting adapters by name pattern
//! - Binding an optimizer to the adapter parameters only
//! - Saving the adapter and loading it onto a fresh copy of the graph

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::Optimizer;
use lora_inject::{
    collect_adapter_parameters, count_parameters, format_parameter_count, inject,
    load_pretrained, named_parameters, save_pretrained, DenseLinear, LoraConfig, Node,
    Sequential,
};
use tempfile::TempDir;

fn dense(in_features: usize, out_features: usize, device: &Device) -> Result<DenseLinear> {
    Ok(DenseLinear::new(
        Tensor::randn(0f32, 0.05, (out_features, in_features), device)?,
        Some(Tensor::zeros(out_features, DType::F32, device)?),
    )?)
}

fn block(d: usize, device: &Device) -> Result<Node> {
    let attn = Sequential::new()
        .add("to_q", dense(d, d, device)?)?
        .add("to_k", dense(d, d, device)?)?
        .add("to_v", dense(d, d, device)?)?
        .add("out_proj", dense(d, d, device)?)?;
    let ffn = Sequential::new()
        .add("fc1", dense(d, 4 * d, device)?)?
        .add("fc2", dense(4 * d, d, device)?)?;
    Ok(Sequential::new().add("attn", attn)?.add("ffn", ffn)?.into())
}

fn main() -> Result<()> {
    println!("=== LoRA Injection Example ===\n");

    let device = Device::Cpu;
    let d = 64;
    let mut graph = block(d, &device)?;

    let config = LoraConfig::new(8, 16.0, 0.0)
        .with_target_modules(["to_q", "to_v", "out_proj", "fc1", "fc2"]);
    let wrapped = inject(&mut graph, &config)?;
    let counts = count_parameters(&graph);
    println!("Wrapped {wrapped} transforms");
    println!(
        "  Trainable: {} of {} ({:.2}%)\n",
        format_parameter_count(counts.trainable),
        format_parameter_count(counts.total),
        counts.trainable_percent()
    );

    // A few steps pulling the output towards zero
    graph.set_training(true);
    let mut sgd = candle_nn::SGD::new(collect_adapter_parameters(&graph), 0.01)?;
    let input = Tensor::randn(0f32, 1.0, (16, d), &device)?;
    for step in 0..5 {
        let loss = graph.forward(&input)?.sqr()?.mean_all()?;
        sgd.backward_step(&loss)?;
        println!("  step {step}: loss = {:.6}", loss.to_scalar::<f32>()?);
    }
    graph.set_training(false);

    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path().join("adapter");
    save_pretrained(&graph, &config, &dir)?;
    println!("\nSaved adapter to {}", dir.display());

    // A serving copy with the same base weights
    let mut serving = block(d, &device)?;
    for ((_, src), (_, dst)) in named_parameters(&graph)
        .into_iter()
        .filter(|(path, _)| !path.contains("lora_"))
        .zip(named_parameters(&serving))
    {
        dst.var().set(src.as_tensor())?;
    }
    let loaded = load_pretrained(&mut serving, &dir, &device)?;
    println!(
        "Loaded adapter: wrapped {}, applied {}, skipped {}",
        loaded.wrapped, loaded.report.applied, loaded.report.skipped
    );

    let expected = graph.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
    let actual = serving.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(expected, actual, "restored graph should match the trained one");

    println!("\n✓ Adapter restored onto a fresh graph");
    Ok(())
}
