//! Benchmark runner for the slotbatch pipeline
//!
//! Usage: `slotbatch-bench [bench-config.json]`

use anyhow::Context;
use slotbatch_bench::{bench_pipeline, BenchConfig, BenchResult};
use slotbatch_transforms::CollatorOptions;

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Rows:         {}", result.rows);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} rows/sec", result.throughput);
    println!("  Pool mapped:  {} bytes", result.mapped_bytes);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?;
            serde_json::from_str::<BenchConfig>(&json).with_context(|| format!("Invalid bench config in {path}"))?
        }
        None => BenchConfig::default(),
    };

    println!("=== Slotbatch Pipeline Benchmarks ===");
    print_result(&bench_pipeline(&config)?);

    // Batch size sweep
    println!("\n=== Batch Size Sweep ===");
    for batch_size in [32, 128, 512] {
        let sweep = BenchConfig {
            iterations: 3,
            warmup_iterations: 1,
            collator: CollatorOptions {
                batch_size,
                ..config.collator
            },
            ..config.clone()
        };
        let result = bench_pipeline(&sweep)?;
        println!("\nBatch size: {batch_size}");
        println!("  Average time: {:?}", result.avg_time);
        println!("  Throughput:   {:.2} rows/sec", result.throughput);
    }

    Ok(())
}
