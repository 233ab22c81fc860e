//! Throughput runner for the slotbatch pipeline
//!
//! Generates synthetic slot-format samples and times parse, collate and
//! materialize over them.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slotbatch_core::{ColumnSpec, MemoryPool, PoolConfig, RowSchema, Stage};
use slotbatch_readers::{MemoryChunks, ParserOptions, RecordParser};
use slotbatch_transforms::{materialize, BatchCollator, CollatorOptions};
use tracing::{debug, info};

/// Everything needed to build a parse-and-collate pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Record parser options
    pub parser: ParserOptions,

    /// Row columns, in declaration order
    pub columns: Vec<ColumnSpec>,

    /// Batch collation options
    pub collator: CollatorOptions,

    /// Memory pool configuration
    pub pool: PoolConfig,
}

impl PipelineConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid pipeline configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Check the parser, pool and schema settings
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parser.validate()?;
        self.pool.validate()?;
        self.schema()?;
        Ok(())
    }

    /// Row schema built from the declared columns
    pub fn schema(&self) -> anyhow::Result<Arc<RowSchema>> {
        Ok(Arc::new(RowSchema::new(self.columns.clone())?))
    }
}

/// Shape of generated samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Number of lines to generate
    pub samples: usize,

    /// Number of dense slots per line
    pub dense_slots: usize,

    /// Number of sparse slots per line
    pub sparse_slots: usize,

    /// Largest dense slot width
    pub max_dense_size: usize,

    /// Most ids in one sparse slot
    pub max_sparse_ids: usize,

    /// Generator seed
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            samples: 1000,
            dense_slots: 30,
            sparse_slots: 20,
            max_dense_size: 13,
            max_sparse_ids: 4,
            seed: 42,
        }
    }
}

/// SplitMix64, enough for reproducible synthetic data
#[derive(Debug, Clone)]
struct SplitMix(u64);

impl SplitMix {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `1..=max`
    fn range(&mut self, max: usize) -> usize {
        (self.next_u64() % max.max(1) as u64) as usize + 1
    }

    /// Uniform in `[0, 1)` at six decimal places
    fn unit(&mut self) -> f64 {
        (self.next_u64() % 1_000_000) as f64 / 1_000_000.0
    }
}

/// Generator for `sample_id|group_id|sparse|dense|label|timestamp` lines
#[derive(Debug, Clone)]
pub struct SampleGenerator {
    config: SampleConfig,
    dense: Vec<(String, usize)>,
    sparse: Vec<String>,
}

impl SampleGenerator {
    /// Create a generator; slot names and widths are fixed by the seed
    pub fn new(config: SampleConfig) -> Self {
        let mut rng = SplitMix(config.seed);
        let dense = (0..config.dense_slots)
            .map(|i| (format!("d{i}"), rng.range(config.max_dense_size)))
            .collect();
        let sparse = (0..config.sparse_slots).map(|i| format!("{}", 1000 + i)).collect();

        Self { config, dense, sparse }
    }

    /// Pipeline configuration matching the generated lines
    pub fn pipeline_config(&self, collator: CollatorOptions) -> anyhow::Result<PipelineConfig> {
        let mut columns = vec![ColumnSpec::string("sample_id")?, ColumnSpec::string("group_id")?];
        for name in &self.sparse {
            columns.push(ColumnSpec::sparse(name.as_str(), &[-1])?);
        }
        for (name, width) in &self.dense {
            columns.push(ColumnSpec::dense(name.as_str(), &[i64::try_from(*width)?])?);
        }

        Ok(PipelineConfig {
            parser: ParserOptions {
                external_keys: vec!["label".into(), "timestamp".into()],
                ..ParserOptions::with_format("sample_id|group_id|sparse|dense|label|timestamp")
            },
            columns,
            collator,
            pool: PoolConfig::default(),
        })
    }

    /// Generate every configured sample as one newline-terminated buffer
    pub fn generate(&self) -> String {
        let mut rng = SplitMix(self.config.seed.rotate_left(17));
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let mut out = String::new();

        for sample_id in 0..self.config.samples {
            let group_id = rng.range(1000);
            let _ = write!(out, "{sample_id}|{group_id}|");

            for (i, name) in self.sparse.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                let _ = write!(out, "{name}@");
                for j in 0..rng.range(self.config.max_sparse_ids) {
                    if j > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}:{:.6}", rng.next_u64() & 0xFFFF_FFFF, rng.unit());
                }
            }
            out.push('|');

            for (i, (name, width)) in self.dense.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                let _ = write!(out, "{name}@");
                for j in 0..*width {
                    if j > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{:.6}", rng.unit());
                }
            }

            let _ = writeln!(out, "|{}|{timestamp}", rng.next_u64() % 2);
        }
        out
    }
}

/// Benchmark configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Number of timed iterations
    pub iterations: usize,

    /// Untimed iterations run first
    pub warmup_iterations: usize,

    /// Batch collation options
    pub collator: CollatorOptions,

    /// Synthetic sample shape
    pub samples: SampleConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 2,
            collator: CollatorOptions::default(),
            samples: SampleConfig::default(),
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time of the timed iterations
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Rows produced per iteration
    pub rows: usize,

    /// Bytes mapped by the memory pool at the end of the run
    pub mapped_bytes: usize,

    /// Throughput (rows/second)
    pub throughput: f64,
}

/// Time `func`, which returns the number of rows it processed
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, pool: &MemoryPool, mut func: F) -> anyhow::Result<BenchResult>
where
    F: FnMut() -> anyhow::Result<usize>,
{
    anyhow::ensure!(config.iterations > 0, "Benchmark needs at least one iteration");

    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let mut rows = 0;
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        rows = func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = total_time / u32::try_from(times.len())?;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let throughput = (rows * config.iterations) as f64 / total_time.as_secs_f64();

    let result = BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        rows,
        mapped_bytes: pool.stats().mapped_bytes,
        throughput,
    };
    info!(name, rows, avg_us = result.avg_time.as_micros(), "benchmark finished");
    Ok(result)
}

/// Parse, collate and materialize `data` once; returns the row count
pub fn run_pipeline(data: &[u8], pipeline: &PipelineConfig, pool: &MemoryPool) -> anyhow::Result<usize> {
    let schema = pipeline.schema()?;
    let source = MemoryChunks::from_bytes(data, pipeline.parser.chunk_size)?;
    let parser = RecordParser::with_pool(source, schema, &pipeline.parser, pool.clone())?;
    let mut collator = BatchCollator::new(parser, pipeline.collator)?;

    let mut rows = 0;
    while let Some(batch) = collator.next()? {
        let out = materialize(&batch)?;
        rows += out.batch_size();
    }
    debug!(rows, stats = ?collator.stats(), "pipeline drained");
    Ok(rows)
}

/// Benchmark the full pipeline over generated samples
pub fn bench_pipeline(config: &BenchConfig) -> anyhow::Result<BenchResult> {
    let generator = SampleGenerator::new(config.samples.clone());
    let pipeline = generator.pipeline_config(config.collator)?;
    let data = generator.generate();
    let pool = MemoryPool::with_config(pipeline.pool.clone())?;

    run_benchmark("parse + collate + materialize", config, &pool, || {
        run_pipeline(data.as_bytes(), &pipeline, &pool)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn small() -> SampleConfig {
        SampleConfig {
            samples: 25,
            dense_slots: 3,
            sparse_slots: 2,
            ..SampleConfig::default()
        }
    }

    #[test]
    fn test_generated_samples_parse() {
        let generator = SampleGenerator::new(small());
        let data = generator.generate();
        assert_eq!(data.lines().count(), 25);

        let pipeline = generator
            .pipeline_config(CollatorOptions {
                batch_size: 10,
                drop_last_batch: false,
            })
            .unwrap();
        let rows = run_pipeline(data.as_bytes(), &pipeline, &MemoryPool::new()).unwrap();
        assert_eq!(rows, 25);
    }

    #[test]
    fn test_generator_is_deterministic() {
        let a = SampleGenerator::new(small()).generate();
        let b = SampleGenerator::new(small()).generate();
        let strip = |s: &str| s.lines().map(|l| l.rsplit_once('|').unwrap().0.to_string()).collect::<Vec<_>>();
        assert_eq!(strip(&a), strip(&b));
    }

    #[test]
    fn test_pipeline_config_from_json() {
        let json = r#"{
            "parser": { "format": "id|dense" },
            "columns": [
                { "name": "id", "dtype": "string", "kind": "string" },
                { "name": "f", "dtype": "float32", "shape": [2], "kind": "dense" }
            ],
            "collator": { "batch_size": 2 }
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = PipelineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.collator.batch_size, 2);
        assert_eq!(config.schema().unwrap().len(), 2);

        let rows = run_pipeline(b"a|f@1,2\nb|f@3\nc|f@4\n", &config, &MemoryPool::new()).unwrap();
        assert_eq!(rows, 3);
    }

    #[test]
    fn test_pipeline_config_rejects_bad_columns() {
        let json = r#"{
            "parser": { "format": "dense" },
            "columns": [{ "name": "f", "dtype": "int64", "shape": [2], "kind": "dense" }]
        }"#;
        assert!(PipelineConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_bench_pipeline_runs() {
        let config = BenchConfig {
            iterations: 2,
            warmup_iterations: 1,
            collator: CollatorOptions {
                batch_size: 8,
                drop_last_batch: true,
            },
            samples: small(),
        };
        let result = bench_pipeline(&config).unwrap();
        assert_eq!(result.rows, 24);
        assert!(result.mapped_bytes > 0);
    }
}
