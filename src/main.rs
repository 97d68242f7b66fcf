//! Ember Compiler — compiles a loader-delivered compute graph into an NVM
//! image plus generated declarations for the intermittent inference runtime.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};

use emberc::codegen::{self, CodegenInfo};
use emberc::config::{DeviceConfig, ModelConfig, RecoveryMethod, Target};
use emberc::graph::{Graph, SampleSet};
use emberc::normalize;
use emberc::nvm_format::ImageBuilder;
use emberc::tiling;

#[derive(Parser, Debug)]
#[command(name = "emberc")]
#[command(about = "Compile a compute graph to an NVM image for intermittently-powered MCUs")]
#[command(version)]
#[command(group(ArgGroup::new("method").required(true)))]
struct Args {
    /// Input graph JSON produced by the model loader
    #[arg(long)]
    graph: PathBuf,

    /// Test samples JSON produced by the dataset tooling
    #[arg(long)]
    samples: PathBuf,

    /// Deployment configuration JSON
    #[arg(long)]
    config: PathBuf,

    /// Target device
    #[arg(long, value_enum)]
    target: Target,

    /// Plain layout without crash recovery
    #[arg(long, group = "method")]
    baseline: bool,

    /// Recovery via per-node footprint counters
    #[arg(long, group = "method")]
    hawaii: bool,

    /// Recovery via footprint elements in intermediate values
    #[arg(long, group = "method")]
    japari: bool,

    /// Recovery via per-slot state bits and turning points
    #[arg(long, group = "method")]
    stateful: bool,

    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Embed the full test set instead of the default subset
    #[arg(long)]
    all_samples: bool,

    /// Interleave bias values into convolution filter payloads
    #[arg(long)]
    merge_bias: bool,

    /// Output directory
    #[arg(long, default_value = "build")]
    out_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn method(&self) -> RecoveryMethod {
        if self.hawaii {
            RecoveryMethod::Hawaii
        } else if self.japari {
            RecoveryMethod::Japari
        } else if self.stateful {
            RecoveryMethod::Stateful
        } else {
            RecoveryMethod::Baseline
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Ember Compiler v{}", env!("CARGO_PKG_VERSION"));
    println!("Graph:  {}", args.graph.display());
    println!("Output: {}", args.out_dir.display());
    println!();

    println!("Loading graph...");
    let mut graph = Graph::load(&args.graph)?;
    let samples = SampleSet::load(&args.samples)?;
    let model = ModelConfig::load(&args.config)?;
    let cfg = DeviceConfig::new(
        args.target,
        args.method(),
        args.batch_size,
        args.all_samples,
        args.merge_bias,
        model,
    );

    if args.verbose {
        graph.print_summary();
        println!();
    }

    println!("Normalizing graph...");
    let mut norm = normalize::normalize(&mut graph)?;
    println!("Input and constant tensors: {}", norm.n_input);

    println!("Planning tile sizes...");
    tiling::plan(&mut norm, &graph, &cfg)?;
    let nodes = normalize::freeze(&norm)?;

    println!("Writing NVM image...");
    let out = ImageBuilder::new(&cfg, &graph, &norm, &nodes, &samples, args.verbose).build()?;

    let decls = codegen::generate(&CodegenInfo {
        cfg: &cfg,
        ops: &norm.ops,
        image: &out.image,
        n_input: norm.n_input,
        num_inputs: out.num_inputs,
        model_nodes_len: nodes.len(),
    });

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create output directory {}", args.out_dir.display()))?;
    let image_path = args.out_dir.join("model.bin");
    let file = File::create(&image_path)
        .with_context(|| format!("Failed to create {}", image_path.display()))?;
    let mut writer = BufWriter::new(file);
    out.image.write_to(&mut writer)?;
    writer.flush()?;
    fs::write(args.out_dir.join("samples.bin"), &out.image.samples)?;
    fs::write(args.out_dir.join("data.h"), &decls.header)?;
    fs::write(args.out_dir.join("data.cpp"), &decls.source)?;

    let reserved = cfg.model.num_slots as usize * cfg.model.intermediate_values_size;
    let total = out.image.total_len() + reserved;
    println!("\nCompilation complete!");
    println!("  Nodes:      {}", nodes.len());
    println!("  Operators:  {}", norm.ops.len());
    println!("  Parameters: {} bytes", out.image.parameters.len());
    println!(
        "  Samples:    {} ({} bytes)",
        cfg.n_samples.min(samples.images.len()),
        out.image.samples.len()
    );
    println!(
        "  NVM usage:  {} of {} bytes ({:.1}%)",
        total,
        cfg.nvm_size,
        total as f64 / cfg.nvm_size as f64 * 100.0
    );
    let overflows = out.diagnostics.overflows().len();
    if overflows > 0 {
        println!("  Quantization overflows: {}", overflows);
    }

    Ok(())
}
