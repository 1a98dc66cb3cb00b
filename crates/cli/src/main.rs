use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};

use ternify_common::NetSpec;
use ternify_core::calibrate::calibrate_tree;
use ternify_core::module::{visit, EmbeddingUnit, LinearUnit, ModuleNode, NormUnit};
use ternify_core::quantize::ternary_distribution;
use ternify_core::tlora::TLoraConfig;
use ternify_rewrite::{attach_tlora, convert_tree, save_calibration, save_manifest, SwapPolicy};

#[derive(Parser, Debug)]
#[command(name = "ternify", about = "Unified CLI for the ternify conversion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert linear units to BitLinear and write the manifest.
    Convert(ConvertArgs),
    /// Calibrate per-row scale/threshold from activation samples.
    Calibrate(CalibrateArgs),
    /// Attach ternary LoRA adapters to linear units.
    Adapt(AdaptArgs),
    /// Run the pipeline end to end: convert, persist the manifest, calibrate,
    /// persist the scales, attach adapters.
    Pipeline(PipelineArgs),
}

// ── Convert ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ConvertArgs {
    #[arg(long, default_value = "netspec.json")]
    spec: PathBuf,
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,
    /// Drop bias vectors instead of copying them into the replacements.
    #[arg(long)]
    no_bias: bool,
}

// ── Calibrate ──────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct CalibrateArgs {
    #[arg(long, default_value = "netspec.json")]
    spec: PathBuf,
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,
    /// Number of activation samples to draw.
    #[arg(long, default_value = "4")]
    samples: usize,
    #[arg(long, default_value = "8")]
    batch_size: usize,
}

// ── Adapt ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct AdaptArgs {
    #[arg(long, default_value = "netspec.json")]
    spec: PathBuf,
    #[arg(long, default_value = "8")]
    rank: usize,
    #[arg(long, default_value = "16.0")]
    alpha: f64,
    #[arg(long, default_value = "0.0")]
    dropout: f32,
}

// ── Pipeline ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PipelineArgs {
    #[arg(long, default_value = "netspec.json")]
    spec: PathBuf,
    #[arg(long, default_value = "out")]
    output_dir: PathBuf,
    #[arg(long, default_value = "4")]
    samples: usize,
    #[arg(long, default_value = "8")]
    batch_size: usize,
    #[arg(long, default_value = "8")]
    rank: usize,
    #[arg(long, default_value = "16.0")]
    alpha: f64,
    #[arg(long, default_value = "0.0")]
    dropout: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let device = Device::Cpu;

    match cli.command {
        Command::Convert(args) => run_convert(args, &device),
        Command::Calibrate(args) => run_calibrate(args, &device),
        Command::Adapt(args) => run_adapt(args, &device),
        Command::Pipeline(args) => run_pipeline(args, &device),
    }
}

// ── Commands ───────────────────────────────────────────────────────────────────

fn run_convert(args: ConvertArgs, device: &Device) -> Result<()> {
    let spec = load_or_create_spec(&args.spec)?;
    let mut tree = build_tree(&spec, device)?;
    let policy = SwapPolicy {
        include_bias: !args.no_bias,
        ..Default::default()
    };
    let manifest = convert_tree(&mut tree, &policy)?;

    std::fs::create_dir_all(&args.output_dir)?;
    save_manifest(&manifest, &args.output_dir.join("manifest.json"))?;

    // Sparsity of the first converted layer, for a quick sanity read.
    let mut first_bit = None;
    visit(&tree, |path, node| {
        if first_bit.is_none() {
            if let ModuleNode::BitLinear(bit) = node {
                first_bit = Some((path.to_string(), bit));
            }
        }
    });
    if let Some((path, bit)) = first_bit {
        let (neg, zero, pos) = ternary_distribution(bit.weight().as_tensor(), bit.threshold())?;
        tracing::info!(path = %path, neg, zero, pos, "Ternary weight distribution");
    }
    Ok(())
}

fn run_calibrate(args: CalibrateArgs, device: &Device) -> Result<()> {
    let spec = load_or_create_spec(&args.spec)?;
    let tree = build_tree(&spec, device)?;
    let samples = draw_samples(&spec, args.samples, args.batch_size, device)?;
    let results = calibrate_tree(&tree, &samples)?;

    for (path, result) in &results {
        let mean_error = result.error.mean_all()?.to_scalar::<f32>()?;
        tracing::info!(path = %path, mean_error, "Calibrated");
    }

    std::fs::create_dir_all(&args.output_dir)?;
    save_calibration(&results, &args.output_dir.join("calibration.json"))?;
    Ok(())
}

fn run_adapt(args: AdaptArgs, device: &Device) -> Result<()> {
    let spec = load_or_create_spec(&args.spec)?;
    let mut tree = build_tree(&spec, device)?;
    let config = TLoraConfig {
        r: args.rank,
        alpha: args.alpha,
        dropout: args.dropout,
    };
    let adapters = attach_tlora(&mut tree, &config)?;

    let trainable: usize = adapters
        .iter()
        .flat_map(|(_, a)| a.trainable_vars())
        .map(|v| v.elem_count())
        .sum();
    tracing::info!(
        adapters = adapters.len(),
        trainable_params = trainable,
        scale = config.alpha / config.r as f64,
        "Adapters attached"
    );
    Ok(())
}

fn run_pipeline(args: PipelineArgs, device: &Device) -> Result<()> {
    let spec = load_or_create_spec(&args.spec)?;
    let mut tree = build_tree(&spec, device)?;
    std::fs::create_dir_all(&args.output_dir)?;

    let manifest = convert_tree(&mut tree, &SwapPolicy::default())?;
    save_manifest(&manifest, &args.output_dir.join("manifest.json"))?;

    let samples = draw_samples(&spec, args.samples, args.batch_size, device)?;
    let results = calibrate_tree(&tree, &samples)?;
    save_calibration(&results, &args.output_dir.join("calibration.json"))?;

    let config = TLoraConfig {
        r: args.rank,
        alpha: args.alpha,
        dropout: args.dropout,
    };
    let adapters = attach_tlora(&mut tree, &config)?;

    // Smoke-test the converted tree with one batch.
    let mut out_dims = Vec::new();
    if spec.vocab_size == 0 {
        let out = tree.forward(&samples[0], false)?;
        out_dims = out.dims().to_vec();
    }
    tracing::info!(
        converted = manifest.len(),
        calibrated = results.len(),
        adapters = adapters.len(),
        output_dims = ?out_dims,
        "Pipeline complete"
    );
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn load_or_create_spec(path: &PathBuf) -> Result<NetSpec> {
    let spec = if path.exists() {
        NetSpec::load(path)?
    } else {
        let default = NetSpec::default();
        default.save(path)?;
        eprintln!("Created default net spec at {}", path.display());
        default
    };
    spec.validate()?;
    Ok(spec)
}

/// Build the demo module tree described by the spec: an optional embedding,
/// `blocks.N.{proj, norm}` composites, and a final head.
fn build_tree(spec: &NetSpec, device: &Device) -> Result<ModuleNode> {
    let mut children: Vec<(String, ModuleNode)> = Vec::new();
    if spec.vocab_size > 0 {
        children.push((
            "embed".to_string(),
            ModuleNode::Embedding(EmbeddingUnit::new(spec.vocab_size, spec.input_dim, device)?),
        ));
    }

    let mut blocks: Vec<(String, ModuleNode)> = Vec::new();
    let mut dim = spec.input_dim;
    for i in 0..spec.num_blocks {
        let mut block: Vec<(String, ModuleNode)> = vec![(
            "proj".to_string(),
            ModuleNode::Linear(LinearUnit::new(dim, spec.hidden_dim, spec.use_bias, device)?),
        )];
        if spec.use_norm {
            block.push((
                "norm".to_string(),
                ModuleNode::Norm(NormUnit::new(spec.hidden_dim, 1e-5, device)?),
            ));
        }
        blocks.push((i.to_string(), ModuleNode::Composite(block)));
        dim = spec.hidden_dim;
    }
    children.push(("blocks".to_string(), ModuleNode::Composite(blocks)));
    children.push((
        "head".to_string(),
        ModuleNode::Linear(LinearUnit::new(dim, spec.output_dim, spec.use_bias, device)?),
    ));
    Ok(ModuleNode::Composite(children))
}

/// Draw Gaussian activation samples shaped for the tree's input.
fn draw_samples(
    spec: &NetSpec,
    count: usize,
    batch_size: usize,
    device: &Device,
) -> Result<Vec<Tensor>> {
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        samples.push(Tensor::randn(
            0f32,
            1f32,
            (batch_size, spec.input_dim),
            device,
        )?);
    }
    Ok(samples)
}
