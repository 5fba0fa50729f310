//! rasternet CLI - inspect compiled models, dump shaders, run on the GPU.

mod inputs;
mod inspect;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rasternet_compiler::{CompileOptions, EngineOptions};
use rasternet_core::reference::evaluate;
use rasternet_model::LoadedModel;
use rasternet_runtime::{Runtime, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Largest absolute difference `--verify` accepts.
const VERIFY_TOLERANCE: f32 = 0.1;

#[derive(Parser)]
#[command(name = "rasternet")]
#[command(about = "Run CNN models as GPU raster programs", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CompileArgs {
    /// Path to the model.json file
    #[arg(value_name = "MODEL")]
    model: PathBuf,

    /// Engine options JSON file (defaults when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Outputs to compute (defaults to the signature outputs)
    #[arg(short, long = "output", value_name = "NAME")]
    outputs: Vec<String>,

    /// Concrete input shape (format: name=1,224,224,3, can be repeated)
    #[arg(short = 's', long = "input-shape")]
    input_shapes: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the schedule, texture layouts and program bindings of a model
    Inspect {
        #[command(flatten)]
        compile: CompileArgs,
    },
    /// Print the WGSL program generated for one node
    Shader {
        #[command(flatten)]
        compile: CompileArgs,

        /// Node whose program to print
        #[arg(short, long, value_name = "NAME")]
        node: String,
    },
    /// Run a model on the GPU and print its outputs as nested JSON
    Run {
        #[command(flatten)]
        compile: CompileArgs,

        /// Input tensor as nested JSON arrays (format: name=file.json, can be repeated)
        #[arg(short, long = "input")]
        inputs: Vec<String>,

        /// Fill inputs not given with --input with uniform random values
        #[arg(long)]
        random_inputs: bool,

        /// Seed for --random-inputs
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Compare every output with the host reference evaluator
        #[arg(long)]
        verify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Inspect { compile } => {
            let (model, options, compile_options) = load(&compile).await?;
            inspect::print_compiled(&model, &options, &compile_options)?;
        }
        Commands::Shader { compile, node } => {
            let (model, options, compile_options) = load(&compile).await?;
            inspect::print_shader(&model, &options, &compile_options, &node)?;
        }
        Commands::Run {
            compile,
            inputs,
            random_inputs,
            seed,
            verify,
        } => {
            let (model, options, compile_options) = load(&compile).await?;
            cmd_run(
                &model,
                options,
                &compile_options,
                &inputs,
                random_inputs.then_some(seed),
                verify,
            )
            .await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info,rasternet_compiler=debug,rasternet_runtime=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load(args: &CompileArgs) -> Result<(LoadedModel, EngineOptions, CompileOptions)> {
    let model = rasternet_model::load_model(args.model.to_string_lossy())
        .await
        .with_context(|| format!("Failed to load model from {}", args.model.display()))?;

    let options = match &args.config {
        Some(path) => load_options(path).await?,
        None => EngineOptions::default(),
    };

    let input_shapes = args
        .input_shapes
        .iter()
        .map(|arg| inputs::parse_shape_arg(arg))
        .collect::<Result<HashMap<_, _>>>()?;

    let compile_options = CompileOptions {
        outputs: args.outputs.clone(),
        input_shapes,
    };
    Ok((model, options, compile_options))
}

async fn load_options(path: &Path) -> Result<EngineOptions> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read engine options from {}", path.display()))?;
    EngineOptions::from_json(&text)
        .with_context(|| format!("Invalid engine options in {}", path.display()))
}

async fn cmd_run(
    model: &LoadedModel,
    options: EngineOptions,
    compile_options: &CompileOptions,
    input_args: &[String],
    random_seed: Option<u64>,
    verify: bool,
) -> Result<()> {
    let runtime = Runtime::new().await.context("Failed to initialize GPU")?;
    let info = runtime.adapter_info();
    eprintln!("GPU: {} ({:?})", info.name, info.backend);

    let mut engine = runtime
        .engine(options)
        .context("Engine options exceed the device limits")?;
    engine
        .compile(model, compile_options)
        .context("Failed to compile model")?;
    let compiled = engine
        .compiled()
        .context("Engine has no compiled graph after compile")?;

    let mut feeds: Vec<(String, Tensor)> = Vec::new();
    for arg in input_args {
        feeds.push(inputs::load_input_arg(arg).await?);
    }
    if let Some(seed) = random_seed {
        let generated = inputs::random_inputs(compiled, &feeds, seed)?;
        feeds.extend(generated);
    }
    let provided = inputs::to_value_map(&feeds)?;
    let reference = if verify {
        let lookup = compiled
            .schedule()
            .bind_inputs(&provided)
            .context("Inputs do not match the compiled graph")?;
        Some(evaluate(compiled.schedule(), &lookup).context("Reference evaluation failed")?)
    } else {
        None
    };

    let feeds: Vec<(&str, Tensor)> = feeds
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();
    let start = std::time::Instant::now();
    let outputs = engine.run(&feeds).context("GPU run failed")?;
    eprintln!("Ran {} programs in {:.2?}", engine.pipeline_count(), start.elapsed());

    let mut printed = serde_json::Map::new();
    for (name, tensor) in &outputs {
        printed.insert(name.clone(), tensor.to_nested()?);
    }
    println!("{}", serde_json::to_string_pretty(&printed)?);

    if let Some(reference) = reference {
        let mut worst = 0.0f32;
        for (name, expected) in &reference {
            let actual = outputs
                .get(name)
                .with_context(|| format!("GPU run produced no output '{name}'"))?
                .to_f32_vec()?;
            let expected = expected
                .to_f32_vec()
                .with_context(|| format!("Reference output '{name}' is not numeric"))?;
            let diff = actual
                .iter()
                .zip(&expected)
                .map(|(a, e)| (a - e).abs())
                .fold(0.0f32, f32::max);
            eprintln!("  {name}: max |gpu - reference| = {diff:.6}");
            worst = worst.max(diff);
        }
        if worst > VERIFY_TOLERANCE {
            anyhow::bail!(
                "GPU output differs from the reference by {worst}, tolerance is {VERIFY_TOLERANCE}"
            );
        }
        eprintln!("Verified against the host reference (tolerance {VERIFY_TOLERANCE})");
    }

    Ok(())
}

