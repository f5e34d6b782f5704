use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use wav2vec2_ctc::{
    project_length, CtcLossBuilder, ExampleLoss, InfeasiblePolicy, Wav2Vec2Config,
};

#[derive(Debug, Parser)]
#[command(name = "ctc_loss")]
#[command(about = "Evaluate wav2vec2 CTC loss and conv length bookkeeping")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default config.json into a directory.
    InitConfig {
        #[arg(long, env = "WAV2VEC2_CTC_CONFIG_DIR", default_value = "dummy")]
        out_dir: PathBuf,
    },
    /// Print the encoder sequence length for a raw input length.
    ProjectLength {
        #[arg(long, env = "WAV2VEC2_CTC_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        input_length: usize,
    },
    /// Compute the reduced batch loss from a JSON batch file.
    Loss {
        #[arg(long, env = "WAV2VEC2_CTC_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        batch: PathBuf,
        /// Fixed raw input length of every example; required unless the
        /// batch file carries `input_lengths`.
        #[arg(long)]
        input_frames: Option<usize>,
        #[arg(long, default_value_t = 1.0)]
        division_factor: f64,
        #[arg(long, default_value_t = false)]
        skip_infeasible: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    logits: Vec<Vec<Vec<f32>>>,
    labels: Vec<Vec<usize>>,
    #[serde(default)]
    input_lengths: Option<Vec<usize>>,
}

#[derive(Debug, Serialize)]
struct LossReport {
    loss: f64,
    reduction: String,
    division_factor: f64,
    examples: Vec<ExampleLoss>,
    skipped: Vec<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    match Args::parse().command {
        Command::InitConfig { out_dir } => {
            let config = Wav2Vec2Config::default();
            config
                .save_pretrained(&out_dir)
                .map_err(|err| err.to_string())?;
            println!("{}", out_dir.join("config.json").display());
            Ok(())
        }
        Command::ProjectLength {
            config,
            input_length,
        } => {
            let config = Wav2Vec2Config::from_json(&config).map_err(|err| err.to_string())?;
            let length = project_length(input_length, &config.conv_descriptors())
                .map_err(|err| err.to_string())?;
            println!("{length}");
            Ok(())
        }
        Command::Loss {
            config,
            batch,
            input_frames,
            division_factor,
            skip_infeasible,
            out,
        } => {
            let config = Wav2Vec2Config::from_json(&config).map_err(|err| err.to_string())?;
            let batch = read_batch(&batch)?;
            let policy = if skip_infeasible {
                InfeasiblePolicy::Skip
            } else {
                InfeasiblePolicy::Abort
            };

            let model_input_frames = match (&batch.input_lengths, input_frames) {
                (_, Some(frames)) => frames,
                (Some(lengths), None) => lengths
                    .iter()
                    .copied()
                    .max()
                    .ok_or_else(|| "batch input_lengths is empty".to_string())?,
                (None, None) => {
                    return Err(
                        "--input-frames is required when the batch has no input_lengths"
                            .to_string(),
                    )
                }
            };
            let loss = CtcLossBuilder::new(&config, model_input_frames)
                .with_division_factor(division_factor)
                .with_infeasible_policy(policy)
                .build()
                .map_err(|err| err.to_string())?;

            let output = match &batch.input_lengths {
                Some(lengths) => loss.compute_with_input_lengths(&batch.logits, &batch.labels, lengths),
                None => loss.compute(&batch.logits, &batch.labels),
            }
            .map_err(|err| err.to_string())?;

            let report = LossReport {
                loss: output.loss,
                reduction: config.loss_reduction().to_string(),
                division_factor,
                examples: output.examples,
                skipped: output.skipped,
            };
            let json = serde_json::to_string_pretty(&report)
                .map_err(|err| format!("Failed to serialize report JSON: {err}"))?;
            match out {
                Some(path) => write_report(&path, &json),
                None => {
                    println!("{json}");
                    Ok(())
                }
            }
        }
    }
}

fn read_batch(path: &Path) -> Result<BatchFile, String> {
    let data = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read batch file '{}': {err}", path.display()))?;
    serde_json::from_str(&data)
        .map_err(|err| format!("Failed to parse batch file '{}': {err}", path.display()))
}

fn write_report(path: &Path, json: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create '{}': {err}", parent.display()))?;
    }
    fs::write(path, format!("{json}\n"))
        .map_err(|err| format!("Failed to write report '{}': {err}", path.display()))
}
