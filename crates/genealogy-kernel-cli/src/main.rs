use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use genealogy_kernel_core::{
    EventOutput, GenealogyKernel, KernelConfig, StepRecord, TrackCreation, TrackEnd, TruthRecord,
};
use serde::Deserialize;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "gk.v1";

#[derive(Debug, Parser)]
#[command(name = "gk")]
#[command(about = "Particle genealogy kernel CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive the kernel with an NDJSON event stream and print the finalized
    /// output collections.
    Run(RunArgs),
    /// Inspect kernel configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Event-stream file: one engine event per line.
    #[arg(long)]
    events: PathBuf,
    /// Kernel configuration file (JSON); defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the resolved default configuration.
    Default,
}

/// One line of the event stream: the transport-engine lifecycle callbacks in
/// their causal order.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EngineEvent {
    BeginEvent { truth: Vec<TruthRecord> },
    TrackCreated(TrackCreation),
    Step(StepRecord),
    TrackEnded(TrackEnd),
    EndEvent,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value, pretty: bool) -> Result<()> {
    let wrapped = with_contract_version(value);
    if pretty {
        println!("{}", serde_json::to_string_pretty(&wrapped)?);
    } else {
        println!("{}", serde_json::to_string(&wrapped)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    // Diagnostics go to stderr so stdout stays a single JSON document.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(&args),
        Command::Config { command } => match command {
            ConfigCommand::Default => run_config_default(),
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn run(args: &RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut kernel = GenealogyKernel::new(config);

    let body = fs::read_to_string(&args.events)
        .with_context(|| format!("failed to read events file {}", args.events.display()))?;

    let mut outputs: Vec<EventOutput> = Vec::new();
    let mut open_truth: Option<Vec<TruthRecord>> = None;
    for (index, line) in body.lines().enumerate() {
        let line_number = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: EngineEvent = serde_json::from_str(line)
            .with_context(|| format!("invalid engine event on line {line_number}"))?;
        match event {
            EngineEvent::BeginEvent { truth } => {
                if open_truth.is_some() {
                    return Err(anyhow!(
                        "begin_event on line {line_number} while the previous event is still open"
                    ));
                }
                kernel.begin_session(&truth);
                open_truth = Some(truth);
            }
            EngineEvent::TrackCreated(creation) => {
                require_open(open_truth.as_deref(), line_number)?;
                kernel
                    .admit(&creation)
                    .with_context(|| format!("track admission failed on line {line_number}"))?;
            }
            EngineEvent::Step(step) => {
                require_open(open_truth.as_deref(), line_number)?;
                kernel.step(&step);
            }
            EngineEvent::TrackEnded(end) => {
                require_open(open_truth.as_deref(), line_number)?;
                kernel.end_track(&end);
            }
            EngineEvent::EndEvent => {
                let Some(truth) = open_truth.take() else {
                    return Err(anyhow!("end_event on line {line_number} with no open event"));
                };
                let output = kernel
                    .finalize(&truth)
                    .with_context(|| format!("finalization failed on line {line_number}"))?;
                outputs.push(output);
            }
        }
    }

    if open_truth.is_some() {
        return Err(anyhow!("events file ended with an unterminated event"));
    }

    emit_json(serde_json::json!({ "events": outputs }), args.pretty)
}

fn require_open(open_truth: Option<&[TruthRecord]>, line_number: usize) -> Result<()> {
    if open_truth.is_none() {
        return Err(anyhow!("track event on line {line_number} outside an open event"));
    }
    Ok(())
}

fn run_config_default() -> Result<()> {
    let kernel = GenealogyKernel::new(KernelConfig::default());
    let value = serde_json::to_value(kernel.config())
        .context("failed to serialize the default configuration")?;
    emit_json(value, true)
}
