//! Command surface over the inference ledger.
//!
//! Every subcommand maps to one backend operation and prints its result
//! as pretty JSON on stdout. The substrate is chosen by configuration
//! and may be overridden per invocation with `--substrate`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use inference_ledger_core::{Backend, BackendConfig, FeatureRow, ScoredOutput, SubstrateKind};
use inference_ledger_store_object::ObjectLedger;
use inference_ledger_store_sqlite::SqliteRecordStore;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "inference-ledger")]
#[command(about = "Production inference data ledger")]
pub struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage substrate override.
    #[arg(long, value_enum)]
    substrate: Option<SubstrateArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SubstrateArg {
    Sqlite,
    Object,
}

impl From<SubstrateArg> for SubstrateKind {
    fn from(value: SubstrateArg) -> Self {
        match value {
            SubstrateArg::Sqlite => Self::Sqlite,
            SubstrateArg::Object => Self::Object,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print labeled production rows, most recently captured first.
    Load(LoadArgs),
    /// Append scored rows from a JSON-lines file.
    Save(SaveArgs),
    /// Synthesize ground truth for rows that have none yet.
    Label(LabelArgs),
    /// Send one prediction request to the serving endpoint.
    Invoke(InvokeArgs),
    /// Create or update the hosted deployment for a model version.
    Deploy(DeployArgs),
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct SaveArgs {
    /// JSON-lines file: one `{"features": {...}, "output": {...}}` object
    /// per line, `output` optional but all-or-nothing across the file.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
pub struct LabelArgs {
    /// Probability that a synthesized label matches the row's prediction.
    #[arg(long, default_value_t = 0.8)]
    accuracy: f64,
}

#[derive(Debug, Args)]
pub struct InvokeArgs {
    /// Request payload as a JSON document.
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    #[arg(long)]
    model_uri: String,
    #[arg(long)]
    model_version: String,
}

/// Reads and resolves the backend configuration, falling back to the
/// built-in defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> Result<BackendConfig> {
    let Some(path) = path else {
        return Ok(BackendConfig::default());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = BackendConfig::from_json(&body)?;
    Ok(config)
}

/// Instantiates the configured storage substrate. Misconfiguration is
/// fatal here; the operations behind the returned backend degrade to
/// safe defaults instead of failing.
pub fn make_backend(config: &BackendConfig) -> Result<Box<dyn Backend>> {
    match config.substrate {
        SubstrateKind::Sqlite => Ok(Box::new(SqliteRecordStore::from_config(config)?)),
        SubstrateKind::Object => Ok(Box::new(ObjectLedger::from_config(config)?)),
    }
}

#[derive(Debug, Deserialize)]
struct SaveLine {
    features: FeatureRow,
    #[serde(default)]
    output: Option<ScoredOutput>,
}

/// Parses a JSON-lines save file into parallel input and output slices.
/// Either every line carries an output or none does.
fn read_save_file(path: &Path) -> Result<(Vec<FeatureRow>, Vec<ScoredOutput>)> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read save file {}", path.display()))?;

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for (line_number, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: SaveLine = serde_json::from_str(line)
            .with_context(|| format!("invalid save record on line {}", line_number + 1))?;
        inputs.push(parsed.features);
        if let Some(output) = parsed.output {
            outputs.push(output);
        }
    }

    if !outputs.is_empty() && outputs.len() != inputs.len() {
        return Err(anyhow!(
            "{} of {} save records carry an output; outputs are all-or-nothing",
            outputs.len(),
            inputs.len()
        ));
    }

    Ok((inputs, outputs))
}

/// Executes one subcommand against an instantiated backend and returns
/// the JSON document to print.
pub fn run_command(backend: &mut dyn Backend, command: &Command) -> Result<Value> {
    match command {
        Command::Load(args) => {
            let rows = backend.load(args.limit);
            serde_json::to_value(rows).context("failed to encode loaded rows")
        }
        Command::Save(args) => {
            let (inputs, outputs) = read_save_file(&args.input)?;
            backend.save(&inputs, &outputs);
            Ok(json!({ "saved": inputs.len() }))
        }
        Command::Label(args) => {
            if !(0.0..=1.0).contains(&args.accuracy) {
                return Err(anyhow!(
                    "accuracy must lie in [0.0, 1.0], got {}",
                    args.accuracy
                ));
            }
            let labeled = backend.label(args.accuracy);
            Ok(json!({ "labeled": labeled }))
        }
        Command::Invoke(args) => {
            let payload: Value = serde_json::from_str(&args.payload)
                .context("invocation payload is not valid JSON")?;
            Ok(backend.invoke(&payload).unwrap_or(Value::Null))
        }
        Command::Deploy(args) => {
            backend.deploy(&args.model_uri, &args.model_version)?;
            Ok(json!({
                "deployed": { "model_uri": args.model_uri, "model_version": args.model_version }
            }))
        }
    }
}

/// Full parsed-CLI execution: resolve config, build the substrate, run
/// the subcommand, print its result.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(substrate) = cli.substrate {
        config.substrate = substrate.into();
    }

    let mut backend = make_backend(&config)?;
    let result = run_command(backend.as_mut(), &cli.command)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
