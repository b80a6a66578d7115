use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = inference_ledger_cli::Cli::parse();
    inference_ledger_cli::run_cli(cli)
}
