use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = glyco_override_cli::Cli::parse();
    glyco_override_cli::run_cli(cli)
}
