use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{run_command, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
