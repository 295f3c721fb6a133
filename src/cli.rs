use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apptap::config::Config;
use apptap::engine;
use apptap::publish::{FileSink, Sink, StdoutSink};
use apptap::TapError;

#[derive(Parser)]
#[command(name = "apptap")]
#[command(author, version, about = "Passive application-transaction analyzer")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture and analyze traffic
    Run {
        /// Replay a PCAP file instead of live capture
        #[arg(long)]
        pcap: Option<String>,

        /// Interface to sniff
        #[arg(short, long)]
        interface: Option<String>,

        /// Write records to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Print the default configuration with comments
    Config {
        /// Dump the effective configuration instead of the default
        #[arg(long)]
        effective: bool,
    },
}

/// Process exit codes
const EXIT_CONFIG: i32 = 2;
const EXIT_CAPTURE: i32 = 3;
const EXIT_SINK: i32 = 4;

pub fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))
            .map_err(|e| exit_with(EXIT_CONFIG, e))?,
        None => Config::default(),
    };

    init_logging(&cli, &config);

    match cli.command {
        Commands::Config { effective } => {
            if effective {
                println!("{}", config.to_toml().map_err(anyhow::Error::from)?);
            } else {
                println!("{}", Config::default_with_comments());
            }
            Ok(())
        }
        Commands::Run {
            pcap,
            interface,
            output,
        } => {
            if pcap.is_some() {
                config.capture.pcap_file = pcap;
            }
            if interface.is_some() {
                config.capture.interface = interface;
            }
            if output.is_some() {
                config.output.file = output;
            }
            config
                .validate()
                .map_err(|e| exit_with(EXIT_CONFIG, e.into()))?;

            let source = engine::open_source(&config.capture).map_err(|e| {
                let code = match &e {
                    TapError::ConfigError(_) => EXIT_CONFIG,
                    _ => EXIT_CAPTURE,
                };
                exit_with(code, e.into())
            })?;

            let sink: Box<dyn Sink> = match &config.output.file {
                Some(path) => Box::new(
                    FileSink::create(path).map_err(|e| exit_with(EXIT_SINK, e.into()))?,
                ),
                None => Box::new(StdoutSink),
            };

            let shutdown = engine::shutdown_flag();
            let report = engine::run(&config, source, sink, shutdown).map_err(|e| {
                let code = match &e {
                    TapError::SinkError(_) => EXIT_SINK,
                    TapError::ConfigError(_) => EXIT_CONFIG,
                    _ => EXIT_CAPTURE,
                };
                exit_with(code, e.into())
            })?;

            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("clean shutdown after {} packets", report.packets);
            }
            Ok(())
        }
    }
}

/// --debug wins, then RUST_LOG, then the config's logging.level
fn init_logging(cli: &Cli, config: &Config) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

/// Print the error and exit with the documented code
fn exit_with(code: i32, err: anyhow::Error) -> anyhow::Error {
    eprintln!("Error: {:#}", err);
    std::process::exit(code);
}
