mod cli;
mod commands;
mod config;
mod error;

use std::process;

use clap::Parser;
use electra_engine::MediaTime;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    commands::PlayOptions,
    error::Result,
};

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args) {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = config::load(args.config.as_deref())?;

    match args.command {
        Commands::Probe { file, init, samples } => commands::probe(&file, init.as_deref(), samples),
        Commands::Play {
            files,
            init,
            stream_type,
            with_audio,
            segment_duration_ms,
            allow_missing,
        } => commands::play(
            &config,
            PlayOptions {
                files,
                init,
                stream_type,
                with_audio,
                segment_duration: MediaTime::from_millis(segment_duration_ms as i64),
                allow_missing,
            },
        ),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}
