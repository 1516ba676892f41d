//! turnpool - signal-driven controller/worker coordination

mod cli;
mod coord;
mod error;
mod logging;
mod work;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::Level;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    logging::init(log_config(&cli));

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Worker(args) => {
            coord::worker::exec(
                args.ordinal,
                args.policy,
                args.controller_pid,
                &args.task_params(),
            );
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Map -v / -q onto a logging configuration, with env overrides on top.
fn log_config(cli: &Cli) -> logging::LogConfig {
    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    logging::LogConfig::new()
        .with_level(level)
        .with_env_overrides()
}

/// Run the controller and print the result summary on stdout.
fn cmd_run(args: &cli::RunArgs) -> Result<()> {
    let config = coord::controller::RunConfig {
        workers: args.workers as usize,
        policy: args.policy,
        params: args.task_params(),
        turns: args.turns,
        turn_ms: args.turn_ms,
    };
    let summary = coord::controller::run(&config)?;
    print!("{}", summary.render());
    Ok(())
}
