use anyhow::Context;
use clap::Parser;
use mprof::cli::{Cli, Command};
use mprof::error::exit_code;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(mprof_err) = e.downcast_ref::<mprof::Error>() {
                ExitCode::from(mprof_err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    cli.validate()
        .map_err(mprof::Error::InvalidArgument)
        .context("Invalid arguments")?;

    match cli.command {
        Command::Top {
            file,
            top,
            exe,
            load_base,
            json,
            csv,
        } => {
            mprof::commands::top::run(
                &file,
                top,
                exe.as_deref(),
                load_base.unwrap_or(0),
                json,
                csv,
            )?;
        }
        Command::List { dir } => {
            mprof::commands::list::run(dir.as_deref())?;
        }
        Command::Import {
            db,
            files,
            exe,
            load_base,
        } => {
            mprof::commands::import::run(&db, &files, exe.as_deref(), load_base.unwrap_or(0))?;
        }
        Command::Query { db, sql } => {
            mprof::commands::query::run(&db, &sql)?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "mprof", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Log to stderr. `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}
