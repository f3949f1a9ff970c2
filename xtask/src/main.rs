use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use xtask::config::{ConfigError, DEFAULT_CONFIG};
use xtask::error::EXIT_INTERNAL;
use xtask::{test_all, test_lab, verify_capture, HarnessConfig, HarnessError};

/// Build, boot and check the system image against its checklist.
#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Clean build, unit-test gate, clean build, then every checklist case (default).
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Only run the named case(s).
        #[arg(long = "case")]
        cases: Vec<String>,
    },
    /// Run the lab smoke test only.
    Lab {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print the checklist in declaration order.
    List {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Check a captured console log against one case.
    Verify {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(long)]
        case: String,
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cmd = cli.cmd.unwrap_or(Cmd::Run {
        config: PathBuf::from(DEFAULT_CONFIG),
        cases: Vec::new(),
    });

    match dispatch(cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            let code = err
                .downcast_ref::<HarnessError>()
                .map_or(EXIT_INTERNAL, HarnessError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn dispatch(cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Run { config, cases } => {
            let config = load(&config)?;
            let all = config.cases().map_err(HarnessError::from)?;
            let checklist = if cases.is_empty() {
                all.clone()
            } else {
                all.select(&cases).map_err(HarnessError::from)?
            };
            test_all(&config, &checklist)?;
        }
        Cmd::Lab { config } => {
            test_lab(&load(&config)?)?;
        }
        Cmd::List { config } => {
            let config = load(&config)?;
            for case in config.cases().map_err(HarnessError::from)? {
                println!(
                    "{} ({}s): {}",
                    case.name,
                    case.timeout.as_secs(),
                    case.fragments.join(" | ")
                );
            }
        }
        Cmd::Verify { config, case, log } => {
            let config = load(&config)?;
            let case = config
                .cases()
                .map_err(HarnessError::from)?
                .get(&case)
                .ok_or_else(|| HarnessError::from(ConfigError::UnknownCase(case.clone())))?;
            let output = fs::read(&log)
                .map_err(|e| HarnessError::io(format!("reading {}", log.display()), e))
                .with_context(|| format!("verifying {}", case.name))?;
            verify_capture(case, &output)?;
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<HarnessConfig, HarnessError> {
    Ok(HarnessConfig::load(path)?)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
