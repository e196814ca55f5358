use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fim_core::actions::{self, Command};
use fim_core::error::{EXIT_INVALID_ARGUMENT, EXIT_IO};
use fim_core::report::{ReportFormat, ReportLevel};
use fim_core::{paths, Cancellation, Config, Error, Settings};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

mod logging;

use crate::logging::Logging;

#[derive(Parser, Debug)]
#[command(name = "fim", author, version, about = "Rule-driven file integrity monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to $FIM_CONFIG, then the per-user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Only report entries whose path matches this prefix-anchored regex
    #[arg(short, long, global = true)]
    limit: Option<String>,

    /// error, warning, notice, info, rule, compare, config, debug, trace
    #[arg(long, global = true, default_value = "warning")]
    log_level: String,

    /// summary, minimal or detailed
    #[arg(long, global = true)]
    report_level: Option<ReportLevel>,

    /// text or json
    #[arg(long, global = true)]
    format: Option<ReportFormat>,

    /// List entries in path order instead of grouping by change type
    #[arg(long, global = true)]
    no_grouping: bool,

    /// Attributes excluded from comparison, e.g. "m+c"
    #[arg(long, global = true)]
    ignore: Option<String>,

    /// Attributes always shown for changed entries
    #[arg(long, global = true)]
    force: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Capture the filesystem into a new database
    Init,
    /// Walk and match the filesystem without capturing anything
    DryInit,
    /// Compare the database with the filesystem (default)
    Check,
    /// Check, then write the current state as a new database
    Update,
    /// Compare database_in with database_new
    Compare,
    /// Validate the configuration and print the rule tree
    ConfigCheck,
    /// Match one path against the rule tree
    PathCheck {
        /// <type>:<absolute path>, e.g. f:/etc/passwd
        query: String,
    },
}

impl From<Commands> for Command {
    fn from(cmd: Commands) -> Self {
        match cmd {
            Commands::Init => Command::Init,
            Commands::DryInit => Command::DryInit,
            Commands::Check => Command::Check,
            Commands::Update => Command::Update,
            Commands::Compare => Command::Compare,
            Commands::ConfigCheck => Command::ConfigCheck,
            Commands::PathCheck { query } => Command::PathCheck(query),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { EXIT_INVALID_ARGUMENT } else { 0 });
        }
    };
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fim: {err:#}");
            exit_code_of(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_of(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().map_or(EXIT_IO, Error::exit_code)
}

async fn run(cli: Cli) -> Result<i32> {
    let logging = logging::init(&cli.log_level)?;
    let command: Command = cli.command.clone().unwrap_or(Commands::Check).into();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut settings = Settings::load(&config_path).map_err(Error::from)?;
    apply_overrides(&cli, &mut settings);
    paths::apply_defaults(&mut settings)?;
    let config = Config::build(settings).map_err(Error::from)?;
    info!(config = %config_path.display(), rules = config.tree.rule_count(), "configuration loaded");

    let cancel = Cancellation::new();
    spawn_signal_handlers(cancel.clone(), logging);

    let outcome = tokio::task::spawn_blocking(move || actions::run(&command, &config, &cancel))
        .await
        .context("worker task failed")??;
    print!("{}", outcome.output);
    info!(exit_code = outcome.exit_code, "exit");
    Ok(outcome.exit_code)
}

fn apply_overrides(cli: &Cli, settings: &mut Settings) {
    if let Some(limit) = &cli.limit {
        settings.limit = Some(limit.clone());
    }
    if let Some(level) = cli.report_level {
        settings.report.level = level;
    }
    if let Some(format) = cli.format {
        settings.report.format = format;
    }
    if cli.no_grouping {
        settings.report.grouped = false;
    }
    if let Some(ignore) = &cli.ignore {
        settings.report.ignore = ignore.clone();
    }
    if let Some(force) = &cli.force {
        settings.report.force = force.clone();
    }
}

fn spawn_signal_handlers(cancel: Cancellation, logging: Logging) {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            let Ok(mut term) = signal(SignalKind::terminate()) else {
                return;
            };
            if term.recv().await.is_some() {
                warn!("terminate received, cancelling");
                cancel.cancel();
            }
        });

        tokio::spawn(async move {
            let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
                return;
            };
            let mut verbose = false;
            while usr1.recv().await.is_some() {
                verbose = !verbose;
                if let Err(e) = logging.set_verbose(verbose) {
                    warn!(error = %e, "cannot toggle debug logging");
                }
            }
        });
    }

    #[cfg(not(unix))]
    drop((cancel, logging));
}
