use anyhow::{Context, Result};
use fim_core::Error;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Translate a `--log-level` name into a filter directive.
pub fn directive(level: &str) -> Result<String, Error> {
    let directive = match level {
        "error" => "error",
        "warning" | "warn" => "warn",
        "notice" | "info" => "info",
        "rule" => "info,fim_core::matcher=debug,fim_core::tree=debug",
        "compare" => "info,fim_core::compare=debug",
        "config" => "info,fim_core::config=debug",
        "debug" => "debug",
        "trace" => "trace",
        other => {
            return Err(Error::InvalidArgument {
                option: "--log-level",
                reason: format!("unknown log level '{other}'"),
            })
        }
    };
    Ok(directive.to_string())
}

/// Live handle on the installed filter.
pub struct Logging {
    handle: reload::Handle<EnvFilter, Registry>,
    base: String,
}

impl Logging {
    /// Switch between the configured filter and `debug`.
    pub fn set_verbose(&self, verbose: bool) -> Result<()> {
        let directive = if verbose { "debug" } else { self.base.as_str() };
        let filter = EnvFilter::try_new(directive)?;
        self.handle.reload(filter).context("reload log filter")?;
        tracing::info!(filter = directive, "log filter changed");
        Ok(())
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) -> Result<Logging> {
    let base = match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => env,
        _ => directive(level)?,
    };
    let (filter, handle) = reload::Layer::new(EnvFilter::try_new(&base)?);
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok(Logging { handle, base })
}
