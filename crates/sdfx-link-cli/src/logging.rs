use sdfx_link_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Build the filter directive string: base level plus per-crate overrides.
fn directives(config: &LoggingConfig, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(config.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global subscriber. `RUST_LOG` wins over the config file.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config, verbose)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match (config.format.as_str(), config.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).try_init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).try_init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).try_init(),
        _ => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))
}
