//! Log subscriber setup for the CLI and embedding processes.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a stderr formatter. `RUST_LOG` wins over `configured`, which wins
/// over `info`. Returns an error if a global subscriber is already set.
pub fn init_tracing(configured: Option<&str>) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or("info")))
        .or_else(|_| EnvFilter::try_new("info"))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_tty())
        .compact()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}
