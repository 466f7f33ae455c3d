//! Process logging setup for binaries.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber at `level` for this crate.
///
/// `RUST_LOG` directives take precedence. Calling it twice is harmless: the
/// second install attempt is ignored.
///
/// # Errors
///
/// Fails if `level` is not a valid filter directive.
pub fn init_tracing(level: &str) -> anyhow::Result<()> {
    let directive = format!("infinity_meter={}", level.to_lowercase()).parse()?;
    let filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
