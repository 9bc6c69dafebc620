//! Logging setup shared by the worker binary and tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Database drivers log every statement at info; keep them at warn unless asked.
const DRIVER_DIRECTIVES: [&str; 2] = ["sqlx=warn", "mongodb=warn"];

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(level)).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

fn directives(level: &str) -> String {
    std::iter::once(level.trim())
        .chain(DRIVER_DIRECTIVES)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_noise_is_capped() {
        assert_eq!(directives("debug"), "debug,sqlx=warn,mongodb=warn");
        assert!(EnvFilter::try_new(directives("dbsnap_core=trace")).is_ok());
    }
}
