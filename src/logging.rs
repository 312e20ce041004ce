use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset or unparsable
pub const DEFAULT_FILTER: &str = "info";

/// Install the console subscriber for the binaries
///
/// Honors `RUST_LOG` and falls back to [`DEFAULT_FILTER`]. Calling it again
/// after a subscriber is installed has no effect.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("subscriber installed");
    }
}
