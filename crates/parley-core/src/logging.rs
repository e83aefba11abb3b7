//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, filtered by `RUST_LOG`
/// (default `info`). Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init_logging();
        init_logging();
    }
}
