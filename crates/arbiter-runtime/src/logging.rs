//! One-call tracing setup for binaries and examples.
//!
//! Libraries embedding the dispatcher normally install their own
//! subscriber; these helpers exist for quick starts and demos. Both are
//! idempotent: installing over an existing subscriber is a no-op.

use tracing_subscriber::EnvFilter;

/// Install a console subscriber at `info` level.
///
/// `RUST_LOG` overrides the default filter when set.
pub fn init() {
    init_with_filter("info");
}

/// Install a console subscriber with the given default filter.
pub fn init_with_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        // A second install must not panic.
        init_with_filter("debug");
    }
}
