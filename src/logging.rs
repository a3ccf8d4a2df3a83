//! Diagnostics output.
//!
//! Internal tracing goes to stderr so it never mixes with forwarded service
//! stdout. `RUST_LOG` takes precedence; otherwise the debug toggle picks
//! between verbose `stackup` diagnostics and warnings only.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "stackup=debug"
    } else {
        "warn"
    }
}

/// Installs the global subscriber. Calling it twice is harmless.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_toggle_selects_filter() {
        assert_eq!(default_directive(true), "stackup=debug");
        assert_eq!(default_directive(false), "warn");
    }

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true);
    }
}
