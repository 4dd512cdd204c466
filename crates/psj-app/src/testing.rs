//! Test support shared by unit and integration tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset.
pub const DEFAULT_TEST_FILTER: &str = "info,psj_app=debug,psj_infra=debug";

static INIT: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
pub fn init_test_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_TEST_FILTER));
        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
