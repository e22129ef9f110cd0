//! Shared test helpers.

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a fmt subscriber honoring `RUST_LOG` so crate logs surface when
/// debugging tests. Idempotent; safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
