//! Integration test crate for Opal; scenarios live under `tests/`.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the test log subscriber; safe to call from every test.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init();
}
