use std::sync::Once;

static TRACE_INIT: Once = Once::new();

/// Installs a fmt subscriber for test output. `RUST_LOG` controls the filter.
pub fn trace_init() {
    TRACE_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
