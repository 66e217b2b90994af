use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_telemetry(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Filter used when `RUST_LOG` is a bare level such as `info`.
pub fn default_filter(level: &str) -> String {
    if level.contains('=') {
        level.to_string()
    } else {
        format!("clash_sync={},actix_web=info", level)
    }
}
