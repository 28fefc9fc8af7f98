use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is not set
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

pub fn setup_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));
    let fmt_layer = fmt::layer().with_target(false);
    Registry::default().with(filter).with(fmt_layer).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(default_filter(0), "info");
        assert_eq!(default_filter(1), "debug");
        assert_eq!(default_filter(4), "trace");
    }
}
