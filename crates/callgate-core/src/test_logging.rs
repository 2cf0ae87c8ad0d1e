//! Logging setup for tests

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

static INIT: Once = Once::new();

/// Route `tracing` output through the test harness writer. Safe to call from
/// every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("callgate_core=debug,warn"));
        let filter = match filter {
            Ok(filter) => filter,
            Err(_) => return,
        };
        let layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_test_writer();
        let _ = tracing::subscriber::set_global_default(Registry::default().with(filter).with(layer));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("test logging ready");
    }
}
