// Tracing initialisation for embedders of the invocation bridge

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Log target of every event this crate emits
pub const BRIDGE_TARGET: &str = "callgate_core";

/// Directives used when neither `RUST_LOG` nor a bridge level is given.
/// The embedding application stays at `warn`; the bridge reports offload
/// exhaustion and release failures at `info` and above.
pub const DEFAULT_DIRECTIVES: &str = "warn,callgate_core=info";

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Build the filter for the bridge. `RUST_LOG` wins when set; otherwise
/// `bridge_level` (e.g. `"debug"`) raises or lowers only the bridge's own
/// target on top of [`DEFAULT_DIRECTIVES`].
pub fn bridge_filter(bridge_level: Option<&str>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = match bridge_level {
        Some(level) => format!("warn,{BRIDGE_TARGET}={level}"),
        None => DEFAULT_DIRECTIVES.to_string(),
    };
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log directives `{directives}`"))
}

/// Installs the global tracing subscriber.
///
/// Fails if `bridge_level` is not a valid level or a global subscriber is
/// already installed.
pub fn init_tracing(bridge_level: Option<&str>, format: LogFormat) -> Result<()> {
    let subscriber = Registry::default().with(bridge_filter(bridge_level)?);

    match format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_current_span(true).with_target(true);
            tracing::subscriber::set_global_default(subscriber.with(layer))?;
        }
        LogFormat::Compact => {
            let layer = fmt::layer().compact().with_target(true).with_level(true);
            tracing::subscriber::set_global_default(subscriber.with(layer))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_filter_scopes_level_to_bridge() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = bridge_filter(Some("trace")).unwrap().to_string();
        assert!(filter.contains("callgate_core=trace"));
        assert!(filter.contains("warn"));

        let filter = bridge_filter(None).unwrap().to_string();
        assert!(filter.contains("callgate_core=info"));
    }

    #[test]
    fn test_bad_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(bridge_filter(Some("loud!")).is_err());
    }

    #[test]
    fn test_second_init_fails() {
        // Whichever call wins, the other reports the existing subscriber
        let first = init_tracing(Some("debug"), LogFormat::Json);
        let second = init_tracing(None, LogFormat::Compact);
        assert!(first.is_err() || second.is_err());
    }
}
