//! Structured telemetry initialisation for the daemon.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use emissary_config::{Config, LogFormat};

use crate::operator::OPERATOR_TARGET;

/// Log target of the AMQP client library.
const PROTOCOL_TARGET: &str = "lapin";

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Logs at syslog `notice` severity.
///
/// `tracing` stops at `info`, so notice events are `info` events tagged with
/// `notice = true` for sinks that want to tell them apart.
macro_rules! notice {
    (target: $target:expr, $($rest:tt)+) => {
        ::tracing::info!(target: $target, notice = true, $($rest)+)
    };
}
pub(crate) use notice;

/// Configures the global tracing subscriber when invoked for the first time.
///
/// The supervisor and each worker call this once at startup. Later calls in
/// the same process leave the installed subscriber untouched. All log lines
/// go through the subscriber's stderr writer, which serialises concurrent
/// writers.
///
/// # Errors
///
/// Returns [`TelemetryError`] if the filter is rejected or another subscriber
/// was installed by someone else.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    initialise_with(config, false)
}

/// Like [`initialise`], but with `protocol_debug` set the operator and the
/// AMQP client log at `debug` whatever the configured level.
///
/// # Errors
///
/// As for [`initialise`].
pub fn initialise_with(
    config: &Config,
    protocol_debug: bool,
) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config, protocol_debug))
        .map(|_| TelemetryHandle)
}

/// Filter expression for `config`, widened for protocol debugging.
pub(crate) fn filter_directives(config: &Config, protocol_debug: bool) -> String {
    let base = config.log_filter();
    if protocol_debug {
        format!("{base},{OPERATOR_TARGET}=debug,{PROTOCOL_TARGET}=debug")
    } else {
        base.to_owned()
    }
}

fn install_subscriber(config: &Config, protocol_debug: bool) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(filter_directives(config, protocol_debug))
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(io::stderr)
            // Colour only on interactive terminals.
            .with_ansi(io::stderr().is_terminal())
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tracing_subscriber::EnvFilter;

    use super::filter_directives;
    use crate::test_support;

    #[rstest]
    #[case(false, "info")]
    #[case(true, "info,emissary::operator=debug,lapin=debug")]
    fn node_debug_widens_protocol_targets(#[case] debug: bool, #[case] expected: &str) {
        let config = test_support::config();
        let directives = filter_directives(&config, debug);
        assert_eq!(directives, expected);
        assert!(EnvFilter::try_new(&directives).is_ok());
    }
}
