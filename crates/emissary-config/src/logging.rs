use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Structured JSON suitable for ingestion by logging stacks.
    #[default]
    Json,
    /// Human-readable single line output.
    Compact,
}

/// Errors encountered while parsing a [`LogFormat`] or [`LogLevel`] from text.
pub type LogParseError = strum::ParseError;

/// Syslog severities accepted by `general.log_level`.
///
/// The names follow `syslog(3)`, including the common short aliases
/// (`emerg`, `crit`, `err`, `warn`). Severities are ordered from most to
/// least severe.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
)]
#[serde(try_from = "String", rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum LogLevel {
    /// System is unusable.
    #[strum(to_string = "emergency", serialize = "emerg", serialize = "panic")]
    Emergency,
    /// Action must be taken immediately.
    #[strum(to_string = "alert")]
    Alert,
    /// Critical conditions.
    #[strum(to_string = "critical", serialize = "crit")]
    Critical,
    /// Error conditions.
    #[strum(to_string = "error", serialize = "err")]
    Error,
    /// Warning conditions.
    #[strum(to_string = "warning", serialize = "warn")]
    Warning,
    /// Normal but significant conditions.
    #[strum(to_string = "notice")]
    Notice,
    /// Informational messages.
    #[default]
    #[strum(to_string = "info", serialize = "informational")]
    Info,
    /// Debug-level messages.
    #[strum(to_string = "debug")]
    Debug,
}

impl LogLevel {
    /// Returns the `tracing` filter directive equivalent to this severity.
    ///
    /// `tracing` has no notice level, so `notice` shares the `info`
    /// directive; notice events carry a `notice = true` field instead.
    #[must_use]
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Emergency | Self::Alert | Self::Critical | Self::Error => "error",
            Self::Warning => "warn",
            Self::Notice | Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = LogParseError;

    fn try_from(value: String) -> Result<Self, LogParseError> {
        value.parse()
    }
}
