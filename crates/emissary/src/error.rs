//! Error taxonomy shared by the operator, the agents and the server.
//!
//! [`EmissaryError`] is a tagged error with an optional causal origin. Code
//! that only knows the outer category can ask [`EmissaryError::matches`]
//! whether the error, or anything it wraps, belongs to a given
//! [`ErrorKind`] without unwrapping by hand.

use std::error::Error as StdError;

use strum::Display;
use thiserror::Error;

/// Boxed error used as the origin of an [`EmissaryError`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Category of an [`EmissaryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// The broker connection could not be established or was lost.
    #[strum(to_string = "connection error")]
    Connection,
    /// An inbound payload could not be decoded into an envelope.
    #[strum(to_string = "invalid message format")]
    InvalidMessageFormat,
    /// Configuration failed validation.
    #[strum(to_string = "invalid configuration")]
    InvalidConfig,
    /// A publish named an exchange that has no broker counterpart.
    #[strum(to_string = "invalid exchange")]
    InvalidExchange,
    /// The requested capability is not available in this build.
    #[strum(to_string = "not implemented")]
    NotImplemented,
    /// An agent operation failed.
    #[strum(to_string = "handler error")]
    Handler,
    /// Anything else.
    #[strum(to_string = "error")]
    General,
}

/// Tagged error carrying an optional lower-level origin.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct EmissaryError {
    kind: ErrorKind,
    message: String,
    #[source]
    origin: Option<BoxError>,
}

impl EmissaryError {
    /// Builds an error with no origin.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    /// Builds an error that records the failure which caused it.
    pub fn with_origin(
        kind: ErrorKind,
        message: impl Into<String>,
        origin: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: Some(origin.into()),
        }
    }

    /// Shorthand for [`ErrorKind::Connection`].
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// Shorthand for [`ErrorKind::InvalidMessageFormat`].
    pub fn invalid_message_format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMessageFormat, message)
    }

    /// Shorthand for [`ErrorKind::InvalidConfig`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    /// Shorthand for [`ErrorKind::InvalidExchange`].
    pub fn invalid_exchange(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidExchange, message)
    }

    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Reports whether this error, or any error in its source chain, has
    /// the given kind.
    #[must_use]
    pub fn matches(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        let mut cause = self.source();
        while let Some(error) = cause {
            if error
                .downcast_ref::<Self>()
                .is_some_and(|wrapped| wrapped.kind == kind)
            {
                return true;
            }
            cause = error.source();
        }
        false
    }
}
