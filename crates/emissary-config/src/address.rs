//! Routing addresses of the form `routing.key[:exchange]`.
//!
//! Subscriptions, startup and shutdown recipients, and the stats queue base
//! are all written this way. The exchange suffix is optional and falls back
//! to [`ExchangeKind::Topic`] when absent or unrecognised.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Routing discipline used to publish or bind an address.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExchangeKind {
    /// Header-matching exchange.
    Headers,
    /// Pattern-matched routing keys.
    #[default]
    Topic,
    /// Exact routing key match.
    Direct,
    /// Broadcast to every bound queue.
    Fanout,
}

/// A routing key paired with the exchange it is published or bound on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    routing_key: String,
    exchange: ExchangeKind,
}

impl Address {
    /// Builds an address from its parts.
    pub fn new(routing_key: impl Into<String>, exchange: ExchangeKind) -> Self {
        Self {
            routing_key: routing_key.into(),
            exchange,
        }
    }

    /// Routing key used to match bindings.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Exchange the address lives on.
    #[must_use]
    pub fn exchange(&self) -> ExchangeKind {
        self.exchange
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (key, exchange) = match trimmed.split_once(':') {
            Some((key, kind)) => (key.trim(), kind.trim().parse().unwrap_or_default()),
            None => (trimmed, ExchangeKind::Topic),
        };
        if key.is_empty() {
            return Err(AddressParseError::EmptyRoutingKey(input.to_owned()));
        }
        Ok(Self::new(key, exchange))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.routing_key, self.exchange)
    }
}

/// Errors encountered while parsing an [`Address`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    /// The address had no routing key before the exchange suffix.
    #[error("address '{0}' has an empty routing key")]
    EmptyRoutingKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("request.2", "request.2", ExchangeKind::Topic)]
    #[case("request.2:topic", "request.2", ExchangeKind::Topic)]
    #[case("node-7.1:direct", "node-7.1", ExchangeKind::Direct)]
    #[case("everyone:FANOUT", "everyone", ExchangeKind::Fanout)]
    #[case("match:headers", "match", ExchangeKind::Headers)]
    #[case("typo:topical", "typo", ExchangeKind::Topic)]
    #[case("  spaced : direct ", "spaced", ExchangeKind::Direct)]
    fn parses_addresses(#[case] input: &str, #[case] key: &str, #[case] exchange: ExchangeKind) {
        let address: Address = input.parse().expect("address should parse");
        assert_eq!(address.routing_key(), key);
        assert_eq!(address.exchange(), exchange);
    }

    #[rstest]
    #[case("")]
    #[case(":direct")]
    #[case("   ")]
    fn rejects_missing_routing_key(#[case] input: &str) {
        let error = input.parse::<Address>().expect_err("address should fail");
        assert!(matches!(error, AddressParseError::EmptyRoutingKey(_)));
    }

    #[test]
    fn displays_with_exchange_suffix() {
        let address = Address::new("startup.2", ExchangeKind::Direct);
        assert_eq!(address.to_string(), "startup.2:direct");
    }
}
