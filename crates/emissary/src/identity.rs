//! Host identity resolution through prioritised providers.
//!
//! Each provider answers a subset of [`IdentityField`]s. Resolution walks the
//! providers from highest to lowest priority; a provider may answer, defer to
//! the next one, or not support the field at all. The provider that first
//! answers a field is remembered so later lookups go straight to it.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, UdpSocket};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;
use tracing::{debug, warn};

const IDENTITY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::identity");

/// Facts about the host that agents report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum IdentityField {
    /// Host name.
    Name,
    /// Publicly routable address.
    PublicIp,
    /// Address on the local network.
    LocalIp,
    /// Cloud instance identifier.
    InstanceId,
    /// Fleet-management server identifier.
    ServerId,
    /// Fleet-management cluster identifier.
    ClusterId,
    /// Fleet-management account identifier.
    AccountId,
    /// Base name of this host's queue on the broker.
    QueueName,
}

impl IdentityField {
    /// Placeholder substituted by [`Identity::interpolate`], e.g.
    /// `__ID_INSTANCE_ID__`.
    #[must_use]
    pub fn placeholder(self) -> String {
        format!("__ID_{}__", self.to_string().to_ascii_uppercase())
    }
}

/// Answer from a single provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The provider knows the value.
    Value(String),
    /// The provider could know, but leaves the answer to a lower priority
    /// provider.
    Defer,
    /// The provider has no way of answering.
    Unsupported,
}

/// Source of identity facts.
pub trait IdentityProvider: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    /// Higher values are consulted first.
    fn priority(&self) -> i32;

    /// Looks up one field.
    fn lookup(&self, field: IdentityField) -> Lookup;
}

/// Errors raised while resolving identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// Every provider deferred or lacked the capability.
    #[error("no identity provider available for '{field}'")]
    NoProvider {
        /// Field that could not be resolved.
        field: IdentityField,
    },
}

/// Resolves identity fields across an ordered provider list.
pub struct Identity {
    providers: Vec<Box<dyn IdentityProvider>>,
    answered_by: Mutex<HashMap<IdentityField, usize>>,
}

impl Identity {
    /// Builds a resolver; providers are sorted by descending priority.
    #[must_use]
    pub fn new(mut providers: Vec<Box<dyn IdentityProvider>>) -> Self {
        providers.sort_by_key(|provider| std::cmp::Reverse(provider.priority()));
        Self {
            providers,
            answered_by: Mutex::new(HashMap::new()),
        }
    }

    /// Standard provider stack: configured overrides, then the local host.
    #[must_use]
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Self {
        Self::new(vec![
            Box::new(StaticIdentity::from_overrides(overrides)),
            Box::new(UnixIdentity),
        ])
    }

    /// Resolves one field.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NoProvider`] when no provider answers.
    pub fn resolve(&self, field: IdentityField) -> Result<String, IdentityError> {
        let cached = self
            .answered_by
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&field)
            .copied();
        if let Some(index) = cached
            && let Some(Lookup::Value(value)) =
                self.providers.get(index).map(|provider| provider.lookup(field))
        {
            return Ok(value);
        }

        for (index, provider) in self.providers.iter().enumerate() {
            match provider.lookup(field) {
                Lookup::Value(value) => {
                    debug!(
                        target: IDENTITY_TARGET,
                        %field,
                        provider = provider.name(),
                        "identity field resolved"
                    );
                    self.answered_by
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(field, index);
                    return Ok(value);
                }
                Lookup::Defer | Lookup::Unsupported => {}
            }
        }
        Err(IdentityError::NoProvider { field })
    }

    /// Resolves a field for inclusion in a payload, yielding `null` when no
    /// provider can answer.
    #[must_use]
    pub fn value_or_null(&self, field: IdentityField) -> Value {
        match self.resolve(field) {
            Ok(value) => Value::String(value),
            Err(error) => {
                warn!(target: IDENTITY_TARGET, %error, "reporting identity field as null");
                Value::Null
            }
        }
    }

    /// Replaces every `__ID_<FIELD>__` placeholder in `text`.
    ///
    /// Placeholders whose field cannot be resolved are left in place.
    #[must_use]
    pub fn interpolate(&self, text: &str) -> String {
        let mut output = text.to_owned();
        for field in IdentityField::iter() {
            let placeholder = field.placeholder();
            if !output.contains(&placeholder) {
                continue;
            }
            match self.resolve(field) {
                Ok(value) => output = output.replace(&placeholder, &value),
                Err(error) => {
                    warn!(target: IDENTITY_TARGET, %error, text, "placeholder left unresolved");
                }
            }
        }
        output
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.providers.iter().map(|provider| provider.name()).collect();
        f.debug_struct("Identity").field("providers", &names).finish()
    }
}

/// Values fixed in configuration; consulted before anything else.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    values: BTreeMap<IdentityField, String>,
}

impl StaticIdentity {
    /// Builds the provider from `[identity]`; unknown keys are ignored.
    #[must_use]
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let values = overrides
            .iter()
            .filter_map(|(key, value)| Some((key.parse().ok()?, value.clone())))
            .collect();
        Self { values }
    }
}

impl IdentityProvider for StaticIdentity {
    fn name(&self) -> &'static str {
        "static"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn lookup(&self, field: IdentityField) -> Lookup {
        self.values
            .get(&field)
            .map_or(Lookup::Defer, |value| Lookup::Value(value.clone()))
    }
}

/// Facts discoverable on any Unix host without a cloud metadata service.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixIdentity;

// Any routable destination works; connecting a UDP socket sends nothing.
const ROUTE_PROBE: &str = "192.0.2.1:9";

impl UnixIdentity {
    fn hostname() -> Option<String> {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
    }

    fn local_ip() -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(ROUTE_PROBE).ok()?;
        Some(socket.local_addr().ok()?.ip())
    }
}

impl IdentityProvider for UnixIdentity {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn lookup(&self, field: IdentityField) -> Lookup {
        let answer = match field {
            IdentityField::Name | IdentityField::QueueName => Self::hostname(),
            IdentityField::LocalIp => Self::local_ip().map(|ip| ip.to_string()),
            IdentityField::PublicIp => return Lookup::Defer,
            IdentityField::InstanceId
            | IdentityField::ServerId
            | IdentityField::ClusterId
            | IdentityField::AccountId => return Lookup::Unsupported,
        };
        answer.map_or(Lookup::Unsupported, Lookup::Value)
    }
}
