use std::collections::{BTreeMap, BTreeSet};

use emissary_config::{Address, ExchangeKind};

/// Routing keys to bind, grouped by exchange kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    keys: BTreeMap<ExchangeKind, BTreeSet<String>>,
}

impl SubscriptionSet {
    /// Groups addresses by exchange, dropping duplicates.
    pub fn from_addresses<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> Self {
        let mut keys: BTreeMap<ExchangeKind, BTreeSet<String>> = BTreeMap::new();
        for address in addresses {
            keys.entry(address.exchange())
                .or_default()
                .insert(address.routing_key().to_owned());
        }
        Self { keys }
    }

    /// Every `(exchange, routing key)` pair, grouped by exchange.
    pub fn iter(&self) -> impl Iterator<Item = (ExchangeKind, &str)> {
        self.keys
            .iter()
            .flat_map(|(kind, keys)| keys.iter().map(move |key| (*kind, key.as_str())))
    }

    /// Routing keys bound on one exchange.
    pub fn keys_for(&self, kind: ExchangeKind) -> impl Iterator<Item = &str> {
        self.keys.get(&kind).into_iter().flatten().map(String::as_str)
    }

    /// Total number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.values().map(BTreeSet::len).sum()
    }

    /// Whether there are no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_exchange_and_deduplicates() {
        let addresses: Vec<Address> = ["request.2", "request.2:topic", "all:fanout", "me:direct"]
            .into_iter()
            .map(|text| text.parse().expect("address"))
            .collect();
        let set = SubscriptionSet::from_addresses(&addresses);

        assert_eq!(set.len(), 3);
        assert_eq!(set.keys_for(ExchangeKind::Topic).collect::<Vec<_>>(), ["request.2"]);
        assert_eq!(set.keys_for(ExchangeKind::Fanout).collect::<Vec<_>>(), ["all"]);
        assert_eq!(set.keys_for(ExchangeKind::Headers).count(), 0);
    }
}
