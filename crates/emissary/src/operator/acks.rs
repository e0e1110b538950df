use std::collections::HashMap;

use uuid::Uuid;

use super::broker::DeliveryTag;

/// Deliveries handed to dispatch but not yet acknowledged or rejected.
///
/// Each entry is consumed by at most one [`PendingAcks::take`].
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    entries: HashMap<Uuid, DeliveryTag>,
}

impl PendingAcks {
    /// Tracks a delivery; returns the tag it displaced, if the uuid was
    /// already pending.
    pub(crate) fn track(&mut self, uuid: Uuid, tag: DeliveryTag) -> Option<DeliveryTag> {
        self.entries.insert(uuid, tag)
    }

    pub(crate) fn take(&mut self, uuid: Uuid) -> Option<DeliveryTag> {
        self.entries.remove(&uuid)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_entry_once() {
        let mut pending = PendingAcks::default();
        let uuid = Uuid::new_v4();
        assert_eq!(pending.track(uuid, 7), None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.take(uuid), Some(7));
        assert_eq!(pending.take(uuid), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn tracking_same_uuid_reports_displaced_tag() {
        let mut pending = PendingAcks::default();
        let uuid = Uuid::new_v4();
        pending.track(uuid, 1);
        assert_eq!(pending.track(uuid, 2), Some(1));
        assert_eq!(pending.take(uuid), Some(2));
    }
}
