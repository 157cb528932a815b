//! Ordered per-resource event grouping, the input the timeline planner's
//! reconstruction step (`spec.md` §4.5 step 3) walks to derive
//! `StatusSegment`s. This module only orders and groups; status derivation
//! and segment-closing live in `planner::reconstruct`.

use crate::core::event::{Event, ResourceIdentity};
use crate::core::temporal::Timestamp;
use std::collections::BTreeMap;

/// All events observed for one resource identity, ordered by timestamp.
///
/// Events sharing a timestamp keep their scan order (the order C2's segment
/// iterator produced them in), which is itself append order within a bucket.
#[derive(Debug, Clone)]
pub struct ResourceTimeline {
    identity: ResourceIdentity,
    events: BTreeMap<Timestamp, Vec<Event>>,
}

impl ResourceTimeline {
    pub fn new(identity: ResourceIdentity) -> Self {
        Self {
            identity,
            events: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub fn push(&mut self, event: Event) {
        self.events.entry(event.timestamp).or_default().push(event);
    }

    /// All events in timestamp order, flattened.
    pub fn ordered_events(&self) -> impl Iterator<Item = &Event> {
        self.events.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.events.first_key_value().map(|(ts, _)| *ts)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.events.last_key_value().map(|(ts, _)| *ts)
    }
}

/// Group a flat event stream into one [`ResourceTimeline`] per resource
/// identity, preserving first-seen insertion order of identities (so the
/// planner can emit deterministic batch ordering upstream of its own
/// `(namespace, name)` sort).
pub fn group_by_resource(events: impl IntoIterator<Item = Event>) -> Vec<ResourceTimeline> {
    let mut order: Vec<ResourceIdentity> = Vec::new();
    let mut groups: BTreeMap<ResourceIdentity, ResourceTimeline> = BTreeMap::new();

    for event in events {
        let identity = event.resource_identity();
        if !groups.contains_key(&identity) {
            order.push(identity.clone());
            groups.insert(identity.clone(), ResourceTimeline::new(identity.clone()));
        }
        groups.get_mut(&identity).unwrap().push(event);
    }

    order
        .into_iter()
        .filter_map(|identity| groups.remove(&identity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventKind;

    fn event(ts: i64, uid: &str) -> Event {
        Event::new(
            format!("evt-{ts}"),
            Timestamp::from_secs(ts),
            "cluster-a".to_string(),
            "inst-1".to_string(),
            EventKind::ResourceModified,
            "v1".to_string(),
            "Pod".to_string(),
            "default".to_string(),
            "my-pod".to_string(),
            uid.to_string(),
            serde_json::json!({}),
        )
    }

    #[test]
    fn push_orders_by_timestamp_regardless_of_insertion_order() {
        let mut timeline = ResourceTimeline::new(event(0, "uid-1").resource_identity());
        timeline.push(event(2000, "uid-1"));
        timeline.push(event(1000, "uid-1"));

        let timestamps: Vec<Timestamp> = timeline.ordered_events().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![Timestamp::from_secs(1000), Timestamp::from_secs(2000)]);
    }

    #[test]
    fn group_by_resource_splits_distinct_identities() {
        let events = vec![event(1000, "uid-1"), event(1000, "uid-2"), event(2000, "uid-1")];
        let groups = group_by_resource(events);
        assert_eq!(groups.len(), 2);
        let uid1 = groups
            .iter()
            .find(|t| t.identity().uid == "uid-1")
            .unwrap();
        assert_eq!(uid1.len(), 2);
    }
}
