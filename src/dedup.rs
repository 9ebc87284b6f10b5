//! Lifecycle event deduplication
//!
//! A device offline for a long stretch keeps generating install-class
//! events; without collapsing them the queue grows without bound. The rule:
//! at most one uncommitted `install` OR one `reinstall` may exist at any
//! time, never both. An `install` purges every `reinstall`, even a
//! chronologically newer one: install is the stronger signal and always
//! takes precedence.

use crate::types::{Event, EventType};

/// Collapse install-class events over the union of persisted and incoming sets
///
/// Non-lifecycle events pass through untouched, in their original order.
pub fn dedup_lifecycle_events(events: Vec<Event>) -> Vec<Event> {
    let latest_install = latest_of(&events, EventType::Install);
    let latest_reinstall = latest_of(&events, EventType::Reinstall);

    let keep = match (latest_install, latest_reinstall) {
        // Install wins over reinstall regardless of recency
        (Some(install), _) => Some(install),
        (None, Some(reinstall)) => Some(reinstall),
        (None, None) => None,
    };

    events
        .into_iter()
        .filter(|e| {
            if !e.event_type.is_lifecycle_class() {
                return true;
            }
            keep.as_ref()
                .map(|k| k.event_type == e.event_type && k.created_at == e.created_at)
                .unwrap_or(false)
        })
        .collect()
}

fn latest_of(events: &[Event], event_type: EventType) -> Option<Event> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .max_by_key(|e| e.created_at)
        .cloned()
}
