//! Per-resource presence reconciliation
//!
//! A contact may be online from several resources at once. This module
//! keeps one record per (bare JID, resource), arbitrates which resource is
//! the primary one, and detects the transitions higher layers care about:
//! contact signed in, contact signed out, primary resource changed.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Jid, ShowState, Timestamp};

// ----------------------------------------------------------------------------
// Presence Records
// ----------------------------------------------------------------------------

/// Presence state of one resource of a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePresence {
    pub resource: String,
    pub show: ShowState,
    pub priority: i8,
    pub status: Option<String>,
    pub nickname: Option<String>,
    pub last_updated: Timestamp,
}

/// The outcome of ingesting one presence stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceChange {
    /// Bare JID of the contact
    pub jid: Jid,
    pub resource: String,
    pub show: ShowState,
    pub priority: i8,
    pub status: Option<String>,
    /// The contact went from no available resource to at least one
    pub signed_in: bool,
    /// The contact's last available resource went away
    pub signed_out: bool,
    /// The identity of the primary resource changed
    pub primary_changed: bool,
    /// The new primary resource, if any resource is still available
    pub primary: Option<String>,
}

// ----------------------------------------------------------------------------
// Presence Tracker
// ----------------------------------------------------------------------------

/// Tracks presence records for every contact of one connection
#[derive(Debug, Default)]
pub struct PresenceTracker {
    contacts: HashMap<Jid, HashMap<String, ResourcePresence>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one presence update.
    ///
    /// Returns `None` when the stanza changes nothing: an unavailable
    /// presence for an unknown resource (nothing to retract), or an exact
    /// repeat of the current state. The latter is what makes sign-in and
    /// sign-out detection idempotent under re-delivery.
    #[allow(clippy::too_many_arguments)]
    pub fn ingest(
        &mut self,
        bare: &Jid,
        resource: &str,
        show: ShowState,
        priority: i8,
        status: Option<String>,
        nickname: Option<String>,
        now: Timestamp,
    ) -> Option<PresenceChange> {
        let known = self
            .contacts
            .get(bare)
            .and_then(|resources| resources.get(resource));

        match known {
            None if !show.is_available() => return None,
            Some(existing)
                if existing.show == show
                    && existing.priority == priority
                    && existing.status == status =>
            {
                return None;
            }
            _ => {}
        }

        let was_available = self.has_available_resource(bare);
        let previous_primary = self.primary_resource(bare).map(|r| r.resource.clone());

        let resources = self.contacts.entry(bare.clone()).or_default();
        resources.insert(
            resource.to_owned(),
            ResourcePresence {
                resource: resource.to_owned(),
                show,
                priority,
                status: status.clone(),
                nickname,
                last_updated: now,
            },
        );

        let now_available = self.has_available_resource(bare);
        let new_primary = self.primary_resource(bare).map(|r| r.resource.clone());

        Some(PresenceChange {
            jid: bare.clone(),
            resource: resource.to_owned(),
            show,
            priority,
            status,
            signed_in: !was_available && now_available,
            signed_out: was_available && !now_available,
            primary_changed: previous_primary != new_primary,
            primary: new_primary,
        })
    }

    /// The record for one resource of a contact
    pub fn get(&self, bare: &Jid, resource: &str) -> Option<&ResourcePresence> {
        self.contacts.get(bare)?.get(resource)
    }

    /// All known resource records of a contact
    pub fn resources(&self, bare: &Jid) -> impl Iterator<Item = &ResourcePresence> {
        self.contacts.get(bare).into_iter().flat_map(|m| m.values())
    }

    /// The highest-priority available resource of a contact.
    ///
    /// Offline and errored resources never win. Ties on priority go to the
    /// most recently updated record, then to the lexicographically larger
    /// resource name so the answer is deterministic.
    pub fn primary_resource(&self, bare: &Jid) -> Option<&ResourcePresence> {
        self.resources(bare)
            .filter(|r| r.show.is_available())
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.last_updated.cmp(&b.last_updated))
                    .then(a.resource.cmp(&b.resource))
            })
    }

    /// Whether any resource of the contact is available
    pub fn has_available_resource(&self, bare: &Jid) -> bool {
        self.resources(bare).any(|r| r.show.is_available())
    }

    /// Bare JIDs with at least one record
    pub fn contacts(&self) -> impl Iterator<Item = &Jid> {
        self.contacts.keys()
    }

    /// Replace every record with the offline terminal state. Used on
    /// stream teardown.
    pub fn mark_all_offline(&mut self, now: Timestamp) {
        for resources in self.contacts.values_mut() {
            for record in resources.values_mut() {
                record.show = ShowState::Offline;
                record.status = None;
                record.priority = 0;
                record.last_updated = now;
            }
        }
    }

    /// Forget a contact entirely
    pub fn remove_contact(&mut self, bare: &Jid) {
        self.contacts.remove(bare);
    }

    /// Number of tracked contacts
    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Jid {
        Jid::bare("user", "example.com")
    }

    fn t(millis: u64) -> Timestamp {
        Timestamp::new(millis)
    }

    fn online(
        tracker: &mut PresenceTracker,
        resource: &str,
        priority: i8,
        now: u64,
    ) -> Option<PresenceChange> {
        tracker.ingest(
            &peer(),
            resource,
            ShowState::Online,
            priority,
            None,
            None,
            t(now),
        )
    }

    fn offline(tracker: &mut PresenceTracker, resource: &str, now: u64) -> Option<PresenceChange> {
        tracker.ingest(
            &peer(),
            resource,
            ShowState::Offline,
            0,
            None,
            None,
            t(now),
        )
    }

    #[test]
    fn test_unknown_unavailable_is_ignored() {
        let mut tracker = PresenceTracker::new();
        assert!(offline(&mut tracker, "ghost", 1).is_none());
        assert_eq!(tracker.contact_count(), 0);
    }

    #[test]
    fn test_priority_arbitration_and_reversion() {
        let mut tracker = PresenceTracker::new();

        let change = online(&mut tracker, "A", 5, 1).unwrap();
        assert!(change.signed_in);
        assert!(change.primary_changed);
        assert_eq!(change.primary.as_deref(), Some("A"));

        let change = online(&mut tracker, "B", 10, 2).unwrap();
        assert!(!change.signed_in);
        assert!(change.primary_changed);
        assert_eq!(change.primary.as_deref(), Some("B"));

        // B goes away: primary reverts to A, exactly one change is signalled
        let change = offline(&mut tracker, "B", 3).unwrap();
        assert!(change.primary_changed);
        assert_eq!(change.primary.as_deref(), Some("A"));
        assert!(!change.signed_out);

        // Re-delivering B's unavailable presence changes nothing further
        assert!(offline(&mut tracker, "B", 4).is_none());
    }

    #[test]
    fn test_priority_tie_broken_by_recency() {
        let mut tracker = PresenceTracker::new();
        online(&mut tracker, "A", 5, 1);
        online(&mut tracker, "B", 5, 2);
        assert_eq!(
            tracker.primary_resource(&peer()).unwrap().resource,
            "B".to_owned()
        );

        // A refresh of A with a different status makes it the most recent
        tracker
            .ingest(
                &peer(),
                "A",
                ShowState::Online,
                5,
                Some("back".into()),
                None,
                t(3),
            )
            .unwrap();
        assert_eq!(
            tracker.primary_resource(&peer()).unwrap().resource,
            "A".to_owned()
        );
    }

    #[test]
    fn test_identical_presence_is_idempotent() {
        let mut tracker = PresenceTracker::new();
        assert!(online(&mut tracker, "A", 5, 1).unwrap().signed_in);
        // Same show, priority and status again: no change at all
        assert!(online(&mut tracker, "A", 5, 2).is_none());
    }

    #[test]
    fn test_sign_out_fires_when_last_resource_leaves() {
        let mut tracker = PresenceTracker::new();
        online(&mut tracker, "A", 5, 1);
        online(&mut tracker, "B", 1, 2);

        assert!(!offline(&mut tracker, "A", 3).unwrap().signed_out);
        let change = offline(&mut tracker, "B", 4).unwrap();
        assert!(change.signed_out);
        assert!(change.primary.is_none());
    }

    #[test]
    fn test_error_resource_cannot_be_primary() {
        let mut tracker = PresenceTracker::new();
        online(&mut tracker, "A", 5, 1);
        tracker
            .ingest(&peer(), "A", ShowState::Error, 5, None, None, t(2))
            .unwrap();
        assert!(tracker.primary_resource(&peer()).is_none());
    }

    #[test]
    fn test_mark_all_offline() {
        let mut tracker = PresenceTracker::new();
        online(&mut tracker, "A", 5, 1);
        online(&mut tracker, "B", 7, 2);

        tracker.mark_all_offline(t(9));
        assert!(!tracker.has_available_resource(&peer()));
        assert_eq!(tracker.get(&peer(), "A").unwrap().show, ShowState::Offline);
    }
}
