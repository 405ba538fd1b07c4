//! Pending-request correlation for IQ exchanges
//!
//! Every outbound request that expects a response registers its stanza id
//! here together with the kind of answer it awaits and the context needed
//! to continue the flow. An inbound result or error resolves the entry at
//! most once; entries whose deadline passes are swept out and surfaced as
//! timeout notifications instead of silently dropping.

use core::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Jid, Timestamp};
use crate::{CoreError, Result};

// ----------------------------------------------------------------------------
// Request Id Generation
// ----------------------------------------------------------------------------

/// Monotonic stanza id generator, unique within one connection
#[derive(Debug, Clone)]
pub struct IdGenerator {
    prefix: String,
    counter: u64,
}

impl IdGenerator {
    /// Create a generator with the given id prefix
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
        }
    }

    /// Produce the next id
    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.prefix, self.counter)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new("wb")
    }
}

// ----------------------------------------------------------------------------
// Pending Requests
// ----------------------------------------------------------------------------

/// The kind of answer an outstanding request awaits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingKind {
    VcardPublished,
    VcardArrived,
    AgentRemoved,
    MetacontactsArrived,
    RosterArrived,
    PrivacyArrived,
    PepConfig,
    DiscoInfo,
    DiscoItems,
    Generic,
}

/// Kind-specific continuation context carried by a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingContext {
    /// No context needed
    None,
    /// The peer the answer concerns
    Peer(Jid),
    /// A disco query: target entity and optional node
    Disco { jid: Jid, node: Option<String> },
    /// A vCard publish: the avatar digest that becomes current on success
    VcardPublish { avatar_sha: Option<String> },
}

/// One outstanding request awaiting a correlated response or timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub kind: PendingKind,
    pub context: PendingContext,
    pub created_at: Timestamp,
    pub deadline: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Correlation Table
// ----------------------------------------------------------------------------

/// Maps outstanding request ids to their continuation context.
///
/// Resolution is at-most-once: resolving an id removes the entry, and a
/// second response with the same id finds nothing.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<String, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request.
    ///
    /// Fails with [`CoreError::DuplicateRequestId`] when the id is already
    /// tracked; ids are generated per connection so this indicates a
    /// programming error upstream, but it must not corrupt the table.
    pub fn register(
        &mut self,
        request_id: &str,
        kind: PendingKind,
        context: PendingContext,
        now: Timestamp,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.entries.contains_key(request_id) {
            return Err(CoreError::DuplicateRequestId(request_id.to_owned()));
        }
        self.entries.insert(
            request_id.to_owned(),
            PendingRequest {
                kind,
                context,
                created_at: now,
                deadline: timeout.map(|t| now.add_millis(t.as_millis() as u64)),
            },
        );
        Ok(())
    }

    /// Remove and return the entry for a response id. Returns `None` for a
    /// late, duplicate or foreign response.
    pub fn resolve(&mut self, response_id: &str) -> Option<PendingRequest> {
        self.entries.remove(response_id)
    }

    /// Whether an id is currently tracked
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Remove and return all entries whose deadline has passed.
    ///
    /// An entry is returned at most once across successive sweeps and
    /// never before its deadline.
    pub fn sweep_timeouts(&mut self, now: Timestamp) -> Vec<(String, PendingRequest)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                out.push((id, entry));
            }
        }
        out
    }

    /// Drop every entry without resolving it. Used on connection teardown,
    /// where pending requests are discarded rather than answered.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Timestamp {
        Timestamp::new(1_000_000)
    }

    #[test]
    fn test_resolve_is_at_most_once() {
        let mut table = CorrelationTable::new();
        table
            .register("v1", PendingKind::VcardArrived, PendingContext::None, now(), None)
            .unwrap();

        let first = table.resolve("v1").unwrap();
        assert_eq!(first.kind, PendingKind::VcardArrived);
        assert!(table.resolve("v1").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = CorrelationTable::new();
        table
            .register("r1", PendingKind::RosterArrived, PendingContext::None, now(), None)
            .unwrap();
        let err = table
            .register("r1", PendingKind::Generic, PendingContext::None, now(), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateRequestId(id) if id == "r1"));
        // The original entry is untouched
        assert_eq!(table.resolve("r1").unwrap().kind, PendingKind::RosterArrived);
    }

    #[test]
    fn test_unknown_id_resolves_to_none() {
        let mut table = CorrelationTable::new();
        assert!(table.resolve("ghost").is_none());
    }

    #[test]
    fn test_sweep_respects_deadline() {
        let mut table = CorrelationTable::new();
        table
            .register(
                "d1",
                PendingKind::DiscoInfo,
                PendingContext::None,
                now(),
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        table
            .register("d2", PendingKind::DiscoItems, PendingContext::None, now(), None)
            .unwrap();

        // Before the deadline nothing expires
        assert!(table.sweep_timeouts(now().add_seconds(4)).is_empty());

        // At the deadline exactly one entry expires, exactly once
        let expired = table.sweep_timeouts(now().add_seconds(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "d1");
        assert!(table.sweep_timeouts(now().add_seconds(60)).is_empty());

        // The deadline-less entry survives indefinitely
        assert!(table.contains("d2"));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut table = CorrelationTable::new();
        for id in ["a", "b", "c"] {
            table
                .register(id, PendingKind::Generic, PendingContext::None, now(), None)
                .unwrap();
        }
        assert_eq!(table.clear(), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_id_generator_unique() {
        let mut ids = IdGenerator::new("wb");
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("wb-"));
    }
}
