//! Conversation sessions and their registry
//!
//! One session tracks one logical conversation thread with a peer. Chat
//! sessions are keyed by the peer's bare JID, private-message sessions
//! (conversations with a groupchat occupant) by the full JID, and within
//! one key at most one session exists per thread id.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Jid, Timestamp};

// ----------------------------------------------------------------------------
// Peer Classification
// ----------------------------------------------------------------------------

/// External classification of peers the core queries when keying sessions.
///
/// Whether a full JID denotes a groupchat occupant is knowledge the MUC
/// layer holds, not the core.
pub trait PeerClassifier {
    fn is_muc_occupant(&self, jid: &Jid) -> bool;
}

/// Default classifier for connections without a MUC layer attached
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMucClassifier;

impl PeerClassifier for NoMucClassifier {
    fn is_muc_occupant(&self, _jid: &Jid) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// Chat Session
// ----------------------------------------------------------------------------

/// Opaque reference to a UI control attached to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlId(pub u64);

/// Session flavor, deciding the key form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// Ordinary one-to-one chat, keyed by bare JID
    Chat,
    /// Private message with a groupchat occupant, keyed by full JID
    PrivateMessage,
}

/// One conversation thread with a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    jid: Jid,
    kind: SessionKind,
    thread_id: String,
    received_thread_id: bool,
    resource: Option<String>,
    last_send: Timestamp,
    last_receive: Timestamp,
    control: Option<ControlId>,
    encryption_active: bool,
}

impl ChatSession {
    fn new(
        jid: Jid,
        kind: SessionKind,
        thread_id: Option<&str>,
        resource: Option<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            jid,
            kind,
            thread_id: thread_id
                .map(str::to_owned)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            received_thread_id: false,
            resource,
            last_send: now,
            last_receive: Timestamp::new(0),
            control: None,
            encryption_active: false,
        }
    }

    /// The key JID of this session (bare for chat, full for pm)
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Whether the peer ever echoed our thread id back
    pub fn received_thread_id(&self) -> bool {
        self.received_thread_id
    }

    /// Record that the peer used this thread id
    pub fn mark_thread_received(&mut self) {
        self.received_thread_id = true;
    }

    /// Resource of the peer this session last spoke to
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn last_send(&self) -> Timestamp {
        self.last_send
    }

    pub fn last_receive(&self) -> Timestamp {
        self.last_receive
    }

    /// Note an outbound message on this session
    pub fn note_send(&mut self, now: Timestamp) {
        self.last_send = now;
    }

    /// Note an inbound message on this session
    pub fn note_receive(&mut self, now: Timestamp, resource: Option<&str>) {
        self.last_receive = now;
        if resource.is_some() {
            self.resource = resource.map(str::to_owned);
        }
    }

    pub fn control(&self) -> Option<ControlId> {
        self.control
    }

    /// Attach a UI control to this session
    pub fn attach_control(&mut self, control: ControlId) {
        self.control = Some(control);
    }

    /// Detach the UI control, leaving the session running
    pub fn detach_control(&mut self) -> Option<ControlId> {
        self.control.take()
    }

    pub fn encryption_active(&self) -> bool {
        self.encryption_active
    }

    /// Mark an encryption session as negotiated on this thread
    pub fn enable_encryption(&mut self) {
        self.encryption_active = true;
    }

    /// Tear down the encryption session material
    pub fn terminate_encryption(&mut self) {
        self.encryption_active = false;
    }
}

// ----------------------------------------------------------------------------
// Session Registry
// ----------------------------------------------------------------------------

/// Two-level session storage: key JID, then thread id.
///
/// Deleting the last thread entry of a JID removes the JID entry too, so
/// no empty inner maps linger.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Jid, HashMap<String, ChatSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic lookup-or-create.
    ///
    /// `pm` decides the key form: private-message sessions are stored under
    /// the full JID, chat sessions under the bare JID. With no thread id
    /// given, a resumable thread-less session is preferred over creating a
    /// fresh one.
    pub fn get_or_create(
        &mut self,
        full_jid: &Jid,
        thread_id: Option<&str>,
        pm: bool,
        now: Timestamp,
    ) -> &mut ChatSession {
        let (key, kind) = if pm {
            (full_jid.clone(), SessionKind::PrivateMessage)
        } else {
            (full_jid.to_bare(), SessionKind::Chat)
        };

        let thread = match thread_id {
            Some(thread) => Some(thread.to_owned()),
            None => self.find_null_session(&key).map(|s| s.thread_id.clone()),
        };

        if let Some(thread) = thread {
            let exists = self
                .sessions
                .get(&key)
                .is_some_and(|threads| threads.contains_key(&thread));
            if exists {
                return self
                    .sessions
                    .get_mut(&key)
                    .and_then(|threads| threads.get_mut(&thread))
                    .expect("session present after lookup");
            }
            return self.insert_session(key, kind, Some(&thread), full_jid, now);
        }

        self.insert_session(key, kind, None, full_jid, now)
    }

    fn insert_session(
        &mut self,
        key: Jid,
        kind: SessionKind,
        thread_id: Option<&str>,
        full_jid: &Jid,
        now: Timestamp,
    ) -> &mut ChatSession {
        let session = ChatSession::new(
            key.clone(),
            kind,
            thread_id,
            full_jid.resource().map(str::to_owned),
            now,
        );
        let thread = session.thread_id.clone();
        self.sessions
            .entry(key)
            .or_default()
            .insert(thread.clone(), session);
        self.sessions
            .get_mut(&full_key(kind, full_jid))
            .and_then(|threads| threads.get_mut(&thread))
            .expect("session present after insert")
    }

    /// Find an existing session by key JID and thread id
    pub fn find(&self, key: &Jid, thread_id: &str) -> Option<&ChatSession> {
        self.sessions.get(key)?.get(thread_id)
    }

    /// Among sessions under a key JID whose thread id the peer never
    /// echoed, the one most recently sent to. Keeps a conversation going
    /// that started before the peer committed to a thread.
    pub fn find_null_session(&self, key: &Jid) -> Option<&ChatSession> {
        self.sessions
            .get(key)?
            .values()
            .filter(|s| !s.received_thread_id)
            .max_by_key(|s| s.last_send)
    }

    /// Find an active session with no UI control attached, optionally
    /// restricted to one peer resource.
    pub fn find_controlless_session(
        &self,
        key: &Jid,
        resource: Option<&str>,
    ) -> Option<&ChatSession> {
        self.sessions.get(key)?.values().find(|s| {
            s.control.is_none()
                && resource.map_or(true, |wanted| s.resource.as_deref() == Some(wanted))
        })
    }

    /// All sessions stored under a key JID
    pub fn sessions_for<'a>(&'a self, key: &Jid) -> impl Iterator<Item = &'a ChatSession> {
        self.sessions.get(key).into_iter().flat_map(|m| m.values())
    }

    /// Mutable access to one session
    pub fn get_mut(&mut self, key: &Jid, thread_id: &str) -> Option<&mut ChatSession> {
        self.sessions.get_mut(key)?.get_mut(thread_id)
    }

    /// Remove one session. Tries the JID as given, then its bare form,
    /// and drops the JID entry when its last thread goes away.
    pub fn delete(&mut self, jid: &Jid, thread_id: &str) -> Option<ChatSession> {
        let key = if self.sessions.contains_key(jid) {
            jid.clone()
        } else {
            jid.to_bare()
        };
        let threads = self.sessions.get_mut(&key)?;
        let removed = threads.remove(thread_id);
        if threads.is_empty() {
            self.sessions.remove(&key);
        }
        removed
    }

    /// Remove and return every session. The caller decides whether to send
    /// termination stanzas for them.
    pub fn drain(&mut self) -> Vec<ChatSession> {
        let mut out: Vec<ChatSession> = self
            .sessions
            .drain()
            .flat_map(|(_, threads)| threads.into_iter().map(|(_, s)| s))
            .collect();
        out.sort_by(|a, b| a.jid.cmp(&b.jid).then(a.thread_id.cmp(&b.thread_id)));
        out
    }

    /// Total number of sessions
    pub fn len(&self) -> usize {
        self.sessions.values().map(HashMap::len).sum()
    }

    /// Whether the registry holds no session
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn full_key(kind: SessionKind, full_jid: &Jid) -> Jid {
    match kind {
        SessionKind::PrivateMessage => full_jid.clone(),
        SessionKind::Chat => full_jid.to_bare(),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t(millis: u64) -> Timestamp {
        Timestamp::new(millis)
    }

    fn full() -> Jid {
        Jid::bare("peer", "example.com").with_resource("mobile")
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let mut registry = SessionRegistry::new();
        let thread = {
            let session = registry.get_or_create(&full(), Some("t1"), false, t(1));
            session.note_send(t(5));
            session.thread_id().to_owned()
        };

        let again = registry.get_or_create(&full(), Some("t1"), false, t(2));
        assert_eq!(again.thread_id(), thread);
        // Same instance: the send stamp set through the first borrow survives
        assert_eq!(again.last_send(), t(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_chat_sessions_key_on_bare_jid() {
        let mut registry = SessionRegistry::new();
        let mobile = Jid::bare("peer", "example.com").with_resource("mobile");
        let desktop = Jid::bare("peer", "example.com").with_resource("desktop");

        registry.get_or_create(&mobile, Some("t1"), false, t(1));
        registry.get_or_create(&desktop, Some("t2"), false, t(2));

        let bare = mobile.to_bare();
        assert_eq!(registry.sessions_for(&bare).count(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_pm_sessions_key_on_full_jid() {
        let mut registry = SessionRegistry::new();
        let occupant = Jid::bare("room", "muc.example.com").with_resource("nick");
        registry.get_or_create(&occupant, None, true, t(1));

        assert_eq!(registry.sessions_for(&occupant).count(), 1);
        assert_eq!(registry.sessions_for(&occupant.to_bare()).count(), 0);
    }

    #[test]
    fn test_null_session_resumed() {
        let mut registry = SessionRegistry::new();
        let generated = {
            let session = registry.get_or_create(&full(), None, false, t(1));
            session.note_send(t(10));
            session.thread_id().to_owned()
        };

        // No thread given again: the thread-less session is resumed
        let resumed = registry.get_or_create(&full(), None, false, t(2));
        assert_eq!(resumed.thread_id(), generated);

        // Once the peer echoes the thread id, it is no longer a null session
        resumed.mark_thread_received();
        let fresh = registry.get_or_create(&full(), None, false, t(3));
        assert_ne!(fresh.thread_id(), generated);
    }

    #[test]
    fn test_null_session_prefers_most_recent_send() {
        let mut registry = SessionRegistry::new();
        let older = registry
            .get_or_create(&full(), Some("t-old"), false, t(1))
            .thread_id()
            .to_owned();
        registry.get_mut(&full().to_bare(), &older).unwrap().note_send(t(1));

        let newer = registry
            .get_or_create(&full(), Some("t-new"), false, t(2))
            .thread_id()
            .to_owned();
        registry.get_mut(&full().to_bare(), &newer).unwrap().note_send(t(9));

        let found = registry.find_null_session(&full().to_bare()).unwrap();
        assert_eq!(found.thread_id(), newer);
    }

    #[test]
    fn test_find_controlless_session() {
        let mut registry = SessionRegistry::new();
        let bare = full().to_bare();
        {
            let session = registry.get_or_create(&full(), Some("t1"), false, t(1));
            session.attach_control(ControlId(7));
        }
        registry.get_or_create(&full(), Some("t2"), false, t(2));

        let found = registry.find_controlless_session(&bare, None).unwrap();
        assert_eq!(found.thread_id(), "t2");

        assert!(registry
            .find_controlless_session(&bare, Some("desktop"))
            .is_none());
        assert!(registry
            .find_controlless_session(&bare, Some("mobile"))
            .is_some());
    }

    #[test]
    fn test_delete_drops_empty_jid_entry() {
        let mut registry = SessionRegistry::new();
        registry.get_or_create(&full(), Some("t1"), false, t(1));

        registry.delete(&full(), "t1").unwrap();
        assert!(registry.is_empty());
        assert!(registry.find(&full().to_bare(), "t1").is_none());
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = SessionRegistry::new();
        {
            let session = registry.get_or_create(&full(), Some("t1"), false, t(1));
            session.enable_encryption();
        }
        registry.get_or_create(&full(), Some("t2"), false, t(2));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());

        // A later get_or_create builds a fresh session, not the old state
        let fresh = registry.get_or_create(&full(), Some("t1"), false, t(3));
        assert!(!fresh.encryption_active());
    }
}
