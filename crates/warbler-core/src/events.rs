//! Outward event vocabulary and the emitter that delivers it
//!
//! Internal state transitions are translated into a closed set of event
//! variants delivered synchronously to registered listeners in
//! registration order. A listener that panics is caught and logged; it
//! never prevents the remaining listeners from observing the event.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;

use crate::correlation::PendingKind;
use crate::protocol::{DiscoInfo, DiscoItem, DiscoKind, ExchangeItem, MetacontactTag, RosterItem, Vcard};
use crate::types::{Jid, ShowState};

// ----------------------------------------------------------------------------
// Event Vocabulary
// ----------------------------------------------------------------------------

/// Why an inbound stanza was rejected at the router boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// The sender identifier failed JID validation
    InvalidJid { value: String },
    /// The stanza structure was unusable
    MalformedStanza { detail: String },
}

/// Message classification as delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageKind {
    Chat,
    Normal,
    Groupchat,
}

/// Events emitted by a [`crate::connection::Connection`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    // Connection lifecycle
    SignedIn,
    StatusChanged {
        show: ShowState,
    },
    Disconnected {
        reason: String,
    },
    UnsupportedFeature {
        feature: String,
    },

    // Messaging
    MessageReceived {
        from: Jid,
        kind: MessageKind,
        body: String,
        subject: Option<String>,
        thread: Option<String>,
        delayed: bool,
    },
    MessageError {
        from: Jid,
        code: Option<String>,
        text: String,
    },
    ReceiptConfirmed {
        from: Jid,
        id: String,
    },
    MucInvitation {
        room: Jid,
        from: Jid,
        reason: Option<String>,
        password: Option<String>,
        continued: bool,
    },

    // Presence
    PresenceUpdated {
        jid: Jid,
        resource: String,
        show: ShowState,
        priority: i8,
        status: Option<String>,
    },
    PrimaryResourceChanged {
        jid: Jid,
        resource: Option<String>,
    },
    ContactSignedIn {
        jid: Jid,
    },
    ContactSignedOut {
        jid: Jid,
    },
    SubscriptionRequested {
        from: Jid,
        status: Option<String>,
    },
    Subscribed {
        jid: Jid,
    },
    Unsubscribed {
        jid: Jid,
    },

    // Roster and metacontacts
    RosterReceived {
        items: Vec<RosterItem>,
    },
    RosterPushed {
        item: RosterItem,
    },
    RosterSuggestion {
        from: Jid,
        items: Vec<ExchangeItem>,
    },
    MetacontactsReceived {
        tags: Vec<MetacontactTag>,
    },

    // vCard and avatars
    VcardArrived {
        jid: Jid,
        vcard: Vcard,
    },
    VcardPublished,
    VcardPublishFailed {
        reason: String,
    },
    AvatarVerified {
        jid: Jid,
        sha1: String,
    },

    // Service discovery
    DiscoInfoReceived {
        from: Jid,
        info: DiscoInfo,
    },
    DiscoItemsReceived {
        from: Jid,
        node: Option<String>,
        items: Vec<DiscoItem>,
    },
    DiscoFailed {
        from: Jid,
        kind: DiscoKind,
    },
    AgentRemoved {
        jid: Jid,
    },
    PepConfigReceived {
        node: String,
    },

    // Operational conditions
    RequestTimedOut {
        kind: PendingKind,
        message: String,
    },
    StanzaRejected {
        reason: RejectReason,
    },
    SessionTerminated {
        jid: Jid,
        thread_id: String,
    },
    TransferAborted {
        jid: Jid,
        transfer_id: String,
    },
}

// ----------------------------------------------------------------------------
// Event Emitter
// ----------------------------------------------------------------------------

/// Handle identifying a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&Event) + Send>;

/// Delivers events to listeners in registration order, synchronously on
/// the calling thread.
#[derive(Default)]
pub struct EventEmitter {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns a handle usable with [`unsubscribe`].
    ///
    /// [`unsubscribe`]: EventEmitter::unsubscribe
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Deliver an event to every listener in registration order. A
    /// panicking listener is contained and logged.
    pub fn emit(&mut self, event: Event) {
        for (id, listener) in &mut self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if outcome.is_err() {
                tracing::error!(listener = id.0, event = ?event, "event listener panicked");
            }
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl core::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collect(emitter: &mut EventEmitter) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        emitter.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let mut emitter = EventEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            emitter.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        emitter.emit(Event::SignedIn);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let mut emitter = EventEmitter::new();
        emitter.subscribe(|_| panic!("listener bug"));
        let seen = collect(&mut emitter);

        emitter.emit(Event::SignedIn);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut emitter = EventEmitter::new();
        let seen = collect(&mut emitter);
        let extra = emitter.subscribe(|_| {});

        assert!(emitter.unsubscribe(extra));
        assert!(!emitter.unsubscribe(extra));
        emitter.emit(Event::SignedIn);
        assert_eq!(emitter.listener_count(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
