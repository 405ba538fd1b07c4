//! Warbler XMPP connection core
//!
//! This crate implements the protocol heart of an XMPP instant-messaging
//! client: a per-account [`Connection`] that multiplexes inbound stanzas to
//! typed handlers, correlates IQ request/response exchanges, reconciles
//! per-resource presence, and manages conversation sessions. Everything
//! around it (socket and XML framing, UI, persistence) stays outside the
//! crate behind the [`Transport`] and event-listener boundaries.
//!
//! The core is synchronous and single-threaded per connection: the
//! embedder feeds [`Connection::handle_stanza`] from its read loop and
//! calls [`Connection::tick`] on a fixed timer. Heavy derived work is
//! offloaded to a worker pool and rejoins through the same tick.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod connection;
pub mod correlation;
pub mod errors;
pub mod events;
pub mod modules;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod stanza;
pub mod transport;
pub mod types;
pub mod worker;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{AccountConfig, CoreConfig};
pub use connection::Connection;
pub use correlation::{CorrelationTable, IdGenerator, PendingContext, PendingKind, PendingRequest};
pub use errors::{CoreError, Result, TransportError};
pub use events::{Event, EventEmitter, ListenerId, MessageKind, RejectReason};
pub use presence::{PresenceChange, PresenceTracker, ResourcePresence};
pub use protocol::{DiscoInfo, DiscoItem, RosterItem, ServerFeatures, Vcard};
pub use registry::ConnectionRegistry;
pub use router::{HandleResult, IqModule, ModuleContext, ModuleRegistry, StanzaClass};
pub use session::{
    ChatSession, ControlId, NoMucClassifier, PeerClassifier, SessionKind, SessionRegistry,
};
pub use stanza::{ns, Element, IqType, Stanza};
pub use transport::{RecordingTransport, Transport};
pub use types::{Jid, ManualTimeSource, ShowState, SystemTimeSource, TimeSource, Timestamp};
