//! The connection umbrella
//!
//! One `Connection` runs the protocol core for exactly one account: it owns
//! the transport handle, the correlation table, the presence tracker, the
//! session registry, the module chain and the event emitter, and wires them
//! into the inbound stanza pipeline and the outbound command API.
//!
//! The connection is synchronous and single-threaded. The embedder's read
//! loop feeds [`Connection::handle_stanza`] and calls [`Connection::tick`]
//! on a periodic timer for timeout sweeps and offloaded-work rejoin. One
//! bad stanza never aborts the loop: parse and validation failures are
//! contained here and surfaced as rejection events.

use hashbrown::HashMap;

use crate::config::{AccountConfig, CoreConfig};
use crate::correlation::{
    CorrelationTable, IdGenerator, PendingContext, PendingKind, PendingRequest,
};
use crate::events::{Event, EventEmitter, ListenerId, MessageKind, RejectReason};
use crate::modules::{DiscoModule, PingModule, PrivacyPushModule, RosterPushModule, VersionModule};
use crate::protocol::disco::{self, DiscoInfo, DiscoKind, ServerFeatures};
use crate::protocol::roster::{self, RosterItem};
use crate::protocol::vcard::Vcard;
use crate::router::{HandleResult, IqModule, ModuleContext, ModuleRegistry, StanzaClass};
use crate::session::{ChatSession, ControlId, NoMucClassifier, PeerClassifier, SessionKind, SessionRegistry};
use crate::stanza::{ns, Element, IqType, Stanza};
use crate::transport::Transport;
use crate::types::{Jid, ShowState, SystemTimeSource, TimeSource, Timestamp};
use crate::worker::{WorkItem, WorkOutcome, WorkerPool};
use crate::{CoreError, Result};

// ----------------------------------------------------------------------------
// Bootstrap Chain
// ----------------------------------------------------------------------------

/// Progress of the login bootstrap: server disco, privacy probe,
/// metacontacts, roster, then first presence. Each step registers the next
/// one only when the previous resolves or times out, so the chain can
/// stall at most one step deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapState {
    Idle,
    AwaitingServerDisco,
    AwaitingPrivacy,
    AwaitingMetacontacts,
    AwaitingRoster,
    Complete,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// The protocol core for one account
pub struct Connection<T: TimeSource = SystemTimeSource> {
    account: AccountConfig,
    core: CoreConfig,
    transport: Box<dyn Transport>,
    correlation: CorrelationTable,
    presence: crate::presence::PresenceTracker,
    sessions: SessionRegistry,
    modules: ModuleRegistry,
    emitter: EventEmitter,
    workers: WorkerPool,
    classifier: Box<dyn PeerClassifier + Send>,
    roster: HashMap<Jid, RosterItem>,
    server: ServerFeatures,
    transfers: HashMap<Jid, Vec<String>>,
    ids: IdGenerator,
    time_source: T,
    bootstrap: BootstrapState,
    bootstrap_request: Option<String>,
    continue_connect: Option<(ShowState, Option<String>)>,
    current_show: ShowState,
    current_status: Option<String>,
    current_priority: i8,
    vcard_sha: Option<String>,
}

impl Connection<SystemTimeSource> {
    /// Create a connection on the wall clock
    pub fn new(account: AccountConfig, core: CoreConfig, transport: Box<dyn Transport>) -> Self {
        Self::with_time_source(account, core, transport, SystemTimeSource)
    }
}

impl<T: TimeSource> Connection<T> {
    /// Create a connection with an explicit time source
    pub fn with_time_source(
        account: AccountConfig,
        core: CoreConfig,
        transport: Box<dyn Transport>,
        time_source: T,
    ) -> Self {
        let mut modules = ModuleRegistry::new();
        modules.register(Box::new(PingModule));
        modules.register(Box::new(VersionModule));
        modules.register(Box::new(DiscoModule));
        modules.register(Box::new(RosterPushModule));
        modules.register(Box::new(PrivacyPushModule));

        let workers = WorkerPool::new(core.worker_threads);
        Self {
            account,
            core,
            transport,
            correlation: CorrelationTable::new(),
            presence: crate::presence::PresenceTracker::new(),
            sessions: SessionRegistry::new(),
            modules,
            emitter: EventEmitter::new(),
            workers,
            classifier: Box::new(NoMucClassifier),
            roster: HashMap::new(),
            server: ServerFeatures::new(),
            transfers: HashMap::new(),
            ids: IdGenerator::default(),
            time_source,
            bootstrap: BootstrapState::Idle,
            bootstrap_request: None,
            continue_connect: None,
            current_show: ShowState::Offline,
            current_status: None,
            current_priority: 0,
            vcard_sha: None,
        }
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    /// Register an event listener
    pub fn on_event<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.emitter.subscribe(listener)
    }

    /// Remove an event listener
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.emitter.unsubscribe(id)
    }

    /// Replace the MUC occupant classifier
    pub fn set_classifier(&mut self, classifier: Box<dyn PeerClassifier + Send>) {
        self.classifier = classifier;
    }

    /// Register an additional protocol module behind the built-in ones
    pub fn register_module(&mut self, module: Box<dyn IqModule>) {
        self.modules.register(module);
    }

    /// The account this connection serves
    pub fn account(&self) -> &AccountConfig {
        &self.account
    }

    /// Read access to the presence tracker
    pub fn presence(&self) -> &crate::presence::PresenceTracker {
        &self.presence
    }

    /// Read access to the session registry
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Read access to the roster mirror
    pub fn roster(&self) -> &HashMap<Jid, RosterItem> {
        &self.roster
    }

    /// Capabilities learned about our server
    pub fn server_features(&self) -> &ServerFeatures {
        &self.server
    }

    /// Whether the transport reports a live stream
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Our current show state
    pub fn current_show(&self) -> ShowState {
        self.current_show
    }

    // ------------------------------------------------------------------
    // Inbound Pipeline
    // ------------------------------------------------------------------

    /// Route one inbound stanza.
    ///
    /// Exactly one terminal action happens per stanza: a module claims it,
    /// a default path consumes it, or it is rejected with a typed event.
    /// This method never propagates an error to the read loop.
    pub fn handle_stanza(&mut self, stanza: Stanza) {
        let now = self.time_source.now();
        let class = match StanzaClass::classify(&stanza) {
            Ok(class) => class,
            Err(error) => {
                tracing::warn!(%error, "rejecting malformed stanza");
                self.emitter.emit(Event::StanzaRejected {
                    reason: RejectReason::MalformedStanza {
                        detail: error.to_string(),
                    },
                });
                return;
            }
        };

        match class {
            StanzaClass::Message => self.handle_message(&stanza, now),
            StanzaClass::Presence => self.handle_presence(&stanza, now),
            StanzaClass::IqGet | StanzaClass::IqSet => self.handle_iq_request(class, &stanza, now),
            StanzaClass::IqResult | StanzaClass::IqError => {
                self.handle_iq_response(class, &stanza, now)
            }
            StanzaClass::Unknown => {
                tracing::debug!(name = stanza.name(), "dropping unknown stanza");
            }
        }
    }

    /// Periodic maintenance: sweep request timeouts and rejoin offloaded
    /// work. The embedder calls this on a fixed tick, every few seconds.
    pub fn tick(&mut self) {
        let now = self.time_source.now();
        let expired = self.correlation.sweep_timeouts(now);
        for (id, pending) in expired {
            self.handle_timeout(id, pending);
        }
        for outcome in self.workers.drain_completed() {
            self.handle_work_outcome(outcome);
        }
    }

    fn reject(&mut self, reason: RejectReason) {
        tracing::warn!(?reason, "rejecting stanza");
        self.emitter.emit(Event::StanzaRejected { reason });
    }

    fn parse_sender(&mut self, stanza: &Stanza) -> Option<Jid> {
        let raw = match stanza.from_attr() {
            Some(raw) => raw,
            None => {
                tracing::debug!(name = stanza.name(), "stanza without sender ignored");
                return None;
            }
        };
        match Jid::parse(raw) {
            Ok(jid) => Some(jid),
            Err(_) => {
                self.reject(RejectReason::InvalidJid {
                    value: raw.to_owned(),
                });
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    fn handle_message(&mut self, stanza: &Stanza, now: Timestamp) {
        let Some(from) = self.parse_sender(stanza) else {
            return;
        };
        let el = stanza.element();

        // Roster item exchange rides on messages
        if let Some(x) = el.child_ns("x", ns::ROSTER_EXCHANGE) {
            let items = roster::parse_exchange(x);
            if !items.is_empty() {
                self.emitter.emit(Event::RosterSuggestion { from, items });
            }
            return;
        }

        // Mediated groupchat invitation: the room invites on the inviter's
        // behalf
        if let Some(x) = el.child_ns("x", ns::MUC_USER) {
            if let Some(invite) = x.child("invite") {
                let Some(inviter) = invite
                    .attr("from")
                    .and_then(|raw| Jid::parse(raw).ok())
                else {
                    tracing::warn!("invitation with invalid inviter jid ignored");
                    return;
                };
                self.emitter.emit(Event::MucInvitation {
                    room: from.to_bare(),
                    from: inviter,
                    reason: invite.child_text("reason").and_then(non_empty),
                    password: x.child_text("password").and_then(non_empty),
                    continued: invite.child("continue").is_some(),
                });
                return;
            }
        }

        // Direct invitation
        if let Some(x) = el.child_ns("x", ns::CONFERENCE) {
            if let Some(room) = x.attr("jid").and_then(|raw| Jid::parse(raw).ok()) {
                self.emitter.emit(Event::MucInvitation {
                    room: room.to_bare(),
                    from: from.clone(),
                    reason: x.attr("reason").map(str::to_owned),
                    password: x.attr("password").map(str::to_owned),
                    continued: x.child("continue").is_some(),
                });
                return;
            }
        }

        let kind = match stanza.stanza_type() {
            Some("chat") => MessageKind::Chat,
            Some("groupchat") => MessageKind::Groupchat,
            _ => MessageKind::Normal,
        };
        let is_error = stanza.stanza_type() == Some("error");
        let thread = el.child_text("thread").and_then(non_empty);
        let body = el.child_text("body").and_then(non_empty);
        let subject = el.child_text("subject").and_then(non_empty);
        let delayed = el.child_ns("delay", ns::DELAY).is_some();

        // Groupchat traffic is not session-tracked; the MUC layer owns it
        if kind == MessageKind::Groupchat {
            if body.is_some() || subject.is_some() {
                self.emitter.emit(Event::MessageReceived {
                    from,
                    kind,
                    body: body.unwrap_or_default(),
                    subject,
                    thread,
                    delayed,
                });
            }
            return;
        }

        let pm = self.classifier.is_muc_occupant(&from);
        {
            let session = self
                .sessions
                .get_or_create(&from, thread.as_deref(), pm, now);
            if thread.is_some() {
                session.mark_thread_received();
            }
            session.note_receive(now, from.resource());
        }

        if is_error {
            let error = el.child("error");
            let text = error
                .and_then(|e| e.child_text("text"))
                .and_then(non_empty)
                .or_else(|| body.clone())
                .unwrap_or_default();
            self.emitter.emit(Event::MessageError {
                from,
                code: error.and_then(|e| e.attr("code")).map(str::to_owned),
                text,
            });
            return;
        }

        // Delivery receipts: answer requests, surface confirmations
        if el.child_ns("request", ns::RECEIPTS).is_some() && self.account.answer_receipts {
            let subscribed = self
                .roster
                .get(&from.to_bare())
                .map(|item| item.subscription.shares_our_presence())
                .unwrap_or(false);
            if (subscribed || pm) && stanza.id().is_some() {
                self.send_receipt(&from, stanza.id().unwrap_or_default(), thread.as_deref());
            }
        }
        if let Some(received) = el.child_ns("received", ns::RECEIPTS) {
            if let Some(id) = received.attr("id").or_else(|| stanza.id()) {
                self.emitter.emit(Event::ReceiptConfirmed {
                    from: from.clone(),
                    id: id.to_owned(),
                });
            }
        }

        if body.is_none() && subject.is_none() {
            // Chat-state or receipt-only message
            return;
        }

        self.emitter.emit(Event::MessageReceived {
            from,
            kind,
            body: body.unwrap_or_default(),
            subject,
            thread,
            delayed,
        });
    }

    fn send_receipt(&mut self, to: &Jid, id: &str, thread: Option<&str>) {
        let mut receipt = Stanza::message(to, "chat").with_id(id.to_owned()).with_payload(
            Element::new("received")
                .with_namespace(ns::RECEIPTS)
                .with_attr("id", id),
        );
        if let Some(thread) = thread {
            receipt
                .element_mut()
                .push_child(Element::new("thread").with_text(thread));
        }
        if let Err(error) = self.transport.send(&receipt) {
            tracing::warn!(%error, "dropping receipt");
        }
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    fn handle_presence(&mut self, stanza: &Stanza, now: Timestamp) {
        let Some(from) = self.parse_sender(stanza) else {
            return;
        };
        let el = stanza.element();

        match stanza.stanza_type() {
            Some("subscribe") => {
                self.emitter.emit(Event::SubscriptionRequested {
                    from: from.to_bare(),
                    status: el.child_text("status").and_then(non_empty),
                });
                return;
            }
            Some("subscribed") => {
                self.emitter.emit(Event::Subscribed {
                    jid: from.to_bare(),
                });
                return;
            }
            Some("unsubscribe") | Some("unsubscribed") => {
                self.emitter.emit(Event::Unsubscribed {
                    jid: from.to_bare(),
                });
                return;
            }
            Some("probe") => {
                tracing::debug!(%from, "ignoring presence probe");
                return;
            }
            _ => {}
        }

        let show = match stanza.stanza_type() {
            Some("unavailable") => ShowState::Offline,
            Some("error") => ShowState::Error,
            None => ShowState::from_show_value(el.child_text("show")),
            Some(other) => {
                tracing::warn!(kind = other, "ignoring presence of unknown type");
                return;
            }
        };
        let priority = el
            .child_text("priority")
            .and_then(|p| p.trim().parse::<i8>().ok())
            .unwrap_or(0);
        let status = el.child_text("status").and_then(non_empty);
        let nickname = el
            .child_ns("nick", ns::NICK)
            .map(|n| n.text().to_owned())
            .and_then(|n| non_empty(&n));

        let bare = from.to_bare();
        let resource = from.resource().unwrap_or("").to_owned();

        let Some(change) = self
            .presence
            .ingest(&bare, &resource, show, priority, status, nickname, now)
        else {
            return;
        };

        self.emitter.emit(Event::PresenceUpdated {
            jid: change.jid.clone(),
            resource: change.resource.clone(),
            show: change.show,
            priority: change.priority,
            status: change.status.clone(),
        });
        if change.primary_changed {
            self.emitter.emit(Event::PrimaryResourceChanged {
                jid: change.jid.clone(),
                resource: change.primary.clone(),
            });
        }
        if change.signed_in {
            self.emitter.emit(Event::ContactSignedIn {
                jid: change.jid.clone(),
            });
        }
        if change.signed_out && self.transport.is_connected() {
            self.emitter.emit(Event::ContactSignedOut {
                jid: change.jid.clone(),
            });
        }

        if matches!(show, ShowState::Offline | ShowState::Error) {
            self.teardown_peer(&from);
        }
    }

    /// Targeted teardown when one specific full JID goes away: abort its
    /// transfer bookkeeping and tear down encryption sessions bound to it,
    /// leaving the contact's other resources untouched.
    fn teardown_peer(&mut self, full: &Jid) {
        if let Some(transfer_ids) = self.transfers.remove(full) {
            for transfer_id in transfer_ids {
                self.emitter.emit(Event::TransferAborted {
                    jid: full.clone(),
                    transfer_id,
                });
            }
        }

        let resource = full.resource();
        let mut doomed: Vec<(Jid, String)> = Vec::new();
        let mut keys = vec![full.to_bare()];
        if !full.is_bare() {
            keys.push(full.clone());
        }
        for key in &keys {
            for session in self.sessions.sessions_for(key) {
                let bound_to_peer = match session.kind() {
                    SessionKind::PrivateMessage => session.jid() == full,
                    SessionKind::Chat => resource.is_some() && session.resource() == resource,
                };
                if bound_to_peer && session.encryption_active() {
                    doomed.push((key.clone(), session.thread_id().to_owned()));
                }
            }
        }
        doomed.sort();
        doomed.dedup();

        for (key, thread_id) in doomed {
            if let Some(mut session) = self.sessions.delete(&key, &thread_id) {
                session.terminate_encryption();
                self.emitter.emit(Event::SessionTerminated {
                    jid: session.jid().clone(),
                    thread_id,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // IQ Requests (get/set)
    // ------------------------------------------------------------------

    fn handle_iq_request(&mut self, class: StanzaClass, stanza: &Stanza, now: Timestamp) {
        let Connection {
            modules,
            transport,
            correlation,
            emitter,
            ids,
            roster,
            account,
            core,
            ..
        } = self;
        let mut ctx = ModuleContext {
            transport: transport.as_mut(),
            correlation,
            emitter,
            ids,
            roster,
            account,
            core,
            now,
        };

        if modules.dispatch(&mut ctx, class, stanza) == HandleResult::Claimed {
            return;
        }

        // Nothing claimed it: one terminal action is still owed
        tracing::debug!(
            namespace = stanza.payload_namespace().unwrap_or("<none>"),
            "answering unhandled iq request with feature-not-implemented"
        );
        let reply = stanza.error_reply("feature-not-implemented", "cancel");
        if let Err(error) = self.transport.send(&reply) {
            tracing::warn!(%error, "dropping iq error reply");
        }
    }

    // ------------------------------------------------------------------
    // IQ Responses (result/error)
    // ------------------------------------------------------------------

    fn handle_iq_response(&mut self, class: StanzaClass, stanza: &Stanza, now: Timestamp) {
        let Some(id) = stanza.id().map(str::to_owned) else {
            tracing::warn!("invalid iq response without an id, ignoring");
            return;
        };

        match self.correlation.resolve(&id) {
            Some(pending) => self.dispatch_pending(&id, pending, class, stanza, now),
            None => {
                tracing::debug!(id = %id, "unmatched iq response (late, duplicate or foreign)");
            }
        }
    }

    fn dispatch_pending(
        &mut self,
        id: &str,
        pending: PendingRequest,
        class: StanzaClass,
        stanza: &Stanza,
        _now: Timestamp,
    ) {
        let is_error = class == StanzaClass::IqError;
        let was_bootstrap = self.bootstrap_request.as_deref() == Some(id);
        if was_bootstrap {
            self.bootstrap_request = None;
        }

        match pending.kind {
            PendingKind::VcardArrived => {
                let jid = match pending.context {
                    PendingContext::Peer(jid) => jid.to_bare(),
                    _ => self.account.jid.to_bare(),
                };
                let vcard_el = stanza.element().child_ns("vCard", ns::VCARD);
                let vcard = match (is_error, vcard_el) {
                    (false, Some(el)) => Vcard::from_element(el),
                    // An empty arrival still tells listeners the fetch finished
                    _ => Vcard::default(),
                };
                if let Some(photo) = &vcard.photo {
                    self.workers.submit(WorkItem::VerifyAvatar {
                        jid: jid.clone(),
                        data_b64: photo.data_b64.clone(),
                    });
                }
                self.emitter.emit(Event::VcardArrived { jid, vcard });
            }

            PendingKind::VcardPublished => {
                if is_error {
                    let reason = stanza
                        .element()
                        .child("error")
                        .and_then(|e| e.child_text("text"))
                        .unwrap_or("server refused vCard")
                        .to_owned();
                    self.emitter.emit(Event::VcardPublishFailed { reason });
                } else {
                    if let PendingContext::VcardPublish { avatar_sha } = pending.context {
                        // A pre-computed digest becomes current right away;
                        // otherwise the worker outcome will install it
                        self.vcard_sha = avatar_sha;
                        self.advertise_presence_if_visible();
                    }
                    self.emitter.emit(Event::VcardPublished);
                }
            }

            PendingKind::AgentRemoved => {
                if let PendingContext::Peer(jid) = pending.context {
                    self.roster.remove(&jid.to_bare());
                    self.emitter.emit(Event::AgentRemoved { jid });
                }
            }

            PendingKind::MetacontactsArrived => {
                if is_error {
                    // Any error means private storage is unusable for us
                    self.server.private_storage = false;
                } else if let Some(storage) = stanza
                    .element()
                    .child_ns("query", ns::PRIVATE)
                    .and_then(|q| q.child_ns("storage", ns::METACONTACTS))
                {
                    let tags = roster::parse_metacontacts(storage);
                    self.emitter.emit(Event::MetacontactsReceived { tags });
                }
                if was_bootstrap && self.bootstrap == BootstrapState::AwaitingMetacontacts {
                    self.request_roster_step();
                }
            }

            PendingKind::RosterArrived => {
                if is_error {
                    tracing::warn!("roster request failed");
                } else if let Some(query) = stanza.element().child_ns("query", ns::ROSTER) {
                    let items = roster::parse_roster(query);
                    self.roster.clear();
                    for item in &items {
                        self.roster.insert(item.jid.to_bare(), item.clone());
                    }
                    self.emitter.emit(Event::RosterReceived { items });
                }
                if was_bootstrap && self.bootstrap == BootstrapState::AwaitingRoster {
                    self.finish_bootstrap();
                }
            }

            PendingKind::PrivacyArrived => {
                if !is_error {
                    self.server.privacy_lists = true;
                } else if matches!(self.continue_connect, Some((ShowState::Invisible, _))) {
                    // Fail fast: an invisible login cannot proceed without
                    // privacy lists
                    self.emitter.emit(Event::UnsupportedFeature {
                        feature: "privacy-lists".to_owned(),
                    });
                    self.disconnect(false, "invisibility not supported by server");
                    return;
                }
                if was_bootstrap && self.bootstrap == BootstrapState::AwaitingPrivacy {
                    self.request_metacontacts_step();
                }
            }

            PendingKind::PepConfig => {
                if is_error {
                    return;
                }
                if let Some(node) = stanza
                    .element()
                    .child_ns("pubsub", ns::PUBSUB_OWNER)
                    .and_then(|p| p.child("configure"))
                    .and_then(|c| c.attr("node"))
                {
                    self.emitter.emit(Event::PepConfigReceived {
                        node: node.to_owned(),
                    });
                }
            }

            PendingKind::DiscoInfo => {
                let jid = match pending.context {
                    PendingContext::Disco { jid, .. } => jid,
                    _ => self.account.jid.to_bare(),
                };
                if is_error {
                    self.emitter.emit(Event::DiscoFailed {
                        from: jid,
                        kind: DiscoKind::Info,
                    });
                } else if let Some(query) = stanza.element().child_ns("query", ns::DISCO_INFO) {
                    let info = DiscoInfo::from_query(query);
                    if jid == Jid::domain(self.account.jid.domain_part()) {
                        self.server.absorb_server_info(&info);
                    }
                    self.server.absorb_entity_info(&jid, &info);
                    self.emitter.emit(Event::DiscoInfoReceived { from: jid, info });
                }
                // The server answered (or refused) its own disco: either
                // way the chain moves on, as the original did
                if was_bootstrap && self.bootstrap == BootstrapState::AwaitingServerDisco {
                    self.request_privacy_step();
                }
            }

            PendingKind::DiscoItems => {
                let jid = match pending.context {
                    PendingContext::Disco { jid, .. } => jid,
                    _ => self.account.jid.to_bare(),
                };
                if is_error {
                    self.emitter.emit(Event::DiscoFailed {
                        from: jid,
                        kind: DiscoKind::Items,
                    });
                } else if let Some(query) = stanza.element().child_ns("query", ns::DISCO_ITEMS) {
                    let node = query.attr("node").map(str::to_owned);
                    let items = disco::parse_items(query);
                    self.emitter.emit(Event::DiscoItemsReceived {
                        from: jid,
                        node,
                        items,
                    });
                }
            }

            PendingKind::Generic => {
                tracing::debug!(id = %id, "generic tracked response resolved");
            }
        }
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    fn handle_timeout(&mut self, id: String, pending: PendingRequest) {
        let message = match &pending.context {
            PendingContext::Peer(jid) => {
                format!("request to {jid} has not arrived in time")
            }
            PendingContext::Disco { jid, .. } => {
                format!("discovery of {jid} has not arrived in time")
            }
            _ => "request has not arrived in time".to_owned(),
        };
        tracing::warn!(id = %id, kind = ?pending.kind, "pending request timed out");
        self.emitter.emit(Event::RequestTimedOut {
            kind: pending.kind,
            message,
        });

        // A dead bootstrap step advances the chain instead of stalling it
        if self.bootstrap_request.as_deref() != Some(id.as_str()) {
            return;
        }
        self.bootstrap_request = None;
        match self.bootstrap {
            BootstrapState::AwaitingServerDisco => self.request_privacy_step(),
            BootstrapState::AwaitingPrivacy => self.request_metacontacts_step(),
            BootstrapState::AwaitingMetacontacts => self.request_roster_step(),
            BootstrapState::AwaitingRoster => self.finish_bootstrap(),
            BootstrapState::Idle | BootstrapState::Complete => {}
        }
    }

    fn handle_work_outcome(&mut self, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::AvatarDigest { jid, sha1_hex } => {
                let Some(sha1) = sha1_hex else {
                    tracing::warn!(%jid, "avatar payload failed to decode");
                    return;
                };
                if jid == self.account.jid.to_bare() {
                    self.vcard_sha = Some(sha1.clone());
                    self.advertise_presence_if_visible();
                }
                self.emitter.emit(Event::AvatarVerified { jid, sha1 });
            }
        }
    }

    // ------------------------------------------------------------------
    // Login Bootstrap
    // ------------------------------------------------------------------

    /// Start the login bootstrap: discover the server, probe privacy
    /// lists, fetch metacontacts and the roster, then broadcast the first
    /// presence with the given show and status.
    pub fn begin_session(&mut self, show: ShowState, status: Option<String>) -> Result<()> {
        self.ensure_connected()?;
        if !show.is_available() {
            tracing::warn!(%show, "refusing to begin a session in a non-available state");
            return Ok(());
        }
        self.continue_connect = Some((show, status));
        self.bootstrap = BootstrapState::AwaitingServerDisco;

        let server = Jid::domain(self.account.jid.domain_part());
        let timeout = self.core.bootstrap_step_timeout;
        let stanza = Stanza::iq_query(IqType::Get, ns::DISCO_INFO).with_to(&server);
        let id = self.send_tracked(
            stanza,
            PendingKind::DiscoInfo,
            PendingContext::Disco {
                jid: server,
                node: None,
            },
            Some(timeout),
        )?;
        self.bootstrap_request = Some(id);
        Ok(())
    }

    fn bootstrap_send(&mut self, stanza: Stanza, kind: PendingKind, context: PendingContext) {
        let timeout = self.core.bootstrap_step_timeout;
        match self.send_tracked(stanza, kind, context, Some(timeout)) {
            Ok(id) => self.bootstrap_request = Some(id),
            Err(error) => {
                tracing::warn!(%error, "bootstrap step could not be sent");
                self.bootstrap_request = None;
            }
        }
    }

    fn request_privacy_step(&mut self) {
        self.bootstrap = BootstrapState::AwaitingPrivacy;
        let stanza = Stanza::iq_query(IqType::Get, ns::PRIVACY);
        self.bootstrap_send(stanza, PendingKind::PrivacyArrived, PendingContext::None);
    }

    fn request_metacontacts_step(&mut self) {
        self.bootstrap = BootstrapState::AwaitingMetacontacts;
        let stanza = Stanza::iq(IqType::Get).with_payload(
            Element::new("query")
                .with_namespace(ns::PRIVATE)
                .with_child(Element::new("storage").with_namespace(ns::METACONTACTS)),
        );
        self.bootstrap_send(stanza, PendingKind::MetacontactsArrived, PendingContext::None);
    }

    fn request_roster_step(&mut self) {
        self.bootstrap = BootstrapState::AwaitingRoster;
        let stanza = Stanza::iq_query(IqType::Get, ns::ROSTER);
        self.bootstrap_send(stanza, PendingKind::RosterArrived, PendingContext::None);
    }

    fn finish_bootstrap(&mut self) {
        self.bootstrap = BootstrapState::Complete;
        self.bootstrap_request = None;
        let Some((show, status)) = self.continue_connect.take() else {
            return;
        };

        if show == ShowState::Invisible && !self.server.privacy_lists {
            self.emitter.emit(Event::UnsupportedFeature {
                feature: "privacy-lists".to_owned(),
            });
            self.disconnect(false, "invisibility not supported by server");
            return;
        }

        self.current_show = show;
        self.current_status = status;
        self.current_priority = self.account.default_priority;
        self.advertise_presence_if_visible();
        self.emitter.emit(Event::StatusChanged { show });
        self.emitter.emit(Event::SignedIn);

        if self.server.vcard {
            if let Err(error) = self.request_vcard(None) {
                tracing::warn!(%error, "own vCard request failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound Command API
    // ------------------------------------------------------------------

    /// Send a chat message, creating or resuming the session for it.
    /// Returns the thread id the message was sent under.
    pub fn send_message(
        &mut self,
        to: &Jid,
        body: &str,
        thread: Option<&str>,
    ) -> Result<String> {
        self.ensure_connected()?;
        let now = self.time_source.now();
        let pm = self.classifier.is_muc_occupant(to);
        let thread_id = {
            let session = self.sessions.get_or_create(to, thread, pm, now);
            session.note_send(now);
            session.thread_id().to_owned()
        };

        let id = self.ids.next_id();
        let mut message = Stanza::message(to, "chat").with_id(id);
        message
            .element_mut()
            .push_child(Element::new("body").with_text(body));
        message
            .element_mut()
            .push_child(Element::new("thread").with_text(thread_id.clone()));
        if self.account.request_receipts {
            message
                .element_mut()
                .push_child(Element::new("request").with_namespace(ns::RECEIPTS));
        }
        self.send_stanza(&message)?;
        Ok(thread_id)
    }

    /// Broadcast a presence change. Invisibility requires server privacy
    /// lists and is refused synchronously without them.
    pub fn change_presence(
        &mut self,
        show: ShowState,
        status: Option<String>,
        priority: Option<i8>,
    ) -> Result<()> {
        self.ensure_connected()?;
        if show == ShowState::Invisible && !self.server.privacy_lists {
            return Err(CoreError::unsupported("privacy-lists"));
        }

        self.current_show = show;
        self.current_status = status;
        if let Some(priority) = priority {
            self.current_priority = priority;
        }

        if show == ShowState::Offline {
            let mut presence = Stanza::presence_of_type("unavailable");
            if let Some(status) = &self.current_status {
                presence
                    .element_mut()
                    .push_child(Element::new("status").with_text(status.clone()));
            }
            self.send_stanza(&presence)?;
        } else {
            self.advertise_presence_if_visible();
        }
        self.emitter.emit(Event::StatusChanged { show });
        Ok(())
    }

    /// Request a vCard; `None` fetches our own
    pub fn request_vcard(&mut self, jid: Option<&Jid>) -> Result<String> {
        self.ensure_connected()?;
        let target = jid
            .map(Jid::to_bare)
            .unwrap_or_else(|| self.account.jid.to_bare());
        let mut stanza =
            Stanza::iq(IqType::Get).with_payload(Element::new("vCard").with_namespace(ns::VCARD));
        if jid.is_some() {
            stanza = stanza.with_to(&target);
        }
        let timeout = self.core.request_timeout;
        self.send_tracked(
            stanza,
            PendingKind::VcardArrived,
            PendingContext::Peer(target),
            Some(timeout),
        )
    }

    /// Publish our vCard. The avatar digest is computed on the worker
    /// pool unless the photo already carries one.
    pub fn publish_vcard(&mut self, vcard: &Vcard) -> Result<String> {
        self.ensure_connected()?;
        let avatar_sha = vcard.photo.as_ref().and_then(|photo| photo.digest.clone());
        if let Some(photo) = &vcard.photo {
            if photo.digest.is_none() {
                self.workers.submit(WorkItem::VerifyAvatar {
                    jid: self.account.jid.to_bare(),
                    data_b64: photo.data_b64.clone(),
                });
            }
        }
        let stanza = Stanza::iq(IqType::Set).with_payload(vcard.to_element());
        let timeout = self.core.request_timeout;
        self.send_tracked(
            stanza,
            PendingKind::VcardPublished,
            PendingContext::VcardPublish { avatar_sha },
            Some(timeout),
        )
    }

    /// Fetch the roster outside the bootstrap chain
    pub fn request_roster(&mut self) -> Result<String> {
        self.ensure_connected()?;
        let timeout = self.core.request_timeout;
        self.send_tracked(
            Stanza::iq_query(IqType::Get, ns::ROSTER),
            PendingKind::RosterArrived,
            PendingContext::None,
            Some(timeout),
        )
    }

    /// Query an entity for its identities and features (XEP-0030)
    pub fn discover_info(&mut self, jid: &Jid, node: Option<&str>) -> Result<String> {
        self.ensure_connected()?;
        let mut stanza = Stanza::iq_query(IqType::Get, ns::DISCO_INFO).with_to(jid);
        if let Some(node) = node {
            if let Some(query) = stanza.element_mut().child_mut("query") {
                query.set_attr("node", node);
            }
        }
        let timeout = self.core.request_timeout;
        self.send_tracked(
            stanza,
            PendingKind::DiscoInfo,
            PendingContext::Disco {
                jid: jid.clone(),
                node: node.map(str::to_owned),
            },
            Some(timeout),
        )
    }

    /// Query an entity for its child items (XEP-0030)
    pub fn discover_items(&mut self, jid: &Jid, node: Option<&str>) -> Result<String> {
        self.ensure_connected()?;
        let mut stanza = Stanza::iq_query(IqType::Get, ns::DISCO_ITEMS).with_to(jid);
        if let Some(node) = node {
            if let Some(query) = stanza.element_mut().child_mut("query") {
                query.set_attr("node", node);
            }
        }
        let timeout = self.core.request_timeout;
        self.send_tracked(
            stanza,
            PendingKind::DiscoItems,
            PendingContext::Disco {
                jid: jid.clone(),
                node: node.map(str::to_owned),
            },
            Some(timeout),
        )
    }

    /// Unregister from a gateway agent and drop it from the roster
    pub fn remove_agent(&mut self, agent: &Jid) -> Result<String> {
        self.ensure_connected()?;
        let stanza = Stanza::iq(IqType::Set).with_to(agent).with_payload(
            Element::new("query")
                .with_namespace(ns::REGISTER)
                .with_child(Element::new("remove")),
        );
        let timeout = self.core.request_timeout;
        self.send_tracked(
            stanza,
            PendingKind::AgentRemoved,
            PendingContext::Peer(agent.to_bare()),
            Some(timeout),
        )
    }

    /// Request the configuration form of one of our PEP nodes
    pub fn request_pep_config(&mut self, node: &str) -> Result<String> {
        self.ensure_connected()?;
        let stanza = Stanza::iq(IqType::Get).with_payload(
            Element::new("pubsub")
                .with_namespace(ns::PUBSUB_OWNER)
                .with_child(Element::new("configure").with_attr("node", node)),
        );
        let timeout = self.core.request_timeout;
        self.send_tracked(
            stanza,
            PendingKind::PepConfig,
            PendingContext::None,
            Some(timeout),
        )
    }

    /// Track an in-progress transfer with a peer's full JID so it can be
    /// aborted when that resource signs out
    pub fn register_transfer(&mut self, peer: &Jid, transfer_id: impl Into<String>) {
        self.transfers
            .entry(peer.clone())
            .or_default()
            .push(transfer_id.into());
    }

    /// Forget a finished transfer
    pub fn complete_transfer(&mut self, peer: &Jid, transfer_id: &str) {
        if let Some(ids) = self.transfers.get_mut(peer) {
            ids.retain(|id| id != transfer_id);
            if ids.is_empty() {
                self.transfers.remove(peer);
            }
        }
    }

    /// Attach a UI control to a session
    pub fn attach_control(&mut self, key: &Jid, thread_id: &str, control: ControlId) -> bool {
        match self.sessions.get_mut(key, thread_id) {
            Some(session) => {
                session.attach_control(control);
                true
            }
            None => false,
        }
    }

    /// Find an active session with no UI control attached
    pub fn find_controlless_session(
        &self,
        key: &Jid,
        resource: Option<&str>,
    ) -> Option<&ChatSession> {
        self.sessions.find_controlless_session(key, resource)
    }

    /// Terminate one session, optionally telling the peer
    pub fn terminate_session(
        &mut self,
        key: &Jid,
        thread_id: &str,
        send_termination: bool,
    ) -> bool {
        let Some(mut session) = self.sessions.delete(key, thread_id) else {
            return false;
        };
        if send_termination {
            self.send_session_termination(&session);
        }
        session.terminate_encryption();
        self.emitter.emit(Event::SessionTerminated {
            jid: session.jid().clone(),
            thread_id: thread_id.to_owned(),
        });
        true
    }

    /// Terminate every session, optionally sending termination stanzas
    /// first. Used on logout.
    pub fn terminate_all_sessions(&mut self, send_termination: bool) {
        for mut session in self.sessions.drain() {
            if send_termination && self.transport.is_connected() {
                self.send_session_termination(&session);
            }
            session.terminate_encryption();
            self.emitter.emit(Event::SessionTerminated {
                jid: session.jid().clone(),
                thread_id: session.thread_id().to_owned(),
            });
        }
    }

    /// Tear the connection down: terminate every session (optionally with
    /// termination stanzas), drop all pending requests unresolved, and
    /// mark every tracked resource offline.
    pub fn disconnect(&mut self, graceful: bool, reason: &str) {
        let now = self.time_source.now();

        self.terminate_all_sessions(graceful);

        let dropped = self.correlation.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped pending requests on disconnect");
        }

        self.presence.mark_all_offline(now);
        self.transfers.clear();
        self.bootstrap = BootstrapState::Idle;
        self.bootstrap_request = None;
        self.continue_connect = None;
        self.current_show = ShowState::Offline;
        self.current_status = None;

        self.emitter.emit(Event::Disconnected {
            reason: reason.to_owned(),
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_connected(&self) -> Result<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(crate::errors::TransportError::NotConnected.into())
        }
    }

    fn send_stanza(&mut self, stanza: &Stanza) -> Result<()> {
        self.transport.send(stanza).map_err(CoreError::from)
    }

    /// Register a pending request and send its stanza, rolling the
    /// registration back when the transport refuses the send.
    fn send_tracked(
        &mut self,
        stanza: Stanza,
        kind: PendingKind,
        context: PendingContext,
        timeout: Option<core::time::Duration>,
    ) -> Result<String> {
        let id = self.ids.next_id();
        let now = self.time_source.now();
        self.correlation
            .register(&id, kind, context, now, timeout)?;
        let stanza = stanza.with_id(id.clone());
        if let Err(error) = self.transport.send(&stanza) {
            self.correlation.resolve(&id);
            return Err(error.into());
        }
        Ok(id)
    }

    fn send_session_termination(&mut self, session: &ChatSession) {
        let to = match (session.kind(), session.resource()) {
            (SessionKind::Chat, Some(resource)) => session.jid().clone().with_resource(resource),
            _ => session.jid().clone(),
        };
        let mut message = Stanza::message(&to, "chat")
            .with_payload(Element::new("gone").with_namespace(ns::CHATSTATES));
        message
            .element_mut()
            .push_child(Element::new("thread").with_text(session.thread_id()));
        if let Err(error) = self.transport.send(&message) {
            tracing::debug!(%error, "dropping session termination");
        }
    }

    /// Broadcast our current presence including the avatar digest advert,
    /// unless we are offline or invisible.
    fn advertise_presence_if_visible(&mut self) {
        if !self.transport.is_connected() {
            return;
        }
        if !self.current_show.is_available() || self.current_show == ShowState::Invisible {
            return;
        }

        let mut presence = Stanza::presence();
        if let Some(show) = self.current_show.show_value() {
            presence
                .element_mut()
                .push_child(Element::new("show").with_text(show));
        }
        if let Some(status) = &self.current_status {
            presence
                .element_mut()
                .push_child(Element::new("status").with_text(status.clone()));
        }
        presence
            .element_mut()
            .push_child(Element::new("priority").with_text(self.current_priority.to_string()));

        let mut advert = Element::new("x").with_namespace(ns::VCARD_UPDATE);
        if let Some(sha) = &self.vcard_sha {
            advert.push_child(Element::new("photo").with_text(sha.clone()));
        }
        presence.element_mut().push_child(advert);

        if let Err(error) = self.transport.send(&presence) {
            tracing::warn!(%error, "dropping presence broadcast");
        }
    }
}

impl<T: TimeSource> core::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("account", &self.account.jid)
            .field("bootstrap", &self.bootstrap)
            .field("pending", &self.correlation.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}
