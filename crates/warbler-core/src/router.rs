//! Stanza classification and the protocol-module handler chain
//!
//! Inbound stanzas are classified once, then offered to registered
//! protocol modules in registration order. A module that claims a stanza
//! stops further propagation; an unclaimed stanza falls through to the
//! connection's default path. Claiming is an explicit return value, never
//! control-flow by unwinding.

use crate::config::{AccountConfig, CoreConfig};
use crate::correlation::{CorrelationTable, IdGenerator};
use crate::events::EventEmitter;
use crate::protocol::RosterItem;
use crate::stanza::Stanza;
use crate::transport::Transport;
use crate::types::{Jid, Timestamp};
use crate::{CoreError, Result};

// ----------------------------------------------------------------------------
// Stanza Classification
// ----------------------------------------------------------------------------

/// The router's view of an inbound stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaClass {
    Message,
    Presence,
    IqGet,
    IqSet,
    IqResult,
    IqError,
    /// A top-level element the core has no handlers for
    Unknown,
}

impl StanzaClass {
    /// Classify a stanza, failing on structurally unusable input (an iq
    /// with a missing or unrecognized type attribute).
    pub fn classify(stanza: &Stanza) -> Result<StanzaClass> {
        match stanza.name() {
            "message" => Ok(StanzaClass::Message),
            "presence" => Ok(StanzaClass::Presence),
            "iq" => match stanza.stanza_type() {
                Some("get") => Ok(StanzaClass::IqGet),
                Some("set") => Ok(StanzaClass::IqSet),
                Some("result") => Ok(StanzaClass::IqResult),
                Some("error") => Ok(StanzaClass::IqError),
                Some(other) => Err(CoreError::malformed(format!("iq type '{other}'"))),
                None => Err(CoreError::malformed("iq without type attribute")),
            },
            _ => Ok(StanzaClass::Unknown),
        }
    }
}

// ----------------------------------------------------------------------------
// Handler Results
// ----------------------------------------------------------------------------

/// Whether a module consumed a stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// The stanza is fully handled; stop the chain
    Claimed,
    /// Not this module's stanza; keep going
    NotClaimed,
}

// ----------------------------------------------------------------------------
// Module Context
// ----------------------------------------------------------------------------

/// Shared state a module may touch while handling a stanza.
///
/// Modules never reach around this context into the connection, which is
/// what keeps the handler chain reentrancy-free.
pub struct ModuleContext<'a> {
    pub transport: &'a mut dyn Transport,
    pub correlation: &'a mut CorrelationTable,
    pub emitter: &'a mut EventEmitter,
    pub ids: &'a mut IdGenerator,
    pub roster: &'a mut hashbrown::HashMap<Jid, RosterItem>,
    pub account: &'a AccountConfig,
    pub core: &'a CoreConfig,
    pub now: Timestamp,
}

impl ModuleContext<'_> {
    /// Send a stanza, logging instead of failing when the transport is
    /// down; by the time a reply is on its way the stanza it answers has
    /// already been consumed.
    pub fn send_or_log(&mut self, stanza: &Stanza) {
        if let Err(error) = self.transport.send(stanza) {
            tracing::warn!(%error, "dropping outbound stanza");
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Modules
// ----------------------------------------------------------------------------

/// A protocol extension handling some subset of iq traffic.
///
/// The connection owns one instance of each module and the router asks
/// `handles` before offering a stanza, so `handle` only sees traffic the
/// module declared interest in.
pub trait IqModule: Send {
    /// Stable name for logging
    fn name(&self) -> &'static str;

    /// Whether this module wants stanzas of this class and payload namespace
    fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool;

    /// Handle a stanza. Returning [`HandleResult::Claimed`] stops the chain.
    fn handle(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        class: StanzaClass,
        stanza: &Stanza,
    ) -> Result<HandleResult>;
}

/// Ordered collection of protocol modules
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn IqModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module to the chain
    pub fn register(&mut self, module: Box<dyn IqModule>) {
        self.modules.push(module);
    }

    /// Offer a stanza to each interested module in registration order
    /// until one claims it. A module error is logged and treated as not
    /// claimed so one bad handler cannot wedge the chain.
    pub fn dispatch(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        class: StanzaClass,
        stanza: &Stanza,
    ) -> HandleResult {
        let namespace = stanza.payload_namespace();
        for module in &mut self.modules {
            if !module.handles(class, namespace) {
                continue;
            }
            match module.handle(ctx, class, stanza) {
                Ok(HandleResult::Claimed) => {
                    tracing::debug!(module = module.name(), "stanza claimed");
                    return HandleResult::Claimed;
                }
                Ok(HandleResult::NotClaimed) => {}
                Err(error) => {
                    tracing::warn!(module = module.name(), %error, "module failed on stanza");
                }
            }
        }
        HandleResult::NotClaimed
    }

    /// Number of registered modules
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is registered
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl core::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{ns, Element, IqType};
    use crate::transport::RecordingTransport;

    struct ClaimingModule {
        namespace: &'static str,
        calls: usize,
    }

    impl IqModule for ClaimingModule {
        fn name(&self) -> &'static str {
            "claiming"
        }

        fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool {
            class == StanzaClass::IqGet && namespace == Some(self.namespace)
        }

        fn handle(
            &mut self,
            _ctx: &mut ModuleContext<'_>,
            _class: StanzaClass,
            _stanza: &Stanza,
        ) -> Result<HandleResult> {
            self.calls += 1;
            Ok(HandleResult::Claimed)
        }
    }

    fn test_ctx<'a>(
        transport: &'a mut RecordingTransport,
        correlation: &'a mut CorrelationTable,
        emitter: &'a mut EventEmitter,
        ids: &'a mut IdGenerator,
        roster: &'a mut hashbrown::HashMap<Jid, RosterItem>,
        account: &'a AccountConfig,
        core: &'a CoreConfig,
    ) -> ModuleContext<'a> {
        ModuleContext {
            transport,
            correlation,
            emitter,
            ids,
            roster,
            account,
            core,
            now: Timestamp::new(0),
        }
    }

    #[test]
    fn test_classify() {
        let iq = Stanza::iq(IqType::Get);
        assert_eq!(StanzaClass::classify(&iq).unwrap(), StanzaClass::IqGet);

        let msg = Stanza::from_element(Element::new("message"));
        assert_eq!(StanzaClass::classify(&msg).unwrap(), StanzaClass::Message);

        let odd = Stanza::from_element(Element::new("stream:features"));
        assert_eq!(StanzaClass::classify(&odd).unwrap(), StanzaClass::Unknown);

        let bad = Stanza::from_element(Element::new("iq"));
        assert!(StanzaClass::classify(&bad).is_err());

        let worse = Stanza::from_element(Element::new("iq").with_attr("type", "subscribe"));
        assert!(StanzaClass::classify(&worse).is_err());
    }

    #[test]
    fn test_first_claim_stops_propagation() {
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(ClaimingModule {
            namespace: ns::PING,
            calls: 0,
        }));
        registry.register(Box::new(ClaimingModule {
            namespace: ns::PING,
            calls: 0,
        }));

        let mut transport = RecordingTransport::new();
        let mut correlation = CorrelationTable::new();
        let mut emitter = EventEmitter::new();
        let mut ids = IdGenerator::default();
        let mut roster = hashbrown::HashMap::new();
        let account = AccountConfig::new(Jid::bare("me", "example.com"), "test");
        let core = CoreConfig::default();
        let mut ctx = test_ctx(
            &mut transport,
            &mut correlation,
            &mut emitter,
            &mut ids,
            &mut roster,
            &account,
            &core,
        );

        let ping = Stanza::iq(IqType::Get)
            .with_id("p1")
            .with_payload(Element::new("ping").with_namespace(ns::PING));

        let result = registry.dispatch(&mut ctx, StanzaClass::IqGet, &ping);
        assert_eq!(result, HandleResult::Claimed);

        // An iq in a namespace nobody registered falls through
        let other = Stanza::iq(IqType::Get)
            .with_id("p2")
            .with_payload(Element::new("query").with_namespace(ns::VERSION));
        let result = registry.dispatch(&mut ctx, StanzaClass::IqGet, &other);
        assert_eq!(result, HandleResult::NotClaimed);
    }
}
