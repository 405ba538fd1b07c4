//! Built-in protocol modules
//!
//! Each module answers one slice of inbound iq traffic: ping, software
//! version, service discovery queries about us, roster pushes and privacy
//! list pushes. The connection registers them in a fixed order at
//! construction; embedders may register further modules after them.

use crate::protocol::roster;
use crate::router::{HandleResult, IqModule, ModuleContext, StanzaClass};
use crate::stanza::{ns, Element, Stanza};
use crate::types::Jid;
use crate::{Event, Result};

// ----------------------------------------------------------------------------
// Ping (XEP-0199)
// ----------------------------------------------------------------------------

/// Answers inbound pings with an empty result
#[derive(Debug, Default)]
pub struct PingModule;

impl IqModule for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool {
        class == StanzaClass::IqGet && namespace == Some(ns::PING)
    }

    fn handle(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        _class: StanzaClass,
        stanza: &Stanza,
    ) -> Result<HandleResult> {
        ctx.send_or_log(&stanza.build_reply("result"));
        Ok(HandleResult::Claimed)
    }
}

// ----------------------------------------------------------------------------
// Software Version (XEP-0092)
// ----------------------------------------------------------------------------

/// Answers version queries from the account config
#[derive(Debug, Default)]
pub struct VersionModule;

impl IqModule for VersionModule {
    fn name(&self) -> &'static str {
        "version"
    }

    fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool {
        class == StanzaClass::IqGet && namespace == Some(ns::VERSION)
    }

    fn handle(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        _class: StanzaClass,
        stanza: &Stanza,
    ) -> Result<HandleResult> {
        if !ctx.account.send_software_version {
            ctx.send_or_log(&stanza.error_reply("service-unavailable", "cancel"));
            return Ok(HandleResult::Claimed);
        }
        let query = Element::new("query")
            .with_namespace(ns::VERSION)
            .with_child(Element::new("name").with_text(ctx.account.client_name.clone()))
            .with_child(Element::new("version").with_text(ctx.account.client_version.clone()));
        let reply = stanza.build_reply("result").with_payload(query);
        ctx.send_or_log(&reply);
        Ok(HandleResult::Claimed)
    }
}

// ----------------------------------------------------------------------------
// Service Discovery (XEP-0030), inbound queries about us
// ----------------------------------------------------------------------------

/// Features this client advertises
const CLIENT_FEATURES: &[&str] = &[
    ns::DISCO_INFO,
    ns::DISCO_ITEMS,
    ns::PING,
    ns::VERSION,
    ns::RECEIPTS,
    ns::CHATSTATES,
    ns::VCARD,
];

/// Answers disco#info and disco#items queries addressed to this client
#[derive(Debug, Default)]
pub struct DiscoModule;

impl IqModule for DiscoModule {
    fn name(&self) -> &'static str {
        "disco"
    }

    fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool {
        class == StanzaClass::IqGet
            && matches!(namespace, Some(ns::DISCO_INFO) | Some(ns::DISCO_ITEMS))
    }

    fn handle(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        _class: StanzaClass,
        stanza: &Stanza,
    ) -> Result<HandleResult> {
        let node = stanza
            .element()
            .child("query")
            .and_then(|q| q.attr("node"))
            .map(str::to_owned);

        let reply = if stanza.payload_namespace() == Some(ns::DISCO_ITEMS) {
            // We expose no items of our own
            let mut query = Element::new("query").with_namespace(ns::DISCO_ITEMS);
            if let Some(node) = node {
                query.set_attr("node", node);
            }
            stanza.build_reply("result").with_payload(query)
        } else {
            let mut query = Element::new("query").with_namespace(ns::DISCO_INFO).with_child(
                Element::new("identity")
                    .with_attr("category", "client")
                    .with_attr("type", "pc")
                    .with_attr("name", ctx.account.client_name.clone()),
            );
            if let Some(node) = node {
                query.set_attr("node", node);
            }
            for feature in CLIENT_FEATURES {
                query.push_child(Element::new("feature").with_attr("var", *feature));
            }
            stanza.build_reply("result").with_payload(query)
        };

        ctx.send_or_log(&reply);
        Ok(HandleResult::Claimed)
    }
}

// ----------------------------------------------------------------------------
// Roster Pushes (RFC 6121)
// ----------------------------------------------------------------------------

/// Applies roster pushes to the connection's roster mirror and
/// acknowledges them
#[derive(Debug, Default)]
pub struct RosterPushModule;

impl IqModule for RosterPushModule {
    fn name(&self) -> &'static str {
        "roster-push"
    }

    fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool {
        class == StanzaClass::IqSet && namespace == Some(ns::ROSTER)
    }

    fn handle(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        _class: StanzaClass,
        stanza: &Stanza,
    ) -> Result<HandleResult> {
        // A push from anyone but our own account is a spoof attempt
        if let Some(from) = stanza.from_attr() {
            let ours = match Jid::parse(from) {
                Ok(jid) => jid.to_bare() == ctx.account.jid.to_bare(),
                Err(_) => false,
            };
            if !ours {
                tracing::warn!(from, "ignoring roster push from foreign jid");
                return Ok(HandleResult::Claimed);
            }
        }

        let query = match stanza.element().child_ns("query", ns::ROSTER) {
            Some(query) => query,
            None => return Ok(HandleResult::NotClaimed),
        };

        for item in roster::parse_roster(query) {
            match item.subscription {
                roster::Subscription::Remove => {
                    ctx.roster.remove(&item.jid.to_bare());
                }
                _ => {
                    ctx.roster.insert(item.jid.to_bare(), item.clone());
                }
            }
            ctx.emitter.emit(Event::RosterPushed { item });
        }

        ctx.send_or_log(&stanza.build_reply("result"));
        Ok(HandleResult::Claimed)
    }
}

// ----------------------------------------------------------------------------
// Privacy List Pushes (XEP-0016)
// ----------------------------------------------------------------------------

/// Acknowledges privacy list change pushes; list editing itself lives
/// outside the core
#[derive(Debug, Default)]
pub struct PrivacyPushModule;

impl IqModule for PrivacyPushModule {
    fn name(&self) -> &'static str {
        "privacy-push"
    }

    fn handles(&self, class: StanzaClass, namespace: Option<&str>) -> bool {
        class == StanzaClass::IqSet && namespace == Some(ns::PRIVACY)
    }

    fn handle(
        &mut self,
        ctx: &mut ModuleContext<'_>,
        _class: StanzaClass,
        stanza: &Stanza,
    ) -> Result<HandleResult> {
        ctx.send_or_log(&stanza.build_reply("result"));
        Ok(HandleResult::Claimed)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, CoreConfig};
    use crate::correlation::{CorrelationTable, IdGenerator};
    use crate::events::EventEmitter;
    use crate::stanza::IqType;
    use crate::transport::RecordingTransport;
    use crate::types::Timestamp;

    struct Fixture {
        transport: RecordingTransport,
        correlation: CorrelationTable,
        emitter: EventEmitter,
        ids: IdGenerator,
        roster: hashbrown::HashMap<Jid, crate::protocol::RosterItem>,
        account: AccountConfig,
        core: CoreConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                transport: RecordingTransport::new(),
                correlation: CorrelationTable::new(),
                emitter: EventEmitter::new(),
                ids: IdGenerator::default(),
                roster: hashbrown::HashMap::new(),
                account: AccountConfig::new(Jid::bare("me", "example.com"), "test"),
                core: CoreConfig::default(),
            }
        }

        fn run(&mut self, module: &mut dyn IqModule, class: StanzaClass, stanza: &Stanza) {
            let recorder = self.transport.clone();
            let mut transport = recorder;
            let mut ctx = ModuleContext {
                transport: &mut transport,
                correlation: &mut self.correlation,
                emitter: &mut self.emitter,
                ids: &mut self.ids,
                roster: &mut self.roster,
                account: &self.account,
                core: &self.core,
                now: Timestamp::new(0),
            };
            module.handle(&mut ctx, class, stanza).unwrap();
        }
    }

    #[test]
    fn test_ping_reply_mirrors_id() {
        let mut fixture = Fixture::new();
        let ping = Stanza::iq(IqType::Get)
            .with_id("ping-1")
            .with_payload(Element::new("ping").with_namespace(ns::PING));
        let mut stanza = ping;
        stanza.element_mut().set_attr("from", "peer@example.com/m");

        fixture.run(&mut PingModule, StanzaClass::IqGet, &stanza);

        let sent = fixture.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), Some("ping-1"));
        assert_eq!(sent[0].stanza_type(), Some("result"));
        assert_eq!(sent[0].to_attr(), Some("peer@example.com/m"));
    }

    #[test]
    fn test_version_reports_client() {
        let mut fixture = Fixture::new();
        let query = Stanza::iq_query(IqType::Get, ns::VERSION).with_id("v1");

        fixture.run(&mut VersionModule, StanzaClass::IqGet, &query);

        let sent = fixture.transport.last_sent().unwrap();
        let payload = sent.element().child_ns("query", ns::VERSION).unwrap();
        assert_eq!(payload.child_text("name"), Some("Warbler"));
    }

    #[test]
    fn test_version_disabled_sends_error() {
        let mut fixture = Fixture::new();
        fixture.account.send_software_version = false;
        let query = Stanza::iq_query(IqType::Get, ns::VERSION).with_id("v2");

        fixture.run(&mut VersionModule, StanzaClass::IqGet, &query);

        let sent = fixture.transport.last_sent().unwrap();
        assert_eq!(sent.stanza_type(), Some("error"));
    }

    #[test]
    fn test_disco_info_lists_features() {
        let mut fixture = Fixture::new();
        let query = Stanza::iq_query(IqType::Get, ns::DISCO_INFO).with_id("d1");

        fixture.run(&mut DiscoModule, StanzaClass::IqGet, &query);

        let sent = fixture.transport.last_sent().unwrap();
        let payload = sent.element().child_ns("query", ns::DISCO_INFO).unwrap();
        assert!(payload
            .children_named("feature")
            .any(|f| f.attr("var") == Some(ns::RECEIPTS)));
        assert!(payload.child("identity").is_some());
    }

    #[test]
    fn test_roster_push_updates_mirror() {
        let mut fixture = Fixture::new();
        let push = Stanza::from_element(
            Element::new("iq")
                .with_attr("type", "set")
                .with_attr("id", "push-1")
                .with_attr("from", "me@example.com")
                .with_child(
                    Element::new("query").with_namespace(ns::ROSTER).with_child(
                        Element::new("item")
                            .with_attr("jid", "alice@example.com")
                            .with_attr("subscription", "both"),
                    ),
                ),
        );

        fixture.run(&mut RosterPushModule, StanzaClass::IqSet, &push);

        let alice = Jid::bare("alice", "example.com");
        assert!(fixture.roster.contains_key(&alice));
        // The push is acknowledged
        assert_eq!(
            fixture.transport.last_sent().unwrap().stanza_type(),
            Some("result")
        );
    }

    #[test]
    fn test_foreign_roster_push_ignored() {
        let mut fixture = Fixture::new();
        let push = Stanza::from_element(
            Element::new("iq")
                .with_attr("type", "set")
                .with_attr("id", "push-2")
                .with_attr("from", "evil@example.org")
                .with_child(
                    Element::new("query").with_namespace(ns::ROSTER).with_child(
                        Element::new("item")
                            .with_attr("jid", "mallory@example.org")
                            .with_attr("subscription", "both"),
                    ),
                ),
        );

        fixture.run(&mut RosterPushModule, StanzaClass::IqSet, &push);
        assert!(fixture.roster.is_empty());
        assert_eq!(fixture.transport.sent_count(), 0);
    }
}
