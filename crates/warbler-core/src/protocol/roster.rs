//! Roster payloads: contact list (RFC 6121), roster item exchange
//! (XEP-0144) and metacontact tags (XEP-0209).
//!
//! Items with an unparsable jid are skipped rather than failing the whole
//! payload, matching how a client must tolerate a sloppy server.

use serde::{Deserialize, Serialize};

use crate::stanza::Element;
use crate::types::Jid;

// ----------------------------------------------------------------------------
// Roster Items
// ----------------------------------------------------------------------------

/// Subscription state of a roster item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    fn from_value(value: Option<&str>) -> Self {
        match value {
            Some("to") => Subscription::To,
            Some("from") => Subscription::From,
            Some("both") => Subscription::Both,
            Some("remove") => Subscription::Remove,
            _ => Subscription::None,
        }
    }

    /// Whether the contact is subscribed to our presence
    pub fn shares_our_presence(self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }
}

/// One contact of the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    pub jid: Jid,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// A subscription request to this contact is pending
    pub ask: bool,
    pub groups: Vec<String>,
}

fn parse_item(item: &Element) -> Option<RosterItem> {
    let jid = Jid::parse(item.attr("jid")?).ok()?;
    Some(RosterItem {
        jid,
        name: item.attr("name").map(str::to_owned),
        subscription: Subscription::from_value(item.attr("subscription")),
        ask: item.attr("ask") == Some("subscribe"),
        groups: item
            .children_named("group")
            .map(|g| g.text().to_owned())
            .filter(|g| !g.is_empty())
            .collect(),
    })
}

/// Parse the `<query/>` of a roster result or push
pub fn parse_roster(query: &Element) -> Vec<RosterItem> {
    query.children_named("item").filter_map(parse_item).collect()
}

// ----------------------------------------------------------------------------
// Roster Item Exchange
// ----------------------------------------------------------------------------

/// Suggested action of a roster exchange item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeAction {
    Add,
    Delete,
    Modify,
}

/// One suggestion of a roster item exchange message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeItem {
    pub action: ExchangeAction,
    pub jid: Jid,
    pub name: Option<String>,
    pub groups: Vec<String>,
}

/// Parse the `<x/>` payload of a roster item exchange message
pub fn parse_exchange(x: &Element) -> Vec<ExchangeItem> {
    x.children_named("item")
        .filter_map(|item| {
            let jid = Jid::parse(item.attr("jid")?).ok()?;
            let action = match item.attr("action") {
                Some("delete") => ExchangeAction::Delete,
                Some("modify") => ExchangeAction::Modify,
                // Absent action defaults to add
                _ => ExchangeAction::Add,
            };
            Some(ExchangeItem {
                action,
                jid,
                name: item.attr("name").map(str::to_owned),
                groups: item
                    .children_named("group")
                    .map(|g| g.text().to_owned())
                    .collect(),
            })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Metacontacts
// ----------------------------------------------------------------------------

/// One jid participating in a metacontact tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetacontactItem {
    pub jid: Jid,
    pub order: i32,
}

/// A metacontact tag grouping several jids into one displayed contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetacontactTag {
    pub tag: String,
    pub items: Vec<MetacontactItem>,
}

/// Parse the `<storage/>` payload of a metacontacts result. Metas with an
/// invalid jid are skipped; a missing or garbled order defaults to 0.
pub fn parse_metacontacts(storage: &Element) -> Vec<MetacontactTag> {
    let mut tags: Vec<MetacontactTag> = Vec::new();
    for meta in storage.children_named("meta") {
        let jid = match meta.attr("jid").map(Jid::parse) {
            Some(Ok(jid)) => jid,
            _ => continue,
        };
        let tag = match meta.attr("tag") {
            Some(tag) => tag.to_owned(),
            None => continue,
        };
        let order = meta
            .attr("order")
            .and_then(|o| o.parse::<i32>().ok())
            .unwrap_or(0);
        let item = MetacontactItem { jid, order };
        match tags.iter_mut().find(|t| t.tag == tag) {
            Some(existing) => existing.items.push(item),
            None => tags.push(MetacontactTag {
                tag,
                items: vec![item],
            }),
        }
    }
    tags
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
