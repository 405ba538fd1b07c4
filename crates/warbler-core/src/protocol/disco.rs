//! Service discovery payloads (XEP-0030)
//!
//! Per XEP-0030: for an identity, category and type are mandatory and name
//! is optional; for a feature, var is mandatory. Items without a valid jid
//! are skipped during parsing rather than failing the whole result.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::stanza::{ns, Element};
use crate::types::Jid;

// ----------------------------------------------------------------------------
// Disco Info
// ----------------------------------------------------------------------------

/// Which disco exchange a result or failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoKind {
    Info,
    Items,
}

/// One `<identity/>` of a disco#info result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoIdentity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

/// A parsed disco#info result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoInfo {
    pub node: Option<String>,
    pub identities: Vec<DiscoIdentity>,
    pub features: Vec<String>,
}

impl DiscoInfo {
    /// Parse the `<query/>` child of a disco#info result
    pub fn from_query(query: &Element) -> Self {
        let mut info = DiscoInfo {
            node: query.attr("node").map(str::to_owned),
            ..DiscoInfo::default()
        };
        for child in query.children() {
            match child.name() {
                "identity" => {
                    let (category, kind) = match (child.attr("category"), child.attr("type")) {
                        (Some(c), Some(t)) => (c.to_owned(), t.to_owned()),
                        _ => continue,
                    };
                    info.identities.push(DiscoIdentity {
                        category,
                        kind,
                        name: child.attr("name").map(str::to_owned),
                    });
                }
                "feature" => {
                    if let Some(var) = child.attr("var") {
                        info.features.push(var.to_owned());
                    }
                }
                _ => {}
            }
        }
        info
    }

    /// Whether a feature var is advertised
    pub fn has_feature(&self, var: &str) -> bool {
        self.features.iter().any(|f| f == var)
    }

    /// Whether this entity is a text conference (MUC) service
    pub fn is_muc_service(&self) -> bool {
        self.has_feature(ns::MUC)
            && self
                .identities
                .iter()
                .any(|i| i.category == "conference" && i.kind == "text")
    }

    /// The transport type when this entity is a gateway
    pub fn gateway_type(&self) -> Option<&str> {
        self.identities
            .iter()
            .find(|i| i.category == "gateway")
            .map(|i| i.kind.as_str())
    }
}

// ----------------------------------------------------------------------------
// Disco Items
// ----------------------------------------------------------------------------

/// One `<item/>` of a disco#items result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoItem {
    pub jid: Jid,
    pub node: Option<String>,
    pub name: Option<String>,
}

/// Parse the `<query/>` child of a disco#items result, skipping items
/// whose jid does not validate.
pub fn parse_items(query: &Element) -> Vec<DiscoItem> {
    query
        .children_named("item")
        .filter_map(|item| {
            let jid = Jid::parse(item.attr("jid")?).ok()?;
            Some(DiscoItem {
                jid,
                node: item.attr("node").map(str::to_owned),
                name: item.attr("name").map(str::to_owned),
            })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Server Features
// ----------------------------------------------------------------------------

/// Capabilities learned about our own server during the login bootstrap
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFeatures {
    /// Server stores vCards
    pub vcard: bool,
    /// Server offers a PEP pubsub service
    pub pep: bool,
    /// Server offers generic pubsub
    pub pubsub: bool,
    /// Server supports privacy lists
    pub privacy_lists: bool,
    /// Server supports private XML storage (metacontacts live there)
    pub private_storage: bool,
    /// MUC service jid per transport type, "jabber" for the native one
    pub muc_services: HashMap<String, Jid>,
    /// Discovered gateway jids per transport type
    pub gateways: HashMap<String, Vec<Jid>>,
}

impl ServerFeatures {
    pub fn new() -> Self {
        Self {
            private_storage: true,
            ..Self::default()
        }
    }

    /// Fold a disco#info result for our own server domain into the flags
    pub fn absorb_server_info(&mut self, info: &DiscoInfo) {
        if info.has_feature(ns::VCARD) {
            self.vcard = true;
        }
        if info.has_feature(ns::PUBSUB) {
            self.pubsub = true;
        }
        if info.has_feature(ns::PRIVACY) {
            self.privacy_lists = true;
        }
        if info
            .identities
            .iter()
            .any(|i| i.category == "pubsub" && i.kind == "pep")
        {
            self.pep = true;
        }
    }

    /// Fold a disco#info result for any discovered entity: gateways and
    /// MUC services are recorded under their transport type.
    pub fn absorb_entity_info(&mut self, from: &Jid, info: &DiscoInfo) {
        let transport_type = info.gateway_type().map(str::to_owned);
        if info.is_muc_service() {
            let key = transport_type.clone().unwrap_or_else(|| "jabber".to_owned());
            self.muc_services.insert(key, from.to_bare());
        }
        if let Some(kind) = transport_type {
            self.gateways
                .entry(kind)
                .or_default()
                .push(from.to_bare());
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn server_query() -> Element {
        Element::new("query")
            .with_namespace(ns::DISCO_INFO)
            .with_child(
                Element::new("identity")
                    .with_attr("category", "server")
                    .with_attr("type", "im"),
            )
            .with_child(
                Element::new("identity")
                    .with_attr("category", "pubsub")
                    .with_attr("type", "pep"),
            )
            .with_child(Element::new("feature").with_attr("var", ns::VCARD))
            .with_child(Element::new("feature").with_attr("var", ns::PRIVACY))
    }

    #[test]
    fn test_parse_info() {
        let info = DiscoInfo::from_query(&server_query());
        assert_eq!(info.identities.len(), 2);
        assert!(info.has_feature(ns::VCARD));
        assert!(!info.has_feature(ns::PUBSUB));
    }

    #[test]
    fn test_identity_without_category_skipped() {
        let query = Element::new("query")
            .with_namespace(ns::DISCO_INFO)
            .with_child(Element::new("identity").with_attr("type", "im"));
        let info = DiscoInfo::from_query(&query);
        assert!(info.identities.is_empty());
    }

    #[test]
    fn test_server_features_absorb() {
        let mut features = ServerFeatures::new();
        features.absorb_server_info(&DiscoInfo::from_query(&server_query()));
        assert!(features.vcard);
        assert!(features.pep);
        assert!(features.privacy_lists);
        assert!(!features.pubsub);
    }

    #[test]
    fn test_muc_service_detection() {
        let query = Element::new("query")
            .with_namespace(ns::DISCO_INFO)
            .with_child(
                Element::new("identity")
                    .with_attr("category", "conference")
                    .with_attr("type", "text"),
            )
            .with_child(Element::new("feature").with_attr("var", ns::MUC));
        let info = DiscoInfo::from_query(&query);
        assert!(info.is_muc_service());

        let mut features = ServerFeatures::new();
        let muc: Jid = "conference.example.com".parse().unwrap();
        features.absorb_entity_info(&muc, &info);
        assert_eq!(features.muc_services.get("jabber"), Some(&muc));
    }

    #[test]
    fn test_parse_items_skips_invalid_jid() {
        let query = Element::new("query")
            .with_namespace(ns::DISCO_ITEMS)
            .with_child(Element::new("item").with_attr("jid", "rooms.example.com"))
            .with_child(Element::new("item").with_attr("jid", "bad jid@"))
            .with_child(Element::new("item").with_attr("name", "no jid at all"));
        let items = parse_items(&query);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].jid.to_string(), "rooms.example.com");
    }
}
