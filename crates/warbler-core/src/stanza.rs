//! Stanza model for the Warbler connection core
//!
//! The transport adapter owns the raw XML stream; by the time a stanza
//! reaches the core it has been parsed into the generic [`Element`] tree
//! defined here. Outbound stanzas are built with the same tree and handed
//! back to the transport for serialization, so the XML structure of the
//! message/presence/iq schemas is preserved bit-exactly by construction.

use serde::{Deserialize, Serialize};

use crate::types::Jid;

// ----------------------------------------------------------------------------
// Namespaces
// ----------------------------------------------------------------------------

/// XML namespaces used by the core protocol flows
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const ROSTER_EXCHANGE: &str = "http://jabber.org/protocol/rosterx";
    pub const PRIVACY: &str = "jabber:iq:privacy";
    pub const PRIVATE: &str = "jabber:iq:private";
    pub const METACONTACTS: &str = "storage:metacontacts";
    pub const REGISTER: &str = "jabber:iq:register";
    pub const VCARD: &str = "vcard-temp";
    pub const VCARD_UPDATE: &str = "vcard-temp:x:update";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    pub const CONFERENCE: &str = "jabber:x:conference";
    pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    pub const PING: &str = "urn:xmpp:ping";
    pub const VERSION: &str = "jabber:iq:version";
    pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    pub const PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
    pub const NICK: &str = "http://jabber.org/protocol/nick";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

// ----------------------------------------------------------------------------
// Element Tree
// ----------------------------------------------------------------------------

/// One XML element: name, optional namespace, attributes, children and
/// character data. Attribute order is preserved for faithful re-emission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// Create an element with the given name
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder: set the namespace
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Builder: add an attribute
    pub fn with_attr<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder: set the character data
    pub fn with_text<S: Into<String>>(mut self, text: S) -> Self {
        self.text = text.into();
        self
    }

    /// Builder: append a child element
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// The element name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The element namespace, if set
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Look up an attribute value
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing any previous value
    pub fn set_attr<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.attrs.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.attrs.push((key, value));
        }
    }

    /// All attributes in document order
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The character data of this element
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Replace the character data
    pub fn set_text<S: Into<String>>(&mut self, text: S) {
        self.text = text.into();
    }

    /// Append a child element
    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// All child elements
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter()
    }

    /// First child with the given name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Mutable first child with the given name
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// First child matching name and namespace
    pub fn child_ns(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace.as_deref() == Some(namespace))
    }

    /// All children with the given name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child carrying the given namespace, regardless of name
    pub fn find_ns(&self, namespace: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.namespace.as_deref() == Some(namespace))
    }

    /// Character data of the first child with the given name
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::text)
    }
}

// ----------------------------------------------------------------------------
// Stanza
// ----------------------------------------------------------------------------

/// IQ stanza type attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

/// One top-level unit of the stream: a `message`, `presence` or `iq`
/// element (anything else is routed as unknown).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza(Element);

impl Stanza {
    /// Wrap an already-parsed element
    pub fn from_element(element: Element) -> Self {
        Self(element)
    }

    /// Borrow the underlying element
    pub fn element(&self) -> &Element {
        &self.0
    }

    /// Mutable access to the underlying element
    pub fn element_mut(&mut self) -> &mut Element {
        &mut self.0
    }

    /// Unwrap into the underlying element
    pub fn into_element(self) -> Element {
        self.0
    }

    /// Top-level element name
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The stanza `id` attribute
    pub fn id(&self) -> Option<&str> {
        self.0.attr("id")
    }

    /// The stanza `type` attribute
    pub fn stanza_type(&self) -> Option<&str> {
        self.0.attr("type")
    }

    /// The raw `from` attribute
    pub fn from_attr(&self) -> Option<&str> {
        self.0.attr("from")
    }

    /// The raw `to` attribute
    pub fn to_attr(&self) -> Option<&str> {
        self.0.attr("to")
    }

    /// Namespace of the first payload child, used for handler matching
    pub fn payload_namespace(&self) -> Option<&str> {
        self.0.children().find_map(Element::namespace)
    }

    /// Builder: set the `id` attribute
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.0.set_attr("id", id);
        self
    }

    /// Builder: set the `to` attribute
    pub fn with_to(mut self, to: &Jid) -> Self {
        self.0.set_attr("to", to.to_string());
        self
    }

    /// Builder: append a payload child
    pub fn with_payload(mut self, child: Element) -> Self {
        self.0.push_child(child);
        self
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// New iq stanza of the given type
    pub fn iq(kind: IqType) -> Self {
        Self(Element::new("iq").with_attr("type", kind.as_str()))
    }

    /// New iq stanza carrying an empty `<query/>` in the given namespace
    pub fn iq_query(kind: IqType, namespace: &str) -> Self {
        Self::iq(kind).with_payload(Element::new("query").with_namespace(namespace))
    }

    /// New message stanza of the given type ("chat", "normal", ...)
    pub fn message(to: &Jid, kind: &str) -> Self {
        Self(
            Element::new("message")
                .with_attr("to", to.to_string())
                .with_attr("type", kind),
        )
    }

    /// New presence stanza with no type attribute (available)
    pub fn presence() -> Self {
        Self(Element::new("presence"))
    }

    /// New presence stanza of the given type ("unavailable", "subscribed", ...)
    pub fn presence_of_type(kind: &str) -> Self {
        Self(Element::new("presence").with_attr("type", kind))
    }

    /// Build a reply stanza: same name, mirrored addressing, copied id
    pub fn build_reply(&self, kind: &str) -> Self {
        let mut reply = Element::new(self.name()).with_attr("type", kind);
        if let Some(from) = self.from_attr() {
            reply.set_attr("to", from);
        }
        if let Some(to) = self.to_attr() {
            reply.set_attr("from", to);
        }
        if let Some(id) = self.id() {
            reply.set_attr("id", id);
        }
        Self(reply)
    }

    /// Build an error reply carrying a defined stanza error condition
    pub fn error_reply(&self, condition: &str, error_type: &str) -> Self {
        let error = Element::new("error").with_attr("type", error_type).with_child(
            Element::new(condition).with_namespace(ns::STANZAS),
        );
        let mut reply = self.build_reply("error");
        reply.0.push_child(error);
        reply
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
