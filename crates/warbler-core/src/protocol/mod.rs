//! Typed payload models for the protocol exchanges the core drives:
//! vCard (XEP-0054), service discovery (XEP-0030), roster (RFC 6121),
//! roster item exchange (XEP-0144) and metacontacts (XEP-0209).

pub mod disco;
pub mod roster;
pub mod vcard;

pub use disco::{DiscoIdentity, DiscoInfo, DiscoItem, DiscoKind, ServerFeatures};
pub use roster::{
    ExchangeAction, ExchangeItem, MetacontactItem, MetacontactTag, RosterItem, Subscription,
};
pub use vcard::{Vcard, VcardPhoto};
