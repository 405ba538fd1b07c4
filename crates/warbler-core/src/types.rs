//! Core types for the Warbler connection core
//!
//! This module defines the fundamental types used throughout the core,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

// ----------------------------------------------------------------------------
// Jabber Identifier (JID)
// ----------------------------------------------------------------------------

/// A Jabber identifier: `local@domain` with an optional `/resource` suffix.
///
/// Equality and hashing include the resource, so a bare JID and a full JID
/// of the same contact are distinct keys. Use [`Jid::to_bare`] when a
/// bare-keyed lookup is needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse and validate a JID from its string form.
    ///
    /// Accepts `domain`, `local@domain` and either form with `/resource`.
    /// The resource part may itself contain `/` and `@`.
    pub fn parse(value: &str) -> Result<Self> {
        let (bare, resource) = match value.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (value, None),
        };

        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };

        if domain.is_empty() || domain.contains('@') || domain.contains(char::is_whitespace) {
            return Err(CoreError::invalid_jid(value));
        }
        if let Some(local) = local {
            if local.is_empty() || local.contains(char::is_whitespace) {
                return Err(CoreError::invalid_jid(value));
            }
        }
        if let Some(resource) = resource {
            if resource.is_empty() {
                return Err(CoreError::invalid_jid(value));
            }
        }

        Ok(Self {
            local: local.map(str::to_owned),
            domain: domain.to_owned(),
            resource: resource.map(str::to_owned),
        })
    }

    /// Build a bare JID from parts
    pub fn bare<L: Into<String>, D: Into<String>>(local: L, domain: D) -> Self {
        Self {
            local: Some(local.into()),
            domain: domain.into(),
            resource: None,
        }
    }

    /// Build a domain-only JID (servers, gateways, MUC services)
    pub fn domain<D: Into<String>>(domain: D) -> Self {
        Self {
            local: None,
            domain: domain.into(),
            resource: None,
        }
    }

    /// Return this JID with the given resource attached
    pub fn with_resource<R: Into<String>>(mut self, resource: R) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// The local part, if any
    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// The domain part
    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this JID carries no resource
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The bare form of this JID (resource stripped)
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Jid::parse(s)
    }
}

// ----------------------------------------------------------------------------
// Show State
// ----------------------------------------------------------------------------

/// Presence show state, ordered by an explicit rank.
///
/// The rank order matches the classic client status list; everything with
/// rank 2 or above counts as available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowState {
    Offline,
    Error,
    Online,
    Chat,
    Away,
    Xa,
    Dnd,
    Invisible,
}

impl ShowState {
    /// Explicit rank used for transition detection
    pub fn rank(self) -> u8 {
        match self {
            ShowState::Offline => 0,
            ShowState::Error => 1,
            ShowState::Online => 2,
            ShowState::Chat => 3,
            ShowState::Away => 4,
            ShowState::Xa => 5,
            ShowState::Dnd => 6,
            ShowState::Invisible => 7,
        }
    }

    /// Whether this state denotes an available resource
    pub fn is_available(self) -> bool {
        self.rank() >= 2
    }

    /// Map the value of a presence `<show/>` element. An absent or
    /// unrecognized value means plain available.
    pub fn from_show_value(value: Option<&str>) -> Self {
        match value {
            Some("chat") => ShowState::Chat,
            Some("away") => ShowState::Away,
            Some("xa") => ShowState::Xa,
            Some("dnd") => ShowState::Dnd,
            _ => ShowState::Online,
        }
    }

    /// The `<show/>` element value for an outbound presence, when one is
    /// needed. Plain available and invisible send no show element; offline
    /// and error are not sendable show values.
    pub fn show_value(self) -> Option<&'static str> {
        match self {
            ShowState::Chat => Some("chat"),
            ShowState::Away => Some("away"),
            ShowState::Xa => Some("xa"),
            ShowState::Dnd => Some("dnd"),
            _ => None,
        }
    }
}

impl fmt::Display for ShowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShowState::Offline => "offline",
            ShowState::Error => "error",
            ShowState::Online => "online",
            ShowState::Chat => "chat",
            ShowState::Away => "away",
            ShowState::Xa => "xa",
            ShowState::Dnd => "dnd",
            ShowState::Invisible => "invisible",
        };
        write!(f, "{}", name)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Add seconds to this timestamp
    pub fn add_seconds(&self, seconds: u64) -> Self {
        Self(self.0 + seconds * 1000)
    }

    /// Add milliseconds to this timestamp
    pub fn add_millis(&self, millis: u64) -> Self {
        Self(self.0 + millis)
    }

    /// Get duration since another timestamp (saturating)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Trait for providing timestamps to the core.
///
/// The core never reads the wall clock directly; every timestamp flows
/// through a `TimeSource` so that embedders and tests can drive time
/// deterministically.
pub trait TimeSource {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of [`TimeSource`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced [`TimeSource`] for deterministic tests.
///
/// Clones share the underlying clock, so a test can keep one handle while
/// the connection under test owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ManualTimeSource {
    /// Create a manual time source starting at the given millisecond value
    pub fn starting_at(millis: u64) -> Self {
        Self {
            millis: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(millis)),
        }
    }

    /// Advance the clock by the given number of milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.millis
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }

    /// Advance the clock by the given number of seconds
    pub fn advance_seconds(&self, seconds: u64) {
        self.advance_millis(seconds * 1000);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(std::sync::atomic::Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_parse_forms() {
        let bare: Jid = "user@example.com".parse().unwrap();
        assert_eq!(bare.local(), Some("user"));
        assert_eq!(bare.domain_part(), "example.com");
        assert!(bare.is_bare());

        let full: Jid = "user@example.com/mobile".parse().unwrap();
        assert_eq!(full.resource(), Some("mobile"));
        assert_ne!(bare, full);
        assert_eq!(full.to_bare(), bare);

        let server: Jid = "conference.example.com".parse().unwrap();
        assert_eq!(server.local(), None);

        // Resource may contain slashes and at-signs
        let odd: Jid = "user@example.com/home/desk@2".parse().unwrap();
        assert_eq!(odd.resource(), Some("home/desk@2"));
    }

    #[test]
    fn test_jid_parse_rejects_garbage() {
        assert!(Jid::parse("").is_err());
        assert!(Jid::parse("@example.com").is_err());
        assert!(Jid::parse("user@").is_err());
        assert!(Jid::parse("user@exa mple.com").is_err());
        assert!(Jid::parse("user@a@b").is_err());
        assert!(Jid::parse("user@example.com/").is_err());
    }

    #[test]
    fn test_jid_display_roundtrip() {
        for raw in ["user@example.com", "user@example.com/mobile", "example.com"] {
            let jid: Jid = raw.parse().unwrap();
            assert_eq!(jid.to_string(), raw);
        }
    }

    #[test]
    fn test_show_state_ranks() {
        assert_eq!(ShowState::Offline.rank(), 0);
        assert_eq!(ShowState::Error.rank(), 1);
        assert!(!ShowState::Offline.is_available());
        assert!(!ShowState::Error.is_available());
        assert!(ShowState::Online.is_available());
        assert!(ShowState::Dnd.is_available());
    }

    #[test]
    fn test_show_state_xml_mapping() {
        assert_eq!(ShowState::from_show_value(None), ShowState::Online);
        assert_eq!(ShowState::from_show_value(Some("dnd")), ShowState::Dnd);
        assert_eq!(ShowState::Online.show_value(), None);
        assert_eq!(ShowState::Xa.show_value(), Some("xa"));
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::starting_at(1_000);
        assert_eq!(clock.now(), Timestamp::new(1_000));
        clock.advance_seconds(5);
        assert_eq!(clock.now(), Timestamp::new(6_000));
    }
}
