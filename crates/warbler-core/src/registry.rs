//! Explicit registry of live connections
//!
//! The application root owns one of these instead of ambient global
//! state: connections are added when an account is enabled, looked up by
//! account name, and torn down when the account is disabled.

use hashbrown::HashMap;

use crate::connection::Connection;
use crate::types::{SystemTimeSource, TimeSource};

// ----------------------------------------------------------------------------
// Connection Registry
// ----------------------------------------------------------------------------

/// Per-account connection store with lifecycle tied to account enable and
/// disable. No state here is shared between accounts.
#[derive(Debug, Default)]
pub struct ConnectionRegistry<T: TimeSource = SystemTimeSource> {
    connections: HashMap<String, Connection<T>>,
}

impl<T: TimeSource> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Register the connection for an enabled account, returning the
    /// previous one if the account was already enabled.
    pub fn enable_account(
        &mut self,
        account: impl Into<String>,
        connection: Connection<T>,
    ) -> Option<Connection<T>> {
        self.connections.insert(account.into(), connection)
    }

    /// Tear down and remove an account's connection. Sessions are
    /// terminated and pending requests dropped before the connection is
    /// handed back.
    pub fn disable_account(&mut self, account: &str) -> Option<Connection<T>> {
        let mut connection = self.connections.remove(account)?;
        connection.disconnect(false, "account disabled");
        Some(connection)
    }

    /// The connection of an account, if enabled
    pub fn get_connection(&self, account: &str) -> Option<&Connection<T>> {
        self.connections.get(account)
    }

    /// Mutable access to an account's connection
    pub fn get_connection_mut(&mut self, account: &str) -> Option<&mut Connection<T>> {
        self.connections.get_mut(account)
    }

    /// Names of all enabled accounts
    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// Number of enabled accounts
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no account is enabled
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, CoreConfig};
    use crate::transport::RecordingTransport;
    use crate::types::{Jid, ManualTimeSource};

    fn connection() -> Connection<ManualTimeSource> {
        Connection::with_time_source(
            AccountConfig::new(Jid::bare("me", "example.com"), "test"),
            CoreConfig::default(),
            Box::new(RecordingTransport::new()),
            ManualTimeSource::starting_at(0),
        )
    }

    #[test]
    fn test_enable_lookup_disable() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        registry.enable_account("work", connection());
        assert_eq!(registry.len(), 1);
        assert!(registry.get_connection("work").is_some());
        assert!(registry.get_connection("home").is_none());

        let removed = registry.disable_account("work");
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.disable_account("work").is_none());
    }

    #[test]
    fn test_disable_tears_down() {
        let mut registry = ConnectionRegistry::new();
        registry.enable_account("work", connection());

        let peer = Jid::bare("peer", "example.com").with_resource("m");
        {
            let conn = registry.get_connection_mut("work").unwrap();
            conn.send_message(&peer, "hi", None).unwrap();
            assert_eq!(conn.sessions().len(), 1);
        }

        let conn = registry.disable_account("work").unwrap();
        assert!(conn.sessions().is_empty());
    }
}
