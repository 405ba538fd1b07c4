//! Centralized configuration for the Warbler connection core

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Jid;

// ----------------------------------------------------------------------------
// Account Configuration
// ----------------------------------------------------------------------------

/// Per-account settings the core needs to run a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Our bare JID
    pub jid: Jid,
    /// The resource this connection binds
    pub resource: String,
    /// Default presence priority
    pub default_priority: i8,
    /// Client name reported to software-version queries
    pub client_name: String,
    /// Client version reported to software-version queries
    pub client_version: String,
    /// Answer inbound delivery-receipt requests
    pub answer_receipts: bool,
    /// Ask peers for delivery receipts on outbound chat messages
    pub request_receipts: bool,
    /// Answer software-version queries at all
    pub send_software_version: bool,
}

impl AccountConfig {
    /// Create an account config with default client settings
    pub fn new(jid: Jid, resource: impl Into<String>) -> Self {
        Self {
            jid,
            resource: resource.into(),
            default_priority: 5,
            client_name: "Warbler".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            answer_receipts: true,
            request_receipts: true,
            send_software_version: true,
        }
    }

    /// Our full JID (account JID plus bound resource)
    pub fn full_jid(&self) -> Jid {
        self.jid.to_bare().with_resource(self.resource.clone())
    }
}

// ----------------------------------------------------------------------------
// Core Configuration
// ----------------------------------------------------------------------------

/// Tunables for the protocol core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Deadline applied to ordinary tracked requests (vCard, disco, ...)
    pub request_timeout: Duration,
    /// Deadline applied to each login bootstrap step
    pub bootstrap_step_timeout: Duration,
    /// Worker threads for offloaded digest computation
    pub worker_threads: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            bootstrap_step_timeout: Duration::from_secs(30),
            worker_threads: 1,
        }
    }
}

impl CoreConfig {
    /// A config with generous deadlines, for interactive debugging
    pub fn permissive() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            bootstrap_step_timeout: Duration::from_secs(300),
            worker_threads: 1,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
