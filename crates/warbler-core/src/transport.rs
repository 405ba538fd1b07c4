//! Transport adapter boundary
//!
//! The raw socket, TLS and XML framing live outside the core. The core
//! only requires the narrow contract below: hand a stanza to the wire, and
//! know whether the wire is up. Inbound traffic reaches the core through
//! [`crate::connection::Connection::handle_stanza`], driven by the
//! embedder's read loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::TransportError;
use crate::stanza::Stanza;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Outbound half of the transport adapter
pub trait Transport: Send {
    /// Queue one stanza for the wire. Fails with
    /// [`TransportError::NotConnected`] when the stream is down.
    fn send(&mut self, stanza: &Stanza) -> Result<(), TransportError>;

    /// Whether the underlying stream is currently up
    fn is_connected(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Recording Transport
// ----------------------------------------------------------------------------

/// In-memory transport capturing everything sent through it.
///
/// Clones share state, so a test can keep one handle while the connection
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<Stanza>>>,
    connected: Arc<AtomicBool>,
}

impl RecordingTransport {
    /// Create a connected recording transport
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the stream going up or down
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Snapshot of everything sent so far
    pub fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().expect("transport log poisoned").clone()
    }

    /// Drain the send log
    pub fn take_sent(&self) -> Vec<Stanza> {
        std::mem::take(&mut *self.sent.lock().expect("transport log poisoned"))
    }

    /// Number of stanzas sent
    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("transport log poisoned").len()
    }

    /// The most recently sent stanza
    pub fn last_sent(&self) -> Option<Stanza> {
        self.sent.lock().expect("transport log poisoned").last().cloned()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, stanza: &Stanza) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .expect("transport log poisoned")
            .push(stanza.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::IqType;

    #[test]
    fn test_recording_transport_captures() {
        let recorder = RecordingTransport::new();
        let mut transport = recorder.clone();

        transport.send(&Stanza::iq(IqType::Get).with_id("a")).unwrap();
        assert_eq!(recorder.sent_count(), 1);
        assert_eq!(recorder.last_sent().unwrap().id(), Some("a"));
    }

    #[test]
    fn test_disconnected_transport_refuses() {
        let recorder = RecordingTransport::new();
        recorder.set_connected(false);
        let mut transport = recorder.clone();

        let err = transport.send(&Stanza::iq(IqType::Get)).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert_eq!(recorder.sent_count(), 0);
    }
}
