//! Transport abstraction for the room connection.
//!
//! Decouples the room layer from any specific transport. One transport
//! carries exactly one room join; a reconnect dials a fresh transport
//! rather than reviving an old one. Production code uses
//! [`WsTransport`](crate::ws_transport::WsTransport); tests drive the room
//! with channel-backed transports.

use std::future::Future;

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O or protocol-level error.
    #[error("{0}")]
    Io(String),
}

impl TransportError {
    /// True when the connection ended rather than faulted.
    ///
    /// The room layer turns a disconnect into a plain leave; only faults
    /// reach the error listeners.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

/// Read half of a transport connection.
///
/// Implementations receive text messages (JSON frames) from the server.
pub trait TransportReader: Send + 'static {
    /// Receive the next text message.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;
}

/// Write half of a transport connection.
pub trait TransportWriter: Send + 'static {
    /// Send a text message to the server.
    fn send(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A bidirectional transport that can be split into independent read and
/// write halves, so the room's reader and writer pump tasks can own their
/// half outright.
pub trait Transport: Send + 'static {
    /// The read half produced by [`split`](Transport::split).
    type Reader: TransportReader;
    /// The write half produced by [`split`](Transport::split).
    type Writer: TransportWriter;

    /// Split the transport into independent read and write halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}
