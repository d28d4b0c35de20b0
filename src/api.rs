//! Capability seams between the connection core and its collaborators.
//!
//! The core consumes a WebSocket transport and reports upward to the node
//! that owns it; SPINE payloads cross through the reader/writer pair. All of
//! these are trait objects so the enclosing node, the transport stack, and
//! the tests can each supply their own implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::buffer::MessageBuffer;
use crate::connection::Event;
use crate::error::ShipError;
use crate::model::SmeState;

/// The mutually-authenticated TLS WebSocket a connection runs on.
///
/// Implemented by the transport stack, consumed by the connection core.
/// Inbound traffic does not flow through this trait; the transport pushes
/// frames, errors, and its close through the [`TransportSink`] it received
/// at creation time.
#[async_trait]
pub trait Websocket: Send + Sync {
    /// Writes one complete binary frame; returns the number of bytes taken.
    async fn write(&self, msg: &[u8]) -> Result<usize, ShipError>;

    async fn close(&self, code: u16, reason: &str);

    fn is_closed(&self) -> bool;

    /// Close code reported by the remote, once closed.
    fn close_error(&self) -> Option<u16>;

    /// Advisory hint that buffered output should be flushed soon.
    fn schedule_write(&self) {}
}

/// Transport factory invoked during [`ShipConnection::start`].
///
/// [`ShipConnection::start`]: crate::connection::ShipConnection::start
pub trait WebsocketCreator: Send + Sync {
    fn create_websocket(&self, sink: TransportSink) -> Result<Arc<dyn Websocket>, ShipError>;
}

/// Inbound edge of the transport: the callbacks a [`Websocket`]
/// implementation invokes from its own I/O context.
///
/// Events are queued towards the connection worker; nothing here touches
/// connection state. Once the connection is cancelled or shut down all
/// callbacks are dropped.
#[derive(Clone)]
pub struct TransportSink {
    pub(crate) tx: mpsc::Sender<Event>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl TransportSink {
    /// A complete binary frame arrived; the bytes are copied.
    pub fn read(&self, frame: &[u8]) {
        self.dispatch(Event::DataReceived(MessageBuffer::from(frame.to_vec())));
    }

    /// The transport failed.
    pub fn error(&self) {
        self.dispatch(Event::WebsocketError);
    }

    /// The transport was closed.
    pub fn closed(&self) {
        self.dispatch(Event::WebsocketClose);
    }

    fn dispatch(&self, event: Event) {
        if self.cancel.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if self.tx.try_send(event).is_err() {
            tracing::warn!("transport event dropped, connection queue is full");
        }
    }
}

/// The connection core's upward interface to the enclosing ship node.
pub trait InfoProvider: Send + Sync {
    /// Whether the service behind this SKI has been paired by the user.
    fn is_remote_service_for_ski_paired(&self, ski: &str) -> bool;

    /// Whether the user may still decide about trusting this SKI.
    fn is_waiting_for_trust_allowed(&self, ski: &str) -> bool;

    /// A connection closed; `handshake_ended` is true when the handshake had
    /// completed (approved, aborted, or rejected) before the close.
    fn handle_connection_closed(&self, ski: &str, handshake_ended: bool);

    /// The ship identifier a remote service reported during the handshake.
    fn report_service_ship_id(&self, service_id: &str, ship_id: &str);

    /// Live view of the SHIP handshake state for a SKI.
    fn handle_ship_state_update(&self, ski: &str, state: SmeState, error: Option<&str>);

    /// The handshake was approved on both ends; returns the sink inbound
    /// SPINE payloads are forwarded to.
    fn setup_remote_device(&self, ski: &str, writer: Arc<dyn DataWriter>) -> Arc<dyn DataReader>;
}

/// Inbound SPINE sink returned by [`InfoProvider::setup_remote_device`].
pub trait DataReader: Send + Sync {
    fn handle_message(&self, payload: &[u8]);
}

/// Outbound SPINE entry point; implemented by the connection itself.
#[async_trait]
pub trait DataWriter: Send + Sync {
    async fn write_message(&self, payload: &[u8]);
}
