//! SHIP (Smart Home IP) connection protocol implementation.
//!
//! Implements the per-connection SHIP state machine of the EEBus stack: a
//! long-lived, bidirectional messaging channel that carries opaque SPINE
//! payloads between two devices over a mutually-authenticated TLS WebSocket.
//! Frames are JSON-UTF8 behind a one-byte frame type; a handshake runs
//! connection-mode initiation, hello with prolongation, protocol-version
//! negotiation, and the PIN and access-methods exchanges before settling
//! into data exchange. Transport, peer discovery, and SPINE semantics live
//! behind the capability traits in [`api`].

pub mod api;
pub mod buffer;
pub mod codec;
pub mod connection;
pub mod error;
pub mod model;

pub use api::{DataReader, DataWriter, InfoProvider, TransportSink, Websocket, WebsocketCreator};
pub use buffer::MessageBuffer;
pub use connection::ShipConnection;
pub use error::ShipError;
pub use model::{ShipMessage, ShipRole, SmeState};
