use thiserror::Error;

/// Failure kinds produced and consumed by the SHIP connection core.
///
/// The handshake states translate these into protocol-appropriate aborts;
/// the human-readable close reason accompanying a terminal failure is kept
/// separately and exposed through [`ShipConnection::last_error`].
///
/// [`ShipConnection::last_error`]: crate::connection::ShipConnection::last_error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShipError {
    /// A precondition on a public call was violated.
    #[error("invalid argument")]
    InputArgument,
    /// An event of a kind the current state cannot consume was dequeued.
    #[error("unexpected input type")]
    InputType,
    /// The transport factory failed to produce a connection.
    #[error("transport could not be created")]
    CommunicationBegin,
    /// Generic transport-level failure detected mid-protocol.
    #[error("transport failure")]
    Communication,
    /// The transport was closed by the remote peer.
    #[error("transport closed by remote")]
    CommunicationEnd,
    /// A receive ran out of time.
    #[error("timed out waiting for the remote")]
    Timeout,
    /// Cooperative cancellation was requested.
    #[error("connection deactivated")]
    Cancelled,
    /// A frame could not be encoded or decoded.
    #[error("malformed ship frame: {0}")]
    Parse(String),
    /// Nothing to do; used by idempotent setters in adjacent layers.
    #[error("nothing to change")]
    NoChange,
}
