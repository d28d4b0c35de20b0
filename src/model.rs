//! Wire-level model of the SHIP message exchange.
//!
//! Every WebSocket frame starts with a one-byte frame type; the remainder is
//! the JSON-UTF8 encoding of exactly one of the values below, tagged by its
//! top-level object key. SPINE payloads travel opaquely inside [`ShipData`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::ShipError;

/// SPINE protocol identifier carried in every `data` frame header.
pub const SHIP_PROTOCOL_ID: &str = "ee1.0";

/// Highest protocol version this implementation speaks.
pub const SHIP_MAX_PROTOCOL_VERSION: ShipVersion = ShipVersion { major: 1, minor: 0 };

/// The fixed body of the connection-mode-initiation frame.
pub const SHIP_INIT_MESSAGE: [u8; 2] = [0x01, 0x00];

/// Upper bound on every CMI and protocol-handshake receive (SHIP 13.4.3).
pub const CMI_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial hello wait announced to the peer (SHIP 13.4.4.1).
pub const T_HELLO_INIT: Duration = Duration::from_secs(60);

/// Extension applied to the hello wait when the peer requests prolongation.
pub const T_HELLO_INC: Duration = Duration::from_secs(60);

/// Minimum announced wait below which no prolongation request is scheduled.
pub const T_HELLO_PROLONG_THR_INC: Duration = Duration::from_secs(30);

/// Safety margin between the peer's announced wait and our request send time.
pub const T_HELLO_PROLONG_WAITING_GAP: Duration = Duration::from_secs(15);

/// Smallest admissible prolongation-request schedule.
pub const T_HELLO_PROLONG_MIN: Duration = Duration::from_secs(1);

/// Which side of the SHIP connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipRole {
    Client,
    Server,
}

/// States of the SHIP message exchange, from connection-mode initiation
/// through data exchange (SHIP 13.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmeState {
    // Connection mode initialisation, SHIP 13.4.3
    CmiInit,
    CmiClientSend,
    CmiClientWait,
    CmiClientEvaluate,
    CmiServerWait,
    CmiServerEvaluate,
    // Connection data preparation, SHIP 13.4.4
    Hello,
    HelloReadyInit,
    HelloReadyListen,
    HelloReadyTimeout,
    HelloPendingInit,
    HelloPendingListen,
    HelloPendingTimeout,
    HelloOk,
    /// Sending an abort to the remote.
    HelloAbort,
    /// Sending an abort to the remote is done.
    HelloAbortDone,
    /// Received an abort from the remote.
    HelloRemoteAbortDone,
    /// Connection closed by the remote application after our pending phase.
    HelloRejected,
    // Protocol handshake, SHIP 13.4.4.2
    ProtocolHandshakeServerInit,
    ProtocolHandshakeClientInit,
    ProtocolHandshakeServerListenProposal,
    ProtocolHandshakeServerListenConfirm,
    ProtocolHandshakeClientListenChoice,
    ProtocolHandshakeTimeout,
    ProtocolHandshakeClientOk,
    ProtocolHandshakeServerOk,
    // PIN verification, SHIP 13.4.5
    PinCheckInit,
    PinCheckListen,
    PinCheckError,
    PinCheckBusyInit,
    PinCheckBusyWait,
    PinCheckOk,
    PinAskInit,
    PinAskProcess,
    PinAskRestrictedOk,
    PinAskOk,
    // Access methods identification, SHIP 13.4.6
    AccessMethodsRequest,
    /// Handshake approved on both ends.
    Approved,
    /// Handshake completed; SPINE payloads flow in both directions.
    DataExchange,
    /// Handshake ended with an error; absorbing.
    Error,
}

impl fmt::Display for SmeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SmeState::CmiInit => "CMI_STATE_INIT_START",
            SmeState::CmiClientSend => "CMI_STATE_CLIENT_SEND",
            SmeState::CmiClientWait => "CMI_STATE_CLIENT_WAIT",
            SmeState::CmiClientEvaluate => "CMI_STATE_CLIENT_EVALUATE",
            SmeState::CmiServerWait => "CMI_STATE_SERVER_WAIT",
            SmeState::CmiServerEvaluate => "CMI_STATE_SERVER_EVALUATE",
            SmeState::Hello => "SME_HELLO_STATE",
            SmeState::HelloReadyInit => "SME_HELLO_STATE_READY_INIT",
            SmeState::HelloReadyListen => "SME_HELLO_STATE_READY_LISTEN",
            SmeState::HelloReadyTimeout => "SME_HELLO_STATE_READY_TIMEOUT",
            SmeState::HelloPendingInit => "SME_HELLO_STATE_PENDING_INIT",
            SmeState::HelloPendingListen => "SME_HELLO_STATE_PENDING_LISTEN",
            SmeState::HelloPendingTimeout => "SME_HELLO_STATE_PENDING_TIMEOUT",
            SmeState::HelloOk => "SME_HELLO_STATE_OK",
            SmeState::HelloAbort => "SME_HELLO_STATE_ABORT",
            SmeState::HelloAbortDone => "SME_HELLO_STATE_ABORT_DONE",
            SmeState::HelloRemoteAbortDone => "SME_HELLO_STATE_REMOTE_ABORT_DONE",
            SmeState::HelloRejected => "SME_HELLO_STATE_REJECTED",
            SmeState::ProtocolHandshakeServerInit => "SME_PROT_H_STATE_SERVER_INIT",
            SmeState::ProtocolHandshakeClientInit => "SME_PROT_H_STATE_CLIENT_INIT",
            SmeState::ProtocolHandshakeServerListenProposal => "SME_PROT_H_STATE_SERVER_LISTEN_PROPOSAL",
            SmeState::ProtocolHandshakeServerListenConfirm => "SME_PROT_H_STATE_SERVER_LISTEN_CONFIRM",
            SmeState::ProtocolHandshakeClientListenChoice => "SME_PROT_H_STATE_CLIENT_LISTEN_CHOICE",
            SmeState::ProtocolHandshakeTimeout => "SME_PROT_H_STATE_TIMEOUT",
            SmeState::ProtocolHandshakeClientOk => "SME_PROT_H_STATE_CLIENT_OK",
            SmeState::ProtocolHandshakeServerOk => "SME_PROT_H_STATE_SERVER_OK",
            SmeState::PinCheckInit => "SME_PIN_STATE_CHECK_INIT",
            SmeState::PinCheckListen => "SME_PIN_STATE_CHECK_LISTEN",
            SmeState::PinCheckError => "SME_PIN_STATE_CHECK_ERROR",
            SmeState::PinCheckBusyInit => "SME_PIN_STATE_CHECK_BUSY_INIT",
            SmeState::PinCheckBusyWait => "SME_PIN_STATE_CHECK_BUSY_WAIT",
            SmeState::PinCheckOk => "SME_PIN_STATE_CHECK_OK",
            SmeState::PinAskInit => "SME_PIN_STATE_ASK_INIT",
            SmeState::PinAskProcess => "SME_PIN_STATE_ASK_PROCESS",
            SmeState::PinAskRestrictedOk => "SME_PIN_STATE_ASK_RESTRICTED_OK",
            SmeState::PinAskOk => "SME_PIN_STATE_ASK_OK",
            SmeState::AccessMethodsRequest => "SME_ACCESS_METHODS_REQUEST",
            SmeState::Approved => "SME_STATE_APPROVED",
            SmeState::DataExchange => "SME_STATE_DATA_EXCHANGE",
            SmeState::Error => "SME_STATE_ERROR",
        };
        f.write_str(name)
    }
}

/// One SHIP message value, tagged on the wire by its JSON object key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShipMessage {
    #[serde(rename = "connectionHello")]
    Hello(ConnectionHello),
    #[serde(rename = "messageProtocolHandshake")]
    ProtocolHandshake(MessageProtocolHandshake),
    #[serde(rename = "messageProtocolHandshakeError")]
    ProtocolHandshakeError(MessageProtocolHandshakeError),
    #[serde(rename = "connectionPinState")]
    PinState(ConnectionPinState),
    #[serde(rename = "accessMethodsRequest")]
    AccessMethodsRequest(AccessMethodsRequest),
    #[serde(rename = "accessMethods")]
    AccessMethods(AccessMethods),
    #[serde(rename = "connectionClose")]
    Close(ConnectionClose),
    #[serde(rename = "data")]
    Data(ShipData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HelloPhase {
    Ready,
    Pending,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHello {
    pub phase: HelloPhase,
    /// Announced wait in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prolongation_request: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolHandshakeType {
    AnnounceMax,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageProtocolFormat {
    #[serde(rename = "JSON-UTF8")]
    JsonUtf8,
    #[serde(rename = "JSON-UTF16")]
    JsonUtf16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtocolFormats {
    pub format: Vec<MessageProtocolFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProtocolHandshake {
    pub handshake_type: ProtocolHandshakeType,
    pub version: ShipVersion,
    pub formats: MessageProtocolFormats,
}

impl MessageProtocolHandshake {
    /// The proposal a client opens the handshake with.
    pub fn announce_max() -> Self {
        Self {
            handshake_type: ProtocolHandshakeType::AnnounceMax,
            version: SHIP_MAX_PROTOCOL_VERSION,
            formats: MessageProtocolFormats {
                format: vec![MessageProtocolFormat::JsonUtf8],
            },
        }
    }

    pub fn select(version: ShipVersion) -> Self {
        Self {
            handshake_type: ProtocolHandshakeType::Select,
            version,
            formats: MessageProtocolFormats {
                format: vec![MessageProtocolFormat::JsonUtf8],
            },
        }
    }

    pub fn select_max() -> Self {
        Self::select(SHIP_MAX_PROTOCOL_VERSION)
    }
}

/// Reason codes of `messageProtocolHandshakeError`, numeric on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum HandshakeErrorCode {
    Rfu = 1,
    Timeout = 2,
    UnexpectedMessage = 3,
    SelectionMismatch = 4,
}

impl From<HandshakeErrorCode> for u8 {
    fn from(code: HandshakeErrorCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for HandshakeErrorCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Rfu),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::UnexpectedMessage),
            4 => Ok(Self::SelectionMismatch),
            other => Err(format!("unknown handshake error code {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtocolHandshakeError {
    pub error: HandshakeErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinState {
    Required,
    Optional,
    PinOk,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinInputPermission {
    Busy,
    Ok,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPinState {
    pub pin_state: PinState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_permission: Option<PinInputPermission>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethodsRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethods {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClosePhase {
    Announce,
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClose {
    pub phase: ClosePhase,
    /// Milliseconds until the announcing side closes unilaterally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipHeader {
    pub protocol_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipDataExtension {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
}

/// A SPINE payload in transit. The payload is kept as raw JSON so the
/// connection core never re-interprets or re-encodes application bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipData {
    pub header: ShipHeader,
    pub payload: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<ShipDataExtension>,
}

impl ShipData {
    /// Wraps an outbound SPINE payload; the bytes must be JSON-UTF8.
    pub fn new(payload: &[u8]) -> Result<Self, ShipError> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| ShipError::Parse(err.to_string()))?;
        let payload = RawValue::from_string(text.to_owned())
            .map_err(|err| ShipError::Parse(err.to_string()))?;
        Ok(Self {
            header: ShipHeader {
                protocol_id: SHIP_PROTOCOL_ID.to_owned(),
            },
            payload,
            extension: None,
        })
    }
}

impl PartialEq for ShipData {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.payload.get() == other.payload.get()
            && self.extension == other.extension
    }
}
