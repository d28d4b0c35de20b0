//! Frame-level encoding and decoding of SHIP messages.
//!
//! A frame is the one-byte frame type followed by the JSON-UTF8 encoding of
//! a single [`ShipMessage`]. The init frame of the connection-mode
//! initiation is the only frame without a JSON body; it is validated
//! byte-for-byte.

use crate::error::ShipError;
use crate::model::{ShipMessage, SHIP_INIT_MESSAGE};

/// First byte of every SHIP WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Init = 0x01,
    Control = 0x02,
    Data = 0x03,
}

/// Encodes a message into a complete frame, frame-type byte included.
pub fn encode(message: &ShipMessage) -> Result<Vec<u8>, ShipError> {
    let frame_type = match message {
        ShipMessage::Data(_) => FrameType::Data,
        _ => FrameType::Control,
    };
    let mut frame = vec![frame_type as u8];
    serde_json::to_writer(&mut frame, message)
        .map_err(|err| ShipError::Parse(err.to_string()))?;
    Ok(frame)
}

/// Decodes a complete control or data frame back into its typed value.
pub fn decode(frame: &[u8]) -> Result<ShipMessage, ShipError> {
    let (&frame_type, body) = frame
        .split_first()
        .ok_or_else(|| ShipError::Parse("empty frame".into()))?;
    if frame_type != FrameType::Control as u8 && frame_type != FrameType::Data as u8 {
        return Err(ShipError::Parse(format!(
            "unexpected frame type {frame_type:#04x}"
        )));
    }
    serde_json::from_slice(body).map_err(|err| ShipError::Parse(err.to_string()))
}

/// Checks a received frame against the fixed CMI init message.
pub fn is_valid_init(frame: &[u8]) -> bool {
    frame == SHIP_INIT_MESSAGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AccessMethods, AccessMethodsRequest, ClosePhase, ConnectionClose, ConnectionHello,
        ConnectionPinState, HandshakeErrorCode, HelloPhase, MessageProtocolHandshake,
        MessageProtocolHandshakeError, PinInputPermission, PinState, ShipData,
        SHIP_PROTOCOL_ID,
    };

    fn roundtrip(message: ShipMessage) -> ShipMessage {
        let frame = encode(&message).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, message);
        decoded
    }

    #[test]
    fn hello_roundtrips_with_and_without_subelements() {
        roundtrip(ShipMessage::Hello(ConnectionHello {
            phase: HelloPhase::Ready,
            waiting: Some(60_000),
            prolongation_request: None,
        }));
        roundtrip(ShipMessage::Hello(ConnectionHello {
            phase: HelloPhase::Pending,
            waiting: None,
            prolongation_request: Some(true),
        }));
        roundtrip(ShipMessage::Hello(ConnectionHello {
            phase: HelloPhase::Aborted,
            waiting: None,
            prolongation_request: None,
        }));
    }

    #[test]
    fn hello_wire_shape_is_camel_cased_and_sparse() {
        let frame = encode(&ShipMessage::Hello(ConnectionHello {
            phase: HelloPhase::Pending,
            waiting: Some(60_000),
            prolongation_request: None,
        }))
        .unwrap();
        assert_eq!(frame[0], FrameType::Control as u8);
        let body: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"connectionHello": {"phase": "pending", "waiting": 60000}})
        );
    }

    #[test]
    fn protocol_handshake_roundtrips() {
        roundtrip(ShipMessage::ProtocolHandshake(
            MessageProtocolHandshake::announce_max(),
        ));
        roundtrip(ShipMessage::ProtocolHandshake(
            MessageProtocolHandshake::select_max(),
        ));
    }

    #[test]
    fn handshake_error_code_is_numeric_on_the_wire() {
        let frame = encode(&ShipMessage::ProtocolHandshakeError(
            MessageProtocolHandshakeError {
                error: HandshakeErrorCode::SelectionMismatch,
            },
        ))
        .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"messageProtocolHandshakeError": {"error": 4}})
        );
        roundtrip(ShipMessage::ProtocolHandshakeError(
            MessageProtocolHandshakeError {
                error: HandshakeErrorCode::UnexpectedMessage,
            },
        ));
    }

    #[test]
    fn pin_state_roundtrips() {
        roundtrip(ShipMessage::PinState(ConnectionPinState {
            pin_state: PinState::None,
            input_permission: None,
        }));
        roundtrip(ShipMessage::PinState(ConnectionPinState {
            pin_state: PinState::Required,
            input_permission: Some(PinInputPermission::Busy),
        }));
    }

    #[test]
    fn access_methods_roundtrip() {
        roundtrip(ShipMessage::AccessMethodsRequest(AccessMethodsRequest {}));
        roundtrip(ShipMessage::AccessMethods(AccessMethods {
            id: "Demo-Unit-123456".into(),
        }));
    }

    #[test]
    fn close_roundtrips() {
        roundtrip(ShipMessage::Close(ConnectionClose {
            phase: ClosePhase::Announce,
            max_time: None,
            reason: Some("bye".into()),
        }));
        roundtrip(ShipMessage::Close(ConnectionClose {
            phase: ClosePhase::Confirm,
            max_time: None,
            reason: None,
        }));
    }

    #[test]
    fn data_frames_use_the_data_frame_type_and_raw_payload() {
        let data = ShipData::new(br#"{"datagram":{"header":{}}}"#).unwrap();
        assert_eq!(data.header.protocol_id, SHIP_PROTOCOL_ID);
        let message = ShipMessage::Data(data);
        let frame = encode(&message).unwrap();
        assert_eq!(frame[0], FrameType::Data as u8);
        let decoded = decode(&frame).unwrap();
        match &decoded {
            ShipMessage::Data(data) => {
                assert_eq!(data.payload.get(), r#"{"datagram":{"header":{}}}"#);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(decoded, message);
    }

    #[test]
    fn init_frame_must_match_exactly() {
        assert!(is_valid_init(&[0x01, 0x00]));
        assert!(!is_valid_init(&[0x01]));
        assert!(!is_valid_init(&[0x01, 0x00, 0x00]));
        assert!(!is_valid_init(&[]));
        for first in 0u8..=255 {
            for second in [0x00, 0x01, 0xff] {
                let valid = first == 0x01 && second == 0x00;
                assert_eq!(is_valid_init(&[first, second]), valid);
            }
        }
    }

    #[test]
    fn malformed_frames_are_parse_errors() {
        assert!(matches!(decode(&[]), Err(ShipError::Parse(_))));
        assert!(matches!(decode(&[0x07, b'{', b'}']), Err(ShipError::Parse(_))));
        assert!(matches!(decode(&[0x02, b'n', b'o']), Err(ShipError::Parse(_))));
        let mut unknown = vec![FrameType::Control as u8];
        unknown.extend_from_slice(br#"{"unknownKey":{}}"#);
        assert!(matches!(decode(&unknown), Err(ShipError::Parse(_))));
    }
}
