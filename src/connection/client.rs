//! Client-side state handling: connection-mode initiation and the
//! protocol-version handshake as the proposing end.

use crate::buffer::MessageBuffer;
use crate::codec;
use crate::model::{
    HandshakeErrorCode, MessageProtocolFormat, MessageProtocolHandshake, ProtocolHandshakeType,
    ShipMessage, SmeState, CMI_TIMEOUT, SHIP_INIT_MESSAGE, SHIP_MAX_PROTOCOL_VERSION,
};

use super::{data_exchange, hello, pin, Received, Worker, SOFT_IDLE};

pub(super) async fn handle_state(worker: &mut Worker) {
    match worker.shared.state() {
        SmeState::CmiClientSend => cmi_send(worker).await,
        SmeState::CmiClientWait => cmi_wait(worker).await,
        SmeState::CmiClientEvaluate => cmi_evaluate(worker).await,
        SmeState::Hello => hello::entry(worker),
        SmeState::HelloReadyInit => hello::ready_init(worker).await,
        SmeState::HelloReadyListen => hello::ready_listen(worker).await,
        SmeState::HelloReadyTimeout => hello::abort(worker).await,
        SmeState::HelloPendingInit => hello::pending_init(worker).await,
        SmeState::HelloPendingListen => hello::pending_listen(worker).await,
        SmeState::HelloPendingTimeout => hello::pending_timeout(worker).await,
        SmeState::HelloOk => worker.set_state(SmeState::ProtocolHandshakeClientInit),
        SmeState::HelloAbort
        | SmeState::HelloAbortDone
        | SmeState::HelloRemoteAbortDone
        | SmeState::HelloRejected => hello::abort(worker).await,
        SmeState::ProtocolHandshakeClientInit => handshake_init(worker).await,
        SmeState::ProtocolHandshakeClientListenChoice => handshake_listen_choice(worker).await,
        SmeState::ProtocolHandshakeClientOk => worker.set_state(SmeState::PinCheckInit),
        SmeState::PinCheckInit => pin::check_init(worker).await,
        SmeState::PinCheckListen => pin::check_listen(worker).await,
        SmeState::PinCheckBusyWait => worker.set_state(SmeState::PinCheckListen),
        SmeState::PinCheckOk => worker.set_state(SmeState::Approved),
        // access methods requests are handled as a data-exchange substate
        SmeState::AccessMethodsRequest => {}
        SmeState::Approved => pin::approved(worker),
        SmeState::DataExchange => data_exchange::run(worker).await,
        SmeState::Error => {}
        _ => tokio::time::sleep(SOFT_IDLE).await,
    }
}

async fn cmi_send(worker: &mut Worker) {
    let init = MessageBuffer::Borrowed(&SHIP_INIT_MESSAGE);
    if worker.send(init.as_ref()).await.is_ok() {
        worker.set_state(SmeState::CmiClientWait);
    } else {
        worker.close_with_error("CMI client send failed").await;
    }
}

async fn cmi_wait(worker: &mut Worker) {
    match worker.receive(CMI_TIMEOUT).await {
        Ok(Received::Frame) => worker.set_state(SmeState::CmiClientEvaluate),
        _ => worker.close_with_error("CMI client wait failed").await,
    }
}

async fn cmi_evaluate(worker: &mut Worker) {
    let valid = worker
        .take_scratch()
        .is_some_and(|frame| codec::is_valid_init(frame.as_ref()));
    if valid {
        worker.set_state(SmeState::Hello);
    } else {
        worker.close_with_error("Invalid init message received").await;
    }
}

async fn handshake_init(worker: &mut Worker) {
    worker.shared.timers.wait_for_ready.stop();

    let announce = ShipMessage::ProtocolHandshake(MessageProtocolHandshake::announce_max());
    if worker.serialize_and_send(&announce).await.is_err() {
        worker
            .close_with_error("Error serializing protocol handshake ship message")
            .await;
        return;
    }

    // wait-for-ready is armed again by the receive in the next state
    worker.set_state(SmeState::ProtocolHandshakeClientListenChoice);
}

async fn handshake_listen_choice(worker: &mut Worker) {
    if !matches!(worker.receive(CMI_TIMEOUT).await, Ok(Received::Frame)) {
        worker
            .abort_protocol_handshake(HandshakeErrorCode::UnexpectedMessage)
            .await;
        return;
    }

    let Some(frame) = worker.take_scratch() else {
        worker
            .abort_protocol_handshake(HandshakeErrorCode::UnexpectedMessage)
            .await;
        return;
    };

    match codec::decode(frame.as_ref()) {
        Ok(ShipMessage::ProtocolHandshake(handshake)) => {
            worker.shared.timers.wait_for_ready.stop();

            if !selection_matches_maximum(&handshake) {
                worker
                    .abort_protocol_handshake(HandshakeErrorCode::SelectionMismatch)
                    .await;
                return;
            }

            let select = ShipMessage::ProtocolHandshake(MessageProtocolHandshake::select_max());
            if worker.serialize_and_send(&select).await.is_err() {
                worker
                    .close_with_error("Error serializing protocol handshake ship message")
                    .await;
                return;
            }

            worker.set_state(SmeState::ProtocolHandshakeClientOk);
        }
        _ => {
            worker
                .abort_protocol_handshake(HandshakeErrorCode::UnexpectedMessage)
                .await;
        }
    }
}

/// The server must have selected exactly our maximum version with JSON-UTF8
/// as the leading format.
fn selection_matches_maximum(handshake: &MessageProtocolHandshake) -> bool {
    if handshake.handshake_type != ProtocolHandshakeType::Select {
        tracing::debug!("invalid protocol handshake response");
        return false;
    }
    if handshake.version != SHIP_MAX_PROTOCOL_VERSION {
        tracing::debug!(
            major = handshake.version.major,
            minor = handshake.version.minor,
            "unsupported protocol version selected"
        );
        return false;
    }
    if handshake.formats.format.first() != Some(&MessageProtocolFormat::JsonUtf8) {
        tracing::debug!("unsupported message format selected");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageProtocolFormats, ShipVersion};

    #[test]
    fn selection_must_echo_the_maximum_version() {
        assert!(selection_matches_maximum(
            &MessageProtocolHandshake::select_max()
        ));
        assert!(!selection_matches_maximum(
            &MessageProtocolHandshake::announce_max()
        ));
        assert!(!selection_matches_maximum(&MessageProtocolHandshake::select(
            ShipVersion { major: 255, minor: 0 }
        )));
        assert!(!selection_matches_maximum(&MessageProtocolHandshake::select(
            ShipVersion { major: 1, minor: 1 }
        )));
    }

    #[test]
    fn selection_requires_a_leading_utf8_format() {
        let mut handshake = MessageProtocolHandshake::select_max();
        handshake.formats = MessageProtocolFormats { format: vec![] };
        assert!(!selection_matches_maximum(&handshake));

        handshake.formats = MessageProtocolFormats {
            format: vec![MessageProtocolFormat::JsonUtf16],
        };
        assert!(!selection_matches_maximum(&handshake));

        handshake.formats = MessageProtocolFormats {
            format: vec![
                MessageProtocolFormat::JsonUtf8,
                MessageProtocolFormat::JsonUtf16,
            ],
        };
        assert!(selection_matches_maximum(&handshake));
    }
}
