//! Server-side state handling: connection-mode initiation and the
//! protocol-version handshake as the selecting end.

use crate::buffer::MessageBuffer;
use crate::codec;
use crate::model::{
    HandshakeErrorCode, MessageProtocolHandshake, ProtocolHandshakeType, ShipMessage, ShipVersion,
    SmeState, CMI_TIMEOUT, SHIP_INIT_MESSAGE, SHIP_MAX_PROTOCOL_VERSION,
};

use super::{data_exchange, hello, pin, Received, Worker, SOFT_IDLE};

pub(super) async fn handle_state(worker: &mut Worker) {
    match worker.shared.state() {
        SmeState::CmiServerWait => cmi_wait(worker).await,
        SmeState::CmiServerEvaluate => cmi_evaluate(worker).await,
        SmeState::Hello => hello::entry(worker),
        SmeState::HelloReadyInit => hello::ready_init(worker).await,
        SmeState::HelloReadyListen => hello::ready_listen(worker).await,
        SmeState::HelloReadyTimeout => hello::abort(worker).await,
        SmeState::HelloPendingInit => hello::pending_init(worker).await,
        SmeState::HelloPendingListen => hello::pending_listen(worker).await,
        SmeState::HelloPendingTimeout => hello::pending_timeout(worker).await,
        SmeState::HelloOk => worker.set_state(SmeState::ProtocolHandshakeServerInit),
        SmeState::HelloAbort
        | SmeState::HelloAbortDone
        | SmeState::HelloRemoteAbortDone
        | SmeState::HelloRejected => hello::abort(worker).await,
        SmeState::ProtocolHandshakeServerInit => handshake_init(worker),
        SmeState::ProtocolHandshakeServerListenProposal => handshake_listen_proposal(worker).await,
        SmeState::ProtocolHandshakeServerListenConfirm => handshake_listen_confirm(worker).await,
        SmeState::ProtocolHandshakeServerOk => worker.set_state(SmeState::PinCheckInit),
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

async fn cmi_wait(worker: &mut Worker) {
    match worker.receive(CMI_TIMEOUT).await {
        Ok(Received::Frame) => worker.set_state(SmeState::CmiServerEvaluate),
        _ => worker.close_with_error("CMI server wait failed").await,
    }
}

async fn cmi_evaluate(worker: &mut Worker) {
    let valid = worker
        .take_scratch()
        .is_some_and(|frame| codec::is_valid_init(frame.as_ref()));
    if !valid {
        worker.close_with_error("Invalid init message received").await;
        return;
    }

    let echo = MessageBuffer::Borrowed(&SHIP_INIT_MESSAGE);
    if worker.send(echo.as_ref()).await.is_err() {
        worker.close_with_error("Server CMI message send failed").await;
        return;
    }

    worker.set_state(SmeState::Hello);
}

fn handshake_init(worker: &mut Worker) {
    worker.shared.timers.wait_for_ready.stop();
    // wait-for-ready is armed again by the receive in the next state
    worker.set_state(SmeState::ProtocolHandshakeServerListenProposal);
}

async fn handshake_listen_proposal(worker: &mut Worker) {
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

            if handshake.handshake_type != ProtocolHandshakeType::AnnounceMax {
                worker
                    .abort_protocol_handshake(HandshakeErrorCode::UnexpectedMessage)
                    .await;
                return;
            }

            let Some(agreed) = agree_on_version(&handshake.version) else {
                worker
                    .abort_protocol_handshake(HandshakeErrorCode::SelectionMismatch)
                    .await;
                return;
            };

            let select = ShipMessage::ProtocolHandshake(MessageProtocolHandshake::select(agreed));
            if worker.serialize_and_send(&select).await.is_err() {
                worker
                    .close_with_error("Error serializing protocol handshake ship message")
                    .await;
                return;
            }

            worker.set_state(SmeState::ProtocolHandshakeServerListenConfirm);
        }
        _ => {
            worker
                .abort_protocol_handshake(HandshakeErrorCode::UnexpectedMessage)
                .await;
        }
    }
}

async fn handshake_listen_confirm(worker: &mut Worker) {
    if !matches!(worker.receive(CMI_TIMEOUT).await, Ok(Received::Frame)) {
        worker
            .abort_protocol_handshake(HandshakeErrorCode::UnexpectedMessage)
            .await;
        return;
    }

    let Some(frame) = worker.take_scratch() else {
        worker
            .abort_protocol_handshake(HandshakeErrorCode::SelectionMismatch)
            .await;
        return;
    };

    match codec::decode(frame.as_ref()) {
        Ok(ShipMessage::ProtocolHandshake(handshake)) => {
            if handshake.handshake_type != ProtocolHandshakeType::Select {
                tracing::debug!("protocol handshake confirmation is not a selection");
                worker
                    .abort_protocol_handshake(HandshakeErrorCode::SelectionMismatch)
                    .await;
                return;
            }

            worker.shared.timers.wait_for_ready.stop();
            worker.set_state(SmeState::ProtocolHandshakeServerOk);
        }
        _ => {
            worker
                .abort_protocol_handshake(HandshakeErrorCode::SelectionMismatch)
                .await;
        }
    }
}

/// Adopts the client's proposal verbatim when both version parts are within
/// our maximum.
fn agree_on_version(proposed: &ShipVersion) -> Option<ShipVersion> {
    (proposed.major <= SHIP_MAX_PROTOCOL_VERSION.major
        && proposed.minor <= SHIP_MAX_PROTOCOL_VERSION.minor)
        .then_some(*proposed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_adopts_the_proposal_verbatim() {
        let proposed = ShipVersion { major: 0, minor: 0 };
        assert_eq!(agree_on_version(&proposed), Some(proposed));
        assert_eq!(
            agree_on_version(&SHIP_MAX_PROTOCOL_VERSION),
            Some(SHIP_MAX_PROTOCOL_VERSION)
        );
    }

    #[test]
    fn agreement_fails_when_either_part_exceeds_the_maximum() {
        assert_eq!(agree_on_version(&ShipVersion { major: 2, minor: 0 }), None);
        assert_eq!(agree_on_version(&ShipVersion { major: 1, minor: 1 }), None);
        assert_eq!(
            agree_on_version(&ShipVersion {
                major: 255,
                minor: 255
            }),
            None
        );
    }
}
