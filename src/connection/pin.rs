//! Connection PIN verification (SHIP 13.4.5) and the approved transition.
//!
//! PIN entry is not implemented: this endpoint declares that no PIN is
//! required and refuses to continue with a peer that demands one.

use crate::codec;
use crate::error::ShipError;
use crate::model::{
    ConnectionPinState, PinInputPermission, PinState, ShipMessage, SmeState, CMI_TIMEOUT,
    T_HELLO_INIT,
};

use super::{Received, Worker};

async fn send_pin_state(
    worker: &Worker,
    pin_state: PinState,
    input_permission: Option<PinInputPermission>,
) -> Result<(), ShipError> {
    // none/pinOk carry no permission subelement on the wire
    let input_permission = match pin_state {
        PinState::None | PinState::PinOk => None,
        _ => Some(input_permission.ok_or(ShipError::InputArgument)?),
    };

    worker
        .serialize_and_send(&ShipMessage::PinState(ConnectionPinState {
            pin_state,
            input_permission,
        }))
        .await
}

pub(super) async fn check_init(worker: &mut Worker) {
    if send_pin_state(worker, PinState::None, Some(PinInputPermission::Ok))
        .await
        .is_err()
    {
        worker
            .close_with_error("Error sending PIN requirement message")
            .await;
        return;
    }

    if !matches!(worker.receive(CMI_TIMEOUT).await, Ok(Received::Frame)) {
        worker.close_with_error("Error receiving pin requirement").await;
        return;
    }

    let Some(frame) = worker.take_scratch() else {
        worker.set_state(SmeState::HelloAbort);
        return;
    };

    match codec::decode(frame.as_ref()) {
        Ok(ShipMessage::PinState(pin)) => check_pin_state(worker, &pin).await,
        Ok(_) => worker.set_state(SmeState::HelloAbort),
        Err(err) => {
            tracing::debug!(%err, "error deserializing pin init message");
            worker.set_state(SmeState::HelloAbort);
        }
    }
}

async fn check_pin_state(worker: &mut Worker, pin: &ConnectionPinState) {
    match pin.pin_state {
        PinState::Required => handle_input_permission(worker, pin.input_permission).await,
        PinState::Optional => {
            // an optional pin leaves data exchange enabled, nothing to set up
            handle_input_permission(worker, pin.input_permission).await;
        }
        PinState::PinOk | PinState::None => worker.set_state(SmeState::PinCheckOk),
    }
}

async fn handle_input_permission(worker: &mut Worker, permission: Option<PinInputPermission>) {
    let Some(permission) = permission else {
        worker
            .close_with_error("PIN input permission is missing")
            .await;
        return;
    };

    match permission {
        PinInputPermission::Busy => worker.set_state(SmeState::PinCheckBusyWait),
        PinInputPermission::Ok => worker.set_state(SmeState::PinCheckListen),
        PinInputPermission::None => {}
    }
}

pub(super) async fn check_listen(worker: &mut Worker) {
    if !matches!(worker.receive(T_HELLO_INIT).await, Ok(Received::Frame)) {
        worker
            .close_with_error("Error receiving PIN state message")
            .await;
        return;
    }

    let Some(frame) = worker.take_scratch() else {
        worker
            .close_with_error("Error deserializing PIN message")
            .await;
        return;
    };

    match codec::decode(frame.as_ref()) {
        Ok(ShipMessage::PinState(pin)) => match pin.pin_state {
            PinState::None => worker.set_state(SmeState::PinCheckOk),
            PinState::Required => {
                worker
                    .close_with_error("Unsupported PIN state: required")
                    .await;
            }
            PinState::Optional => {
                worker
                    .close_with_error("Unsupported PIN state: optional")
                    .await;
            }
            PinState::PinOk => {
                worker.close_with_error("Unsupported PIN state: pinOk").await;
            }
        },
        _ => {
            worker
                .close_with_error("Error deserializing PIN message")
                .await;
        }
    }
}

/// Both ends approved: wire the SPINE sink and enter data exchange.
pub(super) fn approved(worker: &mut Worker) {
    let writer = worker.data_writer_handle();
    let reader = worker
        .shared
        .info_provider
        .setup_remote_device(&worker.shared.remote_ski, writer);
    *worker.shared.data_reader.lock() = Some(reader);

    worker.shared.timers.wait_for_ready.stop();
    worker.set_state(SmeState::DataExchange);
}
