//! Steady-state operation: SPINE payloads flow in both directions while
//! in-band access-methods and connection-termination frames are still
//! honoured (SHIP 13.4.6, 13.4.7).

use crate::buffer::MessageBuffer;
use crate::codec;
use crate::error::ShipError;
use crate::model::{
    AccessMethods, AccessMethodsRequest, ClosePhase, ConnectionClose, ShipData, ShipMessage,
    CMI_TIMEOUT,
};

use super::{Event, Worker, CLOSE_CODE_DEFAULT, CLOSE_GRACE};

pub(super) async fn run(worker: &mut Worker) {
    if !worker.access_methods_sent {
        worker.access_methods_sent = true;
        if request_access_methods(worker).await.is_err() {
            return;
        }
    }

    if handle_event(worker).await.is_err() {
        worker.close_with_error("data exchange failed").await;
    }
}

/// One-shot entry side effect: ask the peer for its access methods and give
/// it the CMI timeout to answer. The reply arrives in-band, so no state
/// switch happens here.
async fn request_access_methods(worker: &mut Worker) -> Result<(), ShipError> {
    let request = ShipMessage::AccessMethodsRequest(AccessMethodsRequest {});
    match worker.serialize_and_send(&request).await {
        Ok(()) => {
            worker
                .shared
                .timers
                .wait_for_ready
                .start(CMI_TIMEOUT, worker.event_tx());
            Ok(())
        }
        Err(err) => {
            worker
                .close_with_error("Error sending access methods request")
                .await;
            Err(err)
        }
    }
}

async fn handle_event(worker: &mut Worker) -> Result<(), ShipError> {
    match worker.next_event().await {
        Some(Event::DataReceived(frame)) => handle_frame(worker, frame).await,
        Some(Event::SpineDataToSend(payload)) => send_spine_data(worker, payload).await,
        Some(Event::Cancel) | None => Ok(()),
        Some(Event::Timeout) => Err(ShipError::Communication),
        Some(Event::WebsocketClose) => {
            worker.shared.close_connection(true, 0, "").await;
            Ok(())
        }
        Some(Event::WebsocketError) => Err(ShipError::Communication),
        Some(Event::Approve) | Some(Event::Abort) => Ok(()),
    }
}

async fn handle_frame(worker: &mut Worker, frame: MessageBuffer) -> Result<(), ShipError> {
    match codec::decode(frame.as_ref())? {
        ShipMessage::Data(data) => {
            let reader = worker.shared.data_reader.lock().clone();
            let Some(reader) = reader else {
                return Err(ShipError::Communication);
            };
            tracing::trace!(
                ski = %worker.shared.remote_ski,
                len = data.payload.get().len(),
                "spine payload received"
            );
            reader.handle_message(data.payload.get().as_bytes());
            Ok(())
        }
        ShipMessage::AccessMethodsRequest(_) => {
            let reply = ShipMessage::AccessMethods(AccessMethods {
                id: worker.shared.local_ship_id.clone(),
            });
            worker.serialize_and_send(&reply).await.map_err(|err| {
                tracing::debug!(%err, "error sending access methods message");
                err
            })
        }
        ShipMessage::AccessMethods(methods) => handle_access_methods(worker, &methods),
        ShipMessage::Close(close) => handle_close(worker, &close).await,
        _ => Err(ShipError::Communication),
    }
}

/// The peer reported its ship identifier. A stored identifier must match by
/// prefix; an empty one is filled in and reported upward.
fn handle_access_methods(worker: &mut Worker, methods: &AccessMethods) -> Result<(), ShipError> {
    worker.shared.timers.wait_for_ready.stop();

    let mut stored = worker.shared.remote_ship_id.lock();
    if !stored.is_empty() && !stored.starts_with(&methods.id) {
        tracing::debug!(
            stored = %*stored,
            received = %methods.id,
            "remote ship id mismatch"
        );
        return Err(ShipError::Communication);
    }

    if stored.is_empty() {
        *stored = methods.id.clone();
        drop(stored);
        tracing::debug!(ski = %worker.shared.remote_ski, ship_id = %methods.id, "saved remote ship id");
        worker
            .shared
            .info_provider
            .report_service_ship_id(&worker.shared.remote_ski, &methods.id);
    }

    Ok(())
}

async fn handle_close(worker: &mut Worker, close: &ConnectionClose) -> Result<(), ShipError> {
    match close.phase {
        ClosePhase::Announce => {
            // SHIP 13.4.7: connection termination confirm; give the frame a
            // moment to reach the peer before the transport goes away
            let confirm = ShipMessage::Close(ConnectionClose {
                phase: ClosePhase::Confirm,
                max_time: None,
                reason: None,
            });
            let _ = worker.serialize_and_send(&confirm).await;
            tokio::time::sleep(CLOSE_GRACE).await;
            worker
                .shared
                .close_connection(false, CLOSE_CODE_DEFAULT, "close")
                .await;
        }
        ClosePhase::Confirm => {
            worker
                .shared
                .close_connection(false, CLOSE_CODE_DEFAULT, "close")
                .await;
        }
    }
    Ok(())
}

async fn send_spine_data(worker: &mut Worker, payload: MessageBuffer) -> Result<(), ShipError> {
    tracing::trace!(
        ski = %worker.shared.remote_ski,
        len = payload.len(),
        "spine payload sent"
    );
    let data = ShipData::new(payload.as_ref())?;
    worker.serialize_and_send(&ShipMessage::Data(data)).await
}
