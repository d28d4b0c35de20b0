//! Connection data preparation: the SME hello phase (SHIP 13.4.4.1).
//!
//! Both roles run the same hello states. The ready flow answers a peer that
//! is immediately willing; the pending flow keeps the window open with
//! prolongation requests until the applications on both ends have decided.

use std::time::Duration;

use crate::codec;
use crate::error::ShipError;
use crate::model::{
    ConnectionHello, HelloPhase, ShipMessage, SmeState, T_HELLO_INC, T_HELLO_INIT,
    T_HELLO_PROLONG_MIN, T_HELLO_PROLONG_THR_INC, T_HELLO_PROLONG_WAITING_GAP,
};

use super::timer::TimerPhase;
use super::{Received, Worker};

/// Entry into the hello phase: a paired peer is answered ready right away,
/// an unpaired one we may still wait for goes through the pending flow.
pub(super) fn entry(worker: &mut Worker) {
    let provider = &worker.shared.info_provider;
    let ski = worker.shared.remote_ski.as_str();

    if provider.is_remote_service_for_ski_paired(ski) {
        worker.set_state(SmeState::HelloReadyInit);
    } else if provider.is_waiting_for_trust_allowed(ski) {
        worker.set_state(SmeState::HelloPendingInit);
    } else {
        worker.set_state(SmeState::HelloAbort);
    }
}

pub(super) async fn send_hello(
    worker: &Worker,
    phase: HelloPhase,
    waiting: Option<Duration>,
    prolongation_request: bool,
) -> Result<(), ShipError> {
    let hello = ConnectionHello {
        phase,
        waiting: waiting
            .filter(|waiting| !waiting.is_zero())
            .map(|waiting| waiting.as_millis() as u64),
        prolongation_request: prolongation_request.then_some(true),
    };
    worker.serialize_and_send(&ShipMessage::Hello(hello)).await
}

pub(super) async fn ready_init(worker: &mut Worker) {
    // The peer's answer is awaited in the ready-listen state, which arms the
    // wait-for-ready timer itself.
    worker.shared.timers.send_prolongation_request.stop();
    worker.shared.timers.prolongation_request_reply.stop();
    if send_hello(worker, HelloPhase::Ready, Some(T_HELLO_INIT), false)
        .await
        .is_ok()
    {
        worker.set_state(SmeState::HelloReadyListen);
    } else {
        worker.set_state(SmeState::HelloAbort);
    }
}

pub(super) async fn ready_listen(worker: &mut Worker) {
    match worker.receive(T_HELLO_INIT).await {
        Ok(Received::Frame) => evaluate_ready_hello(worker).await,
        Ok(Received::Abort) => worker.set_state(SmeState::HelloAbort),
        Ok(Received::Approve) => {}
        Err(ShipError::Timeout) => worker.set_state(SmeState::HelloReadyTimeout),
        Err(ShipError::CommunicationEnd) => {
            // The remote application turned us down: it answers a trust
            // request it does not accept by going pending and then closing.
            worker.shared.record_error("Node rejected by application");
            worker.shared.set_state(SmeState::HelloRejected);
            worker.shared.close_connection(false, 0, "").await;
        }
        Err(_) => worker.set_state(SmeState::HelloAbort),
    }
}

async fn evaluate_ready_hello(worker: &mut Worker) {
    let Some(frame) = worker.take_scratch() else {
        worker.set_state(SmeState::HelloAbort);
        return;
    };

    match codec::decode(frame.as_ref()) {
        Ok(ShipMessage::Hello(hello)) => match hello.phase {
            HelloPhase::Ready => worker.set_state(SmeState::HelloOk),
            HelloPhase::Pending => prolongation_request_update(worker, &hello).await,
            HelloPhase::Aborted => worker.set_state(SmeState::HelloAbort),
        },
        Ok(_) => worker.set_state(SmeState::HelloAbort),
        Err(err) => {
            tracing::debug!(%err, "error deserializing sme hello message");
            abort(worker).await;
        }
    }
}

pub(super) async fn pending_init(worker: &mut Worker) {
    worker.shared.timers.send_prolongation_request.stop();
    worker.shared.timers.prolongation_request_reply.stop();
    if send_hello(worker, HelloPhase::Pending, Some(T_HELLO_INIT), false)
        .await
        .is_ok()
    {
        worker.set_state(SmeState::HelloPendingListen);
    } else {
        worker.set_state(SmeState::HelloAbort);
    }
}

pub(super) async fn pending_listen(worker: &mut Worker) {
    match worker.receive(T_HELLO_INIT).await {
        Ok(Received::Frame) => evaluate_pending_hello(worker).await,
        Ok(Received::Approve) => {
            // The node granted trust: announce ready, then move on as if the
            // peer had been ready all along.
            worker.set_state(SmeState::HelloReadyInit);
            ready_init(worker).await;
            worker.set_state(SmeState::HelloOk);
        }
        Ok(Received::Abort) => worker.set_state(SmeState::HelloAbort),
        Err(ShipError::Timeout) => worker.set_state(SmeState::HelloPendingTimeout),
        Err(_) => worker.set_state(SmeState::HelloAbort),
    }
}

async fn evaluate_pending_hello(worker: &mut Worker) {
    let Some(frame) = worker.take_scratch() else {
        worker.set_state(SmeState::HelloAbort);
        return;
    };

    match codec::decode(frame.as_ref()) {
        Ok(ShipMessage::Hello(hello)) => match hello.phase {
            HelloPhase::Ready => check_waiting(worker, &hello),
            HelloPhase::Pending => check_waiting_and_prolongation(worker, &hello).await,
            HelloPhase::Aborted => worker.set_state(SmeState::HelloAbort),
        },
        Ok(_) => worker.set_state(SmeState::HelloAbort),
        Err(err) => {
            tracing::debug!(%err, "error deserializing sme hello message");
            abort(worker).await;
        }
    }
}

pub(super) async fn pending_timeout(worker: &mut Worker) {
    if worker.shared.timers.wait_for_ready.phase() == TimerPhase::Expired
        || worker.shared.timers.prolongation_request_reply.phase() == TimerPhase::Expired
    {
        worker.set_state(SmeState::HelloAbort);
        return;
    }

    if worker.shared.timers.send_prolongation_request.phase() != TimerPhase::Expired {
        return;
    }

    if send_hello(worker, HelloPhase::Pending, None, true).await.is_err() {
        worker.close_with_error("Error sending hello message").await;
        return;
    }

    if worker.last_received_waiting.is_zero() {
        let remaining = worker.shared.timers.prolongation_request_reply.remaining();
        worker.last_received_waiting = remaining + remaining / 10;
    }

    worker
        .shared
        .timers
        .prolongation_request_reply
        .start(worker.last_received_waiting, worker.event_tx());

    worker.set_state(SmeState::HelloPendingListen);
}

/// Sends the abort hello (best effort) and tears the connection down.
pub(super) async fn abort(worker: &mut Worker) {
    if let Err(err) = send_hello(worker, HelloPhase::Aborted, None, false).await {
        tracing::debug!(%err, "error sending hello state abort message");
    }
    worker
        .close_with_error("SME Hello state connection aborted")
        .await;
}

/// Handles a pending hello carrying a prolongation request by extending the
/// wait-for-ready deadline and restating the received phase with the new
/// remaining time. Without a request the message is ignored
/// (SHIP 13.4.4.1.3).
async fn prolongation_request_update(worker: &mut Worker, hello: &ConnectionHello) {
    if hello.prolongation_request != Some(true) {
        return;
    }

    let extended = worker.shared.timers.wait_for_ready.remaining() + T_HELLO_INC;
    worker
        .shared
        .timers
        .wait_for_ready
        .start(extended, worker.event_tx());
    update_hello(worker, hello.phase).await;
}

async fn update_hello(worker: &mut Worker, phase: HelloPhase) {
    let remaining = match worker.shared.timers.wait_for_ready.phase() {
        TimerPhase::Running => worker.shared.timers.wait_for_ready.remaining(),
        _ => Duration::ZERO,
    };

    if send_hello(worker, phase, Some(remaining), false).await.is_err() {
        worker.set_state(SmeState::HelloAbort);
    }
}

/// Pending listen received a ready hello: a `waiting` subelement is
/// mandatory and reschedules our prolongation request.
fn check_waiting(worker: &mut Worker, hello: &ConnectionHello) {
    match hello.waiting {
        Some(waiting_ms) => {
            worker.shared.timers.wait_for_ready.stop();
            worker.shared.timers.prolongation_request_reply.stop();
            schedule_prolongation_request(worker, Duration::from_millis(waiting_ms));
        }
        None => worker.set_state(SmeState::HelloAbort),
    }
}

/// Pending listen received a pending hello: a plain wait announcement
/// reschedules our prolongation request, anything else runs the common
/// prolongation procedure.
async fn check_waiting_and_prolongation(worker: &mut Worker, hello: &ConnectionHello) {
    if let (Some(waiting_ms), None) = (hello.waiting, hello.prolongation_request) {
        worker.shared.timers.prolongation_request_reply.stop();
        schedule_prolongation_request(worker, Duration::from_millis(waiting_ms));
    } else {
        prolongation_request_update(worker, hello).await;
    }
}

fn schedule_prolongation_request(worker: &mut Worker, waiting: Duration) {
    worker.last_received_waiting = waiting;
    match prolongation_delay(waiting) {
        Some(delay) => worker
            .shared
            .timers
            .send_prolongation_request
            .start(delay, worker.event_tx()),
        None => worker.shared.timers.send_prolongation_request.stop(),
    }
}

/// When a prolongation request must go out for a peer that announced
/// `waiting`, or `None` when no request is to be scheduled.
pub(super) fn prolongation_delay(waiting: Duration) -> Option<Duration> {
    if waiting < T_HELLO_PROLONG_THR_INC {
        return None;
    }
    let delay = waiting.saturating_sub(T_HELLO_PROLONG_WAITING_GAP);
    (delay >= T_HELLO_PROLONG_MIN).then_some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn prolongation_is_scheduled_with_the_gap_subtracted() {
        assert_eq!(prolongation_delay(secs(60)), Some(secs(45)));
        assert_eq!(prolongation_delay(secs(30)), Some(secs(15)));
    }

    #[test]
    fn announced_waits_below_the_threshold_schedule_nothing() {
        assert_eq!(prolongation_delay(secs(29)), None);
        assert_eq!(prolongation_delay(Duration::ZERO), None);
    }

    #[test]
    fn threshold_boundary_is_exact() {
        assert_eq!(prolongation_delay(Duration::from_millis(29_999)), None);
        assert_eq!(
            prolongation_delay(Duration::from_millis(30_000)),
            Some(Duration::from_millis(15_000))
        );
    }
}
