//! The per-connection SHIP state machine and its driving worker.
//!
//! A [`ShipConnection`] owns one transport and one worker task. The worker
//! is the only reader of the event queue and the only mutator of the
//! handshake state; transports, timers, and the public controller methods
//! interact with it exclusively by enqueueing events or flipping the
//! cancel/shutdown flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{DataReader, DataWriter, InfoProvider, TransportSink, Websocket, WebsocketCreator};
use crate::buffer::MessageBuffer;
use crate::codec;
use crate::error::ShipError;
use crate::model::{
    ConnectionClose, ClosePhase, HandshakeErrorCode, MessageProtocolHandshakeError, ShipMessage,
    ShipRole, SmeState,
};

mod client;
mod data_exchange;
mod hello;
mod pin;
mod server;
mod timer;

use timer::TimerSet;

pub(crate) const EVENT_QUEUE_CAPACITY: usize = 15;
pub(crate) const SOFT_IDLE: Duration = Duration::from_millis(10);
/// Grace period after a close announce/confirm so the frame reaches the peer.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_millis(500);
pub(crate) const CLOSE_CODE_DEFAULT: u16 = 4001;

/// Events multiplexed through the per-connection queue.
#[derive(Debug)]
pub(crate) enum Event {
    /// A full WebSocket frame arrived from the transport.
    DataReceived(MessageBuffer),
    /// The application asked for a SPINE payload to be written.
    SpineDataToSend(MessageBuffer),
    /// One of the three handshake timers fired.
    Timeout,
    WebsocketError,
    WebsocketClose,
    /// Cooperative stop.
    Cancel,
    /// The node approved a pending handshake.
    Approve,
    /// The node aborted a pending handshake.
    Abort,
}

/// Non-error outcomes of a handshake-state receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Received {
    /// A frame was dequeued into the worker scratch buffer.
    Frame,
    Approve,
    Abort,
}

pub(crate) struct ConnectionShared {
    pub(crate) role: ShipRole,
    pub(crate) local_ship_id: String,
    pub(crate) remote_ski: String,
    pub(crate) remote_ship_id: Mutex<String>,
    pub(crate) info_provider: Arc<dyn InfoProvider>,
    pub(crate) websocket: Mutex<Option<Arc<dyn Websocket>>>,
    pub(crate) data_reader: Mutex<Option<Arc<dyn DataReader>>>,
    pub(crate) timers: TimerSet,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) shutdown: Arc<AtomicBool>,
    state: Mutex<SmeState>,
    last_error: Mutex<Option<String>>,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionShared {
    pub(crate) fn state(&self) -> SmeState {
        *self.state.lock()
    }

    fn event_tx(&self) -> Option<mpsc::Sender<Event>> {
        self.tx.lock().clone()
    }

    fn record_error(&self, reason: &str) {
        *self.last_error.lock() = Some(reason.to_owned());
    }

    /// Moves to `next` and notifies the node; setting the current state
    /// again is suppressed.
    pub(crate) fn set_state(&self, next: SmeState) {
        self.set_state_with_error(next, None);
    }

    fn set_state_with_error(&self, next: SmeState, error: Option<&str>) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        tracing::debug!(ski = %self.remote_ski, state = %next, "ship state changed");
        self.info_provider
            .handle_ship_state_update(&self.remote_ski, next, error);
    }

    /// Tears the connection down; every invocation after the first is a
    /// no-op, so the transport is closed and the node notified exactly once.
    pub(crate) async fn close_connection(&self, safe: bool, code: u16, reason: &str) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.timers.stop_all();

        let state = self.state();
        // handshake is completed if approved, aborted, or rejected
        let handshake_ended = matches!(
            state,
            SmeState::DataExchange
                | SmeState::HelloAbortDone
                | SmeState::HelloRemoteAbortDone
                | SmeState::HelloRejected
        );

        let websocket = self.websocket.lock().clone();
        if let Some(websocket) = websocket {
            if safe && state == SmeState::DataExchange {
                // SHIP 13.4.7: connection termination announce
                let announce = ShipMessage::Close(ConnectionClose {
                    phase: ClosePhase::Announce,
                    max_time: None,
                    reason: (!reason.is_empty()).then(|| reason.to_owned()),
                });
                if let Ok(frame) = codec::encode(&announce) {
                    let _ = websocket.write(&frame).await;
                }
                tokio::time::sleep(CLOSE_GRACE).await;
                websocket.close(CLOSE_CODE_DEFAULT, "close").await;
            } else {
                let code = if code != 0 { code } else { CLOSE_CODE_DEFAULT };
                websocket.close(code, reason).await;
            }
        }

        self.cancel.store(true, Ordering::SeqCst);
        self.info_provider
            .handle_connection_closed(&self.remote_ski, handshake_ended);
    }
}

/// The state-machine driver; sole reader of the event queue.
pub(crate) struct Worker {
    pub(crate) shared: Arc<ConnectionShared>,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    /// The currently in-flight decoded input frame.
    scratch: Option<MessageBuffer>,
    /// Last wait duration the peer announced, seeding the reply deadline of
    /// a prolongation request.
    pub(crate) last_received_waiting: Duration,
    pub(crate) access_methods_sent: bool,
}

impl Worker {
    async fn run(mut self) {
        while !self.shared.cancel.load(Ordering::SeqCst)
            && !self.shared.shutdown.load(Ordering::SeqCst)
        {
            match self.shared.role {
                ShipRole::Client => client::handle_state(&mut self).await,
                ShipRole::Server => server::handle_state(&mut self).await,
            }
        }
    }

    pub(crate) fn set_state(&self, next: SmeState) {
        self.shared.set_state(next);
    }

    pub(crate) fn event_tx(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    pub(crate) fn take_scratch(&mut self) -> Option<MessageBuffer> {
        self.scratch.take()
    }

    /// Hands the connection out as the SPINE data-writer capability.
    pub(crate) fn data_writer_handle(&self) -> Arc<dyn DataWriter> {
        Arc::new(ShipConnection {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Writes an already-encoded frame to the transport.
    pub(crate) async fn send(&self, frame: &[u8]) -> Result<(), ShipError> {
        let websocket = self
            .shared
            .websocket
            .lock()
            .clone()
            .ok_or(ShipError::Communication)?;
        let written = websocket.write(frame).await?;
        if written != frame.len() {
            tracing::debug!(ski = %self.shared.remote_ski, "websocket write was short");
            return Err(ShipError::Communication);
        }
        Ok(())
    }

    pub(crate) async fn serialize_and_send(&self, message: &ShipMessage) -> Result<(), ShipError> {
        let frame = codec::encode(message)?;
        self.send(&frame).await
    }

    /// Blocks on the event queue with the wait-for-ready timer armed; the
    /// timer is always stopped again on exit. A received frame lands in the
    /// worker scratch buffer.
    pub(crate) async fn receive(&mut self, timeout: Duration) -> Result<Received, ShipError> {
        self.shared
            .timers
            .wait_for_ready
            .start(timeout, self.tx.clone());
        let event = self.rx.recv().await;
        self.shared.timers.wait_for_ready.stop();

        match event {
            Some(Event::DataReceived(frame)) => {
                self.scratch = Some(frame);
                Ok(Received::Frame)
            }
            Some(Event::Approve) => Ok(Received::Approve),
            Some(Event::Abort) => Ok(Received::Abort),
            Some(Event::Timeout) => {
                tracing::debug!(ski = %self.shared.remote_ski, "receive timed out");
                Err(ShipError::Timeout)
            }
            Some(Event::Cancel) | None => {
                tracing::debug!(ski = %self.shared.remote_ski, "receive cancelled");
                Err(ShipError::Cancelled)
            }
            Some(Event::WebsocketError) => Err(ShipError::Communication),
            Some(Event::WebsocketClose) => Err(ShipError::CommunicationEnd),
            Some(Event::SpineDataToSend(_)) => Err(ShipError::InputType),
        }
    }

    /// Dequeues the next event with no deadline; data-exchange only.
    pub(crate) async fn next_event(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Terminal failure: enters the error state and tears the connection
    /// down with `reason`.
    pub(crate) async fn close_with_error(&self, reason: &str) {
        self.shared.record_error(reason);
        self.shared
            .set_state_with_error(SmeState::Error, Some(reason));
        tracing::debug!(ski = %self.shared.remote_ski, reason, "closing ship connection");
        self.shared.close_connection(true, 0, reason).await;
    }

    /// Aborts the protocol-version handshake with the given reason code
    /// (SHIP 13.4.4.2.3).
    pub(crate) async fn abort_protocol_handshake(&self, code: HandshakeErrorCode) {
        self.shared.timers.wait_for_ready.stop();
        let message =
            ShipMessage::ProtocolHandshakeError(MessageProtocolHandshakeError { error: code });
        if self.serialize_and_send(&message).await.is_err() {
            self.close_with_error("Error sending ship message").await;
            return;
        }
        self.set_state(SmeState::Error);
        self.close_with_error("Abort protocol handshake").await;
    }
}

/// One SHIP connection to a remote peer, bound to exactly one transport.
///
/// The handle is cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ShipConnection {
    shared: Arc<ConnectionShared>,
}

impl ShipConnection {
    pub fn new(
        info_provider: Arc<dyn InfoProvider>,
        role: ShipRole,
        local_ship_id: &str,
        remote_ski: &str,
        remote_ship_id: &str,
    ) -> Self {
        let initial_state = match role {
            ShipRole::Client => SmeState::CmiClientSend,
            ShipRole::Server => SmeState::CmiServerWait,
        };

        Self {
            shared: Arc::new(ConnectionShared {
                role,
                local_ship_id: local_ship_id.to_owned(),
                remote_ski: remote_ski.to_owned(),
                remote_ship_id: Mutex::new(remote_ship_id.to_owned()),
                info_provider,
                websocket: Mutex::new(None),
                data_reader: Mutex::new(None),
                timers: TimerSet::new(),
                cancel: Arc::new(AtomicBool::new(false)),
                shutdown: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(initial_state),
                last_error: Mutex::new(None),
                tx: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Binds the connection to a freshly created transport and spawns the
    /// worker. Failures leave the connection in a clean failed state with
    /// [`last_error`](Self::last_error) set; `start` itself never panics.
    pub fn start(&self, creator: &dyn WebsocketCreator) {
        if let Err(err) = self.try_start(creator) {
            self.shared.record_error(&err.to_string());
            tracing::debug!(ski = %self.shared.remote_ski, %err, "starting ship connection failed");
        }
    }

    fn try_start(&self, creator: &dyn WebsocketCreator) -> Result<(), ShipError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let sink = TransportSink {
            tx: tx.clone(),
            cancel: Arc::clone(&self.shared.cancel),
            shutdown: Arc::clone(&self.shared.shutdown),
        };
        let websocket = creator.create_websocket(sink)?;
        *self.shared.websocket.lock() = Some(websocket);
        *self.shared.tx.lock() = Some(tx.clone());

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            rx,
            tx,
            scratch: None,
            last_received_waiting: Duration::ZERO,
            access_methods_sent: false,
        };
        *self.shared.worker.lock() = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Cancels the worker, waits for it to finish, and closes the
    /// connection. Safe to call any number of times.
    pub async fn stop(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shared.event_tx() {
            let _ = tx.send(Event::Cancel).await;
        }

        let worker = self.shared.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        self.shared.close_connection(false, 0, "").await;
    }

    /// Closes the connection. With `safe` set and the handshake completed,
    /// the peer is sent a termination announce first (SHIP 13.4.7).
    pub async fn close_connection(&self, safe: bool, code: u16, reason: &str) {
        self.shared.close_connection(safe, code, reason).await;
    }

    /// Lets a pending handshake proceed. Meaningful only while the remote
    /// decision is awaited in the hello pending phase; otherwise a no-op.
    pub async fn approve_pending_handshake(&self) {
        if self.shared.state() != SmeState::HelloPendingListen {
            return;
        }
        if let Some(tx) = self.shared.event_tx() {
            let _ = tx.send(Event::Approve).await;
        }
    }

    /// Aborts a pending handshake. Meaningful only in the hello listen
    /// phases; otherwise a no-op.
    pub async fn abort_pending_handshake(&self) {
        let state = self.shared.state();
        if state != SmeState::HelloPendingListen && state != SmeState::HelloReadyListen {
            return;
        }
        if let Some(tx) = self.shared.event_tx() {
            let _ = tx.send(Event::Abort).await;
        }
    }

    pub fn state(&self) -> SmeState {
        self.shared.state()
    }

    /// Close reason of the terminal error, if the connection failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn remote_ski(&self) -> &str {
        &self.shared.remote_ski
    }

    /// The peer-reported ship identifier; empty until the access-methods
    /// exchange completed.
    pub fn remote_ship_id(&self) -> String {
        self.shared.remote_ship_id.lock().clone()
    }
}

#[async_trait]
impl DataWriter for ShipConnection {
    async fn write_message(&self, payload: &[u8]) {
        let Some(tx) = self.shared.event_tx() else {
            return;
        };
        let _ = tx
            .send(Event::SpineDataToSend(MessageBuffer::from(payload.to_vec())))
            .await;
    }
}
