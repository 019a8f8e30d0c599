//! The user-facing connection handle.
//!
//! An [`Idscp2Connection`] wraps one state machine and fans its callbacks
//! out to registered listeners. Listener invocation happens on dedicated
//! dispatcher tasks, never under the FSM lock, so listeners are free to call
//! back into the connection. Messages that arrive before
//! [`unlock_messaging`](Idscp2Connection::unlock_messaging) queue losslessly;
//! lifecycle events are not gated.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::{
    config::Idscp2Configuration,
    daps::DapsDriver,
    error::Error,
    fsm::{Fsm, FsmEvent, FsmOutcome, FsmState, SharedFsm, UpperLayer},
    ra::RaRegistry,
    transport::{SecureChannel, SecureChannelEndpoint},
};

/// Receives application payloads once messaging is unlocked.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, payload: &[u8]);
}

/// Receives lifecycle events. `on_error` precedes `on_close`; `on_close`
/// fires exactly once.
pub trait ConnectionListener: Send + Sync {
    fn on_error(&self, error: &Error);
    fn on_close(&self);
}

enum Lifecycle {
    Error(Error),
    Closed,
}

/// Fan-out of FSM callbacks to user listeners, decoupled from the FSM lock.
pub(crate) struct ConnectionEvents {
    messages_tx: mpsc::UnboundedSender<Vec<u8>>,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    message_listeners: StdMutex<Vec<Arc<dyn MessageListener>>>,
    connection_listeners: StdMutex<Vec<Arc<dyn ConnectionListener>>>,
    unlocked: watch::Sender<bool>,
}

impl ConnectionEvents {
    fn new() -> Arc<Self> {
        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel::<Lifecycle>();
        let (unlocked, mut unlocked_rx) = watch::channel(false);

        let events = Arc::new(Self {
            messages_tx,
            lifecycle_tx,
            message_listeners: StdMutex::new(Vec::new()),
            connection_listeners: StdMutex::new(Vec::new()),
            unlocked,
        });

        // message dispatcher, parked until messaging is unlocked
        let weak = Arc::downgrade(&events);
        tokio::spawn(async move {
            while let Some(payload) = messages_rx.recv().await {
                while !*unlocked_rx.borrow() {
                    if unlocked_rx.changed().await.is_err() {
                        return;
                    }
                }
                let Some(events) = weak.upgrade() else { return };
                let listeners = events.message_listeners.lock().expect("listeners").clone();
                for listener in listeners {
                    listener.on_message(&payload);
                }
            }
        });

        // lifecycle dispatcher, never gated
        let weak = Arc::downgrade(&events);
        tokio::spawn(async move {
            while let Some(event) = lifecycle_rx.recv().await {
                let Some(events) = weak.upgrade() else { return };
                let listeners = events
                    .connection_listeners
                    .lock()
                    .expect("listeners")
                    .clone();
                match &event {
                    Lifecycle::Error(error) => {
                        for listener in &listeners {
                            listener.on_error(error);
                        }
                    }
                    Lifecycle::Closed => {
                        for listener in &listeners {
                            listener.on_close();
                        }
                    }
                }
            }
        });

        events
    }
}

impl UpperLayer for ConnectionEvents {
    fn deliver(&self, payload: Vec<u8>) {
        let _ = self.messages_tx.send(payload);
    }

    fn error(&self, error: Error) {
        let _ = self.lifecycle_tx.send(Lifecycle::Error(error));
    }

    fn closed(&self) {
        let _ = self.lifecycle_tx.send(Lifecycle::Closed);
    }
}

/// One IDSCP2 session over one TLS connection.
pub struct Idscp2Connection {
    id: String,
    remote: String,
    fsm: SharedFsm,
    state_rx: watch::Receiver<FsmState>,
    events: Arc<ConnectionEvents>,
}

impl Idscp2Connection {
    /// Wire a fresh state machine onto an established secure channel and run
    /// the handshake to completion.
    pub(crate) async fn start(
        channel: Arc<SecureChannel>,
        config: Arc<Idscp2Configuration>,
        daps: Arc<dyn DapsDriver>,
        registry: Arc<RaRegistry>,
    ) -> Result<Self, Error> {
        static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

        let events = ConnectionEvents::new();
        let remote = channel.remote_peer();
        let endpoint: Arc<dyn SecureChannelEndpoint> = channel.clone();
        let (fsm, mut state_rx) = Fsm::spawn(config, endpoint, daps, registry, events.clone());
        channel.bind_fsm(fsm.clone());

        if Fsm::dispatch(&fsm, FsmEvent::Start).await != FsmOutcome::Ok {
            return Err(Error::HandshakeFailed("could not start the handshake".into()));
        }

        loop {
            if state_rx.changed().await.is_err() {
                return Err(Error::HandshakeFailed("state machine vanished".into()));
            }
            match *state_rx.borrow_and_update() {
                FsmState::Established => break,
                FsmState::Closed => {
                    return Err(Error::HandshakeFailed(
                        "connection closed during handshake".into(),
                    ))
                }
                _ => {}
            }
        }

        let id = format!("{remote}#{}", CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, "IDSCP2 connection ready");
        Ok(Self {
            id,
            remote,
            fsm,
            state_rx,
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote
    }

    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() != FsmState::Closed
    }

    /// Send and wait until the session is in a state that admits the send,
    /// up to `timeout`.
    pub async fn blocking_send(
        &self,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let payload = payload.into();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut state_rx = self.state_rx.clone();

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                FsmState::Closed => return Err(Error::NotConnected),
                FsmState::Established => {
                    return match Fsm::dispatch(&self.fsm, FsmEvent::SendData(payload)).await {
                        FsmOutcome::Ok => Ok(()),
                        _ => Err(Error::NotConnected),
                    };
                }
                _ => {}
            }

            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Error::NotConnected),
                Err(_) => return Err(Error::Timeout("blocking send timed out".into())),
            }
        }
    }

    /// Fire-and-forget send; buffered when the session is still handshaking
    /// or re-attesting.
    pub async fn non_blocking_send(&self, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        match Fsm::dispatch(&self.fsm, FsmEvent::SendData(payload.into())).await {
            FsmOutcome::Ok => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Trigger re-attestation of the peer ahead of the periodic timer. The
    /// request is ignored while a renegotiation is already running.
    pub async fn repeat_ra(&self) -> Result<(), Error> {
        match Fsm::dispatch(&self.fsm, FsmEvent::RepeatRa).await {
            FsmOutcome::NotConnected => Err(Error::NotConnected),
            _ => Ok(()),
        }
    }

    /// Close the session with a `Close(USER_SHUTDOWN)` record.
    pub async fn close(&self) -> Result<(), Error> {
        match Fsm::dispatch(&self.fsm, FsmEvent::Stop).await {
            FsmOutcome::NotConnected => Err(Error::NotConnected),
            _ => Ok(()),
        }
    }

    /// Release queued inbound messages to the listeners. Call after all
    /// listeners are attached; messages received earlier are not lost.
    pub fn unlock_messaging(&self) {
        let _ = self.events.unlocked.send(true);
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.events
            .message_listeners
            .lock()
            .expect("listeners")
            .push(listener);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.events
            .connection_listeners
            .lock()
            .expect("listeners")
            .push(listener);
    }
}

impl Drop for Idscp2Connection {
    fn drop(&mut self) {
        if *self.state_rx.borrow() == FsmState::Closed {
            return;
        }
        // close the session if the handle is dropped without close()
        let fsm = self.fsm.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                Fsm::dispatch(&fsm, FsmEvent::Stop).await;
            });
        }
    }
}
