//! The IDSCP2 connection state machine.
//!
//! One [`Fsm`] drives a single connection: the Hello exchange, the
//! bidirectional attestation loop, DAT renewal, the optional stop-and-wait
//! acknowledgement mode, and teardown. Exactly one transition executes at a
//! time — every entry point locks the FSM mutex for the whole transition,
//! which is also what makes timer cancellation and stale-driver filtering
//! race-free (see [`timer`]).
//!
//! Transitions are written as one `match` over `(state, event)`, with the
//! session-wide events (stop, channel failure, peer close, timeouts, driver
//! verdicts) handled ahead of the per-state arms. Unmatched pairs fall
//! through to a no-transition arm: the machine stays put and reports
//! [`FsmOutcome::UnknownTransition`].

mod event;
mod timer;

pub use event::FsmState;
pub(crate) use event::{FsmEvent, FsmOutcome};

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::{
    config::Idscp2Configuration,
    daps::DapsDriver,
    error::Error,
    messages::{CloseCause, IdscpHello, IdscpMessage},
    ra::{RaDriverHandle, RaDriverListener, RaError, RaRegistry, RaRole},
    transport::{SecureChannelEndpoint, TransportError},
};

use timer::FsmTimer;

pub(crate) type SharedFsm = Arc<Mutex<Fsm>>;

/// Callbacks from the state machine into the owning connection. Implemented
/// by the connection's event fan-out; invoked with the FSM lock held, so
/// implementations must only hand off and never block.
pub(crate) trait UpperLayer: Send + Sync {
    fn deliver(&self, payload: Vec<u8>);
    fn error(&self, error: Error);
    fn closed(&self);
}

pub(crate) struct Fsm {
    state: FsmState,
    config: Arc<Idscp2Configuration>,
    channel: Arc<dyn SecureChannelEndpoint>,
    daps: Arc<dyn DapsDriver>,
    registry: Arc<RaRegistry>,
    upper: Arc<dyn UpperLayer>,
    weak: Weak<Mutex<Fsm>>,
    state_tx: watch::Sender<FsmState>,

    prover: Option<RaDriverHandle>,
    verifier: Option<RaDriverHandle>,
    prover_suite: Option<String>,
    verifier_suite: Option<String>,

    handshake_timer: FsmTimer,
    verifier_timer: FsmTimer,
    ra_timer: FsmTimer,
    dat_timer: FsmTimer,
    ack_timer: FsmTimer,

    /// Set once the first attestation round completed; gates data delivery
    /// during later re-attestation phases.
    attested_once: bool,
    send_bit: bool,
    expect_bit: bool,
    /// Payload of the one outstanding `Data` record in ack mode.
    ack_pending: Option<Vec<u8>>,
    ack_retries: u32,
    /// One user payload queued while the session is not ready to send.
    send_buffer: Option<Vec<u8>>,
    closed_notified: bool,
    next_driver_id: u64,
}

impl Fsm {
    pub(crate) fn spawn(
        config: Arc<Idscp2Configuration>,
        channel: Arc<dyn SecureChannelEndpoint>,
        daps: Arc<dyn DapsDriver>,
        registry: Arc<RaRegistry>,
        upper: Arc<dyn UpperLayer>,
    ) -> (SharedFsm, watch::Receiver<FsmState>) {
        let (state_tx, state_rx) = watch::channel(FsmState::Closed);
        let fsm = Arc::new_cyclic(|weak| {
            Mutex::new(Fsm {
                state: FsmState::Closed,
                config,
                channel,
                daps,
                registry,
                upper,
                weak: weak.clone(),
                state_tx,
                prover: None,
                verifier: None,
                prover_suite: None,
                verifier_suite: None,
                handshake_timer: FsmTimer::new("handshake"),
                verifier_timer: FsmTimer::new("verifier_handshake"),
                ra_timer: FsmTimer::new("ra"),
                dat_timer: FsmTimer::new("dat"),
                ack_timer: FsmTimer::new("ack"),
                attested_once: false,
                send_bit: false,
                expect_bit: false,
                ack_pending: None,
                ack_retries: 0,
                send_buffer: None,
                closed_notified: false,
                next_driver_id: 0,
            })
        });
        (fsm, state_rx)
    }

    /// Lock the machine and run one transition.
    pub(crate) async fn dispatch(fsm: &SharedFsm, event: FsmEvent) -> FsmOutcome {
        let mut guard = fsm.lock().await;
        guard.process_event(event).await
    }

    pub(crate) async fn process_event(&mut self, event: FsmEvent) -> FsmOutcome {
        if self.is_stale_driver_event(&event) {
            tracing::trace!(event = event.name(), "discarding event from a stale driver");
            return FsmOutcome::Ok;
        }
        tracing::trace!(state = %self.state, event = event.name(), "processing event");

        let outcome = match (self.state, event) {
            // ---- terminal state ----
            (FsmState::Closed, FsmEvent::Start) => self.start_handshake().await,
            (
                FsmState::Closed,
                FsmEvent::Stop | FsmEvent::SendData(_) | FsmEvent::RepeatRa,
            ) => FsmOutcome::NotConnected,
            (FsmState::Closed, _) => FsmOutcome::UnknownTransition,

            // ---- session-wide events ----
            (_, FsmEvent::Start) => FsmOutcome::UnknownTransition,
            (_, FsmEvent::Stop) => {
                self.send_record(IdscpMessage::close(CloseCause::UserShutdown, "user shutdown"))
                    .await;
                self.shutdown(None);
                FsmOutcome::Ok
            }
            (_, FsmEvent::ChannelError(reason)) => {
                self.shutdown(Some(Error::Transport(TransportError::ChannelClosed(reason))));
                FsmOutcome::IoError
            }
            (_, FsmEvent::ChannelClosed) => {
                self.shutdown(Some(Error::Transport(TransportError::ChannelClosed(
                    "peer closed the transport".into(),
                ))));
                FsmOutcome::IoError
            }
            (_, FsmEvent::Message(IdscpMessage::Close(close))) => {
                tracing::debug!(cause = %close.cause_code, "peer closed the session");
                let error = (close.cause_code != CloseCause::UserShutdown).then(|| {
                    Error::PeerClosed(format!("{} ({})", close.cause_code, close.cause_msg))
                });
                self.shutdown(error);
                FsmOutcome::Ok
            }
            (_, FsmEvent::HandshakeTimeout) => {
                self.send_record(IdscpMessage::close(CloseCause::Timeout, "handshake timed out"))
                    .await;
                self.shutdown(Some(Error::Timeout("handshake timed out".into())));
                FsmOutcome::Timeout
            }
            (_, FsmEvent::VerifierTimeout) => {
                self.send_record(IdscpMessage::close(
                    CloseCause::Timeout,
                    "re-attestation timed out",
                ))
                .await;
                self.shutdown(Some(Error::Timeout("re-attestation timed out".into())));
                FsmOutcome::Timeout
            }

            // driver verdicts that end the session, wherever they surface
            (_, FsmEvent::RaProverFailed { .. }) => {
                self.prover = None;
                self.send_record(IdscpMessage::close(
                    CloseCause::RaProverFailed,
                    "prover reported failure",
                ))
                .await;
                self.shutdown(Some(Error::Ra(RaError::Failed("prover reported failure".into()))));
                FsmOutcome::RaError
            }
            (_, FsmEvent::RaVerifierFailed { .. }) => {
                self.verifier = None;
                self.send_record(IdscpMessage::close(
                    CloseCause::RaVerifierFailed,
                    "verifier rejected the peer",
                ))
                .await;
                self.shutdown(Some(Error::Ra(RaError::Failed(
                    "verifier rejected the peer".into(),
                ))));
                FsmOutcome::RaError
            }

            // wire RA frames are tagged by the emitting role and delegated to
            // the local counterpart driver
            (_, FsmEvent::Message(IdscpMessage::RaProver { data })) => match &self.verifier {
                Some(verifier) => {
                    verifier.delegate(data);
                    FsmOutcome::Ok
                }
                None => FsmOutcome::UnknownTransition,
            },
            (_, FsmEvent::Message(IdscpMessage::RaVerifier { data })) => match &self.prover {
                Some(prover) => {
                    prover.delegate(data);
                    FsmOutcome::Ok
                }
                None => FsmOutcome::UnknownTransition,
            },

            // local driver output becomes wire frames
            (_, FsmEvent::RaProverMessage { data, .. }) => {
                if self.send_or_fail(IdscpMessage::RaProver { data }).await {
                    FsmOutcome::Ok
                } else {
                    FsmOutcome::IoError
                }
            }
            (_, FsmEvent::RaVerifierMessage { data, .. }) => {
                if self.send_or_fail(IdscpMessage::RaVerifier { data }).await {
                    FsmOutcome::Ok
                } else {
                    FsmOutcome::IoError
                }
            }

            // inbound user data is live from the first attestation on
            (
                _,
                FsmEvent::Message(IdscpMessage::Data {
                    payload,
                    alternating_bit,
                }),
            ) => self.receive_data(payload, alternating_bit).await,

            // ---- handshake ----
            (FsmState::WaitForHello, FsmEvent::Message(IdscpMessage::Hello(hello))) => {
                self.handle_hello(hello).await
            }

            // ---- attestation progress ----
            (FsmState::WaitForRa, FsmEvent::RaProverCompleted { .. }) => {
                self.prover = None;
                self.state = FsmState::WaitForRaVerifier;
                FsmOutcome::Ok
            }
            (FsmState::WaitForRa, FsmEvent::RaVerifierCompleted { .. }) => {
                self.on_verifier_ok();
                self.state = FsmState::WaitForRaProver;
                FsmOutcome::Ok
            }
            (FsmState::WaitForRaProver, FsmEvent::RaProverCompleted { .. }) => {
                self.prover = None;
                self.finish_attestation().await
            }
            (FsmState::WaitForRaVerifier, FsmEvent::RaVerifierCompleted { .. }) => {
                self.on_verifier_ok();
                self.finish_attestation().await
            }
            (FsmState::WaitForDatAndRa, FsmEvent::RaProverCompleted { .. }) => {
                self.prover = None;
                self.state = FsmState::WaitForDatAndRaVerifier;
                FsmOutcome::Ok
            }

            // ---- DAT renewal ----
            (
                FsmState::WaitForDatAndRa | FsmState::WaitForDatAndRaVerifier,
                FsmEvent::Message(IdscpMessage::Dat { token }),
            ) => self.handle_fresh_dat(token).await,
            (state, FsmEvent::Message(IdscpMessage::DatExpired))
                if state != FsmState::WaitForHello =>
            {
                self.handle_peer_dat_expired().await
            }
            (state, FsmEvent::DatTimerExpired) if state != FsmState::WaitForHello => {
                self.handle_dat_timer().await
            }

            // ---- re-attestation ----
            (
                FsmState::Established | FsmState::WaitForAck,
                FsmEvent::Message(IdscpMessage::ReRa { cause }),
            ) => {
                tracing::debug!(%cause, "peer requested re-attestation");
                self.restart_prover_flow().await
            }
            (
                FsmState::Established | FsmState::WaitForAck,
                FsmEvent::RepeatRa | FsmEvent::RaTimerExpired,
            ) => self.repeat_ra_flow().await,

            // ---- user data ----
            (FsmState::Established, FsmEvent::SendData(payload)) => {
                self.send_user_data(payload).await
            }
            (_, FsmEvent::SendData(payload)) => {
                self.buffer_send(payload);
                FsmOutcome::Ok
            }

            // ---- acknowledgement mode ----
            (FsmState::WaitForAck, FsmEvent::Message(IdscpMessage::Ack { alternating_bit })) => {
                self.handle_ack(alternating_bit).await
            }
            (FsmState::WaitForAck, FsmEvent::AckTimerExpired) => self.retransmit().await,

            (state, event) => {
                tracing::debug!(state = %state, event = event.name(), "no transition");
                FsmOutcome::UnknownTransition
            }
        };

        if self.state != *self.state_tx.borrow() {
            let _ = self.state_tx.send(self.state);
        }
        outcome
    }

    // ---- transitions ----

    async fn start_handshake(&mut self) -> FsmOutcome {
        tracing::debug!(remote = %self.channel.remote_peer(), "starting IDSCP2 handshake");
        let token = self.daps.request_token().await;
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!("cannot acquire local DAT: {err}");
                self.send_record(IdscpMessage::close(CloseCause::Error, "cannot acquire DAT"))
                    .await;
                self.shutdown(Some(Error::Daps(err)));
                return FsmOutcome::IoError;
            }
        };

        self.handshake_timer.start(
            self.config.handshake_timeout(),
            self.weak.clone(),
            FsmEvent::HandshakeTimeout,
        );

        let hello = IdscpMessage::Hello(IdscpHello {
            dat: token,
            supported_ra_suites: self.config.supported_ra_suites.clone(),
            expected_ra_suites: self.config.expected_ra_suites.clone(),
        });
        if !self.send_or_fail(hello).await {
            return FsmOutcome::IoError;
        }

        self.state = FsmState::WaitForHello;
        FsmOutcome::Ok
    }

    async fn handle_hello(&mut self, hello: IdscpHello) -> FsmOutcome {
        let Some(peer_certificate) = self.channel.peer_certificate().map(<[u8]>::to_vec) else {
            self.send_record(IdscpMessage::close(
                CloseCause::HandshakeFailed,
                "peer certificate missing",
            ))
            .await;
            self.shutdown(Some(Error::HandshakeFailed("peer certificate missing".into())));
            return FsmOutcome::InvalidDat;
        };

        let verdict = self
            .daps
            .verify_token(&hello.dat, Some(peer_certificate.as_slice()))
            .await;
        let validity = match verdict {
            Ok(validity) => validity,
            Err(err) => {
                tracing::warn!("peer DAT rejected: {err}");
                self.send_record(IdscpMessage::close(CloseCause::DatInvalid, "DAT rejected"))
                    .await;
                self.shutdown(Some(Error::Daps(err)));
                return FsmOutcome::InvalidDat;
            }
        };
        self.start_dat_timer(validity);

        // the peer ranks what our prover runs, we rank what our verifier runs
        let prover_suite =
            select_ra_suite(&hello.expected_ra_suites, &self.config.supported_ra_suites)
                .map(str::to_string);
        let verifier_suite =
            select_ra_suite(&self.config.expected_ra_suites, &hello.supported_ra_suites)
                .map(str::to_string);
        let (Some(prover_suite), Some(verifier_suite)) = (prover_suite, verifier_suite) else {
            tracing::warn!("no common RA suite with peer");
            self.send_record(IdscpMessage::close(
                CloseCause::HandshakeFailed,
                "no common RA suite",
            ))
            .await;
            self.shutdown(Some(Error::HandshakeFailed("no common RA suite".into())));
            return FsmOutcome::RaError;
        };
        tracing::debug!(prover = %prover_suite, verifier = %verifier_suite, "negotiated RA suites");
        self.prover_suite = Some(prover_suite);
        self.verifier_suite = Some(verifier_suite);

        if let Err(err) = self.restart_prover() {
            return self.fail_ra(err).await;
        }
        if let Err(err) = self.restart_verifier() {
            return self.fail_ra(err).await;
        }

        self.state = FsmState::WaitForRa;
        FsmOutcome::Ok
    }

    fn on_verifier_ok(&mut self) {
        self.verifier = None;
        self.verifier_timer.cancel();
        self.ra_timer.start(
            self.config.ra_timeout(),
            self.weak.clone(),
            FsmEvent::RaTimerExpired,
        );
    }

    async fn finish_attestation(&mut self) -> FsmOutcome {
        self.handshake_timer.cancel();
        if !self.attested_once {
            self.attested_once = true;
            tracing::info!(remote = %self.channel.remote_peer(), "connection established");
        }
        self.enter_established().await
    }

    async fn enter_established(&mut self) -> FsmOutcome {
        self.state = FsmState::Established;
        if self.config.ack_mode {
            if let Some(pending) = self.ack_pending.clone() {
                // an unacknowledged record survived re-attestation
                return self.transmit_pending(pending).await;
            }
        }
        if let Some(buffered) = self.send_buffer.take() {
            return self.send_user_data(buffered).await;
        }
        FsmOutcome::Ok
    }

    async fn send_user_data(&mut self, payload: Vec<u8>) -> FsmOutcome {
        if self.config.ack_mode {
            self.ack_pending = Some(payload.clone());
            self.ack_retries = 0;
            self.transmit_pending(payload).await
        } else if self
            .send_or_fail(IdscpMessage::Data {
                payload,
                alternating_bit: false,
            })
            .await
        {
            FsmOutcome::Ok
        } else {
            FsmOutcome::IoError
        }
    }

    async fn transmit_pending(&mut self, payload: Vec<u8>) -> FsmOutcome {
        let record = IdscpMessage::Data {
            payload,
            alternating_bit: self.send_bit,
        };
        if !self.send_or_fail(record).await {
            return FsmOutcome::IoError;
        }
        self.ack_timer.start(
            self.config.ack_timeout(),
            self.weak.clone(),
            FsmEvent::AckTimerExpired,
        );
        self.state = FsmState::WaitForAck;
        FsmOutcome::Ok
    }

    async fn handle_ack(&mut self, bit: bool) -> FsmOutcome {
        if bit != self.send_bit {
            tracing::trace!("acknowledgement for a stale record, ignored");
            return FsmOutcome::Ok;
        }
        self.ack_timer.cancel();
        self.ack_pending = None;
        self.ack_retries = 0;
        self.send_bit = !self.send_bit;
        self.enter_established().await
    }

    async fn retransmit(&mut self) -> FsmOutcome {
        let Some(pending) = self.ack_pending.clone() else {
            return FsmOutcome::UnknownTransition;
        };
        if self.ack_retries >= self.config.max_ack_retries {
            tracing::warn!(
                retries = self.ack_retries,
                "giving up on unacknowledged data"
            );
            self.send_record(IdscpMessage::close(CloseCause::Timeout, "unacknowledged data"))
                .await;
            self.shutdown(Some(Error::Timeout("data was never acknowledged".into())));
            return FsmOutcome::Timeout;
        }
        self.ack_retries += 1;
        tracing::debug!(attempt = self.ack_retries, "retransmitting unacknowledged data");
        self.transmit_pending(pending).await
    }

    async fn receive_data(&mut self, payload: Vec<u8>, bit: bool) -> FsmOutcome {
        if !self.attested_once {
            return FsmOutcome::UnknownTransition;
        }
        if self.config.ack_mode {
            // always acknowledge; deliver only on the expected bit
            if !self.send_or_fail(IdscpMessage::Ack { alternating_bit: bit }).await {
                return FsmOutcome::IoError;
            }
            if bit == self.expect_bit {
                self.expect_bit = !self.expect_bit;
                self.upper.deliver(payload);
            } else {
                tracing::debug!("duplicate data record acknowledged and dropped");
            }
        } else {
            self.upper.deliver(payload);
        }
        FsmOutcome::Ok
    }

    /// Local re-attestation trigger: ask the peer to re-prove and re-run our
    /// verifier against it.
    async fn repeat_ra_flow(&mut self) -> FsmOutcome {
        self.ra_timer.cancel();
        self.ack_timer.cancel();
        if !self
            .send_or_fail(IdscpMessage::ReRa {
                cause: "re-attestation due".into(),
            })
            .await
        {
            return FsmOutcome::IoError;
        }
        if let Err(err) = self.restart_verifier() {
            return self.fail_ra(err).await;
        }
        self.verifier_timer.start(
            self.config.verifier_handshake_timeout(),
            self.weak.clone(),
            FsmEvent::VerifierTimeout,
        );
        self.state = FsmState::WaitForRaVerifier;
        FsmOutcome::Ok
    }

    /// Peer-triggered re-attestation: re-run our prover.
    async fn restart_prover_flow(&mut self) -> FsmOutcome {
        self.ack_timer.cancel();
        if let Err(err) = self.restart_prover() {
            return self.fail_ra(err).await;
        }
        self.state = FsmState::WaitForRaProver;
        FsmOutcome::Ok
    }

    /// The peer flagged our DAT as expired: answer with a fresh token and
    /// re-prove.
    async fn handle_peer_dat_expired(&mut self) -> FsmOutcome {
        tracing::debug!("peer flagged our DAT as expired");
        let token = self.daps.request_token().await;
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!("cannot renew local DAT: {err}");
                self.send_record(IdscpMessage::close(CloseCause::Error, "cannot renew DAT"))
                    .await;
                self.shutdown(Some(Error::Daps(err)));
                return FsmOutcome::IoError;
            }
        };
        if !self.send_or_fail(IdscpMessage::Dat { token }).await {
            return FsmOutcome::IoError;
        }
        self.ack_timer.cancel();
        if let Err(err) = self.restart_prover() {
            return self.fail_ra(err).await;
        }
        self.state = match self.state {
            FsmState::WaitForRa | FsmState::WaitForRaVerifier => FsmState::WaitForRa,
            FsmState::WaitForDatAndRa | FsmState::WaitForDatAndRaVerifier => {
                FsmState::WaitForDatAndRa
            }
            _ => FsmState::WaitForRaProver,
        };
        FsmOutcome::Ok
    }

    /// The peer's DAT reached its renewal deadline: demand a fresh one and
    /// suspend the verifier until it arrives.
    async fn handle_dat_timer(&mut self) -> FsmOutcome {
        tracing::debug!("peer DAT reached its renewal deadline");
        if let Some(verifier) = self.verifier.take() {
            verifier.stop();
        }
        self.ra_timer.cancel();
        self.verifier_timer.cancel();
        self.ack_timer.cancel();
        if !self.send_or_fail(IdscpMessage::DatExpired).await {
            return FsmOutcome::IoError;
        }
        // the renegotiation is bounded like a handshake
        self.handshake_timer.start(
            self.config.handshake_timeout(),
            self.weak.clone(),
            FsmEvent::HandshakeTimeout,
        );
        self.state = match self.state {
            FsmState::WaitForRa | FsmState::WaitForRaProver | FsmState::WaitForDatAndRa => {
                FsmState::WaitForDatAndRa
            }
            _ => FsmState::WaitForDatAndRaVerifier,
        };
        FsmOutcome::Ok
    }

    async fn handle_fresh_dat(&mut self, token: Vec<u8>) -> FsmOutcome {
        let peer_certificate = self.channel.peer_certificate().map(<[u8]>::to_vec);
        let verdict = self
            .daps
            .verify_token(&token, peer_certificate.as_deref())
            .await;
        match verdict {
            Ok(validity) => {
                tracing::debug!(validity_secs = validity.as_secs(), "peer DAT renewed");
                self.start_dat_timer(validity);
                if let Err(err) = self.restart_verifier() {
                    return self.fail_ra(err).await;
                }
                self.state = match self.state {
                    FsmState::WaitForDatAndRa => FsmState::WaitForRa,
                    _ => FsmState::WaitForRaVerifier,
                };
                FsmOutcome::Ok
            }
            Err(err) => {
                tracing::warn!("renewed peer DAT rejected: {err}");
                self.send_record(IdscpMessage::close(CloseCause::DatInvalid, "DAT rejected"))
                    .await;
                self.shutdown(Some(Error::Daps(err)));
                FsmOutcome::InvalidDat
            }
        }
    }

    // ---- helpers ----

    fn start_dat_timer(&mut self, validity: Duration) {
        let delay = validity.mul_f64(self.config.daps.token_renewal_threshold);
        self.dat_timer
            .start(delay, self.weak.clone(), FsmEvent::DatTimerExpired);
    }

    fn restart_prover(&mut self) -> Result<(), RaError> {
        if let Some(prover) = self.prover.take() {
            prover.stop();
        }
        let suite = self
            .prover_suite
            .clone()
            .ok_or_else(|| RaError::UnknownDriver("<no negotiated prover suite>".into()))?;
        self.next_driver_id += 1;
        let listener =
            RaDriverListener::new(self.weak.clone(), RaRole::Prover, self.next_driver_id);
        let handle = self.registry.start_prover(&suite, listener)?;
        tracing::debug!(%suite, id = handle.id(), "started RA prover");
        self.prover = Some(handle);
        Ok(())
    }

    fn restart_verifier(&mut self) -> Result<(), RaError> {
        if let Some(verifier) = self.verifier.take() {
            verifier.stop();
        }
        let suite = self
            .verifier_suite
            .clone()
            .ok_or_else(|| RaError::UnknownDriver("<no negotiated verifier suite>".into()))?;
        self.next_driver_id += 1;
        let listener =
            RaDriverListener::new(self.weak.clone(), RaRole::Verifier, self.next_driver_id);
        let handle = self.registry.start_verifier(&suite, listener)?;
        tracing::debug!(%suite, id = handle.id(), "started RA verifier");
        self.verifier = Some(handle);
        Ok(())
    }

    async fn fail_ra(&mut self, err: RaError) -> FsmOutcome {
        tracing::warn!("cannot run RA driver: {err}");
        self.send_record(IdscpMessage::close(
            CloseCause::Error,
            "attestation driver unavailable",
        ))
        .await;
        self.shutdown(Some(Error::Ra(err)));
        FsmOutcome::RaError
    }

    fn buffer_send(&mut self, payload: Vec<u8>) {
        if self.send_buffer.replace(payload).is_some() {
            tracing::warn!("send buffer overwritten before the session was ready");
        }
    }

    async fn send_record(&mut self, message: IdscpMessage) -> bool {
        tracing::trace!(variant = message.variant(), "sending record");
        self.channel.send(message.encode()).await
    }

    /// Send, and on transport failure close silently: no Close frame is
    /// attempted over a transport that just refused a write.
    async fn send_or_fail(&mut self, message: IdscpMessage) -> bool {
        if self.send_record(message).await {
            return true;
        }
        self.shutdown(Some(Error::Transport(TransportError::ChannelClosed(
            "record write failed".into(),
        ))));
        false
    }

    fn shutdown(&mut self, error: Option<Error>) {
        if let Some(prover) = self.prover.take() {
            prover.stop();
        }
        if let Some(verifier) = self.verifier.take() {
            verifier.stop();
        }
        self.handshake_timer.cancel();
        self.verifier_timer.cancel();
        self.ra_timer.cancel();
        self.dat_timer.cancel();
        self.ack_timer.cancel();
        self.channel.close();

        if let Some(error) = error {
            self.upper.error(error);
        }
        if !self.closed_notified {
            self.closed_notified = true;
            self.upper.closed();
        }
        self.state = FsmState::Closed;
    }

    fn is_stale_driver_event(&self, event: &FsmEvent) -> bool {
        match event {
            FsmEvent::RaProverMessage { driver, .. }
            | FsmEvent::RaProverCompleted { driver }
            | FsmEvent::RaProverFailed { driver } => {
                self.prover.as_ref().map(|handle| handle.id()) != Some(*driver)
            }
            FsmEvent::RaVerifierMessage { driver, .. }
            | FsmEvent::RaVerifierCompleted { driver }
            | FsmEvent::RaVerifierFailed { driver } => {
                self.verifier.as_ref().map(|handle| handle.id()) != Some(*driver)
            }
            _ => false,
        }
    }
}

/// Ordered intersection: the first of `preferred` that `available` offers.
fn select_ra_suite<'a>(preferred: &'a [String], available: &[String]) -> Option<&'a str> {
    preferred
        .iter()
        .find(|suite| available.contains(*suite))
        .map(String::as_str)
}
