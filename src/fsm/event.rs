//! Events and outcome codes of the connection state machine.

use std::fmt;

use crate::messages::IdscpMessage;

/// The addressable states. `Closed` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmState {
    Closed,
    WaitForHello,
    /// Both local drivers running.
    WaitForRa,
    /// Verifier done, prover still running.
    WaitForRaProver,
    /// Prover done, verifier still running.
    WaitForRaVerifier,
    /// Fresh peer DAT outstanding, prover (re)running afterwards as well.
    WaitForDatAndRa,
    /// Fresh peer DAT outstanding, only the verifier re-runs afterwards.
    WaitForDatAndRaVerifier,
    /// One `Data` record outstanding in acknowledgement mode.
    WaitForAck,
    Established,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FsmState::Closed => "Closed",
            FsmState::WaitForHello => "WaitForHello",
            FsmState::WaitForRa => "WaitForRa",
            FsmState::WaitForRaProver => "WaitForRaProver",
            FsmState::WaitForRaVerifier => "WaitForRaVerifier",
            FsmState::WaitForDatAndRa => "WaitForDatAndRa",
            FsmState::WaitForDatAndRaVerifier => "WaitForDatAndRaVerifier",
            FsmState::WaitForAck => "WaitForAck",
            FsmState::Established => "Established",
        };
        write!(f, "{name}")
    }
}

/// Everything that can be fed into [`Fsm::process_event`](super::Fsm).
#[derive(Debug, Clone)]
pub(crate) enum FsmEvent {
    // user-initiated
    Start,
    Stop,
    SendData(Vec<u8>),
    RepeatRa,
    // secure channel
    Message(IdscpMessage),
    ChannelError(String),
    ChannelClosed,
    // attestation drivers; `driver` is checked against the current handle so
    // stale callbacks from stopped drivers are discarded
    RaProverMessage { driver: u64, data: Vec<u8> },
    RaProverCompleted { driver: u64 },
    RaProverFailed { driver: u64 },
    RaVerifierMessage { driver: u64, data: Vec<u8> },
    RaVerifierCompleted { driver: u64 },
    RaVerifierFailed { driver: u64 },
    // timers
    HandshakeTimeout,
    VerifierTimeout,
    RaTimerExpired,
    DatTimerExpired,
    AckTimerExpired,
}

impl FsmEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            FsmEvent::Start => "Start",
            FsmEvent::Stop => "Stop",
            FsmEvent::SendData(_) => "SendData",
            FsmEvent::RepeatRa => "RepeatRa",
            FsmEvent::Message(message) => message.variant(),
            FsmEvent::ChannelError(_) => "ChannelError",
            FsmEvent::ChannelClosed => "ChannelClosed",
            FsmEvent::RaProverMessage { .. } => "RaProverMessage",
            FsmEvent::RaProverCompleted { .. } => "RaProverCompleted",
            FsmEvent::RaProverFailed { .. } => "RaProverFailed",
            FsmEvent::RaVerifierMessage { .. } => "RaVerifierMessage",
            FsmEvent::RaVerifierCompleted { .. } => "RaVerifierCompleted",
            FsmEvent::RaVerifierFailed { .. } => "RaVerifierFailed",
            FsmEvent::HandshakeTimeout => "HandshakeTimeout",
            FsmEvent::VerifierTimeout => "VerifierTimeout",
            FsmEvent::RaTimerExpired => "RaTimerExpired",
            FsmEvent::DatTimerExpired => "DatTimerExpired",
            FsmEvent::AckTimerExpired => "AckTimerExpired",
        }
    }
}

/// Result code of one transition, reported to user-initiated callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FsmOutcome {
    Ok,
    NotConnected,
    IoError,
    RaError,
    InvalidDat,
    Timeout,
    /// Spurious or out-of-phase event; the state machine stays put.
    UnknownTransition,
}
