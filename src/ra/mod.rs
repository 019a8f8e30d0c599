//! Pluggable remote-attestation drivers.
//!
//! A driver runs on its own task and talks to the state machine only through
//! the [`RaDriverListener`] capability it is handed at start: protocol
//! payloads via [`send_message`](RaDriverListener::send_message), a terminal
//! verdict via [`completed`](RaDriverListener::completed) or
//! [`failed`](RaDriverListener::failed). Peer frames reach the driver through
//! the receiver in its [`RaDriverContext`].
//!
//! Drivers are registered under their suite identifier in an [`RaRegistry`],
//! which is passed to connections explicitly rather than living in process
//! globals.

pub mod dummy;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::fsm::{Fsm, FsmEvent};

#[derive(thiserror::Error, Debug)]
pub enum RaError {
    #[error("no RA driver registered under '{0}'")]
    UnknownDriver(String),
    #[error("RA driver '{0}' failed to start: {1}")]
    DriverStart(String, String),
    #[error("attestation failed: {0}")]
    Failed(String),
}

/// Which side of the attestation exchange a driver implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RaRole {
    Prover,
    Verifier,
}

/// Everything a driver needs to run one attestation exchange.
pub struct RaDriverContext {
    /// Frames relayed from the peer's counterpart driver.
    pub peer_messages: mpsc::Receiver<Vec<u8>>,
    /// Callback capability into the owning state machine.
    pub listener: RaDriverListener,
    /// Driver-specific configuration given at registration.
    pub config: Option<serde_json::Value>,
}

#[async_trait]
pub trait RaProverDriver: Send {
    /// Drive the prover side of the exchange to a terminal verdict.
    async fn run(self: Box<Self>, ctx: RaDriverContext);
}

#[async_trait]
pub trait RaVerifierDriver: Send {
    /// Drive the verifier side of the exchange to a terminal verdict.
    async fn run(self: Box<Self>, ctx: RaDriverContext);
}

pub trait RaProverFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn RaProverDriver>, String>;
}

pub trait RaVerifierFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn RaVerifierDriver>, String>;
}

/// Weak callback capability a driver holds into its state machine.
///
/// Holding it does not keep the connection alive, and events from a driver
/// that has been stopped or replaced are discarded by the state machine.
pub struct RaDriverListener {
    fsm: Weak<tokio::sync::Mutex<Fsm>>,
    role: RaRole,
    driver_id: u64,
}

impl RaDriverListener {
    pub(crate) fn new(fsm: Weak<tokio::sync::Mutex<Fsm>>, role: RaRole, driver_id: u64) -> Self {
        Self {
            fsm,
            role,
            driver_id,
        }
    }

    pub(crate) fn driver_id(&self) -> u64 {
        self.driver_id
    }

    /// Forward a protocol payload to the peer's counterpart driver.
    pub async fn send_message(&self, data: Vec<u8>) {
        let event = match self.role {
            RaRole::Prover => FsmEvent::RaProverMessage {
                driver: self.driver_id,
                data,
            },
            RaRole::Verifier => FsmEvent::RaVerifierMessage {
                driver: self.driver_id,
                data,
            },
        };
        self.dispatch(event).await;
    }

    /// Report successful attestation; the driver should return afterwards.
    pub async fn completed(&self) {
        let event = match self.role {
            RaRole::Prover => FsmEvent::RaProverCompleted {
                driver: self.driver_id,
            },
            RaRole::Verifier => FsmEvent::RaVerifierCompleted {
                driver: self.driver_id,
            },
        };
        self.dispatch(event).await;
    }

    /// Report failed attestation; the session will be closed.
    pub async fn failed(&self) {
        let event = match self.role {
            RaRole::Prover => FsmEvent::RaProverFailed {
                driver: self.driver_id,
            },
            RaRole::Verifier => FsmEvent::RaVerifierFailed {
                driver: self.driver_id,
            },
        };
        self.dispatch(event).await;
    }

    async fn dispatch(&self, event: FsmEvent) {
        if let Some(fsm) = self.fsm.upgrade() {
            Fsm::dispatch(&fsm, event).await;
        }
    }
}

/// Handle the state machine keeps on a running driver task.
#[derive(Debug)]
pub struct RaDriverHandle {
    id: u64,
    suite: String,
    input: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl RaDriverHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn suite(&self) -> &str {
        &self.suite
    }

    /// Hand a peer frame to the driver. Never blocks: when the driver does
    /// not drain its queue, the frame is dropped with a warning rather than
    /// stalling the state machine.
    pub(crate) fn delegate(&self, data: Vec<u8>) {
        if let Err(err) = self.input.try_send(data) {
            tracing::warn!(suite = %self.suite, "RA driver not accepting frames: {err}");
        }
    }

    /// Stop the driver promptly; idempotent.
    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RaDriverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ProverEntry {
    factory: Arc<dyn RaProverFactory>,
    config: Option<serde_json::Value>,
}

struct VerifierEntry {
    factory: Arc<dyn RaVerifierFactory>,
    config: Option<serde_json::Value>,
}

/// Named registry of attestation driver factories.
#[derive(Default)]
pub struct RaRegistry {
    provers: RwLock<HashMap<String, ProverEntry>>,
    verifiers: RwLock<HashMap<String, VerifierEntry>>,
}

/// Peer-frame queue depth per driver.
const DRIVER_QUEUE: usize = 16;

impl RaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the dummy suite wired up, for tests and demos.
    pub fn with_dummy_drivers() -> Arc<Self> {
        let registry = Self::new();
        registry.register_prover(
            dummy::DUMMY_RA_SUITE,
            Arc::new(dummy::DummyRaProverFactory),
            None,
        );
        registry.register_verifier(
            dummy::DUMMY_RA_SUITE,
            Arc::new(dummy::DummyRaVerifierFactory),
            None,
        );
        Arc::new(registry)
    }

    /// Register a prover factory, replacing any prior entry under `suite`.
    pub fn register_prover(
        &self,
        suite: impl Into<String>,
        factory: Arc<dyn RaProverFactory>,
        config: Option<serde_json::Value>,
    ) {
        self.provers
            .write()
            .expect("prover registry")
            .insert(suite.into(), ProverEntry { factory, config });
    }

    /// Register a verifier factory, replacing any prior entry under `suite`.
    pub fn register_verifier(
        &self,
        suite: impl Into<String>,
        factory: Arc<dyn RaVerifierFactory>,
        config: Option<serde_json::Value>,
    ) {
        self.verifiers
            .write()
            .expect("verifier registry")
            .insert(suite.into(), VerifierEntry { factory, config });
    }

    pub fn has_prover(&self, suite: &str) -> bool {
        self.provers.read().expect("prover registry").contains_key(suite)
    }

    pub fn has_verifier(&self, suite: &str) -> bool {
        self.verifiers
            .read()
            .expect("verifier registry")
            .contains_key(suite)
    }

    pub(crate) fn start_prover(
        &self,
        suite: &str,
        listener: RaDriverListener,
    ) -> Result<RaDriverHandle, RaError> {
        let (factory, config) = {
            let provers = self.provers.read().expect("prover registry");
            let entry = provers
                .get(suite)
                .ok_or_else(|| RaError::UnknownDriver(suite.to_string()))?;
            (entry.factory.clone(), entry.config.clone())
        };

        let driver = factory
            .create()
            .map_err(|err| RaError::DriverStart(suite.to_string(), err))?;

        let id = listener.driver_id();
        let (input, peer_messages) = mpsc::channel(DRIVER_QUEUE);
        let task = tokio::spawn(driver.run(RaDriverContext {
            peer_messages,
            listener,
            config,
        }));

        Ok(RaDriverHandle {
            id,
            suite: suite.to_string(),
            input,
            task,
        })
    }

    pub(crate) fn start_verifier(
        &self,
        suite: &str,
        listener: RaDriverListener,
    ) -> Result<RaDriverHandle, RaError> {
        let (factory, config) = {
            let verifiers = self.verifiers.read().expect("verifier registry");
            let entry = verifiers
                .get(suite)
                .ok_or_else(|| RaError::UnknownDriver(suite.to_string()))?;
            (entry.factory.clone(), entry.config.clone())
        };

        let driver = factory
            .create()
            .map_err(|err| RaError::DriverStart(suite.to_string(), err))?;

        let id = listener.driver_id();
        let (input, peer_messages) = mpsc::channel(DRIVER_QUEUE);
        let task = tokio::spawn(driver.run(RaDriverContext {
            peer_messages,
            listener,
            config,
        }));

        Ok(RaDriverHandle {
            id,
            suite: suite.to_string(),
            input,
            task,
        })
    }
}
