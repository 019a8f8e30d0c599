//! A no-op attestation suite for tests, demos and bring-up.
//!
//! The prover sends a single report frame and reports success; the verifier
//! accepts any report. This exercises the full driver plumbing (delegation,
//! listener callbacks, terminal verdicts) without touching real attestation
//! hardware.

use async_trait::async_trait;

use super::{RaDriverContext, RaProverDriver, RaProverFactory, RaVerifierDriver, RaVerifierFactory};

pub const DUMMY_RA_SUITE: &str = "Dummy";

/// The single report frame the dummy prover sends.
pub const DUMMY_REPORT: &[u8] = b"dummy attestation report";

pub struct DummyRaProver;

#[async_trait]
impl RaProverDriver for DummyRaProver {
    async fn run(self: Box<Self>, ctx: RaDriverContext) {
        ctx.listener.send_message(DUMMY_REPORT.to_vec()).await;
        ctx.listener.completed().await;
    }
}

pub struct DummyRaVerifier;

#[async_trait]
impl RaVerifierDriver for DummyRaVerifier {
    async fn run(self: Box<Self>, mut ctx: RaDriverContext) {
        match ctx.peer_messages.recv().await {
            Some(report) if report == DUMMY_REPORT => ctx.listener.completed().await,
            Some(_) => {
                tracing::warn!("dummy verifier received an unexpected report");
                ctx.listener.failed().await;
            }
            // channel torn down before a report arrived
            None => ctx.listener.failed().await,
        }
    }
}

pub struct DummyRaProverFactory;

impl RaProverFactory for DummyRaProverFactory {
    fn create(&self) -> Result<Box<dyn RaProverDriver>, String> {
        Ok(Box::new(DummyRaProver))
    }
}

pub struct DummyRaVerifierFactory;

impl RaVerifierFactory for DummyRaVerifierFactory {
    fn create(&self) -> Result<Box<dyn RaVerifierDriver>, String> {
        Ok(Box::new(DummyRaVerifier))
    }
}
