#![deny(rustdoc::broken_intra_doc_links)]

//! # IDSCP2
//!
//! The Industrial Data Space Communication Protocol (version 2) establishes
//! mutually attested sessions between connectors over TLS 1.3. Each peer
//! presents a short-lived Dynamic Attribute Token (DAT) issued by a central
//! DAPS and continuously proves its integrity through pluggable remote
//! attestation drivers, in both roles at once: every peer is prover and
//! verifier of the other.
//!
//! The primary API are the [`connect`] function and the [`Idscp2Server`],
//! which yield [`Idscp2Connection`] handles once a session is established.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use idscp2::{connect, DapsClient, DapsDriver, Idscp2Configuration, RaRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), idscp2::Error> {
//!     let config: Arc<Idscp2Configuration> =
//!         Arc::new(Idscp2Configuration::from_path("connector.toml")?);
//!     let daps: Arc<dyn DapsDriver> =
//!         Arc::new(DapsClient::new(&config.daps, &config.tls)?);
//!     let registry = RaRegistry::with_dummy_drivers();
//!
//!     let connection = connect("provider.example.org", 29292, config, daps, registry).await?;
//!     connection.unlock_messaging();
//!     connection.blocking_send(b"hello".to_vec(), Duration::from_secs(5)).await?;
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```

/// Configuration surface: timeouts, RA suites, DAPS and TLS settings.
pub mod config;

/// DAT acquisition, caching and verification against a DAPS.
pub mod daps;

mod error;

/// The connection state machine.
mod fsm;

/// The IDSCP2 message taxonomy and its length-prefixed wire format.
pub mod messages;

/// Pluggable remote-attestation drivers and their registry.
pub mod ra;

/// TLS endpoints, the secure channel adapter, connect and accept.
pub mod transport;

mod connection;

#[cfg(test)]
mod test;

pub use config::{DapsConfig, Idscp2Configuration, SecurityProfile, SecurityRequirements, TlsConfig};
pub use connection::{ConnectionListener, Idscp2Connection, MessageListener};
pub use daps::{DapsClient, DapsDriver};
pub use error::Error;
pub use fsm::FsmState;
pub use ra::RaRegistry;
pub use transport::{connect, Idscp2Server};
