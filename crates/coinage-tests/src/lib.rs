//! Coinage Tests - In-process exchange and auditor for end-to-end tests
//!
//! [`ExchangeSim`] and [`AuditorSim`] implement the client's `Transport`
//! trait, so an [`coinage_client::ExchangeClient`] talks to them exactly as
//! it would to a remote exchange, minus the network.

pub mod auditor;
pub mod exchange;

pub use auditor::{AuditorSim, SimAuditorConnector};
pub use exchange::{ExchangeSim, AUDITOR_URL, DENOMINATION_VALUES, EXCHANGE_URL};
