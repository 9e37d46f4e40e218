//! Client core for the Icom WLAN (UDP) radio-control protocol.
//!
//! `Controller` is the crate's entry point: it owns the Control/CI-V/Audio
//! UDP sessions, drives the connect/login/bring-up handshake, and exposes
//! the result as a small set of commands plus a [`RadioEvent`] stream.

mod audio_subsession;
mod civ_reassembler;
mod civ_subsession;
mod codec;
mod config;
mod controller;
mod error;
mod events;
mod metrics;
mod phase;
mod session;
mod udp_endpoint;

pub use config::{RadioConfig, RadioConfigBuilder};
pub use controller::{Controller, MonitorConfig};
pub use error::{RadioError, Result};
pub use events::{RadioEvent, SessionLabel};
pub use metrics::MetricsSnapshot;
pub use phase::Phase;

pub use codec::RadioCapRecord;
