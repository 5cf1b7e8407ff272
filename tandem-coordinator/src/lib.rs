//! # tandem-coordinator
//!
//! The coordinator service binary: TOML configuration, the TCP accept
//! loop, and the periodic clock-probe and heartbeat-sweep workers
//! around [`tandem_core::Coordinator`].

pub mod config;
pub mod service;
