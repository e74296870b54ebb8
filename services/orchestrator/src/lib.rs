//! calcbridge orchestrator library.
//!
//! This crate primarily ships an `orchestrator` binary, but we expose the
//! lifecycle manager and cleanup worker as a library for integration
//! testing and one-shot cleanup runs.

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod lifecycle;
pub mod state;
pub mod storage;
