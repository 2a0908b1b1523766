//! Trellis - platform configurator backend
//!
//! Device-code authentication for the companion CLI and the cluster
//! credential/liveness service, over a relational store. All modules are
//! exposed for integration testing.

pub mod entities;
pub mod errors;
pub mod jobs;
pub mod provider;
pub mod session;
pub mod settings;
pub mod storage;
pub mod tokens;
pub mod web;
