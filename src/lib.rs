//! Orchestration core for browser-mediated proofs: the background session
//! state machine, request matching and claim building, the single-flight
//! proof queue, the per-tab network observer, and the page-facing SDK.

pub mod backend;
pub mod background;
pub mod bridge;
pub mod browser;
pub mod claim;
pub mod config;
pub mod content;
pub mod cookies;
pub mod error;
pub mod logging;
pub mod matching;
pub mod messages;
pub mod offscreen;
pub mod proof;
pub mod provider;
pub mod queue;
pub mod rpc;
pub mod sdk;
pub mod session;
pub mod timer;

#[cfg(test)]
mod session_flow_tests;
#[cfg(test)]
mod test_support;

pub use background::{Dependencies, Orchestrator, OrchestratorHandle};
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
