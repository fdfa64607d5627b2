//! Domain model for the FlowForge agent orchestrator.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
