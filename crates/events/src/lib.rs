//! Event system for FlowForge
//!
//! This crate provides the event bus and event types used to observe
//! orchestration progress (stage changes, agent invocations, gate violations).

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
