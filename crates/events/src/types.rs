//! Event types for the FlowForge event system

use chrono::{DateTime, Utc};
use flowforge_core::{AgentRole, AnalysisStatus, Stage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Session events
    /// A new build session was created
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: Uuid,
        target_resource_id: Option<String>,
    },

    /// Session moved to another stage
    #[serde(rename = "session.stage_changed")]
    StageChanged {
        session_id: Uuid,
        from: Stage,
        to: Stage,
    },

    /// A QA loop iteration started
    #[serde(rename = "session.cycle_started")]
    CycleStarted {
        session_id: Uuid,
        cycle: u32,
        level: String,
    },

    /// Session snapshot moved to the archive
    #[serde(rename = "session.archived")]
    SessionArchived { session_id: Uuid, stage: Stage },

    // Agent events
    /// An agent invocation settled
    #[serde(rename = "agent.invoked")]
    AgentInvoked {
        session_id: Uuid,
        role: AgentRole,
        success: bool,
        call_count: usize,
    },

    // Gate events
    /// A gate check failed
    #[serde(rename = "gate.violated")]
    GateViolated {
        session_id: Uuid,
        gate: String,
        reason: String,
    },

    // Analysis events
    /// Audit analysis advanced to another status
    #[serde(rename = "analysis.status_changed")]
    AnalysisStatusChanged {
        analysis_id: Uuid,
        from: AnalysisStatus,
        to: AnalysisStatus,
    },

    /// One analysis recommendation went through the builder and QA
    #[serde(rename = "analysis.fix_finished")]
    FixTaskFinished {
        session_id: Uuid,
        task_id: String,
        applied: bool,
        validated: bool,
        attempts: u32,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the session ID associated with this event, if any
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::SessionCreated { session_id, .. } => Some(*session_id),
            Event::StageChanged { session_id, .. } => Some(*session_id),
            Event::CycleStarted { session_id, .. } => Some(*session_id),
            Event::SessionArchived { session_id, .. } => Some(*session_id),
            Event::AgentInvoked { session_id, .. } => Some(*session_id),
            Event::GateViolated { session_id, .. } => Some(*session_id),
            Event::FixTaskFinished { session_id, .. } => Some(*session_id),
            Event::AnalysisStatusChanged { .. } => None,
            Event::Error { .. } => None,
        }
    }
}
