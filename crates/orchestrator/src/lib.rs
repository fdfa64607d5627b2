pub mod agents;
pub mod analysis;
pub mod config;
pub mod error;
pub mod flow;
pub mod gates;
pub mod knowledge;
pub mod message_parser;
pub mod prompts;
pub mod session_store;
pub mod state_machine;

pub use agents::{AgentRequest, AgentResponse, AgentRuntime, HttpAgentRuntime, ToolCall};
pub use analysis::{
    AnalysisResult, AnalyzerOrchestrator, FixApproval, FixSummary, ReviewOutcome,
};
pub use config::{OrchestratorConfig, RuntimeConfig};
pub use error::{OrchestratorError, Result};
pub use flow::{DecisionPrompter, Orchestrator, TaskOutcome, TaskReport};
pub use gates::{Gate, GateEnforcer, GateResult};
pub use knowledge::KnowledgeBase;
pub use session_store::SessionStore;
pub use state_machine::StageMachine;
