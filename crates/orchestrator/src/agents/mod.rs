//! Agent invocation contract and the five role adapters.
//!
//! Every role runs through [`AgentInvoker`], which races the runtime call
//! against the configured timeout, logs the external calls the agent made,
//! records a history entry and stores the typed result on the session.

pub mod analyst;
pub mod architect;
pub mod builder;
pub mod http_runtime;
pub mod invoker;
pub mod qa;
pub mod researcher;

use async_trait::async_trait;
use flowforge_core::AgentRole;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use analyst::AnalystAgent;
pub use architect::ArchitectAgent;
pub use builder::BuilderAgent;
pub use http_runtime::HttpAgentRuntime;
pub use invoker::{AgentInvoker, AgentTurn, Invocation};
pub use qa::QaAgent;
pub use researcher::ResearcherAgent;

/// External workflow-system capabilities reachable through agent tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Fetch,
    List,
    Create,
    Update,
    PartialUpdate,
    Delete,
    Validate,
    Test,
    Executions,
    Autofix,
}

impl Capability {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Fetch => "workflow_get",
            Self::List => "workflow_list",
            Self::Create => "workflow_create",
            Self::Update => "workflow_update_full",
            Self::PartialUpdate => "workflow_update_partial",
            Self::Delete => "workflow_delete",
            Self::Validate => "workflow_validate",
            Self::Test => "test_workflow",
            Self::Executions => "executions_get",
            Self::Autofix => "workflow_autofix",
        }
    }

    pub fn from_tool_name(name: &str) -> Option<Self> {
        [
            Self::Fetch,
            Self::List,
            Self::Create,
            Self::Update,
            Self::PartialUpdate,
            Self::Delete,
            Self::Validate,
            Self::Test,
            Self::Executions,
            Self::Autofix,
        ]
        .into_iter()
        .find(|c| c.tool_name() == name)
    }

    /// Capabilities a role is allowed to use.
    pub fn allowed_for(role: AgentRole) -> &'static [Capability] {
        match role {
            AgentRole::Architect => &[],
            AgentRole::Researcher => &[
                Self::Fetch,
                Self::List,
                Self::Validate,
                Self::Executions,
            ],
            AgentRole::Builder => &[
                Self::Fetch,
                Self::Create,
                Self::Update,
                Self::PartialUpdate,
                Self::Delete,
                Self::Validate,
                Self::Autofix,
            ],
            AgentRole::Qa => &[
                Self::Fetch,
                Self::Validate,
                Self::Test,
                Self::Executions,
                Self::PartialUpdate,
            ],
            AgentRole::Analyst => &[Self::Fetch, Self::Executions],
        }
    }
}

/// A tool call the runtime executed on the agent's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub role: AgentRole,
    pub system_prompt: String,
    pub prompt: String,
    pub allowed_tools: Vec<String>,
}

impl AgentRequest {
    pub fn new(
        role: AgentRole,
        system_prompt: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            role,
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            allowed_tools: Capability::allowed_for(role)
                .iter()
                .map(|c| c.tool_name().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// LLM execution backend. Runs one agent turn to completion.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::CallType;

    #[test]
    fn test_capability_tool_names_round_trip() {
        for cap in [Capability::Fetch, Capability::PartialUpdate, Capability::Executions] {
            assert_eq!(Capability::from_tool_name(cap.tool_name()), Some(cap));
        }
        assert_eq!(Capability::from_tool_name("shell"), None);
    }

    #[test]
    fn test_capability_call_types() {
        assert_eq!(
            CallType::from_tool_name(Capability::Create.tool_name()),
            CallType::Mutation
        );
        assert_eq!(
            CallType::from_tool_name(Capability::PartialUpdate.tool_name()),
            CallType::Mutation
        );
        assert_eq!(
            CallType::from_tool_name(Capability::List.tool_name()),
            CallType::Search
        );
        assert_eq!(
            CallType::from_tool_name(Capability::Executions.tool_name()),
            CallType::Read
        );
    }

    #[test]
    fn test_only_builder_and_qa_may_mutate() {
        for role in AgentRole::ALL {
            let mutates = Capability::allowed_for(role)
                .iter()
                .any(|c| CallType::from_tool_name(c.tool_name()) == CallType::Mutation);
            let expected = matches!(role, AgentRole::Builder | AgentRole::Qa);
            assert_eq!(mutates, expected, "unexpected mutation rights for {role}");
        }
    }

    #[test]
    fn test_request_carries_allowed_tools() {
        let request = AgentRequest::new(AgentRole::Analyst, "sys", "prompt");
        assert_eq!(request.allowed_tools, vec!["workflow_get", "executions_get"]);
    }
}
