use std::sync::Arc;

use flowforge_core::{AgentRole, LiveTestResult, QaIssue, QaReport, QaStatus};
use serde_json::json;
use uuid::Uuid;

use super::invoker::{AgentInvoker, AgentTurn, Invocation};
use super::Capability;
use crate::error::Result;
use crate::prompts::AgentPrompts;

pub struct QaAgent {
    invoker: Arc<AgentInvoker>,
}

impl QaAgent {
    pub fn new(invoker: Arc<AgentInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn validate(
        &self,
        session_id: Uuid,
        resource_id: &str,
    ) -> Result<Invocation<QaReport>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Qa,
                &AgentPrompts::validate(resource_id),
                json!({ "resource_id": resource_id }),
                fallback_report,
            )
            .await
    }

    /// Live execution test, forced when a PASS arrives without one.
    pub async fn test_workflow(
        &self,
        session_id: Uuid,
        resource_id: &str,
    ) -> Result<Invocation<LiveTestResult>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Qa,
                &AgentPrompts::test_workflow(resource_id),
                json!({ "resource_id": resource_id }),
                |_| LiveTestResult::default(),
            )
            .await
    }
}

/// Unparseable QA output never counts as a pass.
fn fallback_report(turn: &AgentTurn) -> QaReport {
    let live_test_executed = turn.called(Capability::Test.tool_name())
        || turn.called(Capability::Executions.tool_name());
    QaReport {
        status: QaStatus::Fail,
        errors: vec![QaIssue {
            node: None,
            message: "QA report could not be parsed".to_string(),
        }],
        live_test_executed,
        summary: turn.text.chars().take(200).collect(),
        ..QaReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::LoggedCall;

    #[test]
    fn test_fallback_report_is_fail() {
        let report = fallback_report(&AgentTurn::default());
        assert_eq!(report.status, QaStatus::Fail);
        assert!(!report.live_test_executed);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_fallback_detects_live_test_calls() {
        let turn = AgentTurn {
            text: "ran it".to_string(),
            calls: vec![LoggedCall::new(
                "test_workflow",
                json!({"id": "wf-1"}),
                AgentRole::Qa,
            )],
            error: None,
        };
        assert!(fallback_report(&turn).live_test_executed);
    }
}
