use std::sync::Arc;

use flowforge_core::{
    AgentRole, Blueprint, BuildResult, CredentialSelection, FixOutcome, FixVerification,
    LoggedCall, ResearchFindings,
};
use serde_json::json;
use uuid::Uuid;

use super::invoker::{AgentInvoker, AgentTurn, Invocation};
use crate::error::Result;
use crate::prompts::AgentPrompts;

/// The only role allowed to mutate workflows.
pub struct BuilderAgent {
    invoker: Arc<AgentInvoker>,
}

impl BuilderAgent {
    pub fn new(invoker: Arc<AgentInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn build(
        &self,
        session_id: Uuid,
        blueprint: &Blueprint,
        findings: &ResearchFindings,
        credentials: Option<&CredentialSelection>,
    ) -> Result<Invocation<BuildResult>> {
        let invocation = self
            .invoker
            .invoke(
                session_id,
                AgentRole::Builder,
                &AgentPrompts::build(),
                json!({
                    "blueprint": blueprint,
                    "research_findings": findings,
                    "credentials": credentials,
                }),
                fallback_build,
            )
            .await?;

        // A parsed result may still omit the id the builder actually created.
        Ok(match invocation.data.resource_id {
            Some(_) => invocation,
            None => {
                let resource_id = resource_id_from_calls(&invocation.calls);
                Invocation {
                    data: BuildResult {
                        resource_id,
                        ..invocation.data
                    },
                    ..invocation
                }
            }
        })
    }

    /// Scoped repair; `already_tried` is the formatted attempt history.
    pub async fn fix(
        &self,
        session_id: Uuid,
        resource_id: &str,
        edit_scope: &[String],
        errors: &str,
        already_tried: &str,
    ) -> Result<Invocation<FixOutcome>> {
        let id = resource_id.to_string();
        self.invoker
            .invoke(
                session_id,
                AgentRole::Builder,
                &AgentPrompts::fix(resource_id, edit_scope, errors, already_tried),
                json!({ "edit_scope": edit_scope }),
                move |turn| FixOutcome {
                    resource_id: Some(id),
                    changes: Vec::new(),
                    verification: FixVerification {
                        expected_changes_applied: turn.calls.iter().any(LoggedCall::is_mutation),
                        version_changed: false,
                    },
                },
            )
            .await
    }
}

fn fallback_build(turn: &AgentTurn) -> BuildResult {
    BuildResult {
        resource_id: resource_id_from_calls(&turn.calls),
        notes: "build result not parseable, id taken from logged calls".to_string(),
        ..BuildResult::default()
    }
}

/// First `params.id` among the logged calls.
pub fn resource_id_from_calls(calls: &[LoggedCall]) -> Option<String> {
    calls
        .iter()
        .find_map(|c| c.param_str("id").filter(|id| !id.is_empty()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_from_calls() {
        let calls = vec![
            LoggedCall::new("workflow_create", json!({"name": "digest"}), AgentRole::Builder),
            LoggedCall::new("workflow_validate", json!({"id": "wf-77"}), AgentRole::Builder),
            LoggedCall::new("workflow_get", json!({"id": "wf-99"}), AgentRole::Builder),
        ];
        assert_eq!(resource_id_from_calls(&calls).as_deref(), Some("wf-77"));
        assert_eq!(resource_id_from_calls(&[]), None);
    }

    #[test]
    fn test_fallback_build_without_calls_has_no_id() {
        let result = fallback_build(&AgentTurn::default());
        assert!(result.resource_id.is_none());
    }
}
