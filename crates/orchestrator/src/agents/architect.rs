use std::sync::Arc;

use flowforge_core::{
    AgentRole, Answer, Blueprint, BuildOption, ClarificationResult, CredentialBinding,
    CredentialDiscovery, CredentialSelection, ExplicitRequirements, OptionsResult, ProjectAnalysis,
    ProjectDocs, Requirements, ResearchFindings,
};
use regex::Regex;
use serde_json::json;
use uuid::Uuid;

use super::invoker::{AgentInvoker, Invocation};
use crate::error::Result;
use crate::prompts::AgentPrompts;

/// Planning role: clarifies, proposes options, designs blueprints.
pub struct ArchitectAgent {
    invoker: Arc<AgentInvoker>,
}

impl ArchitectAgent {
    pub fn new(invoker: Arc<AgentInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn clarify(
        &self,
        session_id: Uuid,
        request: &str,
    ) -> Result<Invocation<ClarificationResult>> {
        let fallback_request = request.to_string();
        self.invoker
            .invoke(
                session_id,
                AgentRole::Architect,
                &AgentPrompts::clarify(request),
                json!({}),
                move |_| fallback_clarification(&fallback_request),
            )
            .await
    }

    pub async fn present_options(
        &self,
        session_id: Uuid,
        findings: &ResearchFindings,
    ) -> Result<Invocation<OptionsResult>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Architect,
                &AgentPrompts::present_options(),
                json!({ "research_findings": findings }),
                |_| OptionsResult::default(),
            )
            .await
    }

    pub async fn create_blueprint(
        &self,
        session_id: Uuid,
        option: &BuildOption,
        findings: &ResearchFindings,
        requirements: Option<&Requirements>,
    ) -> Result<Invocation<Blueprint>> {
        let selection = if option.description.is_empty() {
            option.name.clone()
        } else {
            format!("{}: {}", option.name, option.description)
        };
        self.invoker
            .invoke(
                session_id,
                AgentRole::Architect,
                &AgentPrompts::create_blueprint(&selection, requirements),
                json!({ "research_findings": findings }),
                |_| Blueprint::default(),
            )
            .await
    }

    /// Reconcile needed credential types against what the researcher discovered.
    pub async fn select_credentials(
        &self,
        session_id: Uuid,
        needed: &[String],
        discovered: &CredentialDiscovery,
    ) -> Result<Invocation<CredentialSelection>> {
        let fallback_needed = needed.to_vec();
        let fallback_discovered = discovered.clone();
        self.invoker
            .invoke(
                session_id,
                AgentRole::Architect,
                &AgentPrompts::select_credentials(),
                json!({ "needed_types": needed, "discovered": discovered }),
                move |_| match_credentials(&fallback_needed, &fallback_discovered),
            )
            .await
    }

    pub async fn analyze_project_context(
        &self,
        session_id: Uuid,
        workflow_id: &str,
        docs: &ProjectDocs,
    ) -> Result<Invocation<ProjectAnalysis>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Architect,
                &AgentPrompts::analyze_project(workflow_id),
                json!({ "project_docs": docs }),
                |_| ProjectAnalysis::default(),
            )
            .await
    }

    pub async fn answer(
        &self,
        session_id: Uuid,
        from: AgentRole,
        question: &str,
        context: serde_json::Value,
    ) -> Result<Invocation<Answer>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Architect,
                &AgentPrompts::answer_question(from, question),
                context,
                |turn| Answer {
                    answer: turn.text.trim().to_string(),
                },
            )
            .await
    }
}

/// Explicit "N nodes" / "N steps" count in free text.
pub fn extract_node_count(text: &str) -> Option<u32> {
    let re = Regex::new(r"(?i)(\d+)\s*(node|step)").ok()?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn fallback_clarification(request: &str) -> ClarificationResult {
    let node_count = extract_node_count(request);
    ClarificationResult {
        requirements: request.to_string(),
        needs_research: true,
        node_count,
        explicit_requirements: node_count.map(|n| ExplicitRequirements {
            min_nodes: Some(n),
            notes: Vec::new(),
        }),
        ..ClarificationResult::default()
    }
}

/// Local reconciliation used when the architect's answer is unusable.
pub fn match_credentials(
    needed: &[String],
    discovered: &CredentialDiscovery,
) -> CredentialSelection {
    let mut selection = CredentialSelection::default();
    for credential_type in needed {
        match discovered
            .available
            .iter()
            .find(|c| c.credential_type.eq_ignore_ascii_case(credential_type))
        {
            Some(found) => selection.selected.push(CredentialBinding {
                credential_type: credential_type.clone(),
                credential_id: found.id.clone(),
            }),
            None => selection.missing.push(credential_type.clone()),
        }
    }
    selection
}
