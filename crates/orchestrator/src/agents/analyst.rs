use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use flowforge_core::{
    AgentRole, AnalysisReport, Answer, LearningProposal, MessageRole, PostMortem, Session,
};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::invoker::{AgentInvoker, Invocation};
use crate::error::Result;
use crate::knowledge::KnowledgeBase;
use crate::prompts::AgentPrompts;

const GRADE_SCALE: u8 = 10;

/// Estimated token spend grouped by the role that produced each entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUsage {
    pub total: usize,
    pub per_role: BTreeMap<String, usize>,
}

/// Post-mortem and audit synthesis. The only holder of write access to the
/// learnings and context files.
pub struct AnalystAgent {
    invoker: Arc<AgentInvoker>,
    knowledge: KnowledgeBase,
}

impl AnalystAgent {
    pub fn new(invoker: Arc<AgentInvoker>, knowledge: KnowledgeBase) -> Self {
        Self { invoker, knowledge }
    }

    pub async fn post_mortem(
        &self,
        session: &Session,
        resource_id: Option<&str>,
        cause: &str,
    ) -> Result<Invocation<PostMortem>> {
        let fallback_cause = cause.to_string();
        self.invoker
            .invoke(
                session.id,
                AgentRole::Analyst,
                &AgentPrompts::post_mortem(resource_id, cause),
                json!({
                    "stage": session.stage,
                    "cycle": session.cycle,
                    "fix_attempts": session.fix_attempts,
                    "logged_calls": session.logged_calls.len(),
                    "history_entries": session.history.len(),
                }),
                move |_| PostMortem {
                    root_cause: fallback_cause,
                    ..PostMortem::default()
                },
            )
            .await
    }

    pub async fn write_learning(&self, learning: &LearningProposal) -> Result<String> {
        self.knowledge
            .append_learning(learning, Utc::now().date_naive())
            .await
    }

    pub async fn update_context(&self, section: &str, content: &str) -> Result<()> {
        self.knowledge.update_context_section(section, content).await
    }

    /// Persist every learning and context update a post-mortem proposes.
    /// Individual write failures are logged and skipped.
    pub async fn apply_post_mortem(&self, post_mortem: &PostMortem) -> Vec<String> {
        let mut ids = Vec::new();
        for learning in &post_mortem.learnings {
            if learning.title.trim().is_empty() {
                continue;
            }
            match self.write_learning(learning).await {
                Ok(id) => ids.push(id),
                Err(e) => warn!(title = %learning.title, error = %e, "Failed to record learning"),
            }
        }
        for update in &post_mortem.context_updates {
            if update.section.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.update_context(&update.section, &update.content).await {
                warn!(section = %update.section, error = %e, "Failed to update context");
            }
        }
        ids
    }

    pub async fn synthesize_report(
        &self,
        session_id: Uuid,
        workflow_id: &str,
        context: serde_json::Value,
    ) -> Result<Invocation<AnalysisReport>> {
        self.invoker
            .invoke(
                session_id,
                AgentRole::Analyst,
                &AgentPrompts::synthesize_report(workflow_id),
                context,
                |turn| AnalysisReport {
                    summary: turn.text.chars().take(500).collect(),
                    ..AnalysisReport::default()
                },
            )
            .await
    }

    pub async fn write_report(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        self.knowledge.write_report(file_name, content).await
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
                AgentRole::Analyst,
                &AgentPrompts::answer_question(from, question),
                context,
                |turn| Answer {
                    answer: turn.text.trim().to_string(),
                },
            )
            .await
    }
}

pub fn token_usage(session: &Session) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for entry in &session.history {
        let tokens = entry.estimated_tokens();
        let key = match (entry.role, entry.agent_role) {
            (_, Some(role)) => role.as_str().to_string(),
            (MessageRole::User, None) => "user".to_string(),
            (_, None) => "system".to_string(),
        };
        usage.total += tokens;
        *usage.per_role.entry(key).or_default() += tokens;
    }
    usage
}

fn grade_bar(score: u8) -> String {
    let filled = score.min(GRADE_SCALE) as usize;
    format!(
        "{}{}",
        "█".repeat(filled),
        "░".repeat(GRADE_SCALE as usize - filled)
    )
}

/// Human-readable block report returned to the caller.
pub fn generate_user_report(
    session: &Session,
    post_mortem: &PostMortem,
    usage: &TokenUsage,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Post-Mortem Report\n");
    let _ = writeln!(out, "- **Session:** {}", session.id);
    let _ = writeln!(
        out,
        "- **Workflow:** {}",
        session.target_resource_id.as_deref().unwrap_or("(not created)")
    );
    let _ = writeln!(out, "- **Stage:** {}", session.stage);
    let _ = writeln!(out, "- **Cycles:** {}\n", session.cycle);

    let _ = writeln!(out, "## Root Cause\n");
    let root_cause = if post_mortem.root_cause.trim().is_empty() {
        "Unknown"
    } else {
        post_mortem.root_cause.trim()
    };
    let _ = writeln!(out, "{}\n", root_cause);

    if !post_mortem.timeline.is_empty() {
        let _ = writeln!(out, "## Timeline\n");
        for event in &post_mortem.timeline {
            let _ = writeln!(out, "- {} [{}] {}", event.at, event.agent, event.event);
        }
        out.push('\n');
    }

    if !post_mortem.agent_grades.is_empty() {
        let _ = writeln!(out, "## Agent Performance\n");
        for grade in &post_mortem.agent_grades {
            let score = grade.score.min(GRADE_SCALE);
            let _ = write!(
                out,
                "- {:<10} {} {}/{}",
                grade.agent,
                grade_bar(score),
                score,
                GRADE_SCALE
            );
            if grade.notes.is_empty() {
                out.push('\n');
            } else {
                let _ = writeln!(out, " ({})", grade.notes);
            }
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Token Usage\n");
    let _ = writeln!(out, "- Total: ~{} tokens", usage.total);
    for (role, tokens) in &usage.per_role {
        let _ = writeln!(out, "- {}: ~{}", role, tokens);
    }
    out.push('\n');

    if !session.fix_attempts.is_empty() {
        let _ = writeln!(out, "## Fix Attempts\n");
        for (i, attempt) in session.fix_attempts.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}. Cycle {}: {} ({})",
                i + 1,
                attempt.cycle,
                attempt.approach,
                attempt.result.as_str()
            );
        }
        out.push('\n');
    }

    if !post_mortem.recommendations.is_empty() {
        let _ = writeln!(out, "## Recommendations\n");
        for rec in &post_mortem.recommendations {
            let _ = writeln!(out, "- {}", rec);
        }
    }

    out.trim_end().to_string()
}
