use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::AgentRole;

/// Progress of a read-only workflow audit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Loading,
    Understanding,
    Investigating,
    Synthesizing,
    Complete,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Understanding => "understanding",
            Self::Investigating => "investigating",
            Self::Synthesizing => "synthesizing",
            Self::Complete => "complete",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Loading => Some(Self::Understanding),
            Self::Understanding => Some(Self::Investigating),
            Self::Investigating => Some(Self::Synthesizing),
            Self::Synthesizing => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Forward by one step, or straight to complete from anywhere.
    pub fn can_transition(&self, to: &Self) -> bool {
        *to == Self::Complete || self.next() == Some(*to)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Question,
    Notification,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Resolved,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub from: AgentRole,
    pub to: AgentRole,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    pub status: MessageStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn question(
        from: AgentRole,
        to: AgentRole,
        content: impl Into<String>,
        context: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            kind: MessageKind::Question,
            content: content.into(),
            context,
            status: MessageStatus::Pending,
            retries: 0,
            answer: None,
            created_at: Utc::now(),
        }
    }

    /// Notifications never expect a reply and are resolved on creation.
    pub fn notification(from: AgentRole, to: AgentRole, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Notification,
            status: MessageStatus::Resolved,
            ..Self::question(from, to, content, None)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaExchange {
    pub from: AgentRole,
    pub to: AgentRole,
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

/// Markdown documents loaded from the project directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectDocs {
    pub readme: Option<String>,
    pub todo: Option<String>,
    pub plan: Option<String>,
    pub architecture: Option<String>,
    /// `(file name, contents)` pairs from the `.context` directory.
    pub context_files: Vec<(String, String)>,
}

impl ProjectDocs {
    pub fn is_empty(&self) -> bool {
        self.readme.is_none()
            && self.todo.is_none()
            && self.plan.is_none()
            && self.architecture.is_none()
            && self.context_files.is_empty()
    }

    pub fn document_count(&self) -> usize {
        [&self.readme, &self.todo, &self.plan, &self.architecture]
            .iter()
            .filter(|d| d.is_some())
            .count()
            + self.context_files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_status_transitions() {
        assert!(AnalysisStatus::Loading.can_transition(&AnalysisStatus::Understanding));
        assert!(AnalysisStatus::Synthesizing.can_transition(&AnalysisStatus::Complete));
        assert!(AnalysisStatus::Loading.can_transition(&AnalysisStatus::Complete));
        assert!(!AnalysisStatus::Loading.can_transition(&AnalysisStatus::Synthesizing));
        assert!(!AnalysisStatus::Investigating.can_transition(&AnalysisStatus::Understanding));
    }

    #[test]
    fn test_notification_is_resolved() {
        let msg = AgentMessage::notification(AgentRole::Analyst, AgentRole::Architect, "done");
        assert_eq!(msg.kind, MessageKind::Notification);
        assert_eq!(msg.status, MessageStatus::Resolved);

        let question =
            AgentMessage::question(AgentRole::Researcher, AgentRole::Architect, "why?", None);
        assert_eq!(question.status, MessageStatus::Pending);
        assert_eq!(question.retries, 0);
    }

    #[test]
    fn test_project_docs_count() {
        let mut docs = ProjectDocs::default();
        assert!(docs.is_empty());

        docs.readme = Some("# Readme".to_string());
        docs.context_files.push(("SUMMARY.md".to_string(), "x".to_string()));
        assert_eq!(docs.document_count(), 2);
    }
}
