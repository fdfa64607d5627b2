use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::{AnalysisReport, AuditFindings};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    P0,
    P1,
    P2,
    P3,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::P0 => "Critical - fix immediately",
            Self::P1 => "High - fix soon",
            Self::P2 => "Medium - plan to fix",
            Self::P3 => "Low - nice to have",
        }
    }

    /// P0 and P1 are applied automatically.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::P0 | Self::P1)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            _ => None,
        }
    }

    /// Fallback when a recommendation carries no explicit priority.
    pub fn from_risk_level(risk_level: &str) -> Self {
        match risk_level.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::P0,
            "high" => Self::P1,
            "medium" => Self::P2,
            _ => Self::P3,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recommendation from an analysis report, tracked until it is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixTask {
    pub id: String,
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    pub title: String,
    #[serde(default)]
    pub affected_nodes: Vec<String>,
    /// Audit findings on the affected nodes.
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoList {
    pub analysis_id: Uuid,
    pub workflow_id: String,
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<FixTask>,
}

impl TodoList {
    /// One task per non-empty recommendation, ordered by priority.
    ///
    /// A leading `P0`..`P3` tag (`P1: ...`, `[P1] ...`, `P1 - ...`) sets the
    /// priority, otherwise the report's risk level does. Affected nodes are the
    /// audited nodes the recommendation names, or every audited node when it
    /// names none.
    pub fn from_report(
        analysis_id: Uuid,
        workflow_id: impl Into<String>,
        report: &AnalysisReport,
        findings: Option<&AuditFindings>,
    ) -> Self {
        let issues = findings.map(|f| f.issues.as_slice()).unwrap_or_default();
        let fallback = TaskPriority::from_risk_level(&report.risk_level);

        let mut tasks: Vec<FixTask> = report
            .recommendations
            .iter()
            .filter(|r| !r.trim().is_empty())
            .map(|recommendation| {
                let (priority, title) = match split_priority(recommendation) {
                    Some((priority, title)) => (priority, title),
                    None => (fallback, recommendation.trim()),
                };

                let named: Vec<_> = issues
                    .iter()
                    .filter(|i| i.node.as_deref().is_some_and(|n| title.contains(n)))
                    .collect();
                let related = if named.is_empty() {
                    issues.iter().collect()
                } else {
                    named
                };

                let mut affected_nodes: Vec<String> = Vec::new();
                for node in related.iter().filter_map(|i| i.node.clone()) {
                    if !affected_nodes.contains(&node) {
                        affected_nodes.push(node);
                    }
                }
                let evidence = related
                    .iter()
                    .map(|i| match &i.node {
                        Some(node) => format!("{}: {}", node, i.description),
                        None => i.description.clone(),
                    })
                    .collect();

                FixTask {
                    id: String::new(),
                    priority,
                    status: TaskStatus::Pending,
                    title: title.to_string(),
                    affected_nodes,
                    evidence,
                    error: None,
                }
            })
            .collect();

        tasks.sort_by_key(|t| t.priority);
        for (i, task) in tasks.iter_mut().enumerate() {
            task.id = format!("T-{:03}", i + 1);
        }

        Self {
            analysis_id,
            workflow_id: workflow_id.into(),
            generated_at: Utc::now(),
            tasks,
        }
    }

    /// Returns false when no task has this id.
    pub fn set_status(&mut self, id: &str, status: TaskStatus, error: Option<String>) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                task.status = status;
                if error.is_some() {
                    task.error = error;
                }
                true
            }
            None => false,
        }
    }

    /// Pending P0/P1 tasks, the auto-fix queue.
    pub fn urgent_pending(&self) -> Vec<&FixTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.priority.is_urgent())
            .collect()
    }
}

fn split_priority(recommendation: &str) -> Option<(TaskPriority, &str)> {
    let is_separator = |c: char| matches!(c, ':' | '-' | ' ');
    let trimmed = recommendation.trim();
    let (tag, rest) = match trimmed.strip_prefix('[') {
        Some(inner) => inner.split_once(']')?,
        None => {
            let (tag, rest) = trimmed.split_at(trimmed.char_indices().nth(2)?.0);
            if !rest.starts_with(is_separator) {
                return None;
            }
            (tag, rest)
        }
    };
    let priority = TaskPriority::parse(tag)?;
    let title = rest.trim_start_matches(is_separator).trim();
    if title.is_empty() {
        return None;
    }
    Some((priority, title))
}
