//! Agent result envelope and the closed set of phase payloads.
//!
//! Every payload type derives `Default` with `#[serde(default)]`, so a partially
//! populated model response still deserializes into a total structure and an
//! unparseable one degrades to the zero value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::{AgentRole, LoggedCall};
use crate::error::CoreError;

/// Uniform envelope returned by every agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_role: AgentRole,
    pub success: bool,
    pub data: AgentPayload,
    #[serde(default)]
    pub logged_calls: Vec<LoggedCall>,
    pub timestamp: DateTime<Utc>,
}

impl AgentResult {
    pub fn new(
        agent_role: AgentRole,
        success: bool,
        data: AgentPayload,
        logged_calls: Vec<LoggedCall>,
    ) -> Self {
        Self {
            agent_role,
            success,
            data,
            logged_calls,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        agent_role: AgentRole,
        error: impl Into<String>,
        logged_calls: Vec<LoggedCall>,
    ) -> Self {
        Self::new(
            agent_role,
            false,
            AgentPayload::Failure {
                error: error.into(),
            },
            logged_calls,
        )
    }
}

/// Phase-specific result data with an explicit discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum AgentPayload {
    Clarification(ClarificationResult),
    Findings(ResearchFindings),
    Diagnosis(Diagnosis),
    Options(OptionsResult),
    Blueprint(Blueprint),
    CredentialDiscovery(CredentialDiscovery),
    CredentialSelection(CredentialSelection),
    Build(BuildResult),
    Fix(FixOutcome),
    QaReport(QaReport),
    LiveTest(LiveTestResult),
    PostMortem(PostMortem),
    ProjectAnalysis(ProjectAnalysis),
    WorkflowSnapshot(WorkflowSnapshot),
    AuditFindings(AuditFindings),
    AnalysisReport(AnalysisReport),
    Answer(Answer),
    Failure { error: String },
}

impl AgentPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Clarification(_) => "clarification",
            Self::Findings(_) => "findings",
            Self::Diagnosis(_) => "diagnosis",
            Self::Options(_) => "options",
            Self::Blueprint(_) => "blueprint",
            Self::CredentialDiscovery(_) => "credential_discovery",
            Self::CredentialSelection(_) => "credential_selection",
            Self::Build(_) => "build",
            Self::Fix(_) => "fix",
            Self::QaReport(_) => "qa_report",
            Self::LiveTest(_) => "live_test",
            Self::PostMortem(_) => "post_mortem",
            Self::ProjectAnalysis(_) => "project_analysis",
            Self::WorkflowSnapshot(_) => "workflow_snapshot",
            Self::AuditFindings(_) => "audit_findings",
            Self::AnalysisReport(_) => "analysis_report",
            Self::Answer(_) => "answer",
            Self::Failure { .. } => "failure",
        }
    }

    /// Investigator hypothesis and its validated flag, when this payload carries one.
    pub fn hypothesis(&self) -> Option<(&str, bool)> {
        match self {
            Self::Findings(f) => Some((f.hypothesis.as_str(), f.hypothesis_validated)),
            Self::Diagnosis(d) => Some((d.hypothesis.as_str(), d.hypothesis_validated)),
            _ => None,
        }
    }
}

macro_rules! payload_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for AgentPayload {
                fn from(value: $ty) -> Self {
                    AgentPayload::$variant(value)
                }
            }
        )*
    };
}

payload_from! {
    ClarificationResult => Clarification,
    ResearchFindings => Findings,
    Diagnosis => Diagnosis,
    OptionsResult => Options,
    Blueprint => Blueprint,
    CredentialDiscovery => CredentialDiscovery,
    CredentialSelection => CredentialSelection,
    BuildResult => Build,
    FixOutcome => Fix,
    QaReport => QaReport,
    LiveTestResult => LiveTest,
    PostMortem => PostMortem,
    ProjectAnalysis => ProjectAnalysis,
    WorkflowSnapshot => WorkflowSnapshot,
    AuditFindings => AuditFindings,
    AnalysisReport => AnalysisReport,
    Answer => Answer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExplicitRequirements {
    pub min_nodes: Option<u32>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClarificationResult {
    pub requirements: String,
    pub complexity: Complexity,
    pub needs_research: bool,
    pub is_conversational: bool,
    /// Direct reply for conversational requests.
    pub response: Option<String>,
    pub node_count: Option<u32>,
    pub explicit_requirements: Option<ExplicitRequirements>,
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResearchFindings {
    pub hypothesis: String,
    pub hypothesis_validated: bool,
    pub fit_score: u32,
    pub templates_found: Vec<String>,
    pub nodes_found: Vec<String>,
    pub existing_workflows: Vec<String>,
    pub summary: String,
    pub ready_for_blueprint: bool,
}

impl ResearchFindings {
    /// Findings synthesized when clarification judged research unnecessary.
    pub fn pass_through(requirements: impl Into<String>) -> Self {
        Self {
            hypothesis: requirements.into(),
            hypothesis_validated: true,
            fit_score: 80,
            ready_for_blueprint: true,
            ..Self::default()
        }
    }
}

/// Output of a targeted (L2) or deep-dive (L3) investigation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Diagnosis {
    pub hypothesis: String,
    pub hypothesis_validated: bool,
    pub root_cause: String,
    pub failing_nodes: Vec<String>,
    pub recommended_fix: String,
    pub rejected_approaches: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildOption {
    pub name: String,
    pub description: String,
    pub score: u32,
    pub recommended: bool,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptionsResult {
    pub options: Vec<BuildOption>,
}

impl OptionsResult {
    /// Index of the flagged recommendation, else the first option.
    pub fn recommended_index(&self) -> Option<usize> {
        if self.options.is_empty() {
            return None;
        }
        Some(
            self.options
                .iter()
                .position(|o| o.recommended)
                .unwrap_or(0),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlueprintNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Blueprint {
    pub name: String,
    pub description: String,
    pub trigger: String,
    pub nodes: Vec<BlueprintNode>,
    pub connections: Vec<Connection>,
    /// `None` means the field was missing from the plan.
    pub required_credentials: Option<Vec<String>>,
}

impl Blueprint {
    /// Structural check run before any build is attempted.
    pub fn validate(&self, min_nodes: Option<u32>) -> Result<(), CoreError> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name is empty".to_string());
        }
        if self.nodes.is_empty() {
            problems.push("no nodes defined".to_string());
        }
        if self.required_credentials.is_none() {
            problems.push("required_credentials field missing".to_string());
        }
        if let Some(min) = min_nodes {
            if (self.nodes.len() as u32) < min {
                problems.push(format!(
                    "user requested at least {min} nodes, blueprint has {}",
                    self.nodes.len()
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(problems.join(", ")))
        }
    }

    pub fn credential_types(&self) -> &[String] {
        self.required_credentials.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Credential {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub credential_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialDiscovery {
    pub available: Vec<Credential>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialBinding {
    pub credential_type: String,
    pub credential_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialSelection {
    pub selected: Vec<CredentialBinding>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildResult {
    pub resource_id: Option<String>,
    pub name: String,
    pub node_count: u32,
    pub version: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FixVerification {
    pub expected_changes_applied: bool,
    pub version_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FixOutcome {
    pub resource_id: Option<String>,
    pub changes: Vec<String>,
    pub verification: FixVerification,
}

/// Canonical validation status. A warning-only result is a `Pass`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaStatus {
    Pass,
    #[default]
    Fail,
    Blocked,
}

impl QaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Blocked => "BLOCKED",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QaIssue {
    pub node: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawQaReport")]
pub struct QaReport {
    pub status: QaStatus,
    pub errors: Vec<QaIssue>,
    pub warnings: Vec<QaIssue>,
    /// Minimal set of node names a fix may touch.
    pub edit_scope: Vec<String>,
    pub live_test_executed: bool,
    pub summary: String,
}

impl QaReport {
    /// One-line digest of the errors, used as the fix instruction and attempt label.
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return if self.summary.is_empty() {
                "validation failed without itemized errors".to_string()
            } else {
                self.summary.clone()
            };
        }
        self.errors
            .iter()
            .map(|e| match &e.node {
                Some(node) => format!("{node}: {}", e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Wire shape of a QA report before status normalization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawQaReport {
    status: String,
    errors: Vec<QaIssue>,
    warnings: Vec<QaIssue>,
    edit_scope: Vec<String>,
    #[serde(alias = "phase_5_executed")]
    live_test_executed: bool,
    summary: String,
}

impl From<RawQaReport> for QaReport {
    fn from(raw: RawQaReport) -> Self {
        let status = match raw.status.trim().to_ascii_uppercase().as_str() {
            "PASS" => QaStatus::Pass,
            "SOFT_PASS" if raw.errors.is_empty() => QaStatus::Pass,
            "BLOCKED" => QaStatus::Blocked,
            _ => QaStatus::Fail,
        };
        Self {
            status,
            errors: raw.errors,
            warnings: raw.warnings,
            edit_scope: raw.edit_scope,
            live_test_executed: raw.live_test_executed,
            summary: raw.summary,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestRun {
    pub name: String,
    pub success: bool,
    pub execution_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveTestResult {
    pub tests: Vec<TestRun>,
    pub summary: String,
}

impl LiveTestResult {
    pub fn executed(&self) -> bool {
        !self.tests.is_empty()
    }

    pub fn all_passed(&self) -> bool {
        self.executed() && self.tests.iter().all(|t| t.success)
    }

    pub fn has_failure(&self) -> bool {
        self.tests.iter().any(|t| !t.success)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimelineEvent {
    pub at: String,
    pub agent: String,
    pub event: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentGrade {
    pub agent: String,
    /// Score from 0 to 10.
    pub score: u8,
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningProposal {
    pub title: String,
    pub category: String,
    pub severity: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextUpdate {
    pub section: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostMortem {
    pub root_cause: String,
    pub timeline: Vec<TimelineEvent>,
    pub agent_grades: Vec<AgentGrade>,
    pub learnings: Vec<LearningProposal>,
    pub context_updates: Vec<ContextUpdate>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectAnalysis {
    pub project_summary: String,
    pub intended_behavior: String,
    pub concerns: Vec<String>,
    pub open_questions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionRecord {
    pub id: String,
    pub status: String,
    pub started_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub nodes: Vec<WorkflowNode>,
    pub executions: Vec<ExecutionRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditIssue {
    pub node: Option<String>,
    pub severity: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditFindings {
    pub issues: Vec<AuditIssue>,
    pub execution_summary: String,
    pub hypothesis: String,
    /// Questions the researcher wants the architect to answer.
    pub open_questions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisReport {
    pub summary: String,
    pub root_causes: Vec<String>,
    pub recommendations: Vec<String>,
    pub risk_level: String,
    /// Questions the analyst wants the researcher to answer.
    pub open_questions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Answer {
    pub answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qa_status_normalization() {
        let report: QaReport = serde_json::from_str(r#"{"status":"pass"}"#).unwrap();
        assert_eq!(report.status, QaStatus::Pass);

        let report: QaReport =
            serde_json::from_str(r#"{"status":"SOFT_PASS","warnings":[{"message":"slow"}]}"#)
                .unwrap();
        assert_eq!(report.status, QaStatus::Pass);

        let report: QaReport =
            serde_json::from_str(r#"{"status":"SOFT_PASS","errors":[{"message":"broken"}]}"#)
                .unwrap();
        assert_eq!(report.status, QaStatus::Fail);

        let report: QaReport = serde_json::from_str(r#"{"status":"MAYBE"}"#).unwrap();
        assert_eq!(report.status, QaStatus::Fail);

        let report: QaReport = serde_json::from_str(r#"{"status":"BLOCKED"}"#).unwrap();
        assert_eq!(report.status, QaStatus::Blocked);
    }

    #[test]
    fn test_qa_report_live_test_alias() {
        let report: QaReport =
            serde_json::from_str(r#"{"status":"PASS","phase_5_executed":true}"#).unwrap();
        assert!(report.live_test_executed);
    }

    #[test]
    fn test_qa_report_survives_reserialization() {
        let report: QaReport = serde_json::from_str(
            r#"{"status":"FAIL","errors":[{"node":"HTTP","message":"401"}],"edit_scope":["HTTP"]}"#,
        )
        .unwrap();
        let payload = AgentPayload::from(report.clone());
        let json = serde_json::to_string(&payload).unwrap();
        let restored: AgentPayload = serde_json::from_str(&json).unwrap();

        match restored {
            AgentPayload::QaReport(r) => assert_eq!(r, report),
            other => panic!("Expected qa report, got {other:?}"),
        }
    }

    #[test]
    fn test_error_summary() {
        let report = QaReport {
            errors: vec![
                QaIssue {
                    node: Some("HTTP".to_string()),
                    message: "401".to_string(),
                },
                QaIssue {
                    node: None,
                    message: "missing trigger".to_string(),
                },
            ],
            ..QaReport::default()
        };
        assert_eq!(report.error_summary(), "HTTP: 401; missing trigger");
        assert!(!QaReport::default().error_summary().is_empty());
    }

    #[test]
    fn test_payload_defaults_are_total() {
        let blueprint: Blueprint = serde_json::from_str("{}").unwrap();
        assert!(blueprint.name.is_empty());
        assert!(blueprint.nodes.is_empty());
        assert!(blueprint.required_credentials.is_none());

        let clarification: ClarificationResult =
            serde_json::from_str(r#"{"is_conversational":true}"#).unwrap();
        assert!(clarification.is_conversational);
        assert_eq!(clarification.complexity, Complexity::Medium);
    }

    #[test]
    fn test_blueprint_validation() {
        let mut blueprint = Blueprint {
            name: "Slack digest".to_string(),
            nodes: vec![BlueprintNode::default(), BlueprintNode::default()],
            required_credentials: Some(Vec::new()),
            ..Blueprint::default()
        };
        assert!(blueprint.validate(None).is_ok());
        assert!(blueprint.validate(Some(2)).is_ok());

        match blueprint.validate(Some(3)) {
            Err(CoreError::Validation(msg)) => assert!(msg.contains("at least 3 nodes")),
            other => panic!("Expected validation error, got {other:?}"),
        }

        blueprint.nodes.clear();
        blueprint.required_credentials = None;
        let err = blueprint.validate(None).unwrap_err().to_string();
        assert!(err.contains("no nodes defined"));
        assert!(err.contains("required_credentials"));
    }

    #[test]
    fn test_pass_through_findings() {
        let findings = ResearchFindings::pass_through("send a slack message");
        assert_eq!(findings.hypothesis, "send a slack message");
        assert!(findings.hypothesis_validated);
        assert_eq!(findings.fit_score, 80);
    }

    #[test]
    fn test_recommended_index() {
        let mut options = OptionsResult::default();
        assert_eq!(options.recommended_index(), None);

        options.options.push(BuildOption::default());
        options.options.push(BuildOption {
            recommended: true,
            ..BuildOption::default()
        });
        assert_eq!(options.recommended_index(), Some(1));
    }

    #[test]
    fn test_live_test_result() {
        let mut result = LiveTestResult::default();
        assert!(!result.executed());
        assert!(!result.all_passed());

        result.tests.push(TestRun {
            success: true,
            ..TestRun::default()
        });
        assert!(result.all_passed());

        result.tests.push(TestRun::default());
        assert!(result.has_failure());
        assert!(!result.all_passed());
    }

    #[test]
    fn test_hypothesis_accessor() {
        let payload = AgentPayload::from(Diagnosis {
            hypothesis: "auth header missing".to_string(),
            hypothesis_validated: true,
            ..Diagnosis::default()
        });
        assert_eq!(payload.hypothesis(), Some(("auth header missing", true)));
        assert_eq!(AgentPayload::from(Answer::default()).hypothesis(), None);
    }
}
