//! Gate Enforcer
//!
//! Six independent admission checks over session state and structured agent
//! output. Checks never invoke agents; a failing check is a control-flow
//! signal for the orchestrator and is recorded in the violation log.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use events::{Event, EventBus};
use flowforge_core::{
    AgentRole, EscalationLevel, LoggedCall, QaReport, QaStatus, ResearchFindings, Session, Stage,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::session_store::format_already_tried;

const EXECUTION_TOOL_MARKER: &str = "execution";
const SUMMARY_MODE: &str = "summary";
const FILTERED_MODE: &str = "filtered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gate {
    #[serde(rename = "GATE_1")]
    ProgressiveEscalation,
    #[serde(rename = "GATE_2")]
    InvestigationBeforeFix,
    #[serde(rename = "GATE_3")]
    LiveVerification,
    #[serde(rename = "GATE_4")]
    AttemptHistory,
    #[serde(rename = "GATE_5")]
    MutationCalls,
    #[serde(rename = "GATE_6")]
    HypothesisValidation,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProgressiveEscalation => "GATE_1",
            Self::InvestigationBeforeFix => "GATE_2",
            Self::LiveVerification => "GATE_3",
            Self::AttemptHistory => "GATE_4",
            Self::MutationCalls => "GATE_5",
            Self::HypothesisValidation => "GATE_6",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateViolation {
    pub gate: Gate,
    pub reason: String,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateData {
    Escalation {
        level: EscalationLevel,
        required_agent: Option<AgentRole>,
        post_mortem: bool,
    },
    AlreadyTried(String),
    MutationCounts {
        total_calls: usize,
        mutation_calls: usize,
    },
    Hypothesis(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    pub gate: Gate,
    pub passed: bool,
    pub message: Option<String>,
    pub data: Option<GateData>,
}

impl GateResult {
    fn pass(gate: Gate) -> Self {
        Self {
            gate,
            passed: true,
            message: None,
            data: None,
        }
    }

    fn fail(gate: Gate, message: impl Into<String>) -> Self {
        Self {
            gate,
            passed: false,
            message: Some(message.into()),
            data: None,
        }
    }

    fn with_data(mut self, data: GateData) -> Self {
        self.data = Some(data);
        self
    }

    /// Investigator the orchestrator must run to clear this failure.
    pub fn required_agent(&self) -> Option<AgentRole> {
        match &self.data {
            Some(GateData::Escalation { required_agent, .. }) => *required_agent,
            _ if !self.passed && self.gate == Gate::InvestigationBeforeFix => {
                Some(AgentRole::Researcher)
            }
            _ => None,
        }
    }

    pub fn already_tried(&self) -> Option<&str> {
        match &self.data {
            Some(GateData::AlreadyTried(block)) => Some(block),
            _ => None,
        }
    }

    pub fn requires_post_mortem(&self) -> bool {
        matches!(
            self.data,
            Some(GateData::Escalation {
                post_mortem: true,
                ..
            })
        )
    }
}

/// Ambient inputs for [`GateEnforcer::check_all`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GateContext<'a> {
    pub has_failed_execution: bool,
    pub qa_report: Option<&'a QaReport>,
    pub findings: Option<&'a ResearchFindings>,
}

#[derive(Debug, Clone)]
pub struct CompositeResult {
    pub passed: bool,
    pub violations: Vec<GateResult>,
}

impl CompositeResult {
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.gate, v.message.as_deref().unwrap_or("failed")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct GateEnforcer {
    session_id: Uuid,
    investigation_freshness: Duration,
    violations: Vec<GateViolation>,
    event_bus: Option<EventBus>,
}

impl GateEnforcer {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            investigation_freshness: Duration::from_secs(5 * 60),
            violations: Vec::new(),
            event_bus: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.investigation_freshness = freshness;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn violations(&self) -> &[GateViolation] {
        &self.violations
    }

    fn record(&mut self, result: &GateResult, context: serde_json::Value) {
        if result.passed {
            return;
        }
        let reason = result.message.clone().unwrap_or_default();
        warn!(
            session_id = %self.session_id,
            gate = %result.gate,
            reason = %reason,
            "Gate violation"
        );

        if let Some(bus) = &self.event_bus {
            bus.emit(Event::GateViolated {
                session_id: self.session_id,
                gate: result.gate.to_string(),
                reason: reason.clone(),
            });
        }
        self.violations.push(GateViolation {
            gate: result.gate,
            reason,
            context,
            timestamp: Utc::now(),
        });
    }

    /// Gate 1: cycle-driven escalation before `target` runs.
    pub fn check_progressive_escalation(
        &mut self,
        session: &Session,
        target: AgentRole,
        now: DateTime<Utc>,
    ) -> GateResult {
        let level = session.escalation_level();
        let gate = Gate::ProgressiveEscalation;

        let result = if level == EscalationLevel::L4 {
            GateResult::fail(
                gate,
                format!(
                    "L4 escalation: cycle {} reached the limit, post-mortem required",
                    session.cycle
                ),
            )
            .with_data(GateData::Escalation {
                level,
                required_agent: Some(AgentRole::Analyst),
                post_mortem: true,
            })
        } else if level >= EscalationLevel::L2 && target == AgentRole::Builder {
            let fresh = session
                .agent_result(AgentRole::Researcher)
                .map(|r| {
                    let age = now.signed_duration_since(r.timestamp);
                    age.to_std()
                        .map(|age| age <= self.investigation_freshness)
                        .unwrap_or(true)
                })
                .unwrap_or(false);

            if fresh {
                GateResult::pass(gate).with_data(GateData::Escalation {
                    level,
                    required_agent: None,
                    post_mortem: false,
                })
            } else {
                GateResult::fail(
                    gate,
                    format!(
                        "{} escalation: researcher must investigate before builder runs (cycle {})",
                        level, session.cycle
                    ),
                )
                .with_data(GateData::Escalation {
                    level,
                    required_agent: Some(AgentRole::Researcher),
                    post_mortem: false,
                })
            }
        } else {
            GateResult::pass(gate).with_data(GateData::Escalation {
                level,
                required_agent: None,
                post_mortem: false,
            })
        };

        self.record(
            &result,
            json!({ "cycle": session.cycle, "target": target.as_str() }),
        );
        result
    }

    /// Gate 2: two-step execution diagnosis plus a validated hypothesis.
    ///
    /// Only researcher calls logged during the current cycle count as evidence.
    pub fn check_investigation(&mut self, session: &Session) -> GateResult {
        let gate = Gate::InvestigationBeforeFix;
        let evidence: Vec<&LoggedCall> = session
            .calls_for(AgentRole::Researcher)
            .filter(|c| c.cycle == session.cycle && c.tool.contains(EXECUTION_TOOL_MARKER))
            .collect();

        let has_mode = |mode: &str| evidence.iter().any(|c| c.param_str("mode") == Some(mode));
        let hypothesis_validated = session
            .agent_result(AgentRole::Researcher)
            .and_then(|r| r.data.hypothesis())
            .map(|(_, validated)| validated)
            .unwrap_or(false);

        let result = if !has_mode(SUMMARY_MODE) {
            GateResult::fail(
                gate,
                "Investigation step 1 missing: inspect executions in summary mode",
            )
        } else if !has_mode(FILTERED_MODE) {
            GateResult::fail(
                gate,
                "Investigation step 2 missing: inspect failing nodes in filtered mode",
            )
        } else if !hypothesis_validated {
            GateResult::fail(gate, "Researcher hypothesis not validated")
        } else {
            GateResult::pass(gate)
        };

        self.record(
            &result,
            json!({ "cycle": session.cycle, "evidence_calls": evidence.len() }),
        );
        result
    }

    /// Gate 3: PASS is only acceptable after a live test.
    pub fn check_live_verification(&mut self, report: &QaReport) -> GateResult {
        let gate = Gate::LiveVerification;
        let result = if report.status == QaStatus::Pass && !report.live_test_executed {
            GateResult::fail(
                gate,
                "QA reported PASS without executing a live test",
            )
        } else {
            GateResult::pass(gate)
        };

        self.record(&result, json!({ "status": report.status.as_str() }));
        result
    }

    /// Gate 4: not a pass/fail check, prepares the "already tried" block.
    pub fn inject_fix_attempts(&self, session: &Session) -> GateResult {
        GateResult::pass(Gate::AttemptHistory).with_data(GateData::AlreadyTried(
            format_already_tried(&session.fix_attempts),
        ))
    }

    /// Gate 5: a fix must have produced at least one mutation call.
    pub fn verify_mutation_calls(&mut self, calls: &[LoggedCall]) -> GateResult {
        let gate = Gate::MutationCalls;
        let mutation_calls = calls.iter().filter(|c| c.is_mutation()).count();

        let result = if calls.is_empty() {
            GateResult::fail(gate, "Builder must log mutation calls")
        } else if mutation_calls == 0 {
            GateResult::fail(gate, "At least one mutation call required")
        } else {
            GateResult::pass(gate).with_data(GateData::MutationCounts {
                total_calls: calls.len(),
                mutation_calls,
            })
        };

        self.record(
            &result,
            json!({ "total_calls": calls.len(), "mutation_calls": mutation_calls }),
        );
        result
    }

    /// Gate 6: non-empty and validated hypothesis.
    pub fn validate_hypothesis(&mut self, hypothesis: &str, validated: bool) -> GateResult {
        let gate = Gate::HypothesisValidation;
        let result = if hypothesis.trim().is_empty() {
            GateResult::fail(gate, "Findings carry no hypothesis")
        } else if !validated {
            GateResult::fail(gate, format!("Hypothesis not validated: {}", hypothesis))
        } else {
            GateResult::pass(gate).with_data(GateData::Hypothesis(hypothesis.to_string()))
        };

        self.record(&result, json!({ "validated": validated }));
        result
    }

    /// Runs the applicable subset of gates 1, 2, 3 and 6.
    pub fn check_all(
        &mut self,
        session: &Session,
        target: AgentRole,
        ctx: GateContext<'_>,
    ) -> CompositeResult {
        let mut results = vec![self.check_progressive_escalation(session, target, Utc::now())];

        if target == AgentRole::Builder && ctx.has_failed_execution {
            results.push(self.check_investigation(session));
        }
        if let Some(report) = ctx.qa_report {
            results.push(self.check_live_verification(report));
        }
        if let Some(findings) = ctx.findings {
            if session.stage == Stage::Decision {
                results.push(
                    self.validate_hypothesis(&findings.hypothesis, findings.hypothesis_validated),
                );
            }
        }

        let violations: Vec<GateResult> = results.into_iter().filter(|r| !r.passed).collect();
        CompositeResult {
            passed: violations.is_empty(),
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::{AgentPayload, AgentResult, Diagnosis, FixAttempt, FixResult};

    fn session_at(cycle: u32) -> Session {
        let mut session = Session::new(Some("wf".to_string()));
        session.cycle = cycle;
        session
    }

    fn researcher_result(validated: bool, at: DateTime<Utc>) -> AgentResult {
        let mut result = AgentResult::new(
            AgentRole::Researcher,
            true,
            AgentPayload::from(Diagnosis {
                hypothesis: "expired token".to_string(),
                hypothesis_validated: validated,
                ..Diagnosis::default()
            }),
            Vec::new(),
        );
        result.timestamp = at;
        result
    }

    fn execution_call(mode: &str, cycle: u32) -> LoggedCall {
        LoggedCall::new(
            "executions_get",
            json!({ "mode": mode }),
            AgentRole::Researcher,
        )
        .in_cycle(cycle)
    }

    fn mutation_call() -> LoggedCall {
        LoggedCall::new("workflow_update_partial", json!({}), AgentRole::Builder)
    }

    #[test]
    fn test_gate_names() {
        assert_eq!(Gate::ProgressiveEscalation.as_str(), "GATE_1");
        assert_eq!(Gate::HypothesisValidation.to_string(), "GATE_6");
        assert_eq!(
            serde_json::to_string(&Gate::MutationCalls).unwrap(),
            "\"GATE_5\""
        );
    }

    #[test]
    fn test_escalation_l1_passes() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let result =
            gates.check_progressive_escalation(&session_at(3), AgentRole::Builder, Utc::now());

        assert!(result.passed);
        assert!(gates.violations().is_empty());
    }

    #[test]
    fn test_escalation_l2_requires_fresh_researcher() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let session = session_at(4);

        let result = gates.check_progressive_escalation(&session, AgentRole::Builder, Utc::now());
        assert!(!result.passed);
        assert!(result.message.as_deref().unwrap().starts_with("L2"));
        assert_eq!(result.required_agent(), Some(AgentRole::Researcher));
        assert_eq!(gates.violations().len(), 1);
    }

    #[test]
    fn test_escalation_l3_names_level() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let result =
            gates.check_progressive_escalation(&session_at(6), AgentRole::Builder, Utc::now());

        assert!(!result.passed);
        assert!(result.message.as_deref().unwrap().starts_with("L3"));
    }

    #[test]
    fn test_escalation_stale_researcher_fails() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let now = Utc::now();
        let mut session = session_at(5);
        session.agent_results.insert(
            AgentRole::Researcher,
            researcher_result(true, now - chrono::Duration::minutes(6)),
        );

        assert!(!gates.check_progressive_escalation(&session, AgentRole::Builder, now).passed);

        session.agent_results.insert(
            AgentRole::Researcher,
            researcher_result(true, now - chrono::Duration::minutes(2)),
        );
        assert!(gates.check_progressive_escalation(&session, AgentRole::Builder, now).passed);
    }

    #[test]
    fn test_escalation_ignores_non_builder_targets() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        assert!(gates
            .check_progressive_escalation(&session_at(5), AgentRole::Qa, Utc::now())
            .passed);
    }

    #[test]
    fn test_escalation_l4_always_fails() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let now = Utc::now();
        let mut session = session_at(8);
        session
            .agent_results
            .insert(AgentRole::Researcher, researcher_result(true, now));

        let result = gates.check_progressive_escalation(&session, AgentRole::Qa, now);
        assert!(!result.passed);
        assert!(result.requires_post_mortem());
        assert_eq!(result.required_agent(), Some(AgentRole::Analyst));
    }

    #[test]
    fn test_investigation_requires_both_modes() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let mut session = session_at(4);
        session
            .agent_results
            .insert(AgentRole::Researcher, researcher_result(true, Utc::now()));

        let result = gates.check_investigation(&session);
        assert!(!result.passed);
        assert!(result.message.as_deref().unwrap().contains("summary"));

        session.logged_calls.push(execution_call("summary", 4));
        let result = gates.check_investigation(&session);
        assert!(!result.passed);
        assert!(result.message.as_deref().unwrap().contains("filtered"));

        session.logged_calls.push(execution_call("filtered", 4));
        let result = gates.check_investigation(&session);
        assert!(result.passed);
        assert_eq!(result.required_agent(), None);
    }

    #[test]
    fn test_investigation_ignores_stale_cycle_evidence() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let mut session = session_at(5);
        session
            .agent_results
            .insert(AgentRole::Researcher, researcher_result(true, Utc::now()));
        session.logged_calls.push(execution_call("summary", 4));
        session.logged_calls.push(execution_call("filtered", 4));

        assert!(!gates.check_investigation(&session).passed);
    }

    #[test]
    fn test_investigation_requires_validated_hypothesis() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let mut session = session_at(4);
        session.logged_calls.push(execution_call("summary", 4));
        session.logged_calls.push(execution_call("filtered", 4));
        session
            .agent_results
            .insert(AgentRole::Researcher, researcher_result(false, Utc::now()));

        let result = gates.check_investigation(&session);
        assert!(!result.passed);
        assert_eq!(result.required_agent(), Some(AgentRole::Researcher));
    }

    #[test]
    fn test_live_verification() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let mut report = QaReport {
            status: QaStatus::Pass,
            ..QaReport::default()
        };

        assert!(!gates.check_live_verification(&report).passed);

        report.live_test_executed = true;
        assert!(gates.check_live_verification(&report).passed);

        let failing = QaReport::default();
        assert!(gates.check_live_verification(&failing).passed);
    }

    #[test]
    fn test_inject_fix_attempts() {
        let gates = GateEnforcer::new(Uuid::new_v4());
        let mut session = session_at(2);

        match gates.inject_fix_attempts(&session).data {
            Some(GateData::AlreadyTried(block)) => assert!(block.is_empty()),
            other => panic!("Expected AlreadyTried, got {other:?}"),
        }

        session
            .fix_attempts
            .push(FixAttempt::new(1, "rename field", FixResult::Failed));
        match gates.inject_fix_attempts(&session).data {
            Some(GateData::AlreadyTried(block)) => assert!(block.contains("Cycle 1: rename field")),
            other => panic!("Expected AlreadyTried, got {other:?}"),
        }
    }

    #[test]
    fn test_mutation_calls_empty_fails() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let result = gates.verify_mutation_calls(&[]);

        assert!(!result.passed);
        assert_eq!(result.message.as_deref(), Some("Builder must log mutation calls"));
    }

    #[test]
    fn test_mutation_calls_read_only_fails() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let calls = vec![LoggedCall::new("workflow_get", json!({}), AgentRole::Builder)];

        let result = gates.verify_mutation_calls(&calls);
        assert!(!result.passed);
        assert_eq!(
            result.message.as_deref(),
            Some("At least one mutation call required")
        );
    }

    #[test]
    fn test_mutation_calls_counts() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let calls = vec![
            LoggedCall::new("workflow_get", json!({}), AgentRole::Builder),
            mutation_call(),
            mutation_call(),
        ];

        let result = gates.verify_mutation_calls(&calls);
        assert!(result.passed);
        assert_eq!(
            result.data,
            Some(GateData::MutationCounts {
                total_calls: 3,
                mutation_calls: 2
            })
        );
    }

    #[test]
    fn test_hypothesis_validation() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());

        assert!(!gates.validate_hypothesis("", true).passed);
        assert!(!gates.validate_hypothesis("   ", false).passed);
        assert!(!gates.validate_hypothesis("use webhook trigger", false).passed);

        let result = gates.validate_hypothesis("use webhook trigger", true);
        assert!(result.passed);
        assert_eq!(
            result.data,
            Some(GateData::Hypothesis("use webhook trigger".to_string()))
        );
        assert_eq!(gates.violations().len(), 3);
    }

    #[test]
    fn test_check_all_selects_applicable_gates() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let mut session = session_at(2);
        session.stage = Stage::Decision;
        let findings = ResearchFindings {
            hypothesis: "cron trigger".to_string(),
            hypothesis_validated: false,
            ..ResearchFindings::default()
        };

        let result = gates.check_all(
            &session,
            AgentRole::Architect,
            GateContext {
                findings: Some(&findings),
                ..GateContext::default()
            },
        );
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].gate, Gate::HypothesisValidation);

        // Findings are only checked at the decision stage.
        session.stage = Stage::Validate;
        let result = gates.check_all(
            &session,
            AgentRole::Architect,
            GateContext {
                findings: Some(&findings),
                ..GateContext::default()
            },
        );
        assert!(result.passed);
    }

    #[test]
    fn test_check_all_investigation_only_for_failed_builder_runs() {
        let mut gates = GateEnforcer::new(Uuid::new_v4());
        let session = session_at(1);

        let clean = gates.check_all(&session, AgentRole::Builder, GateContext::default());
        assert!(clean.passed);

        let failed = gates.check_all(
            &session,
            AgentRole::Builder,
            GateContext {
                has_failed_execution: true,
                ..GateContext::default()
            },
        );
        assert!(!failed.passed);
        assert_eq!(failed.violations[0].gate, Gate::InvestigationBeforeFix);
        assert!(failed.summary().starts_with("GATE_2"));
    }

    #[test]
    fn test_violation_event_emitted() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut gates = GateEnforcer::new(Uuid::new_v4()).with_event_bus(bus);

        gates.verify_mutation_calls(&[]);

        match rx.try_recv().unwrap().event {
            Event::GateViolated { gate, .. } => assert_eq!(gate, "GATE_5"),
            other => panic!("Expected GateViolated, got {other:?}"),
        }
    }
}
