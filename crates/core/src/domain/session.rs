use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentResult;

/// Global token budget for a session's conversation history.
pub const MAX_HISTORY_TOKENS: usize = 200_000;

/// Trimming never shrinks the history below this many entries.
pub const MIN_HISTORY_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Clarification,
    Research,
    Decision,
    Credentials,
    Implementation,
    Build,
    Validate,
    Test,
    Complete,
    Blocked,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarification => "clarification",
            Self::Research => "research",
            Self::Decision => "decision",
            Self::Credentials => "credentials",
            Self::Implementation => "implementation",
            Self::Build => "build",
            Self::Validate => "validate",
            Self::Test => "test",
            Self::Complete => "complete",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clarification" => Some(Self::Clarification),
            "research" => Some(Self::Research),
            "decision" => Some(Self::Decision),
            "credentials" => Some(Self::Credentials),
            "implementation" => Some(Self::Implementation),
            "build" => Some(Self::Build),
            "validate" => Some(Self::Validate),
            "test" => Some(Self::Test),
            "complete" => Some(Self::Complete),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Complete and blocked are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Blocked)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Researcher,
    Builder,
    Qa,
    Analyst,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        Self::Architect,
        Self::Researcher,
        Self::Builder,
        Self::Qa,
        Self::Analyst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Researcher => "researcher",
            Self::Builder => "builder",
            Self::Qa => "qa",
            Self::Analyst => "analyst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "architect" => Some(Self::Architect),
            "researcher" => Some(Self::Researcher),
            "builder" => Some(Self::Builder),
            "qa" => Some(Self::Qa),
            "analyst" => Some(Self::Analyst),
            _ => None,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cycle-derived escalation tier for the QA loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    L1,
    L2,
    L3,
    L4,
}

impl EscalationLevel {
    pub fn from_cycle(cycle: u32) -> Self {
        match cycle {
            0..=3 => Self::L1,
            4..=5 => Self::L2,
            6..=7 => Self::L3,
            _ => Self::L4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
            Self::L4 => "L4",
        }
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEntry {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<AgentRole>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            agent_role: None,
            timestamp: Utc::now(),
            tokens: None,
        }
    }

    pub fn assistant(agent_role: AgentRole, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            agent_role: Some(agent_role),
            timestamp: Utc::now(),
            tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Explicit count when known, otherwise roughly four characters per token.
    pub fn estimated_tokens(&self) -> usize {
        self.tokens.unwrap_or_else(|| self.content.len().div_ceil(4))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FixResult {
    Success,
    Failed,
}

impl FixResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixAttempt {
    pub cycle: u32,
    pub approach: String,
    pub result: FixResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub nodes_affected: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl FixAttempt {
    pub fn new(cycle: u32, approach: impl Into<String>, result: FixResult) -> Self {
        Self {
            cycle,
            approach: approach.into(),
            result,
            error_type: None,
            nodes_affected: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes_affected = nodes;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Read,
    Mutation,
    Search,
}

impl CallType {
    /// Derives the audit tag from a capability/tool name.
    pub fn from_tool_name(tool: &str) -> Self {
        let name = tool.to_ascii_lowercase();
        if ["create", "update", "delete", "autofix"]
            .iter()
            .any(|verb| name.contains(verb))
        {
            Self::Mutation
        } else if name.contains("search") || name.contains("list") {
            Self::Search
        } else {
            Self::Read
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggedCall {
    pub tool: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    #[serde(default)]
    pub params: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub agent_role: AgentRole,
    /// QA cycle during which the call was made.
    #[serde(default)]
    pub cycle: u32,
}

impl LoggedCall {
    pub fn new(tool: impl Into<String>, params: serde_json::Value, agent_role: AgentRole) -> Self {
        let tool = tool.into();
        Self {
            call_type: CallType::from_tool_name(&tool),
            tool,
            params,
            timestamp: Utc::now(),
            agent_role,
            cycle: 0,
        }
    }

    pub fn in_cycle(mut self, cycle: u32) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn is_mutation(&self) -> bool {
        self.call_type == CallType::Mutation
    }

    /// String parameter lookup, e.g. `params.mode` or `params.id`.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Explicit user constraints captured during clarification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Requirements {
    pub min_node_count: Option<u32>,
    pub constraints: Vec<String>,
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        self.min_node_count.is_none() && self.constraints.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    #[serde(default)]
    pub target_resource_id: Option<String>,
    pub stage: Stage,
    pub cycle: u32,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<ConversationEntry>,
    #[serde(default)]
    pub fix_attempts: Vec<FixAttempt>,
    #[serde(default)]
    pub logged_calls: Vec<LoggedCall>,
    #[serde(default, with = "agent_results_serde")]
    pub agent_results: BTreeMap<AgentRole, AgentResult>,
    #[serde(default)]
    pub requirements: Option<Requirements>,
}

impl Session {
    pub fn new(target_resource_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target_resource_id,
            stage: Stage::default(),
            cycle: 0,
            started_at: now,
            last_updated_at: now,
            history: Vec::new(),
            fix_attempts: Vec::new(),
            logged_calls: Vec::new(),
            agent_results: BTreeMap::new(),
            requirements: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    pub fn escalation_level(&self) -> EscalationLevel {
        EscalationLevel::from_cycle(self.cycle)
    }

    pub fn history_tokens(&self) -> usize {
        self.history.iter().map(|e| e.estimated_tokens()).sum()
    }

    /// Appends an entry and trims from index 1 while over budget.
    ///
    /// Returns the number of removed entries.
    pub fn push_history(&mut self, entry: ConversationEntry) -> usize {
        self.history.push(entry);
        let mut total = self.history_tokens();
        let mut removed = 0;
        while total > MAX_HISTORY_TOKENS && self.history.len() > MIN_HISTORY_ENTRIES {
            let dropped = self.history.remove(1);
            total -= dropped.estimated_tokens();
            removed += 1;
        }
        removed
    }

    pub fn calls_for(&self, role: AgentRole) -> impl Iterator<Item = &LoggedCall> {
        self.logged_calls
            .iter()
            .filter(move |call| call.agent_role == role)
    }

    pub fn agent_result(&self, role: AgentRole) -> Option<&AgentResult> {
        self.agent_results.get(&role)
    }
}

/// Agent results persist as an ordered `[role, result]` list and are rebuilt
/// into a typed map on load.
mod agent_results_serde {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::AgentRole;
    use crate::domain::agent::AgentResult;

    pub fn serialize<S>(
        map: &BTreeMap<AgentRole, AgentResult>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let entries: Vec<(&AgentRole, &AgentResult)> = map.iter().collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<BTreeMap<AgentRole, AgentResult>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries: Vec<(AgentRole, AgentResult)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}
