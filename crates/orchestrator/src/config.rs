use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use flowforge_core::AgentRole;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_MAX_QA_CYCLES: u32 = 7;
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_qa_cycles: u32,
    pub agent_timeout: Duration,
    /// How recent an investigator result must be for Gate 1 at L2/L3.
    pub investigation_freshness: Duration,
    pub interactive: bool,
    /// Root for active sessions, `archives/` and `analyze/`.
    pub storage_dir: PathBuf,
    pub learnings_path: PathBuf,
    pub context_path: PathBuf,
    pub reports_dir: PathBuf,
    pub message_poll_interval: Duration,
    pub message_timeout: Duration,
    pub message_max_retries: u32,
    pub max_qa_rounds: u32,
    /// Builder/QA attempts per analysis fix task.
    pub max_fix_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_qa_cycles: DEFAULT_MAX_QA_CYCLES,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            investigation_freshness: Duration::from_secs(5 * 60),
            interactive: false,
            storage_dir: PathBuf::from("sessions"),
            learnings_path: PathBuf::from("docs/LEARNINGS.md"),
            context_path: PathBuf::from("docs/SYSTEM-CONTEXT.md"),
            reports_dir: PathBuf::from("reports"),
            message_poll_interval: Duration::from_secs(1),
            message_timeout: Duration::from_secs(60),
            message_max_retries: 3,
            max_qa_rounds: 5,
            max_fix_attempts: DEFAULT_MAX_FIX_ATTEMPTS,
        }
    }
}

impl OrchestratorConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_qa_cycles(mut self, max: u32) -> Self {
        self.max_qa_cycles = max;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_learnings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.learnings_path = path.into();
        self
    }

    pub fn with_context_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.context_path = path.into();
        self
    }

    pub fn with_reports_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.reports_dir = path.into();
        self
    }

    pub fn with_max_fix_attempts(mut self, max: u32) -> Self {
        self.max_fix_attempts = max;
        self
    }

    pub fn with_message_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.message_poll_interval = poll_interval;
        self.message_timeout = timeout;
        self
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.storage_dir.join("archives")
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.storage_dir.join("analyze")
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_qa_cycles == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_qa_cycles must be at least 1".to_string(),
            ));
        }
        if self.max_fix_attempts == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_fix_attempts must be at least 1".to_string(),
            ));
        }
        if self.agent_timeout.is_zero() {
            return Err(OrchestratorError::InvalidConfig(
                "agent_timeout must be non-zero".to_string(),
            ));
        }
        if self.message_poll_interval > self.message_timeout {
            return Err(OrchestratorError::InvalidConfig(
                "message_poll_interval exceeds message_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection settings for the HTTP agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub default_model: String,
    /// Per-role model override.
    pub models: BTreeMap<AgentRole, String>,
    pub max_retries: u32,
    pub max_turns: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            default_model: "claude-sonnet-4".to_string(),
            models: BTreeMap::new(),
            max_retries: 3,
            max_turns: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn model_for(&self, role: AgentRole) -> &str {
        self.models
            .get(&role)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_qa_cycles, 7);
        assert_eq!(config.agent_timeout, Duration::from_secs(90));
        assert_eq!(config.message_max_retries, 3);
        assert!(!config.interactive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_paths() {
        let config = OrchestratorConfig::new("/tmp/ff")
            .with_max_qa_cycles(3)
            .with_interactive(true);

        assert_eq!(config.max_qa_cycles, 3);
        assert!(config.interactive);
        assert_eq!(config.archive_dir(), PathBuf::from("/tmp/ff/archives"));
        assert_eq!(config.analysis_dir(), PathBuf::from("/tmp/ff/analyze"));
    }

    #[test]
    fn test_validate_rejects_zero_cycles() {
        let config = OrchestratorConfig::default().with_max_qa_cycles(0);
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_fix_attempts() {
        let config = OrchestratorConfig::default().with_max_fix_attempts(0);
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::InvalidConfig(msg)) if msg.contains("max_fix_attempts")
        ));
        assert_eq!(OrchestratorConfig::default().max_fix_attempts, 3);
    }

    #[test]
    fn test_model_override() {
        let mut runtime = RuntimeConfig::default();
        runtime
            .models
            .insert(AgentRole::Analyst, "claude-opus-4".to_string());

        assert_eq!(runtime.model_for(AgentRole::Analyst), "claude-opus-4");
        assert_eq!(runtime.model_for(AgentRole::Qa), runtime.default_model);
    }
}
