use std::sync::Arc;
use std::time::Duration;

use events::{Event, EventBus};
use flowforge_core::{AgentPayload, AgentResult, AgentRole, ConversationEntry, LoggedCall};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AgentRequest, AgentRuntime};
use crate::config::DEFAULT_AGENT_TIMEOUT;
use crate::error::{OrchestratorError, Result};
use crate::message_parser::MessageParser;
use crate::prompts::AgentPrompts;
use crate::session_store::SessionStore;

/// Raw outcome of one agent turn, before payload extraction.
#[derive(Debug, Clone, Default)]
pub struct AgentTurn {
    pub text: String,
    pub calls: Vec<LoggedCall>,
    pub error: Option<String>,
}

impl AgentTurn {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn called(&self, tool_fragment: &str) -> bool {
        self.calls.iter().any(|c| c.tool.contains(tool_fragment))
    }
}

/// Typed result handed back to the role adapter.
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    pub data: T,
    pub success: bool,
    pub calls: Vec<LoggedCall>,
    pub error: Option<String>,
}

pub struct AgentInvoker {
    runtime: Arc<dyn AgentRuntime>,
    store: Arc<SessionStore>,
    timeout: Duration,
    event_bus: Option<EventBus>,
}

impl AgentInvoker {
    pub fn new(runtime: Arc<dyn AgentRuntime>, store: Arc<SessionStore>) -> Self {
        Self {
            runtime,
            store,
            timeout: DEFAULT_AGENT_TIMEOUT,
            event_bus: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Run one agent turn and record it on the session.
    ///
    /// Malformed output is replaced by `fallback`; a runtime error or timeout
    /// yields a failed result whose stored payload carries the error message.
    pub async fn invoke<T, F>(
        &self,
        session_id: Uuid,
        role: AgentRole,
        task: &str,
        context: serde_json::Value,
        fallback: F,
    ) -> Result<Invocation<T>>
    where
        T: DeserializeOwned + Clone + Into<AgentPayload>,
        F: FnOnce(&AgentTurn) -> T,
    {
        let request = AgentRequest::new(
            role,
            AgentPrompts::system(role),
            AgentPrompts::task_prompt(task, &context),
        );
        debug!(session_id = %session_id, role = %role, "Invoking agent");

        let mut turn = match tokio::time::timeout(self.timeout, self.runtime.run(request)).await {
            Ok(Ok(response)) => {
                let mut calls = Vec::with_capacity(response.tool_calls.len());
                for call in response.tool_calls {
                    let logged = self
                        .store
                        .log_call(session_id, LoggedCall::new(call.name, call.input, role))
                        .await?;
                    calls.push(logged);
                }
                AgentTurn {
                    text: response.text,
                    calls,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(
                    session_id = %session_id,
                    role = %role,
                    error = %e,
                    "Agent invocation failed"
                );
                AgentTurn {
                    error: Some(e.to_string()),
                    ..AgentTurn::default()
                }
            }
            Err(_) => {
                let e = OrchestratorError::AgentTimeout {
                    role,
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                warn!(session_id = %session_id, role = %role, "{}", e);
                AgentTurn {
                    error: Some(e.to_string()),
                    ..AgentTurn::default()
                }
            }
        };

        let (data, payload) = match &turn.error {
            None => {
                let data = MessageParser::parse::<T>(&turn.text).unwrap_or_else(|| fallback(&turn));
                let payload = data.clone().into();
                (data, payload)
            }
            Some(error) => (
                fallback(&turn),
                AgentPayload::Failure {
                    error: error.clone(),
                },
            ),
        };
        let success = turn.succeeded();

        let history_text = match &turn.error {
            Some(error) => format!("[{} failed] {}", role, error),
            None => turn.text.clone(),
        };
        self.store
            .add_history(session_id, ConversationEntry::assistant(role, history_text))
            .await?;
        self.store
            .store_agent_result(
                session_id,
                AgentResult::new(role, success, payload, turn.calls.clone()),
            )
            .await?;

        info!(
            session_id = %session_id,
            role = %role,
            success,
            calls = turn.calls.len(),
            "Agent invocation settled"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit(Event::AgentInvoked {
                session_id,
                role,
                success,
                call_count: turn.calls.len(),
            });
        }

        Ok(Invocation {
            data,
            success,
            calls: std::mem::take(&mut turn.calls),
            error: turn.error,
        })
    }
}
