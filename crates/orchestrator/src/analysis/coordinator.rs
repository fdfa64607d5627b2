//! Agent-to-agent Q&A routing for the audit flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowforge_core::{AgentMessage, AgentRole, MessageStatus, QaExchange};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context_store::SharedContextStore;
use crate::error::{OrchestratorError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Answers questions addressed to one role.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> Result<String>;
}

pub struct MessageCoordinator {
    context: Arc<SharedContextStore>,
    handlers: RwLock<HashMap<AgentRole, Arc<dyn MessageHandler>>>,
    /// Serializes drains so a question is never handled twice.
    processing: Mutex<()>,
    poll_interval: Duration,
    timeout: Duration,
    max_retries: u32,
}

impl MessageCoordinator {
    pub fn new(context: Arc<SharedContextStore>) -> Self {
        Self {
            context,
            handlers: RwLock::new(HashMap::new()),
            processing: Mutex::new(()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn register_handler(&self, role: AgentRole, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.insert(role, handler);
    }

    /// Enqueue a question and wait for the answer.
    ///
    /// Someone else must drive [`process_pending`](Self::process_pending)
    /// while this polls.
    pub async fn ask(
        &self,
        from: AgentRole,
        to: AgentRole,
        question: &str,
        context: Option<serde_json::Value>,
    ) -> Result<String> {
        if !self.handlers.read().await.contains_key(&to) {
            return Err(OrchestratorError::NoHandler(to));
        }
        let id = self
            .context
            .enqueue(AgentMessage::question(from, to, question, context))
            .await?;
        info!(message_id = %id, from = %from, to = %to, "Question queued");

        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.context.message(id).await {
                Some(message) if message.status == MessageStatus::Resolved => {
                    return Ok(message.answer.unwrap_or_default());
                }
                Some(message) if message.status == MessageStatus::Timeout => {
                    return Err(OrchestratorError::MessageTimeout(id));
                }
                Some(_) => {}
                None => {
                    return Err(OrchestratorError::ExecutionFailed(format!(
                        "Message {} disappeared from the queue",
                        id
                    )))
                }
            }

            if Instant::now() >= deadline {
                warn!(message_id = %id, to = %to, "Question timed out");
                self.context.mark_timeout(id).await?;
                return Err(OrchestratorError::MessageTimeout(id));
            }
        }
    }

    /// Fire-and-forget, resolved on enqueue.
    pub async fn notify(&self, from: AgentRole, to: AgentRole, content: &str) -> Result<Uuid> {
        self.context
            .enqueue(AgentMessage::notification(from, to, content))
            .await
    }

    /// Route every pending question to its handler. Returns how many were answered.
    pub async fn process_pending(&self) -> Result<usize> {
        let _guard = self.processing.lock().await;
        let pending = self.context.pending_questions().await;
        let mut answered = 0;

        for message in pending {
            let handler = self.handlers.read().await.get(&message.to).cloned();
            let Some(handler) = handler else {
                debug!(message_id = %message.id, to = %message.to, "No handler registered");
                continue;
            };

            match handler.handle(&message).await {
                Ok(answer) => {
                    self.context.resolve(message.id, answer).await?;
                    answered += 1;
                }
                Err(e) => {
                    let retries = self.context.record_retry(message.id).await?;
                    warn!(
                        message_id = %message.id,
                        to = %message.to,
                        retries,
                        error = %e,
                        "Handler failed"
                    );
                    if retries >= self.max_retries {
                        self.context.mark_timeout(message.id).await?;
                    }
                }
            }
        }
        Ok(answered)
    }

    pub async fn qa_exchanges(&self) -> Vec<QaExchange> {
        self.context.qa_exchanges().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(&self, message: &AgentMessage) -> Result<String> {
            Ok(format!("re: {}", message.content))
        }
    }

    struct FailingHandler(AtomicU32);

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &AgentMessage) -> Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(OrchestratorError::ExecutionFailed("model unavailable".to_string()))
        }
    }

    fn setup() -> (TempDir, Arc<SharedContextStore>) {
        let temp_dir = TempDir::new().unwrap();
        let context = Arc::new(SharedContextStore::new(temp_dir.path(), "wf-1"));
        (temp_dir, context)
    }

    #[tokio::test]
    async fn test_process_pending_answers_questions() {
        let (_dir, context) = setup();
        let coordinator = MessageCoordinator::new(context.clone());
        coordinator
            .register_handler(AgentRole::Architect, Arc::new(EchoHandler))
            .await;

        context
            .enqueue(AgentMessage::question(
                AgentRole::Researcher,
                AgentRole::Architect,
                "scope?",
                None,
            ))
            .await
            .unwrap();
        // No handler for the analyst: left pending.
        context
            .enqueue(AgentMessage::question(
                AgentRole::Researcher,
                AgentRole::Analyst,
                "risk?",
                None,
            ))
            .await
            .unwrap();

        assert_eq!(coordinator.process_pending().await.unwrap(), 1);

        let exchanges = coordinator.qa_exchanges().await;
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].answer, "re: scope?");
        assert_eq!(context.pending_questions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_times_out_after_retries() {
        let (_dir, context) = setup();
        let coordinator = MessageCoordinator::new(context.clone()).with_max_retries(3);
        let handler = Arc::new(FailingHandler(AtomicU32::new(0)));
        coordinator
            .register_handler(AgentRole::Architect, handler.clone())
            .await;

        let id = context
            .enqueue(AgentMessage::question(
                AgentRole::Researcher,
                AgentRole::Architect,
                "scope?",
                None,
            ))
            .await
            .unwrap();

        for _ in 0..5 {
            coordinator.process_pending().await.unwrap();
        }

        assert_eq!(handler.0.load(Ordering::SeqCst), 3);
        let message = context.message(id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Timeout);
        assert_eq!(message.retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_resolves_via_pump() {
        let (_dir, context) = setup();
        let coordinator = Arc::new(MessageCoordinator::new(context));
        coordinator
            .register_handler(AgentRole::Architect, Arc::new(EchoHandler))
            .await;

        let pump = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let _ = coordinator.process_pending().await;
                }
            })
        };

        let answer = coordinator
            .ask(AgentRole::Researcher, AgentRole::Architect, "trigger?", None)
            .await
            .unwrap();
        pump.abort();

        assert_eq!(answer, "re: trigger?");
    }

    #[tokio::test]
    async fn test_ask_without_handler_fails_fast() {
        let (_dir, context) = setup();
        let coordinator = MessageCoordinator::new(context.clone());

        let result = coordinator
            .ask(AgentRole::Analyst, AgentRole::Researcher, "why?", None)
            .await;

        match result {
            Err(OrchestratorError::NoHandler(role)) => assert_eq!(role, AgentRole::Researcher),
            other => panic!("Expected NoHandler, got {:?}", other),
        }
        assert!(context.pending_questions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_times_out_when_nobody_drains() {
        let (_dir, context) = setup();
        let coordinator = MessageCoordinator::new(context.clone())
            .with_timing(Duration::from_secs(1), Duration::from_secs(5));
        coordinator
            .register_handler(AgentRole::Researcher, Arc::new(EchoHandler))
            .await;

        let result = coordinator
            .ask(AgentRole::Analyst, AgentRole::Researcher, "why?", None)
            .await;

        match result {
            Err(OrchestratorError::MessageTimeout(id)) => {
                let message = context.message(id).await.unwrap();
                assert_eq!(message.status, MessageStatus::Timeout);
            }
            other => panic!("Expected MessageTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notify_is_resolved() {
        let (_dir, context) = setup();
        let coordinator = MessageCoordinator::new(context.clone());

        let id = coordinator
            .notify(AgentRole::Analyst, AgentRole::Architect, "report ready")
            .await
            .unwrap();

        assert_eq!(
            context.message(id).await.unwrap().status,
            MessageStatus::Resolved
        );
        assert!(context.pending_questions().await.is_empty());
    }
}
