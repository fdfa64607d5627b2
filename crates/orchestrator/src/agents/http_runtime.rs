use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{AgentRequest, AgentResponse, AgentRuntime, ToolCall};
use crate::config::RuntimeConfig;
use crate::error::{OrchestratorError, Result};

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30000;

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    model: &'a str,
    role: &'a str,
    system_prompt: &'a str,
    prompt: &'a str,
    allowed_tools: &'a [String],
    max_turns: u32,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    result: String,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct RuntimeErrorBody {
    error: String,
}

/// Agent runtime reached over HTTP at `{base_url}/v1/agents/run`.
#[derive(Clone)]
pub struct HttpAgentRuntime {
    client: Client,
    config: RuntimeConfig,
}

impl HttpAgentRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn run_url(&self) -> String {
        format!("{}/v1/agents/run", self.config.base_url.trim_end_matches('/'))
    }

    async fn with_retry<T, F, Fut>(&self, operation: F, operation_name: &str) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    if retries >= self.config.max_retries {
                        error!("{} failed after {} retries: {}", operation_name, retries, e);
                        return Err(e);
                    }

                    let wait_ms = match &e {
                        OrchestratorError::RateLimited {
                            retry_after: Some(secs),
                        } => secs * 1000,
                        _ => backoff_ms,
                    }
                    .min(MAX_BACKOFF_MS);

                    warn!(
                        "{} failed ({}), retrying in {}ms (attempt {}/{})",
                        operation_name,
                        e,
                        wait_ms,
                        retries + 1,
                        self.config.max_retries
                    );

                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    retries += 1;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => {
                    if retries > 0 {
                        info!("{} failed after {} retries: {}", operation_name, retries, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn run_once(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let body = RunRequest {
            model: self.config.model_for(request.role),
            role: request.role.as_str(),
            system_prompt: &request.system_prompt,
            prompt: &request.prompt,
            allowed_tools: &request.allowed_tools,
            max_turns: self.config.max_turns,
        };
        debug!(role = %request.role, model = body.model, "Posting agent run");

        let mut builder = self.client.post(self.run_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                return Err(OrchestratorError::RateLimited { retry_after });
            }

            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RuntimeErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(OrchestratorError::runtime_api(message, Some(status.as_u16())));
        }

        let run: RunResponse = response.json().await?;
        Ok(AgentResponse {
            text: run.result,
            tool_calls: run.tool_calls,
        })
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse> {
        let name = format!("agent_run[{}]", request.role);
        self.with_retry(|| self.run_once(&request), &name).await
    }
}
