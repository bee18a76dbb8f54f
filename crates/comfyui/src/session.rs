//! One inference run against a ComfyUI instance.
//!
//! [`InferenceSession::run`] drives the three phases of a job:
//! wait for the HTTP server, open the WebSocket, then submit the workflow
//! and wait for its completion marker before reading the history.
//! Phases one and two retry under their own [`RetryPolicy`]; phase three
//! does not retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::history::{parse_history, HistoryEntry};
use crate::processor::{wait_for_completion, WaitError};
use crate::retry::{retry, Clock, RetryPolicy, TokioClock};

/// Retry and timeout settings for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Polling of `GET /` until the server answers.
    pub http_ready: RetryPolicy,
    /// Attempts to open the WebSocket.
    pub ws_connect: RetryPolicy,
    /// Upper bound on the wait for the completion marker. `None` waits
    /// indefinitely.
    pub completion_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            http_ready: RetryPolicy::http_ready(),
            ws_connect: RetryPolicy::ws_connect(),
            completion_timeout: None,
        }
    }
}

/// A finished prompt and its history.
#[derive(Debug)]
pub struct Completed {
    pub prompt_id: String,
    pub history: HistoryEntry,
    /// When the workflow was sent for submission.
    pub submitted_at: Instant,
}

/// Drives workflow execution on one ComfyUI instance.
pub struct InferenceSession {
    api: ComfyUIApi,
    client: ComfyUIClient,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl InferenceSession {
    pub fn new(api: ComfyUIApi, client: ComfyUIClient, config: SessionConfig) -> Self {
        Self {
            api,
            client,
            config,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replace the clock used for delays between retry attempts.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Submit `workflow` and wait for it to finish.
    ///
    /// A fresh client ID is generated per call. The WebSocket is closed
    /// before returning, whatever the outcome.
    pub async fn run(&self, workflow: &serde_json::Value) -> Result<Completed, InferenceError> {
        let client_id = uuid::Uuid::new_v4().to_string();

        self.wait_until_ready().await?;
        let mut conn = self.connect(&client_id).await?;

        let outcome = self.submit_and_wait(&mut conn, workflow).await;
        conn.close().await;
        let (prompt_id, submitted_at) = outcome?;

        let history = self.fetch_history(&prompt_id).await?;

        Ok(Completed {
            prompt_id,
            history,
            submitted_at,
        })
    }

    /// Phase one: poll `GET /` until the server answers.
    pub async fn wait_until_ready(&self) -> Result<(), InferenceError> {
        tracing::info!(api_url = %self.api.api_url(), "Waiting for ComfyUI HTTP server");
        let api = &self.api;

        retry(&self.config.http_ready, self.clock.as_ref(), "http", |_| {
            api.ping()
        })
        .await
        .map_err(|e| InferenceError::ServerUnreachable {
            attempts: e.attempts,
            last_error: e.last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Phase two: open the WebSocket as `client_id`.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, InferenceError> {
        let client = &self.client;
        tracing::debug!(ws_url = %client.ws_url(), client_id, "Connecting to ComfyUI WebSocket");

        retry(&self.config.ws_connect, self.clock.as_ref(), "websocket", |_| {
            client.connect(client_id)
        })
        .await
        .map_err(|e| InferenceError::WebSocketTimeout {
            attempts: e.attempts,
            last_error: e.last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Phase three: queue the workflow and read events until it completes.
    async fn submit_and_wait(
        &self,
        conn: &mut ComfyUIConnection,
        workflow: &serde_json::Value,
    ) -> Result<(String, Instant), InferenceError> {
        let submitted_at = Instant::now();
        let response = self
            .api
            .submit_workflow(workflow, &conn.client_id)
            .await
            .map_err(InferenceError::Submit)?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            client_id = %conn.client_id,
            "Workflow submitted to ComfyUI",
        );

        let wait = wait_for_completion(&mut conn.ws_stream, &response.prompt_id);
        match self.config.completion_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| InferenceError::CompletionTimeout(limit))??,
            None => wait.await?,
        }

        Ok((response.prompt_id, submitted_at))
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<HistoryEntry, InferenceError> {
        let body = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(|e| InferenceError::HistoryFetch(e.to_string()))?;

        let entry = parse_history(body, prompt_id)
            .map_err(|e| InferenceError::HistoryFetch(e.to_string()))?;

        match &entry.status {
            Some(status) if !status.succeeded() => tracing::warn!(
                prompt_id,
                status = %status.status_str,
                completed = status.completed,
                "History reports unsuccessful run",
            ),
            _ => {}
        }
        tracing::debug!(prompt_id, nodes = entry.outputs.len(), "Fetched history");
        Ok(entry)
    }
}

/// Errors from an inference run.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("ComfyUI HTTP server unreachable after {attempts} attempts: {last_error}")]
    ServerUnreachable { attempts: u32, last_error: String },

    #[error("WebSocket connection timed out after {attempts} attempts: {last_error}")]
    WebSocketTimeout { attempts: u32, last_error: String },

    #[error("Failed to submit workflow: {0}")]
    Submit(ComfyUIApiError),

    #[error("WebSocket connection lost: {0}")]
    ConnectionLost(String),

    #[error("Execution failed at node {node_id} ({exception_type}): {message}")]
    ExecutionFailed {
        node_id: String,
        exception_type: String,
        message: String,
    },

    #[error("Prompt did not complete within {0:?}")]
    CompletionTimeout(Duration),

    #[error("Failed to fetch history: {0}")]
    HistoryFetch(String),
}

impl InferenceError {
    /// Stable code reported in failure payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServerUnreachable { .. } => "SERVER_UNREACHABLE",
            Self::WebSocketTimeout { .. } => "WEBSOCKET_TIMEOUT",
            Self::Submit(_) => "SUBMIT_ERROR",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::ExecutionFailed { .. } => "EXECUTION_FAILED",
            Self::CompletionTimeout(_) => "COMPLETION_TIMEOUT",
            Self::HistoryFetch(_) => "HISTORY_FETCH_ERROR",
        }
    }
}

impl From<WaitError> for InferenceError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::ExecutionFailed {
                node_id,
                exception_type,
                message,
            } => Self::ExecutionFailed {
                node_id,
                exception_type,
                message,
            },
            other => Self::ConnectionLost(other.to_string()),
        }
    }
}
