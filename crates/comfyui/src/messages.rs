//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum. Message kinds the
//! worker does not care about (including those added by custom nodes)
//! parse as [`ComfyUIMessage::Other`].

use serde::Deserialize;

/// Message kinds with a typed representation.
const KNOWN_TYPES: &[&str] = &[
    "status",
    "execution_start",
    "execution_cached",
    "executing",
    "progress",
    "executed",
    "execution_error",
    "execution_success",
];

/// All ComfyUI WebSocket message types the worker understands.
///
/// Deserialized via the adjacently-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. the sampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// Execution of a prompt finished without error (newer servers only).
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptData),

    /// Any other message kind, carrying its `type` string.
    #[serde(skip_deserializing)]
    Other(String),
}

impl ComfyUIMessage {
    /// Whether this is the completion marker for `prompt_id`: an
    /// `executing` message with no current node.
    pub fn is_completion_of(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            ComfyUIMessage::Executing(ExecutingData { node: None, prompt_id: Some(id) })
                if id == prompt_id
        )
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only a prompt ID.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
/// Very old servers omit `prompt_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i32,
    /// Total number of steps.
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage (0-100).
    pub fn percent(&self) -> i16 {
        if self.max > 0 {
            ((self.value as f64 / self.max as f64) * 100.0) as i16
        } else {
            0
        }
    }
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (videos, images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Just enough of a message to read its kind.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or a known `type` with a malformed
/// payload. Unknown kinds are returned as [`ComfyUIMessage::Other`].
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if !KNOWN_TYPES.contains(&envelope.kind.as_str()) {
        return Ok(ComfyUIMessage::Other(envelope.kind));
    }
    serde_json::from_str(text)
}
