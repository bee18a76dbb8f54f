//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, and stops as soon as the
//! completion marker for the awaited prompt arrives.

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::messages::{parse_message, ComfyUIMessage, ErrorData};

/// Why waiting for a prompt ended without completion.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The server closed the socket or the stream ended.
    #[error("WebSocket closed before prompt {prompt_id} completed")]
    Closed { prompt_id: String },

    /// A frame could not be read.
    #[error("WebSocket receive error: {0}")]
    Receive(#[from] tungstenite::Error),

    /// ComfyUI reported an `execution_error` for the prompt.
    #[error("Execution failed at node {node_id} ({exception_type}): {message}")]
    ExecutionFailed {
        node_id: String,
        exception_type: String,
        message: String,
    },
}

/// Consume frames until ComfyUI signals that `prompt_id` has finished.
///
/// Completion is an `executing` message with a null node and a matching
/// prompt ID. Frames after the marker are left in the stream. Binary
/// frames (preview images), unparseable text, and events for other
/// prompts are skipped.
pub async fn wait_for_completion<S>(stream: &mut S, prompt_id: &str) -> Result<(), WaitError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if handle_text_message(&text, prompt_id)? {
                    tracing::info!(prompt_id, "Execution completed (all nodes done)");
                    return Ok(());
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!(prompt_id, "Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::warn!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                return Err(WaitError::Closed {
                    prompt_id: prompt_id.to_string(),
                });
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(prompt_id, error = %e, "WebSocket receive error");
                return Err(WaitError::Receive(e));
            }
        }
    }

    Err(WaitError::Closed {
        prompt_id: prompt_id.to_string(),
    })
}

/// Handle one text frame. Returns `Ok(true)` on the completion marker.
fn handle_text_message(text: &str, prompt_id: &str) -> Result<bool, WaitError> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            return Ok(false);
        }
    };

    if msg.is_completion_of(prompt_id) {
        return Ok(true);
    }

    match msg {
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(
                prompt_id,
                value = data.value,
                max = data.max,
                percent = data.percent(),
                "Generation progress",
            );
        }
        ComfyUIMessage::ExecutionStart(data) if data.prompt_id == prompt_id => {
            tracing::info!(prompt_id, "Execution started");
        }
        ComfyUIMessage::Executing(data) => {
            if let Some(node) = data.node {
                tracing::debug!(prompt_id, node = %node, "Executing node");
            }
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id, node = %data.node, "Node executed with output");
        }
        ComfyUIMessage::ExecutionError(data) if data.prompt_id == prompt_id => {
            return Err(execution_failed(data));
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id, cached = data.nodes.len(), "Execution used cache");
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        ComfyUIMessage::Other(kind) => {
            tracing::trace!(kind = %kind, "Ignoring ComfyUI message");
        }
        _ => {}
    }

    Ok(false)
}

fn execution_failed(data: ErrorData) -> WaitError {
    tracing::error!(
        prompt_id = %data.prompt_id,
        node_id = %data.node_id,
        error_type = %data.exception_type,
        error_message = %data.exception_message,
        "Execution error",
    );
    WaitError::ExecutionFailed {
        node_id: data.node_id,
        exception_type: data.exception_type,
        message: data.exception_message,
    }
}
