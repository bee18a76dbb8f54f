//! Job result payloads.

use serde::Serialize;

/// Message returned when the workflow finished without a video.
pub const NO_VIDEO_MESSAGE: &str = "No video generated";

/// Successful generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoResponse {
    /// Base64-encoded video bytes.
    pub video: String,
    /// Seconds from submission to the encoded artifact.
    pub generation_time: f64,
    pub model: String,
    pub frames: u32,
    pub steps: u32,
    pub cfg: f64,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub prompt_id: String,
}

/// Serialized result of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobResponse {
    Video(VideoResponse),
    /// The run succeeded but produced no video artifact.
    NoOutput { error: String },
    /// The job failed; `code` identifies the failure class.
    Failed { error: String, code: String },
}

impl JobResponse {
    pub fn no_output() -> Self {
        Self::NoOutput {
            error: NO_VIDEO_MESSAGE.to_string(),
        }
    }

    pub fn failed(error: impl ToString, code: &str) -> Self {
        Self::Failed {
            error: error.to_string(),
            code: code.to_string(),
        }
    }

    /// Whether the job failed outright. A missing video is not a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
