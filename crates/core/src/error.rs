/// Errors raised while preparing a job for submission.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Base64 decode failed: {0}")]
    Decode(String),

    #[error("{field} must be numeric, got {value}")]
    InvalidDimension { field: &'static str, value: String },

    #[error("Invalid job input: {0}")]
    InvalidJob(String),

    #[error("Workflow template error: {0}")]
    Template(String),

    #[error("Workflow node '{0}' not found in template")]
    MissingNode(String),

    #[error("Workflow failed validation: {0}")]
    WorkflowInvalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable machine-readable code surfaced in failure payloads.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Download { .. } => "DOWNLOAD_ERROR",
            CoreError::Decode(_) => "DECODE_ERROR",
            CoreError::InvalidDimension { .. } => "INVALID_DIMENSION",
            CoreError::InvalidJob(_) => "INVALID_JOB",
            CoreError::Template(_) | CoreError::MissingNode(_) => "TEMPLATE_ERROR",
            CoreError::WorkflowInvalid(_) => "WORKFLOW_INVALID",
            CoreError::Io(_) => "IO_ERROR",
        }
    }
}
