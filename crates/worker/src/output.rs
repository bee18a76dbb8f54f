//! Locating and encoding the generated video.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use vidgen_comfyui::history::HistoryEntry;

/// A video artifact read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Node that produced the file.
    pub node_id: String,
    pub path: PathBuf,
    /// Standard-alphabet base64 of the file contents.
    pub encoded: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Failed to read artifact {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ExtractError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::Read { .. } => "ARTIFACT_READ_ERROR",
        }
    }
}

/// Return the first non-empty video artifact in lexicographic node-id
/// order. "First" means smallest node id as a string (`"131"` before
/// `"90"`), not first produced by the server.
///
/// `Ok(None)` means the history lists no usable video.
pub async fn extract_video(
    history: &HistoryEntry,
    output_dir: &Path,
) -> Result<Option<Artifact>, ExtractError> {
    for (node_id, output) in &history.outputs {
        for file in output.video_files() {
            let path = file.local_path(output_dir);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| ExtractError::Read {
                    path: path.clone(),
                    source,
                })?;

            if bytes.is_empty() {
                tracing::warn!(node_id = %node_id, path = %path.display(), "Skipping empty artifact");
                continue;
            }

            tracing::info!(
                node_id = %node_id,
                path = %path.display(),
                bytes = bytes.len(),
                "Video artifact found",
            );
            return Ok(Some(Artifact {
                node_id: node_id.clone(),
                path,
                encoded: general_purpose::STANDARD.encode(&bytes),
            }));
        }
    }

    tracing::warn!(nodes = history.outputs.len(), "No video artifact in history");
    Ok(None)
}
