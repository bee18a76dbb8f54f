//! Typed view of a ComfyUI `/history/{prompt_id}` record.
//!
//! Only the parts the worker reads are typed: per-node outputs and the
//! final status. Video nodes (VideoHelperSuite) publish their files under
//! `gifs`; some newer nodes use `videos`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// History of a single prompt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Outputs keyed by node id, iterated in lexicographic node-id order
    /// (`"131"` before `"90"`), not the order the server produced them.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Completion status reported by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
}

impl HistoryStatus {
    /// `true` when the run completed with status `success`.
    pub fn succeeded(&self) -> bool {
        self.completed && self.status_str == "success"
    }
}

/// Files produced by one node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub videos: Vec<OutputFile>,
}

impl NodeOutput {
    /// Video files, `gifs` entries first.
    pub fn video_files(&self) -> impl Iterator<Item = &OutputFile> {
        self.gifs.iter().chain(self.videos.iter())
    }
}

/// One file written by a node.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub format: Option<String>,
    /// Absolute path on the ComfyUI host, when the node reports one.
    #[serde(default)]
    pub fullpath: Option<String>,
}

impl OutputFile {
    /// Where the file lives on disk: `fullpath` if reported, otherwise
    /// `output_dir/subfolder/filename`.
    pub fn local_path(&self, output_dir: &Path) -> PathBuf {
        match self.fullpath.as_deref() {
            Some(full) if !full.is_empty() => PathBuf::from(full),
            _ => {
                let mut path = output_dir.to_path_buf();
                if !self.subfolder.is_empty() {
                    path.push(&self.subfolder);
                }
                path.push(&self.filename);
                path
            }
        }
    }
}

/// Errors when reading a history response.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("No history entry for prompt {0}")]
    MissingEntry(String),

    #[error("Malformed history entry for prompt {prompt_id}: {source}")]
    Malformed {
        prompt_id: String,
        source: serde_json::Error,
    },
}

/// Pick the entry for `prompt_id` out of a `/history/{prompt_id}` body.
pub fn parse_history(
    mut body: serde_json::Value,
    prompt_id: &str,
) -> Result<HistoryEntry, HistoryError> {
    let entry = body
        .get_mut(prompt_id)
        .map(serde_json::Value::take)
        .ok_or_else(|| HistoryError::MissingEntry(prompt_id.to_string()))?;

    serde_json::from_value(entry).map_err(|source| HistoryError::Malformed {
        prompt_id: prompt_id.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parses_video_helper_outputs() {
        let body = json!({
            "p1": {
                "prompt": [],
                "outputs": {
                    "131": {
                        "gifs": [{
                            "filename": "wan_00001.mp4",
                            "subfolder": "",
                            "type": "output",
                            "format": "video/h264-mp4",
                            "frame_rate": 16.0,
                            "fullpath": "/ComfyUI/output/wan_00001.mp4"
                        }]
                    },
                    "90": { "images": [{"filename": "x.png", "subfolder": "", "type": "temp"}] }
                },
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });

        let entry = parse_history(body, "p1").unwrap();
        assert_eq!(entry.outputs.len(), 2);
        let files: Vec<_> = entry.outputs["131"].video_files().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, "output");
        assert_eq!(files[0].format.as_deref(), Some("video/h264-mp4"));
        assert_eq!(entry.outputs["90"].video_files().count(), 0);
        assert!(entry.status.unwrap().succeeded());
    }

    #[test]
    fn status_succeeded_requires_completed_success() {
        let status = |s: &str, completed: bool| HistoryStatus {
            status_str: s.into(),
            completed,
        };
        assert!(status("success", true).succeeded());
        assert!(!status("error", true).succeeded());
        assert!(!status("success", false).succeeded());
    }

    #[test]
    fn outputs_iterate_in_node_id_order() {
        let body = json!({"p1": {"outputs": {"b": {}, "a": {}, "c": {}}}});
        let entry = parse_history(body, "p1").unwrap();
        let ids: Vec<_> = entry.outputs.keys().map(String::as_str).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn numeric_node_ids_sort_lexicographically() {
        let body = json!({"p1": {"outputs": {"90": {}, "131": {}, "7": {}}}});
        let entry = parse_history(body, "p1").unwrap();
        let ids: Vec<_> = entry.outputs.keys().map(String::as_str).collect();
        assert_eq!(ids, ["131", "7", "90"]);
    }

    #[test]
    fn missing_entry_is_an_error() {
        assert_matches!(
            parse_history(json!({}), "p1"),
            Err(HistoryError::MissingEntry(id)) if id == "p1"
        );
    }

    #[test]
    fn malformed_entry_is_an_error() {
        let body = json!({"p1": {"outputs": {"9": {"gifs": [{"subfolder": ""}]}}}});
        assert_matches!(
            parse_history(body, "p1"),
            Err(HistoryError::Malformed { .. })
        );
    }

    #[test]
    fn local_path_prefers_fullpath() {
        let file = OutputFile {
            filename: "a.mp4".into(),
            subfolder: "sub".into(),
            kind: "output".into(),
            format: None,
            fullpath: Some("/abs/a.mp4".into()),
        };
        assert_eq!(file.local_path(Path::new("/out")), PathBuf::from("/abs/a.mp4"));
    }

    #[test]
    fn local_path_falls_back_to_output_dir() {
        let file = OutputFile {
            filename: "a.mp4".into(),
            subfolder: "sub".into(),
            kind: "output".into(),
            format: None,
            fullpath: None,
        };
        assert_eq!(
            file.local_path(Path::new("/out")),
            PathBuf::from("/out/sub/a.mp4")
        );

        let flat = OutputFile {
            subfolder: String::new(),
            ..file
        };
        assert_eq!(flat.local_path(Path::new("/out")), PathBuf::from("/out/a.mp4"));
    }
}
