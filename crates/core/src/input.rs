//! Conditioning-image materialization.
//!
//! Resolves the job's image reference into a local file the inference
//! server can read. Downloads and decoded uploads land in a per-job
//! [`ScratchDir`] that is removed when the job finishes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use tokio::process::Command;

use crate::error::CoreError;
use crate::job::ImageSource;

/// Filename used for downloaded or decoded input images.
pub const INPUT_IMAGE_FILENAME: &str = "input_image.jpg";

/// Default time allowed for a single download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Scratch directory
// ---------------------------------------------------------------------------

/// Per-job working directory, deleted on drop.
///
/// The directory is only created on first use, so jobs that pass a plain
/// path never touch the filesystem.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Reserve `<root>/task_<uuid>` for a new job.
    pub fn new(root: &Path) -> Result<Self, CoreError> {
        let name = format!("task_{}", uuid::Uuid::new_v4());
        let path = std::path::absolute(root.join(name))?;
        Ok(Self { path })
    }

    /// Absolute path of the directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory if it does not exist yet.
    pub async fn ensure(&self) -> Result<&Path, CoreError> {
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(&self.path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove scratch directory",
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Downloads a remote file to a local path.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, target: &Path) -> Result<(), CoreError>;
}

/// [`Fetcher`] backed by the `wget` binary.
pub struct WgetFetcher {
    program: OsString,
    timeout: Duration,
}

impl WgetFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self::with_program("wget", timeout)
    }

    /// Run `program` instead of `wget`. It receives wget's arguments.
    pub(crate) fn with_program(program: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for WgetFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_DOWNLOAD_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl Fetcher for WgetFetcher {
    async fn fetch(&self, url: &str, target: &Path) -> Result<(), CoreError> {
        let download_error = |reason: String| CoreError::Download {
            url: url.to_string(),
            reason,
        };

        let program = self.program.to_string_lossy();
        let mut cmd = Command::new(&self.program);
        cmd.arg("-O")
            .arg(target)
            .arg("--no-verbose")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // On timeout the child is dropped and killed.
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| download_error(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| download_error(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(url, %program, status = %output.status, stderr = %stderr.trim(), "Download failed");
            return Err(download_error(format!(
                "{program} {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        tracing::info!(url, target = %target.display(), "Downloaded input image");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// Turn an image source into a local absolute path.
///
/// `None` resolves to `default_image`. Paths pass through without I/O;
/// URLs go through `fetcher`; base64 payloads are decoded in-process.
pub async fn materialize_image(
    source: Option<ImageSource<'_>>,
    scratch: &ScratchDir,
    fetcher: &dyn Fetcher,
    default_image: &Path,
) -> Result<PathBuf, CoreError> {
    match source {
        None => {
            tracing::info!(path = %default_image.display(), "Using default input image");
            Ok(default_image.to_path_buf())
        }
        Some(ImageSource::Path(path)) => {
            tracing::info!(path, "Using image path input");
            Ok(PathBuf::from(path))
        }
        Some(ImageSource::Url(url)) => {
            tracing::info!(url, "Using image URL input");
            let target = scratch.ensure().await?.join(INPUT_IMAGE_FILENAME);
            fetcher.fetch(url, &target).await?;
            Ok(target)
        }
        Some(ImageSource::Base64(data)) => {
            tracing::info!(encoded_len = data.len(), "Using base64 image input");
            save_base64(data, scratch).await
        }
    }
}

/// Decode a standard-alphabet base64 payload into the scratch directory.
async fn save_base64(data: &str, scratch: &ScratchDir) -> Result<PathBuf, CoreError> {
    // Decode before touching the filesystem so bad input leaves no trace.
    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| CoreError::Decode(e.to_string()))?;

    let target = scratch.ensure().await?.join(INPUT_IMAGE_FILENAME);
    tokio::fs::write(&target, &bytes).await?;

    tracing::info!(path = %target.display(), bytes = bytes.len(), "Saved base64 input");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    /// Records every fetch and writes fixed bytes to the target.
    #[derive(Default)]
    struct RecordingFetcher {
        calls: Mutex<Vec<(String, PathBuf)>>,
    }

    #[async_trait::async_trait]
    impl Fetcher for RecordingFetcher {
        async fn fetch(&self, url: &str, target: &Path) -> Result<(), CoreError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), target.to_path_buf()));
            tokio::fs::write(target, b"jpeg").await?;
            Ok(())
        }
    }

    struct FailingFetcher;

    #[async_trait::async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self, url: &str, _target: &Path) -> Result<(), CoreError> {
            Err(CoreError::Download {
                url: url.to_string(),
                reason: "404 Not Found".into(),
            })
        }
    }

    #[tokio::test]
    async fn path_passes_through_without_io() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();
        let fetcher = RecordingFetcher::default();

        let path = materialize_image(
            Some(ImageSource::Path("/data/in.png")),
            &scratch,
            &fetcher,
            Path::new("/example_image.png"),
        )
        .await
        .unwrap();

        assert_eq!(path, PathBuf::from("/data/in.png"));
        assert!(fetcher.calls.lock().unwrap().is_empty());
        assert!(!scratch.path().exists());
    }

    #[tokio::test]
    async fn missing_source_uses_default_image() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();

        let path = materialize_image(
            None,
            &scratch,
            &RecordingFetcher::default(),
            Path::new("/example_image.png"),
        )
        .await
        .unwrap();

        assert_eq!(path, PathBuf::from("/example_image.png"));
    }

    #[tokio::test]
    async fn url_source_downloads_into_scratch_dir() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();
        let fetcher = RecordingFetcher::default();

        let path = materialize_image(
            Some(ImageSource::Url("http://x/y.jpg")),
            &scratch,
            &fetcher,
            Path::new("/example_image.png"),
        )
        .await
        .unwrap();

        let calls = fetcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://x/y.jpg");
        assert_eq!(calls[0].1, path);
        assert!(path.is_absolute());
        assert!(path.starts_with(scratch.path()));
        assert!(path.ends_with(INPUT_IMAGE_FILENAME));
    }

    #[tokio::test]
    async fn download_failure_propagates() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();

        let result = materialize_image(
            Some(ImageSource::Url("http://x/missing.jpg")),
            &scratch,
            &FailingFetcher,
            Path::new("/example_image.png"),
        )
        .await;

        assert_matches!(result, Err(CoreError::Download { url, .. }) if url == "http://x/missing.jpg");
    }

    // -- WgetFetcher against real processes --------------------------------

    #[tokio::test]
    async fn fetch_process_exit_failure_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = WgetFetcher::with_program("false", Duration::from_secs(5));

        let err = fetcher
            .fetch("http://example.com/a.jpg", &dir.path().join("a.jpg"))
            .await
            .unwrap_err();

        assert_matches!(
            err,
            CoreError::Download { ref url, ref reason }
                if url == "http://example.com/a.jpg" && reason.contains("exit status")
        );
    }

    #[tokio::test]
    async fn missing_fetch_program_is_download_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = WgetFetcher::with_program(
            dir.path().join("no-such-downloader"),
            Duration::from_secs(5),
        );

        let err = fetcher
            .fetch("http://example.com/a.jpg", &dir.path().join("a.jpg"))
            .await
            .unwrap_err();

        assert_matches!(err, CoreError::Download { ref reason, .. } if reason.contains("failed to run"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_fetch_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-fetch");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let fetcher = WgetFetcher::with_program(&script, Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = fetcher
            .fetch("http://example.com/a.jpg", &dir.path().join("a.jpg"))
            .await
            .unwrap_err();

        assert_matches!(err, CoreError::Download { ref reason, .. } if reason.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn base64_source_is_decoded_to_file() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();
        let fetcher = RecordingFetcher::default();

        let path = materialize_image(
            Some(ImageSource::Base64("aGVsbG8gd29ybGQ=")),
            &scratch,
            &fetcher,
            Path::new("/example_image.png"),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_base64_is_decode_error() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();

        let result = materialize_image(
            Some(ImageSource::Base64("not base64!!")),
            &scratch,
            &RecordingFetcher::default(),
            Path::new("/example_image.png"),
        )
        .await;

        assert_matches!(result, Err(CoreError::Decode(_)));
        assert!(!scratch.path().exists());
    }

    #[tokio::test]
    async fn scratch_dir_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::new(root.path()).unwrap();
        let dir = scratch.ensure().await.unwrap().to_path_buf();
        std::fs::write(dir.join("leftover.bin"), b"x").unwrap();
        assert!(dir.exists());

        drop(scratch);
        assert!(!dir.exists());
    }
}
