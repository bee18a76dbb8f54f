use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vidgen_comfyui::retry::RetryPolicy;
use vidgen_comfyui::session::SessionConfig;

/// Handler configuration loaded from environment variables.
///
/// All fields default to the layout of the serverless worker image.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    /// ComfyUI host (default: `127.0.0.1`).
    pub server_address: String,
    /// ComfyUI port (default: `8188`).
    pub comfyui_port: u16,
    /// Workflow template (default: `/new_Wan22_api.json`).
    pub workflow_path: PathBuf,
    /// Directory probed for the built-in LoRA adapters.
    pub lora_dir: PathBuf,
    /// ComfyUI output directory, for artifacts without a `fullpath`.
    pub output_dir: PathBuf,
    /// Image used when a job supplies none.
    pub default_image: PathBuf,
    /// Parent of the per-job scratch directories.
    pub scratch_root: PathBuf,
    pub http_ready: RetryPolicy,
    pub ws_connect: RetryPolicy,
    /// Unset waits for completion indefinitely.
    pub completion_timeout: Option<Duration>,
    pub download_timeout: Duration,
    /// Check the template against `/object_info` before submitting.
    pub validate_workflow: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".into(),
            comfyui_port: 8188,
            workflow_path: "/new_Wan22_api.json".into(),
            lora_dir: "/ComfyUI/models/loras".into(),
            output_dir: "/ComfyUI/output".into(),
            default_image: "/example_image.png".into(),
            scratch_root: ".".into(),
            http_ready: RetryPolicy::http_ready(),
            ws_connect: RetryPolicy::ws_connect(),
            completion_timeout: None,
            download_timeout: vidgen_core::input::DEFAULT_DOWNLOAD_TIMEOUT,
            validate_workflow: false,
        }
    }
}

impl HandlerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                  |
    /// |----------------------------|--------------------------|
    /// | `SERVER_ADDRESS`           | `127.0.0.1`              |
    /// | `COMFYUI_PORT`             | `8188`                   |
    /// | `WORKFLOW_PATH`            | `/new_Wan22_api.json`    |
    /// | `LORA_DIR`                 | `/ComfyUI/models/loras`  |
    /// | `COMFYUI_OUTPUT_DIR`       | `/ComfyUI/output`        |
    /// | `DEFAULT_IMAGE_PATH`       | `/example_image.png`     |
    /// | `SCRATCH_DIR`              | `.`                      |
    /// | `HTTP_READY_ATTEMPTS`      | `180`                    |
    /// | `HTTP_READY_INTERVAL_SECS` | `1`                      |
    /// | `WS_CONNECT_ATTEMPTS`      | `36`                     |
    /// | `WS_CONNECT_INTERVAL_SECS` | `5`                      |
    /// | `COMPLETION_TIMEOUT_SECS`  | unset                    |
    /// | `DOWNLOAD_TIMEOUT_SECS`    | `300`                    |
    /// | `VALIDATE_WORKFLOW`        | `false`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env(lookup);

        let http_ready = RetryPolicy::fixed(
            Duration::from_secs(env.parse(
                "HTTP_READY_INTERVAL_SECS",
                defaults.http_ready.initial_delay.as_secs(),
            )?),
            env.parse("HTTP_READY_ATTEMPTS", defaults.http_ready.max_attempts)?,
        );
        let ws_connect = RetryPolicy::fixed(
            Duration::from_secs(env.parse(
                "WS_CONNECT_INTERVAL_SECS",
                defaults.ws_connect.initial_delay.as_secs(),
            )?),
            env.parse("WS_CONNECT_ATTEMPTS", defaults.ws_connect.max_attempts)?,
        );

        Ok(Self {
            server_address: env.string("SERVER_ADDRESS").unwrap_or(defaults.server_address),
            comfyui_port: env.parse("COMFYUI_PORT", defaults.comfyui_port)?,
            workflow_path: env.path("WORKFLOW_PATH").unwrap_or(defaults.workflow_path),
            lora_dir: env.path("LORA_DIR").unwrap_or(defaults.lora_dir),
            output_dir: env.path("COMFYUI_OUTPUT_DIR").unwrap_or(defaults.output_dir),
            default_image: env.path("DEFAULT_IMAGE_PATH").unwrap_or(defaults.default_image),
            scratch_root: env.path("SCRATCH_DIR").unwrap_or(defaults.scratch_root),
            http_ready,
            ws_connect,
            completion_timeout: env
                .parse_opt::<u64>("COMPLETION_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            download_timeout: Duration::from_secs(env.parse(
                "DOWNLOAD_TIMEOUT_SECS",
                defaults.download_timeout.as_secs(),
            )?),
            validate_workflow: env.parse("VALIDATE_WORKFLOW", defaults.validate_workflow)?,
        })
    }

    /// HTTP base URL of the ComfyUI instance.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.server_address, self.comfyui_port)
    }

    /// WebSocket base URL of the ComfyUI instance.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.server_address, self.comfyui_port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            http_ready: self.http_ready.clone(),
            ws_connect: self.ws_connect.clone(),
            completion_timeout: self.completion_timeout,
        }
    }
}

/// An environment variable held a value that could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("{var} has invalid value {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Non-empty, trimmed value of `var`.
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, var: &str) -> Option<PathBuf> {
        self.string(var).map(PathBuf::from)
    }

    fn parse_opt<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(var) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError { var, value }),
        }
    }

    fn parse<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_opt(var)?.unwrap_or(default))
    }
}
