//! Job input schema.
//!
//! Every field is optional; absent fields fall back to the model profile
//! defaults when the workflow is parameterized.

use serde::Deserialize;

use crate::error::CoreError;

/// A single handler invocation as delivered by the serverless platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Job {
    /// Platform-assigned job identifier, when the platform provides one.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: JobInput,
}

impl Job {
    /// Deserialize a job envelope, reporting schema problems as
    /// [`CoreError::InvalidJob`].
    pub fn from_value(value: serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value).map_err(|e| CoreError::InvalidJob(e.to_string()))
    }
}

/// User-controllable generation parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobInput {
    pub image_path: Option<String>,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,

    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,

    /// Number of frames to generate.
    pub length: Option<u32>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub seed: Option<u64>,

    /// Kept as raw JSON: numbers and numeric strings are both accepted and
    /// validated when the resolution is computed.
    pub width: Option<serde_json::Value>,
    pub height: Option<serde_json::Value>,

    // Context-window knobs are forwarded to the workflow untouched.
    pub context_frames: Option<serde_json::Value>,
    pub context_overlap: Option<serde_json::Value>,
    pub context_stride: Option<serde_json::Value>,

    pub use_lightning_lora: Option<bool>,
    pub lightning_lora_strength: Option<f64>,
    pub use_nsfw_lora: Option<bool>,
    pub nsfw_lora_strength: Option<f64>,

    pub lora_pairs: Option<Vec<LoraPair>>,
}

/// Where the conditioning image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource<'a> {
    /// A file already present on the worker.
    Path(&'a str),
    /// A remote file to download.
    Url(&'a str),
    /// Inline file contents.
    Base64(&'a str),
}

impl JobInput {
    /// Pick the image source, preferring a path, then a URL, then base64.
    ///
    /// Returns `None` when the job supplies no image at all.
    pub fn image_source(&self) -> Option<ImageSource<'_>> {
        if let Some(path) = &self.image_path {
            Some(ImageSource::Path(path))
        } else if let Some(url) = &self.image_url {
            Some(ImageSource::Url(url))
        } else {
            self.image_base64.as_deref().map(ImageSource::Base64)
        }
    }

    /// User-supplied adapter pairs, in the order given.
    pub fn lora_pairs(&self) -> &[LoraPair] {
        self.lora_pairs.as_deref().unwrap_or_default()
    }
}

/// A user-requested LoRA adapter.
///
/// Accepts both the single-model shape (`name`/`weight`) and the
/// high/low-noise shape (`high`/`high_weight`) used by dual-model
/// workflows; only the high-noise half applies to this model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoraPair {
    pub name: Option<String>,
    pub high: Option<String>,
    pub weight: Option<f64>,
    pub high_weight: Option<f64>,
}

/// Strength applied when a pair carries no usable weight.
pub const DEFAULT_LORA_WEIGHT: f64 = 1.0;

impl LoraPair {
    /// Adapter filename: `name`, falling back to `high`. Empty names count
    /// as missing.
    pub fn adapter_name(&self) -> Option<&str> {
        [self.name.as_deref(), self.high.as_deref()]
            .into_iter()
            .flatten()
            .find(|n| !n.is_empty())
    }

    /// Adapter strength: `weight`, falling back to `high_weight`, then 1.0.
    ///
    /// A zero `weight` is treated as unset.
    pub fn strength(&self) -> f64 {
        self.weight
            .filter(|w| *w != 0.0)
            .or(self.high_weight)
            .unwrap_or(DEFAULT_LORA_WEIGHT)
    }
}
