//! Workflow template loading and parameterization.
//!
//! A ComfyUI API-format workflow is an object keyed by node ID:
//!
//! ```json
//! {
//!   "220": { "class_type": "WanVideoSampler", "inputs": { "seed": 42, "steps": 20 } }
//! }
//! ```
//!
//! Node IDs are only ever referenced through [`WorkflowBindings`], which
//! names each field the handler writes. Swapping the template means
//! swapping the bindings, not hunting for string literals.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::job::JobInput;
use crate::resolution::parse_dimension;

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// One writable input on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeField {
    pub node: &'static str,
    pub input: &'static str,
}

impl NodeField {
    pub const fn new(node: &'static str, input: &'static str) -> Self {
        Self { node, input }
    }
}

/// Maps named generation parameters onto template nodes.
#[derive(Debug, Clone)]
pub struct WorkflowBindings {
    pub image: NodeField,
    pub num_frames: NodeField,
    pub positive_prompt: NodeField,
    pub negative_prompt: NodeField,
    pub seed: NodeField,
    pub steps: NodeField,
    pub cfg: NodeField,
    pub width: NodeField,
    pub height: NodeField,
    pub context_frames: NodeField,
    pub context_overlap: NodeField,
    pub context_stride: NodeField,
    /// Multi-LoRA loader node exposing `lora_{i}` / `strength_{i}` inputs.
    pub lora_node: &'static str,
    /// Number of indexed slots on [`lora_node`](Self::lora_node).
    pub lora_slots: usize,
}

impl WorkflowBindings {
    /// Input key holding the adapter filename for `slot`.
    pub fn lora_name_key(slot: usize) -> String {
        format!("lora_{slot}")
    }

    /// Input key holding the adapter strength for `slot`.
    pub fn lora_strength_key(slot: usize) -> String {
        format!("strength_{slot}")
    }
}

/// Bindings for the Wan 2.2 5B image-to-video template.
pub const WAN22_5B_I2V_BINDINGS: WorkflowBindings = WorkflowBindings {
    image: NodeField::new("244", "image"),
    num_frames: NodeField::new("541", "num_frames"),
    positive_prompt: NodeField::new("135", "positive_prompt"),
    negative_prompt: NodeField::new("135", "negative_prompt"),
    seed: NodeField::new("220", "seed"),
    steps: NodeField::new("220", "steps"),
    cfg: NodeField::new("220", "cfg"),
    width: NodeField::new("235", "value"),
    height: NodeField::new("236", "value"),
    context_frames: NodeField::new("498", "context_frames"),
    context_overlap: NodeField::new("498", "context_overlap"),
    context_stride: NodeField::new("498", "context_stride"),
    lora_node: "279",
    lora_slots: 4,
};

// ---------------------------------------------------------------------------
// Model profile
// ---------------------------------------------------------------------------

/// An adapter shipped with the worker image.
#[derive(Debug, Clone)]
pub struct BuiltinLora {
    /// Filename inside the LoRA directory.
    pub filename: &'static str,
    pub default_strength: f64,
}

/// Template bindings plus the defaults applied when a job omits a field.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    /// Model tag reported in responses.
    pub tag: &'static str,
    pub bindings: WorkflowBindings,
    pub default_prompt: &'static str,
    pub default_negative_prompt: &'static str,
    pub default_length: u32,
    pub default_width: u32,
    pub default_height: u32,
    pub default_context_frames: u32,
    pub default_context_overlap: u32,
    pub default_context_stride: u32,
    /// Steps / CFG used when the performance adapter is active.
    pub fast_steps: u32,
    pub fast_cfg: f64,
    /// Steps / CFG used without it.
    pub standard_steps: u32,
    pub standard_cfg: f64,
    /// Distilled adapter that allows far fewer sampling steps.
    pub performance_lora: BuiltinLora,
    /// Secondary content adapter.
    pub content_lora: BuiltinLora,
}

impl ModelProfile {
    /// Wan 2.2 TI2V 5B, image-to-video.
    pub fn wan22_5b_i2v() -> Self {
        Self {
            tag: "5B_I2V",
            bindings: WAN22_5B_I2V_BINDINGS,
            default_prompt: "a person moving",
            default_negative_prompt:
                "blurry, distorted, low quality, ugly, deformed, static, worst quality",
            // 4 seconds at 16 fps.
            default_length: 65,
            default_width: 480,
            default_height: 832,
            default_context_frames: 65,
            default_context_overlap: 24,
            default_context_stride: 4,
            fast_steps: 6,
            fast_cfg: 3.0,
            standard_steps: 20,
            standard_cfg: 5.0,
            performance_lora: BuiltinLora {
                filename: "wan22_5b_lightning.safetensors",
                default_strength: 1.0,
            },
            content_lora: BuiltinLora {
                filename: "wan22_5b_nsfw.safetensors",
                default_strength: 0.8,
            },
        }
    }
}

/// Which built-in adapters are installed on this worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterAvailability {
    pub performance: bool,
    pub content: bool,
}

impl AdapterAvailability {
    /// Check the LoRA directory for the profile's built-in adapters.
    pub fn probe(lora_dir: &Path, profile: &ModelProfile) -> Self {
        let available = Self {
            performance: lora_dir.join(profile.performance_lora.filename).exists(),
            content: lora_dir.join(profile.content_lora.filename).exists(),
        };
        tracing::debug!(
            lora_dir = %lora_dir.display(),
            performance = available.performance,
            content = available.content,
            "Probed built-in adapters",
        );
        available
    }
}

// ---------------------------------------------------------------------------
// Parameter resolution
// ---------------------------------------------------------------------------

/// An adapter placed in a LoRA loader slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraAssignment {
    pub slot: usize,
    pub name: String,
    pub strength: f64,
}

/// Fully resolved values written into the template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub image: PathBuf,
    pub prompt: String,
    pub negative_prompt: String,
    pub length: u32,
    pub steps: u32,
    pub cfg: f64,
    pub seed: u64,
    pub width: u32,
    pub height: u32,
    pub context_frames: Value,
    pub context_overlap: Value,
    pub context_stride: Value,
    pub loras: Vec<LoraAssignment>,
    /// Whether the performance adapter occupies a slot.
    pub fast_mode: bool,
}

/// Seed used when the job gives none: wall-clock milliseconds mod 2^32.
///
/// Not random; two jobs started in the same millisecond share a seed.
pub fn default_seed() -> u64 {
    (chrono::Utc::now().timestamp_millis() as u64) % (1u64 << 32)
}

/// Fill LoRA slots: performance adapter, content adapter, then user pairs
/// in order until the loader runs out of slots.
///
/// User pairs are cut to the slots left after the built-ins before names
/// are checked, so a pair without a usable name still takes its slot and
/// that slot stays empty.
pub fn assign_lora_slots(
    input: &JobInput,
    profile: &ModelProfile,
    available: AdapterAvailability,
) -> Vec<LoraAssignment> {
    let capacity = profile.bindings.lora_slots;
    let mut assignments: Vec<LoraAssignment> = Vec::with_capacity(capacity);

    let mut push = |name: &str, strength: f64| {
        if assignments.len() < capacity {
            assignments.push(LoraAssignment {
                slot: assignments.len(),
                name: name.to_string(),
                strength,
            });
        } else {
            tracing::warn!(name, capacity, "No free LoRA slot, adapter dropped");
        }
    };

    if available.performance && input.use_lightning_lora.unwrap_or(true) {
        let lora = &profile.performance_lora;
        push(
            lora.filename,
            input.lightning_lora_strength.unwrap_or(lora.default_strength),
        );
    }

    if available.content && input.use_nsfw_lora.unwrap_or(true) {
        let lora = &profile.content_lora;
        push(
            lora.filename,
            input.nsfw_lora_strength.unwrap_or(lora.default_strength),
        );
    }

    let base = assignments.len();
    let pairs = input.lora_pairs();
    let free = capacity.saturating_sub(base);
    if pairs.len() > free {
        tracing::warn!(
            requested = pairs.len(),
            free,
            "Too many LoRA pairs, extra pairs dropped"
        );
    }

    for (i, pair) in pairs.iter().take(free).enumerate() {
        match pair.adapter_name() {
            Some(name) => assignments.push(LoraAssignment {
                slot: base + i,
                name: name.to_string(),
                strength: pair.strength(),
            }),
            None => tracing::warn!(?pair, slot = base + i, "Skipping LoRA pair without a name"),
        }
    }

    assignments
}

/// Combine job input, profile defaults and installed adapters into the
/// values written to the template.
pub fn resolve_params(
    input: &JobInput,
    profile: &ModelProfile,
    available: AdapterAvailability,
    image: PathBuf,
    fallback_seed: u64,
) -> Result<GenerationParams, CoreError> {
    let loras = assign_lora_slots(input, profile, available);
    let fast_mode = available.performance && input.use_lightning_lora.unwrap_or(true);

    let (default_steps, default_cfg) = if fast_mode {
        (profile.fast_steps, profile.fast_cfg)
    } else {
        (profile.standard_steps, profile.standard_cfg)
    };

    let width = match &input.width {
        Some(v) => parse_dimension("width", v)?,
        None => profile.default_width,
    };
    let height = match &input.height {
        Some(v) => parse_dimension("height", v)?,
        None => profile.default_height,
    };

    Ok(GenerationParams {
        image,
        prompt: input
            .prompt
            .clone()
            .unwrap_or_else(|| profile.default_prompt.to_string()),
        negative_prompt: input
            .negative_prompt
            .clone()
            .unwrap_or_else(|| profile.default_negative_prompt.to_string()),
        length: input.length.unwrap_or(profile.default_length),
        steps: input.steps.unwrap_or(default_steps),
        cfg: input.cfg.unwrap_or(default_cfg),
        seed: input.seed.unwrap_or(fallback_seed),
        width,
        height,
        context_frames: input
            .context_frames
            .clone()
            .unwrap_or_else(|| profile.default_context_frames.into()),
        context_overlap: input
            .context_overlap
            .clone()
            .unwrap_or_else(|| profile.default_context_overlap.into()),
        context_stride: input
            .context_stride
            .clone()
            .unwrap_or_else(|| profile.default_context_stride.into()),
        loras,
        fast_mode,
    })
}

// ---------------------------------------------------------------------------
// Workflow graph
// ---------------------------------------------------------------------------

/// A parsed workflow template.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

impl Workflow {
    /// Read and parse a template file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Template(format!("failed to read {}: {e}", path.display()))
        })?;
        let json: Value = serde_json::from_str(&text).map_err(|e| {
            CoreError::Template(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        let workflow = Self::from_value(json)?;
        tracing::info!(
            path = %path.display(),
            nodes = workflow.nodes.len(),
            "Loaded workflow template",
        );
        Ok(workflow)
    }

    /// Wrap an API-format workflow object.
    ///
    /// Every node must carry a string `class_type`; a missing `inputs`
    /// object is created empty.
    pub fn from_value(json: Value) -> Result<Self, CoreError> {
        let Value::Object(mut nodes) = json else {
            return Err(CoreError::Template(
                "workflow JSON must be an object".to_string(),
            ));
        };
        if nodes.is_empty() {
            return Err(CoreError::Template(
                "workflow JSON must contain at least one node".to_string(),
            ));
        }

        for (node_id, node) in nodes.iter_mut() {
            let Some(node_obj) = node.as_object_mut() else {
                return Err(CoreError::Template(format!(
                    "node '{node_id}' must be an object"
                )));
            };
            if !node_obj.get("class_type").is_some_and(Value::is_string) {
                return Err(CoreError::Template(format!(
                    "node '{node_id}' is missing required 'class_type' field"
                )));
            }
            let inputs = node_obj
                .entry("inputs")
                .or_insert_with(|| Value::Object(Map::new()));
            if !inputs.is_object() {
                return Err(CoreError::Template(format!(
                    "node '{node_id}' has non-object 'inputs'"
                )));
            }
        }

        Ok(Self { nodes })
    }

    /// Node IDs in the template.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Class type of a node.
    pub fn class_type(&self, node: &str) -> Option<&str> {
        self.nodes.get(node)?.get("class_type")?.as_str()
    }

    /// Input object of a node.
    pub fn inputs(&self, node: &str) -> Option<&Map<String, Value>> {
        self.nodes.get(node)?.get("inputs")?.as_object()
    }

    /// Current value of one input.
    pub fn get(&self, node: &str, input: &str) -> Option<&Value> {
        self.inputs(node)?.get(input)
    }

    /// Write a bound field.
    pub fn set(&mut self, field: NodeField, value: impl Into<Value>) -> Result<(), CoreError> {
        self.set_input(field.node, field.input, value.into())
    }

    /// Write an input on an existing node.
    pub fn set_input(&mut self, node: &str, input: &str, value: Value) -> Result<(), CoreError> {
        let inputs = self
            .nodes
            .get_mut(node)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| CoreError::MissingNode(node.to_string()))?;
        inputs.insert(input.to_string(), value);
        Ok(())
    }

    /// Write resolved parameters through `bindings`.
    pub fn apply(
        &mut self,
        bindings: &WorkflowBindings,
        params: &GenerationParams,
    ) -> Result<(), CoreError> {
        self.set(bindings.image, params.image.to_string_lossy().into_owned())?;
        self.set(bindings.num_frames, params.length)?;
        self.set(bindings.positive_prompt, params.prompt.as_str())?;
        self.set(bindings.negative_prompt, params.negative_prompt.as_str())?;
        self.set(bindings.seed, params.seed)?;
        self.set(bindings.cfg, params.cfg)?;
        self.set(bindings.steps, params.steps)?;
        self.set(bindings.width, params.width)?;
        self.set(bindings.height, params.height)?;
        self.set(bindings.context_frames, params.context_frames.clone())?;
        self.set(bindings.context_overlap, params.context_overlap.clone())?;
        self.set(bindings.context_stride, params.context_stride.clone())?;

        for lora in &params.loras {
            self.set_input(
                bindings.lora_node,
                &WorkflowBindings::lora_name_key(lora.slot),
                lora.name.as_str().into(),
            )?;
            self.set_input(
                bindings.lora_node,
                &WorkflowBindings::lora_strength_key(lora.slot),
                lora.strength.into(),
            )?;
            tracing::info!(
                slot = lora.slot,
                name = %lora.name,
                strength = lora.strength,
                "LoRA applied",
            );
        }

        tracing::info!(
            frames = params.length,
            steps = params.steps,
            cfg = params.cfg,
            seed = params.seed,
            width = params.width,
            height = params.height,
            fast_mode = params.fast_mode,
            "Workflow parameterized",
        );
        Ok(())
    }

    /// Serialize for submission.
    pub fn to_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }
}
