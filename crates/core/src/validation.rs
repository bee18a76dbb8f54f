//! Workflow validation against a server's node definitions.
//!
//! ComfyUI rejects a prompt outright when a node references an unknown
//! input, so templates are checked against `GET /object_info` before they
//! reach production.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::workflow::Workflow;

/// A single problem found in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// The server has no node class with this name.
    UnknownClass { node_id: String, class_type: String },
    /// The node sets an input its class does not declare.
    UnknownInput {
        node_id: String,
        class_type: String,
        input: String,
    },
    /// A required input is absent.
    MissingInput {
        node_id: String,
        class_type: String,
        input: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::UnknownClass {
                node_id,
                class_type,
            } => write!(f, "Node {node_id}: unknown class_type '{class_type}'"),
            ValidationIssue::UnknownInput {
                node_id,
                class_type,
                input,
            } => write!(f, "Node {node_id} ({class_type}): unknown input '{input}'"),
            ValidationIssue::MissingInput {
                node_id,
                class_type,
                input,
            } => write!(
                f,
                "Node {node_id} ({class_type}): missing required input '{input}'"
            ),
        }
    }
}

/// Outcome of validating a whole workflow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// Nodes whose class was found and whose inputs were checked.
    pub nodes_checked: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// Convert a failed report into [`CoreError::WorkflowInvalid`].
    pub fn into_result(self) -> Result<(), CoreError> {
        if self.is_valid() {
            return Ok(());
        }
        let summary = self
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(CoreError::WorkflowInvalid(summary))
    }
}

/// Declared interface of one node class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeSignature {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub hidden: Vec<String>,
    pub outputs: Vec<String>,
}

impl NodeSignature {
    fn accepts(&self, input: &str) -> bool {
        [&self.required, &self.optional, &self.hidden]
            .into_iter()
            .any(|names| names.iter().any(|n| n == input))
    }
}

/// Extract a node class's signature from an `/object_info` response.
pub fn node_signature(object_info: &Value, class_type: &str) -> Option<NodeSignature> {
    let def = object_info.get(class_type)?;
    let input_def = def.get("input");

    let names = |section: &str| -> Vec<String> {
        input_def
            .and_then(|i| i.get(section))
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    };

    let outputs = def
        .get("output")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    // Combo outputs are lists of choices.
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(NodeSignature {
        required: names("required"),
        optional: names("optional"),
        hidden: names("hidden"),
        outputs,
    })
}

/// Check every node of `workflow` against the server's definitions.
pub fn validate_workflow(workflow: &Workflow, object_info: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    for node_id in workflow.node_ids() {
        let class_type = workflow.class_type(node_id).unwrap_or_default();

        let Some(signature) = node_signature(object_info, class_type) else {
            report.issues.push(ValidationIssue::UnknownClass {
                node_id: node_id.to_string(),
                class_type: class_type.to_string(),
            });
            continue;
        };

        let present: BTreeSet<&str> = workflow
            .inputs(node_id)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();

        for input in &present {
            if !signature.accepts(input) {
                report.issues.push(ValidationIssue::UnknownInput {
                    node_id: node_id.to_string(),
                    class_type: class_type.to_string(),
                    input: input.to_string(),
                });
            }
        }

        for required in &signature.required {
            if !present.contains(required.as_str()) {
                report.issues.push(ValidationIssue::MissingInput {
                    node_id: node_id.to_string(),
                    class_type: class_type.to_string(),
                    input: required.clone(),
                });
            }
        }

        tracing::debug!(
            node_id,
            class_type,
            inputs = present.len(),
            "Node validated",
        );
        report.nodes_checked += 1;
    }

    report
}
