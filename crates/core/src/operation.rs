//! The operation contract exchanged with the document/store layer.
//!
//! An invoked export receives the current control state and answers with
//! control changes and/or leveled issues. The result shape is validated
//! before anything is applied back to the store: malformed extension output
//! must never corrupt application state silently.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::value::ExtValue;

/// Where an operation lives: a bundle, a module inside it, a named export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub bundle_url: Url,
    pub module_id: String,
    pub export_name: String,
}

/// The argument supplied to an invoked operation export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OperationControls {
    /// Current value of every control, by name.
    pub values: BTreeMap<String, serde_json::Value>,
    /// Control names ordered by recency of user interaction; the export uses
    /// this to decide which controls to recompute.
    pub priorities: Vec<String>,
}

impl OperationControls {
    /// The argument object handed to the export.
    pub fn to_ext_value(&self) -> ExtValue {
        ExtValue::object([
            (
                "values".to_string(),
                ExtValue::Object(
                    self.values
                        .iter()
                        .map(|(k, v)| (k.clone(), ExtValue::from(v.clone())))
                        .collect(),
                ),
            ),
            (
                "priorities".to_string(),
                ExtValue::array(self.priorities.iter().cloned().map(ExtValue::String)),
            ),
        ])
    }

    pub fn knows(&self, control: &str) -> bool {
        self.values.contains_key(control) || self.priorities.iter().any(|name| name == control)
    }
}

/// What an operation export returns. Unknown fields are a schema violation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OperationResult {
    #[serde(default)]
    pub changes: Vec<ControlChange>,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

/// A named control value update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ControlChange {
    pub control: String,
    pub value: serde_json::Value,
}

/// A leveled diagnostic, optionally targeting a named control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Issue {
    pub level: IssueLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<String>,
}

impl Issue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: IssueLevel::Error,
            message: message.into(),
            description: None,
            control: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_control(mut self, control: impl Into<String>) -> Self {
        self.control = Some(control.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_schema_rejects_unknown_fields() {
        let raw = serde_json::json!({
            "changes": [],
            "issues": [],
            "sideEffects": ["format C:"],
        });
        assert!(serde_json::from_value::<OperationResult>(raw).is_err());
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let result: OperationResult = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(result.changes.is_empty());
        assert!(result.issues.is_empty());
    }

    #[test]
    fn controls_convert_to_the_export_argument_shape() {
        let controls = OperationControls {
            values: [("text".to_string(), serde_json::json!("hello"))].into(),
            priorities: vec!["text".to_string()],
        };
        let arg = controls.to_ext_value();
        let entries = arg.as_object().unwrap();
        assert!(entries.contains_key("values"));
        assert!(entries.contains_key("priorities"));
        assert!(controls.knows("text"));
        assert!(!controls.knows("cipher"));
    }
}
