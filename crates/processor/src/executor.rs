//! Turning export invocations into store-safe outcomes.
//!
//! The executor is the glue between the document/store layer and the
//! controller. Whatever an extension returns (a rejection, a malformed
//! result shape, changes aimed at controls that do not exist), the outcome
//! handed back to the store is always safe to apply: invalid output is
//! converted into error-level issues, never into state.

use pipeforge_core::operation::{
    ControlChange, Issue, OperationControls, OperationHandle, OperationResult,
};
use pipeforge_core::ExtValue;

use crate::controller::Controller;

/// What an operation run produced: validated changes plus diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutcome {
    pub changes: Vec<ControlChange>,
    pub issues: Vec<Issue>,
}

impl OperationOutcome {
    fn failed(issue: Issue) -> Self {
        Self {
            changes: Vec::new(),
            issues: vec![issue],
        }
    }

    /// Whether any error-level issue is present.
    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.level == pipeforge_core::operation::IssueLevel::Error)
    }
}

/// Invoke an operation export with the current control state and validate
/// what comes back.
///
/// This never returns an error: a failed call becomes a single error-level
/// issue attached to the invoking node, per the propagation policy.
pub async fn execute_operation(
    controller: &Controller,
    handle: &OperationHandle,
    controls: &OperationControls,
) -> OperationOutcome {
    let result = controller
        .call_module_function(
            &handle.bundle_url,
            &handle.module_id,
            &handle.export_name,
            vec![controls.to_ext_value()],
        )
        .await;

    match result {
        Ok(value) => validate_result(value, controls),
        Err(err) => {
            tracing::debug!(
                bundle = %handle.bundle_url,
                module = %handle.module_id,
                export = %handle.export_name,
                %err,
                "operation call failed"
            );
            OperationOutcome::failed(Issue::error(err.to_string()))
        }
    }
}

/// Validate a raw result value against the operation contract.
fn validate_result(value: ExtValue, controls: &OperationControls) -> OperationOutcome {
    let json = match value.into_json() {
        Ok(json) => json,
        Err(err) => {
            return OperationOutcome::failed(
                Issue::error("operation returned a value outside the result contract")
                    .with_description(err.to_string()),
            );
        }
    };

    let result: OperationResult = match serde_json::from_value(json) {
        Ok(result) => result,
        Err(err) => {
            return OperationOutcome::failed(
                Issue::error("operation result does not match the expected schema")
                    .with_description(err.to_string()),
            );
        }
    };

    let mut outcome = OperationOutcome::default();
    for change in result.changes {
        if controls.knows(&change.control) {
            outcome.changes.push(change);
        } else {
            outcome.issues.push(Issue::error(format!(
                "operation returned a change for unknown control '{}'",
                change.control
            )));
        }
    }
    for issue in result.issues {
        match &issue.control {
            Some(control) if !controls.knows(control) => {
                outcome.issues.push(Issue::error(format!(
                    "operation issue targets unknown control '{control}'"
                )));
            }
            _ => outcome.issues.push(issue),
        }
    }
    outcome
}
