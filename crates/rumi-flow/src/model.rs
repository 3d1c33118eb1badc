// SPDX-License-Identifier: MIT OR Apache-2.0
//! Flow and step definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a capability handler.
    #[default]
    Handler,
    /// Repeat children until `exit_when` or `max_iterations`.
    Loop,
    /// Run `then` or `else` depending on `when`.
    Branch,
    /// Fan branches out onto concurrent tasks.
    Parallel,
    /// Run children under an optional `when` gate.
    Group,
    /// Re-invoke a handler up to `max_attempts` times.
    Retry,
}

/// Flow-level error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Record the step error and keep going.
    #[default]
    Continue,
    /// Stop the flow at the first step error.
    Abort,
}

/// One step of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step id; the step's output lands in the context under this key.
    pub id: String,
    /// Step kind. Defaults to `handler`.
    #[serde(default)]
    pub kind: StepKind,
    /// Permission id to invoke (`handler` and `retry` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Handler arguments, resolved before dispatch.
    #[serde(default)]
    pub args: Value,
    /// Skip the step unless this condition holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Loop exit condition, evaluated after each iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_when: Option<String>,
    /// Step ids that must run before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optional phase label; dependencies across phases are diagnosed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Iteration bound for `loop` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Attempt bound for `retry` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Delay between retry attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Children of `loop` and `group` steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Step>,
    /// Branches of a `parallel` step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Vec<Step>>,
    /// Steps taken when a `branch` condition holds.
    #[serde(default, rename = "then", skip_serializing_if = "Vec::is_empty")]
    pub then_steps: Vec<Step>,
    /// Steps taken when a `branch` condition fails.
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<Step>,
}

impl Step {
    /// A bare handler step.
    pub fn handler(id: &str, permission_id: &str, args: Value) -> Self {
        Self {
            id: id.to_string(),
            kind: StepKind::Handler,
            handler: Some(permission_id.to_string()),
            args,
            when: None,
            exit_when: None,
            depends_on: Vec::new(),
            phase: None,
            max_iterations: None,
            max_attempts: None,
            delay_ms: None,
            children: Vec::new(),
            branches: Vec::new(),
            then_steps: Vec::new(),
            else_steps: Vec::new(),
        }
    }

    /// Builder: add a dependency.
    pub fn after(mut self, step_id: &str) -> Self {
        self.depends_on.push(step_id.to_string());
        self
    }

    /// Builder: add a `when` gate.
    pub fn when(mut self, condition: &str) -> Self {
        self.when = Some(condition.to_string());
        self
    }
}

/// An ordered set of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDef {
    /// Flow identifier (for audit and chaining diagnostics).
    pub flow_id: String,
    /// Steps in declaration order.
    pub steps: Vec<Step>,
    /// Error policy.
    #[serde(default)]
    pub on_error: OnError,
}
