//! Operation reports delivered back to the remote callback
//!
//! A report is a tree: every node carries a status plus optional error and
//! message lists, and a node is only `true` when all of its children are.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::error::AgentError;

/// One step of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub msg: Vec<String>,
    /// Sub-steps, e.g. plugin restore nested under application restore
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub operation: BTreeMap<String, StepReport>,
}

impl StepReport {
    pub fn ok() -> Self {
        Self {
            status: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: false,
            error: vec![error.into()],
            ..Default::default()
        }
    }

    pub fn from_result<T>(result: Result<T, AgentError>, context: &str) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failed(format!("{}: {}", context, e)),
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg.push(msg.into());
        self
    }

    pub fn push_msg(&mut self, msg: impl Into<String>) {
        self.msg.push(msg.into());
    }

    /// Record an error; the step is failed from now on
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.error.push(error.into());
        self.status = false;
    }

    /// Attach a nested step, folding its status into this one
    pub fn nest(&mut self, name: impl Into<String>, step: StepReport) {
        self.status = self.status && step.status;
        self.operation.insert(name.into(), step);
    }
}

/// Aggregate result of one pipeline run
///
/// `status` is maintained on every insert so it can never be `true` while a
/// recorded step is `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    status: bool,
    operation: BTreeMap<String, StepReport>,
}

impl Default for OperationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationReport {
    pub fn new() -> Self {
        Self {
            status: true,
            operation: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> bool {
        self.status
    }

    pub fn record(&mut self, step: impl Into<String>, report: StepReport) -> bool {
        let ok = report.status;
        self.operation.insert(step.into(), report);
        self.status = self.operation.values().all(|s| s.status);
        ok
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.operation.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = (&String, &StepReport)> {
        self.operation.iter()
    }

    pub fn len(&self) -> usize {
        self.operation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operation.is_empty()
    }

    /// Fold a whole report in as a single nested step
    pub fn into_step(self) -> StepReport {
        StepReport {
            status: self.status,
            operation: self.operation,
            ..Default::default()
        }
    }
}
