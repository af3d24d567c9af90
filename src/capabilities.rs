//! Worker capabilities and the constraints buckets place on them.
//!
//! A worker declares a list of named capabilities (e.g. `os.version = 14.2`) with every
//! dequeue request. A bucket may require capabilities through constraints; the bucket is
//! only handed to workers whose declared capabilities satisfy every requirement.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub name: String,
    pub value: String,
}

impl WorkerCapability {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WorkerCapabilityConstraint {
    Absent,
    Equal(String),
    LessThan(String),
    GreaterThan(String),
    Not(Box<WorkerCapabilityConstraint>),
    All(Vec<WorkerCapabilityConstraint>),
    Any(Vec<WorkerCapabilityConstraint>),
}

impl WorkerCapabilityConstraint {
    pub fn present() -> Self {
        Self::Not(Box::new(Self::Absent))
    }

    pub fn greater_than_or_equal_to(value: impl Into<String>) -> Self {
        let value = value.into();
        Self::Any(vec![Self::Equal(value.clone()), Self::GreaterThan(value)])
    }

    pub fn and(self, other: Self) -> Self {
        Self::All(vec![self, other])
    }

    /// `value` is `None` when the worker does not declare the capability at all.
    pub fn is_satisfied_by(&self, value: Option<&str>) -> bool {
        match self {
            Self::Absent => value.is_none(),
            Self::Equal(expected) => value == Some(expected.as_str()),
            Self::LessThan(bound) => {
                value.is_some_and(|v| compare_values(v, bound) == Ordering::Less)
            }
            Self::GreaterThan(bound) => {
                value.is_some_and(|v| compare_values(v, bound) == Ordering::Greater)
            }
            Self::Not(inner) => !inner.is_satisfied_by(value),
            Self::All(constraints) => constraints.iter().all(|c| c.is_satisfied_by(value)),
            Self::Any(constraints) => constraints.iter().any(|c| c.is_satisfied_by(value)),
        }
    }
}

/// Numeric comparison when both sides parse as numbers, lexicographic otherwise.
fn compare_values(left: &str, right: &str) -> Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerCapabilityRequirement {
    pub capability_name: String,
    pub constraint: WorkerCapabilityConstraint,
}

impl WorkerCapabilityRequirement {
    pub fn new(capability_name: impl Into<String>, constraint: WorkerCapabilityConstraint) -> Self {
        Self {
            capability_name: capability_name.into(),
            constraint,
        }
    }
}

/// Returns true if every requirement is met by at least one capability with a matching
/// name, or, when the worker lacks the capability, if the constraint accepts its absence.
pub fn requirements_satisfied(
    requirements: &[WorkerCapabilityRequirement],
    capabilities: &[WorkerCapability],
) -> bool {
    requirements.iter().all(|requirement| {
        let mut matching = capabilities
            .iter()
            .filter(|c| c.name == requirement.capability_name)
            .peekable();

        if matching.peek().is_none() {
            requirement.constraint.is_satisfied_by(None)
        } else {
            matching.any(|c| requirement.constraint.is_satisfied_by(Some(&c.value)))
        }
    })
}

/// Latest capability set declared by each worker.
#[derive(Debug, Default)]
pub struct WorkerCapabilitiesStorage {
    capabilities: Mutex<HashMap<WorkerId, Vec<WorkerCapability>>>,
}

impl WorkerCapabilitiesStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, worker_id: &WorkerId, capabilities: &[WorkerCapability]) {
        self.capabilities
            .lock()
            .insert(worker_id.clone(), capabilities.to_vec());
    }

    pub fn capabilities(&self, worker_id: &WorkerId) -> Vec<WorkerCapability> {
        self.capabilities
            .lock()
            .get(worker_id)
            .cloned()
            .unwrap_or_default()
    }
}
