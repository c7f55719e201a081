//! The master's `ScaleUpPropose` surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One slot of a scale-up decision: bind `pod_name` to the agent at
/// `endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Propose {
    /// Target agent address, as `host:port`.
    pub endpoint: String,
    /// Workload+ordinal name, unique cluster-wide among live pods.
    pub pod_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleUpProposeRequest {
    pub proposes: Vec<Propose>,
}

/// Why a proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AgentUnreachable,
    AlreadyBound,
    LaunchFailed,
    InsufficientResources,
    InvalidRequest,
}

/// Per-entry outcome of a propose batch. Every `pod_name` from the request
/// appears in exactly one of the two sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaleUpProposeResponse {
    pub accepted: Vec<String>,
    pub rejected: BTreeMap<String, RejectReason>,
}
