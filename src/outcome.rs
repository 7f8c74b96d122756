//! Probability-weighted outcome selection.

use rand::Rng;
use serde::Serialize;
use std::fmt;

use crate::config::{BranchConfig, EndpointDefinition, DEFAULT_STATUS};

/// Which side of a probability split was drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    Success,
    Failure,
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchKind::Success => f.write_str("success"),
            BranchKind::Failure => f.write_str("failure"),
        }
    }
}

/// The branch chosen for one request.
#[derive(Debug, Clone, Copy)]
pub struct Outcome<'a> {
    pub kind: BranchKind,
    pub branch: &'a BranchConfig,
}

impl<'a> Outcome<'a> {
    pub fn status(&self) -> u16 {
        self.branch.status_code.unwrap_or(DEFAULT_STATUS)
    }

    pub fn delay_ms(&self) -> u64 {
        self.branch.delay.unwrap_or(0)
    }

    pub fn response(&self) -> Option<&'a serde_json::Value> {
        self.branch.response.as_ref()
    }
}

/// The drawn branch is not configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Missing {0} response configuration")]
pub struct MissingBranch(pub BranchKind);

/// Draw an outcome with the thread-local RNG.
///
/// Returns `Ok(None)` for endpoints without a probability split.
pub fn select(endpoint: &EndpointDefinition) -> Result<Option<Outcome<'_>>, MissingBranch> {
    select_with(endpoint, &mut rand::thread_rng())
}

/// Draw an outcome with the given RNG.
///
/// A value drawn uniformly from `[0, 100)` selects `success` when it is at
/// most `probability`.
pub fn select_with<'a, R: Rng>(
    endpoint: &'a EndpointDefinition,
    rng: &mut R,
) -> Result<Option<Outcome<'a>>, MissingBranch> {
    let (Some(probability), Some(responses)) = (endpoint.probability, &endpoint.responses) else {
        return Ok(None);
    };

    let draw: f64 = rng.gen_range(0.0..100.0);
    let (kind, branch) = if draw <= probability {
        (BranchKind::Success, responses.success.as_ref())
    } else {
        (BranchKind::Failure, responses.failure.as_ref())
    };

    branch
        .map(|branch| Some(Outcome { kind, branch }))
        .ok_or(MissingBranch(kind))
}
