//! Error types shared across the orchestration engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::generation::GenerationError;
use crate::sources::SourceError;

/// Registry lookup and construction errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry must list at least one agent")]
    Empty,

    #[error("Unknown agent '{0}'")]
    NotFound(String),

    #[error("Agent '{0}' is registered more than once")]
    Duplicate(String),

    #[error("Agent '{agent}' depends on unknown agent '{dependency}'")]
    UnknownDependency { agent: String, dependency: String },

    #[error("Dependency cycle detected among agents: {0:?}")]
    Cycle(Vec<String>),
}

/// Query classification errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Query is empty")]
    EmptyQuery,
}

/// Closed set of failure kinds recorded on a failed agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingDependency,
    UpstreamUnavailable,
    GenerationFailed,
    Timeout,
    Cancelled,
    /// Executor task died without reporting (panic); an engine fault
    Internal,
}

/// Failure raised by an agent executor
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Agent '{agent}' is missing the result of dependency '{dependency}'")]
    MissingDependency { agent: String, dependency: String },

    #[error("Data source unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Narrative generation failed: {0}")]
    GenerationFailed(String),

    #[error("Agent exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent task aborted: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MissingDependency { .. } => FailureKind::MissingDependency,
            Self::UpstreamUnavailable(_) => FailureKind::UpstreamUnavailable,
            Self::GenerationFailed(_) => FailureKind::GenerationFailed,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Faults indicate a bug in the engine rather than an operational failure
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::MissingDependency { .. } | Self::Internal(_))
    }
}

impl From<SourceError> for AgentError {
    fn from(err: SourceError) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

impl From<GenerationError> for AgentError {
    fn from(err: GenerationError) -> Self {
        Self::GenerationFailed(err.to_string())
    }
}

/// Execution plan construction errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Intent requires no agents")]
    EmptyPlan,

    #[error("Intent requires unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("Agent '{agent}' depends on '{dependency}', which is not part of the plan")]
    MissingDependency { agent: String, dependency: String },

    #[error("No executor registered for agent '{0}'")]
    NoExecutor(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result aggregation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Run {0} has not reached a terminal status")]
    IncompleteRun(Uuid),
}

/// Errors surfaced by the run manager to callers
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error("Run {0} not found")]
    NotFound(Uuid),

    #[error("Run {0} already has a subscriber")]
    AlreadySubscribed(Uuid),
}
