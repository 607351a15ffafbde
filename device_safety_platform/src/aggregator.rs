//! Folds a finished run into the caller-facing [`FinalResult`].

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentOutput;
use crate::error::{AggregationError, FailureKind};
use crate::intent::Intent;
use crate::run::{AgentStatus, OrchestrationRun, RunStatus};

/// What was attempted for one agent, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDiagnostic {
    pub status: AgentStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub run_id: Uuid,
    pub query: String,
    pub intent: Intent,
    pub status: RunStatus,
    /// Completed agents only, in plan order
    pub results: IndexMap<String, AgentOutput>,
    /// Every agent of the plan
    pub diagnostics: IndexMap<String, AgentDiagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl FinalResult {
    pub fn succeeded(&self) -> Vec<&str> {
        self.results.keys().map(String::as_str).collect()
    }
}

pub fn aggregate(run: &OrchestrationRun) -> Result<FinalResult, AggregationError> {
    let status = run.status();
    if !status.is_terminal() {
        return Err(AggregationError::IncompleteRun(run.id));
    }

    let mut results = IndexMap::new();
    let mut diagnostics = IndexMap::new();
    for (id, agent) in &run.agents {
        let snapshot = agent.snapshot();
        if let Some(output) = agent.result() {
            results.insert(id.clone(), output.clone());
        }
        diagnostics.insert(
            id.clone(),
            AgentDiagnostic {
                status: snapshot.status,
                progress: snapshot.progress,
                message: snapshot.message,
                error_kind: snapshot.failure.map(|failure| failure.kind),
            },
        );
    }

    // The last narrative in plan order is the answer
    let answer = results.values().rev().find_map(|output| match output {
        AgentOutput::Narrative { text, .. } => Some(text.clone()),
        _ => None,
    });

    let finished_at = run.finished_at().unwrap_or_else(Utc::now);
    let duration_ms = (finished_at - run.started_at).num_milliseconds().max(0) as u64;

    Ok(FinalResult {
        run_id: run.id,
        query: run.query.clone(),
        intent: (*run.intent).clone(),
        status,
        results,
        diagnostics,
        answer,
        cancel_reason: run.cancel_reason().map(str::to_string),
        started_at: run.started_at,
        finished_at,
        duration_ms,
    })
}
