//! Per-run state: one [`OrchestrationRun`] owning one [`AgentRun`] per
//! required agent.
//!
//! Transition methods return `Err(current_status)` when the move is not
//! allowed, leaving the run untouched.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::agent::AgentOutput;
use crate::error::{AgentError, FailureKind};
use crate::intent::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Waiting, Skipped)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&AgentError> for AgentFailure {
    fn from(err: &AgentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Lifecycle record for one agent within one run
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub agent_id: String,
    status: AgentStatus,
    progress: u8,
    message: String,
    data_points: Option<u64>,
    updated_at: DateTime<Utc>,
    result: Option<AgentOutput>,
    failure: Option<AgentFailure>,
}

impl AgentRun {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Waiting,
            progress: 0,
            message: "Waiting".to_string(),
            data_points: None,
            updated_at: Utc::now(),
            result: None,
            failure: None,
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn result(&self) -> Option<&AgentOutput> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&AgentFailure> {
        self.failure.as_ref()
    }

    fn transition(&mut self, next: AgentStatus, message: String) -> Result<(), AgentStatus> {
        if !self.status.can_transition_to(next) {
            return Err(self.status);
        }
        self.status = next;
        self.message = message;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), AgentStatus> {
        self.transition(AgentStatus::Running, "Starting".to_string())
    }

    /// Apply a progress report. Returns `Ok(false)` when nothing changed.
    /// Percentages are clamped to 100 and never lowered.
    pub fn record_progress(
        &mut self,
        percentage: u8,
        message: impl Into<String>,
        data_points: Option<u64>,
    ) -> Result<bool, AgentStatus> {
        if self.status != AgentStatus::Running {
            return Err(self.status);
        }
        let percentage = percentage.min(100).max(self.progress);
        let message = message.into();
        let data_points = data_points.or(self.data_points);
        if percentage == self.progress && message == self.message && data_points == self.data_points {
            return Ok(false);
        }
        self.progress = percentage;
        self.message = message;
        self.data_points = data_points;
        self.updated_at = Utc::now();
        Ok(true)
    }

    pub fn complete(&mut self, output: AgentOutput) -> Result<(), AgentStatus> {
        let data_points = output.data_points().or(self.data_points);
        self.transition(AgentStatus::Completed, output.summary())?;
        self.progress = 100;
        self.data_points = data_points;
        self.result = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, err: &AgentError) -> Result<(), AgentStatus> {
        self.transition(AgentStatus::Failed, err.to_string())?;
        self.failure = Some(AgentFailure::from(err));
        Ok(())
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), AgentStatus> {
        self.transition(AgentStatus::Skipped, reason.into())
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            data_points: self.data_points,
            updated_at: self.updated_at,
            failure: self.failure.clone(),
        }
    }
}

/// Wire view of an [`AgentRun`]; results travel only in the final result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub status: AgentStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_points: Option<u64>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AgentFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// All state for one submitted query
#[derive(Debug, Clone)]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub query: String,
    pub intent: Arc<Intent>,
    /// Keyed by agent id in execution plan order
    pub agents: IndexMap<String, AgentRun>,
    cancelled: bool,
    cancel_reason: Option<String>,
    fault: Option<String>,
    pub started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl OrchestrationRun {
    pub fn new(id: Uuid, query: impl Into<String>, intent: Arc<Intent>, plan_order: &[String]) -> Self {
        let agents = plan_order
            .iter()
            .map(|id| (id.clone(), AgentRun::new(id.clone())))
            .collect();
        Self {
            id,
            query: query.into(),
            intent,
            agents,
            cancelled: false,
            cancel_reason: None,
            fault: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn agent(&self, id: &str) -> Option<&AgentRun> {
        self.agents.get(id)
    }

    pub fn agent_mut(&mut self, id: &str) -> Option<&mut AgentRun> {
        self.agents.get_mut(id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// First reason wins; returns false if the run was already cancelled
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> bool {
        if self.cancelled {
            return false;
        }
        self.cancelled = true;
        self.cancel_reason = Some(reason.into());
        true
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn record_fault(&mut self, message: impl Into<String>) {
        self.fault.get_or_insert_with(|| message.into());
    }

    pub fn all_terminal(&self) -> bool {
        self.agents.values().all(|run| run.status().is_terminal())
    }

    pub fn status(&self) -> RunStatus {
        if !self.all_terminal() {
            return RunStatus::Running;
        }
        let clean = self
            .agents
            .values()
            .all(|run| matches!(run.status(), AgentStatus::Completed | AgentStatus::Skipped));
        let any_completed = self
            .agents
            .values()
            .any(|run| run.status() == AgentStatus::Completed);

        if !self.cancelled && self.fault.is_none() && clean && any_completed {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }

    /// Mean agent progress; skipped agents count as zero
    pub fn progress(&self) -> u8 {
        if self.agents.is_empty() {
            return 0;
        }
        let total: u32 = self
            .agents
            .values()
            .map(|run| match run.status() {
                AgentStatus::Completed => 100,
                AgentStatus::Skipped => 0,
                _ => u32::from(run.progress()),
            })
            .sum();
        (total / self.agents.len() as u32) as u8
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn mark_finished(&mut self) {
        self.finished_at.get_or_insert_with(Utc::now);
    }

    /// First failed agent in plan order that was not cancelled
    pub fn first_failure(&self) -> Option<(&str, &AgentFailure)> {
        self.agents.values().find_map(|run| {
            run.failure()
                .filter(|failure| failure.kind != FailureKind::Cancelled)
                .map(|failure| (run.agent_id.as_str(), failure))
        })
    }

    pub fn snapshots(&self) -> IndexMap<String, AgentSnapshot> {
        self.agents
            .iter()
            .map(|(id, run)| (id.clone(), run.snapshot()))
            .collect()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            query: self.query.clone(),
            intent: (*self.intent).clone(),
            status: self.status(),
            progress: self.progress(),
            cancelled: self.cancelled,
            agents: self.snapshots(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub query: String,
    pub intent: Intent,
    pub status: RunStatus,
    pub progress: u8,
    pub cancelled: bool,
    pub agents: IndexMap<String, AgentSnapshot>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
