//! Dependency-ordered scheduling of agent executors for one run.
//!
//! The dispatch loop in [`Orchestrator::drive`] is the only writer of a run's
//! state. Every transition is applied while holding the run lock, and the
//! matching events are published before the lock is released, so the event
//! order is the transition order.

use chrono::{DateTime, Utc};
use futures::future;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{
    AgentContext, AgentExecutor, AgentInputs, AgentOutput, ExecutorSet, ProgressReporter,
    ProgressUpdate,
};
use crate::aggregator::{aggregate, FinalResult};
use crate::error::{AgentError, AggregationError, FailureKind, PlanError};
use crate::events::{self, EventKind, EventPublisher, EventStream};
use crate::intent::Intent;
use crate::registry::AgentRegistry;
use crate::run::{AgentSnapshot, AgentStatus, OrchestrationRun, RunSnapshot, RunStatus};
use crate::settings::OrchestratorConfig;

const SUBSCRIBER_GONE: &str = "Subscriber disconnected";
const RUN_BUDGET_EXCEEDED: &str = "Run budget exceeded";

/// Topologically ordered agents with their declared dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub order: Vec<String>,
    pub dependencies: IndexMap<String, Vec<String>>,
    /// Optional inputs that are part of this plan, per agent
    pub optional_inputs: IndexMap<String, Vec<String>>,
}

impl ExecutionPlan {
    pub fn dependencies_of(&self, agent_id: &str) -> &[String] {
        self.dependencies
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn optional_inputs_of(&self, agent_id: &str) -> &[String] {
        self.optional_inputs
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

struct RunState {
    run: OrchestrationRun,
    publisher: EventPublisher,
    /// Last overall percentage sent in a `progress` event
    reported_progress: u8,
}

impl RunState {
    /// One `agent_update` with every changed agent, then a `progress` event
    /// if the overall percentage moved
    fn publish_changes(&mut self, changed: IndexMap<String, AgentSnapshot>) {
        if changed.is_empty() {
            return;
        }
        self.publisher.publish(EventKind::AgentUpdate(changed));

        let percentage = self.run.progress();
        if percentage == self.reported_progress {
            return;
        }
        self.reported_progress = percentage;
        let finished = self
            .run
            .agents
            .values()
            .filter(|agent| agent.status().is_terminal())
            .count();
        self.publisher.publish(EventKind::Progress {
            percentage,
            message: format!("{} of {} agents finished", finished, self.run.agents.len()),
        });
    }
}

/// Shared handle to one run's state and cancellation signal
#[derive(Clone)]
pub struct RunHandle {
    id: Uuid,
    plan: Arc<ExecutionPlan>,
    state: Arc<Mutex<RunState>>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the dispatch loop to cancel the run. Has no effect on a run whose
    /// agents have all finished.
    pub async fn cancel(&self, reason: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.run.all_terminal() {
            return;
        }
        if state.run.mark_cancelled(reason) {
            info!(run_id = %self.id, reason = state.run.cancel_reason().unwrap_or_default(), "Cancellation requested");
        }
        self.cancel.cancel();
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        self.state.lock().await.run.snapshot()
    }

    pub async fn status(&self) -> RunStatus {
        self.state.lock().await.run.status()
    }

    pub async fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.run.finished_at()
    }

    pub async fn result(&self) -> Result<FinalResult, AggregationError> {
        aggregate(&self.state.lock().await.run)
    }
}

type AgentOutcome = (String, Result<AgentOutput, AgentError>);

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    executors: ExecutorSet,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(registry: Arc<AgentRegistry>, executors: ExecutorSet, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            executors,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Order the intent's agents by dependency, ties broken by registry
    /// listing order.
    pub fn build_plan(&self, intent: &Intent) -> Result<ExecutionPlan, PlanError> {
        if intent.required_agents.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        for id in &intent.required_agents {
            let descriptor = self
                .registry
                .get(id)
                .map_err(|_| PlanError::UnknownAgent(id.clone()))?;
            if let Some(dependency) = descriptor.depends_on.iter().find(|dep| !intent.requires(dep)) {
                error!(agent_id = %id, %dependency, "Intent omits a required dependency");
                return Err(PlanError::MissingDependency {
                    agent: id.clone(),
                    dependency: dependency.clone(),
                });
            }
            if !self.executors.contains(id) {
                return Err(PlanError::NoExecutor(id.clone()));
            }
        }

        let order = self.registry.topological_order(&intent.required_agents)?;
        let mut dependencies = IndexMap::with_capacity(order.len());
        let mut optional_inputs = IndexMap::new();
        for id in &order {
            let descriptor = self.registry.get(id)?;
            dependencies.insert(id.clone(), descriptor.depends_on.clone());
            let planned: Vec<String> = descriptor
                .reads
                .iter()
                .filter(|input| intent.requires(input))
                .cloned()
                .collect();
            if !planned.is_empty() {
                optional_inputs.insert(id.clone(), planned);
            }
        }

        Ok(ExecutionPlan {
            order,
            dependencies,
            optional_inputs,
        })
    }

    /// Plan a run and publish its initial `agent_states`. The run does not
    /// make progress until [`Orchestrator::drive`] is awaited.
    #[instrument(skip(self, intent), fields(category = ?intent.category))]
    pub fn launch(&self, query: &str, intent: Intent) -> Result<(RunHandle, EventStream), PlanError> {
        let plan = self.build_plan(&intent)?;
        let cancel = CancellationToken::new();
        let (mut publisher, stream) = events::channel(cancel.clone());

        let run = OrchestrationRun::new(Uuid::new_v4(), query, Arc::new(intent), &plan.order);
        publisher.publish(EventKind::AgentStates(run.snapshots()));

        info!(run_id = %run.id, agents = ?plan.order, "Run planned");
        let handle = RunHandle {
            id: run.id,
            plan: Arc::new(plan),
            state: Arc::new(Mutex::new(RunState {
                run,
                publisher,
                reported_progress: 0,
            })),
            cancel,
        };
        Ok((handle, stream))
    }

    /// Dispatch loop: runs agents until every one is terminal, then publishes
    /// the terminal event and returns the aggregated result.
    #[instrument(skip(self, handle), fields(run_id = %handle.id))]
    pub async fn drive(&self, handle: RunHandle) -> Result<FinalResult, AggregationError> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let mut tasks: JoinSet<AgentOutcome> = JoinSet::new();
        let mut task_agents: HashMap<tokio::task::Id, String> = HashMap::new();

        let deadline = self.config.run_timeout().map(|budget| Instant::now() + budget);
        let run_deadline = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(run_deadline);
        let mut deadline_passed = false;
        let mut cancellation_applied = false;

        self.schedule(&handle, &mut tasks, &mut task_agents, &progress_tx)
            .await;

        loop {
            if tasks.is_empty() {
                let state = handle.state.lock().await;
                if state.run.all_terminal() {
                    break;
                }
                drop(state);
                if !handle.cancel.is_cancelled() {
                    // Nothing running and nothing startable: the plan cannot finish
                    error!("Dispatch stalled with agents still waiting");
                    handle.state.lock().await.run.record_fault("Dispatch stalled");
                    handle.cancel.cancel();
                }
            }

            tokio::select! {
                biased;

                _ = handle.cancel.cancelled(), if !cancellation_applied => {
                    cancellation_applied = true;
                    self.apply_cancellation(&handle).await;
                    tasks.abort_all();
                }

                _ = &mut run_deadline, if !deadline_passed => {
                    deadline_passed = true;
                    warn!("Run budget exceeded");
                    handle.cancel(RUN_BUDGET_EXCEEDED).await;
                }

                Some(update) = progress_rx.recv() => {
                    self.apply_progress(&handle, update).await;
                }

                Some(joined) = tasks.join_next_with_id() => {
                    match joined {
                        Ok((task_id, (agent_id, outcome))) => {
                            task_agents.remove(&task_id);
                            self.finish_agent(&handle, &agent_id, outcome).await;
                        }
                        Err(err) if err.is_cancelled() => {
                            task_agents.remove(&err.id());
                        }
                        Err(err) => {
                            let agent_id = task_agents.remove(&err.id()).unwrap_or_default();
                            error!(agent_id = %agent_id, error = %err, "Agent task aborted");
                            self.finish_agent(&handle, &agent_id, Err(AgentError::Internal(err.to_string()))).await;
                        }
                    }
                    self.schedule(&handle, &mut tasks, &mut task_agents, &progress_tx).await;
                }
            }
        }

        self.finish_run(&handle).await
    }

    /// Skip agents behind failed dependencies and start every ready agent the
    /// concurrency budget allows.
    async fn schedule(
        &self,
        handle: &RunHandle,
        tasks: &mut JoinSet<AgentOutcome>,
        task_agents: &mut HashMap<tokio::task::Id, String>,
        progress_tx: &mpsc::UnboundedSender<ProgressUpdate>,
    ) {
        let mut state = handle.state.lock().await;
        if handle.cancel.is_cancelled() {
            return;
        }

        let budget = self.config.max_concurrent_agents.unwrap_or(usize::MAX);
        let mut running = state
            .run
            .agents
            .values()
            .filter(|agent| agent.status() == AgentStatus::Running)
            .count();
        let mut changed = IndexMap::new();

        for agent_id in &handle.plan.order {
            if state.run.agent(agent_id).map(|a| a.status()) != Some(AgentStatus::Waiting) {
                continue;
            }
            let dependencies = handle.plan.dependencies_of(agent_id);
            let optional_inputs = handle.plan.optional_inputs_of(agent_id);

            let blocked_by = dependencies.iter().find_map(|dep| {
                let status = state.run.agent(dep)?.status();
                matches!(status, AgentStatus::Failed | AgentStatus::Skipped).then_some((dep, status))
            });
            if let Some((dep, status)) = blocked_by {
                let reason = format!("Dependency '{}' {:?}", dep, status).to_lowercase();
                if let Some(agent) = state.run.agent_mut(agent_id) {
                    if agent.skip(format!("Skipped: {}", reason)).is_ok() {
                        debug!(%agent_id, %dep, "Skipping agent");
                        changed.insert(agent_id.clone(), agent.snapshot());
                    }
                }
                continue;
            }

            // Optional inputs only need to settle; their failure is tolerated
            let ready = dependencies
                .iter()
                .all(|dep| state.run.agent(dep).map(|a| a.status()) == Some(AgentStatus::Completed))
                && optional_inputs
                    .iter()
                    .all(|input| state.run.agent(input).map_or(true, |a| a.status().is_terminal()));
            if !ready || running >= budget {
                continue;
            }

            let inputs: AgentInputs = dependencies
                .iter()
                .chain(optional_inputs)
                .filter_map(|dep| {
                    let output = state.run.agent(dep)?.result()?.clone();
                    Some((dep.clone(), output))
                })
                .collect();

            let Some(agent) = state.run.agent_mut(agent_id) else {
                continue;
            };
            if agent.start().is_err() {
                continue;
            }
            changed.insert(agent_id.clone(), agent.snapshot());
            running += 1;

            let ctx = AgentContext {
                run_id: handle.id,
                agent_id: agent_id.clone(),
                query: Arc::from(state.run.query.as_str()),
                intent: state.run.intent.clone(),
                dependencies: dependencies.to_vec(),
                progress: ProgressReporter::new(agent_id.clone(), progress_tx.clone()),
                cancel: handle.cancel.clone(),
            };

            match self.executors.get(agent_id) {
                Some(executor) => {
                    let abort = tasks.spawn(self.run_agent(executor, ctx, inputs));
                    task_agents.insert(abort.id(), agent_id.clone());
                    info!(%agent_id, "Agent started");
                }
                None => {
                    // Plans are checked against the executor set, so this is a defect
                    let err = AgentError::Internal(format!("no executor for '{}'", agent_id));
                    error!(%agent_id, "Started agent has no executor");
                    if let Some(agent) = state.run.agent_mut(agent_id) {
                        let _ = agent.fail(&err);
                        changed.insert(agent_id.clone(), agent.snapshot());
                    }
                    state.run.record_fault(err.to_string());
                    running -= 1;
                }
            }
        }

        state.publish_changes(changed);
        if state.run.fault().is_some() {
            handle.cancel.cancel();
        }
    }

    /// Executor future wrapped with the per-agent budget and the run's
    /// cancellation signal
    fn run_agent(
        &self,
        executor: Arc<dyn AgentExecutor>,
        ctx: AgentContext,
        inputs: AgentInputs,
    ) -> impl std::future::Future<Output = AgentOutcome> + Send + 'static {
        let budget = self.config.agent_timeout();
        async move {
            let agent_id = ctx.agent_id.clone();
            let cancel = ctx.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                result = tokio::time::timeout(budget, executor.run(ctx, inputs)) => {
                    result.unwrap_or(Err(AgentError::Timeout(budget)))
                }
            };
            (agent_id, outcome)
        }
    }

    async fn apply_progress(&self, handle: &RunHandle, update: ProgressUpdate) {
        let mut state = handle.state.lock().await;
        let Some(agent) = state.run.agent_mut(&update.agent_id) else {
            warn!(agent_id = %update.agent_id, "Progress for an agent outside the plan");
            return;
        };
        match agent.record_progress(update.percentage, update.message, update.data_points) {
            Ok(true) => {
                let mut changed = IndexMap::new();
                changed.insert(update.agent_id, agent.snapshot());
                state.publish_changes(changed);
            }
            Ok(false) => {}
            Err(status) => {
                debug!(agent_id = %update.agent_id, ?status, "Dropping progress for agent that is not running");
            }
        }
    }

    async fn finish_agent(&self, handle: &RunHandle, agent_id: &str, outcome: Result<AgentOutput, AgentError>) {
        let mut state = handle.state.lock().await;
        let Some(agent) = state.run.agent_mut(agent_id) else {
            return;
        };

        let mut fault = None;
        let applied = match outcome {
            Ok(output) => agent.complete(output),
            Err(err) => {
                let applied = agent.fail(&err);
                if applied.is_ok() {
                    if err.is_fault() {
                        error!(%agent_id, error = %err, "Agent failed with an engine defect");
                        fault = Some(err.to_string());
                    } else {
                        warn!(%agent_id, error = %err, "Agent failed");
                    }
                }
                applied
            }
        };

        if let Err(status) = applied {
            // Already settled by cancellation
            debug!(%agent_id, ?status, "Ignoring late agent outcome");
            return;
        }

        let snapshot = agent.snapshot();
        info!(%agent_id, status = ?snapshot.status, "Agent finished");
        let mut changed = IndexMap::new();
        changed.insert(agent_id.to_string(), snapshot);
        if let Some(fault) = fault {
            state.run.record_fault(fault);
        }
        state.publish_changes(changed);
        if state.run.fault().is_some() {
            handle.cancel.cancel();
        }
    }

    /// Waiting agents become Skipped and Running ones Failed with `Cancelled`;
    /// completed agents keep their results.
    async fn apply_cancellation(&self, handle: &RunHandle) {
        let mut state = handle.state.lock().await;
        if state.run.all_terminal() {
            return;
        }

        let default_reason = if state.run.fault().is_some() {
            "Engine fault"
        } else if state.publisher.subscriber_connected() {
            "Cancelled by request"
        } else {
            SUBSCRIBER_GONE
        };
        state.run.mark_cancelled(default_reason);
        let reason = state
            .run
            .cancel_reason()
            .unwrap_or(default_reason)
            .to_string();
        info!(%reason, "Cancelling run");

        let mut changed = IndexMap::new();
        for (agent_id, agent) in state.run.agents.iter_mut() {
            let applied = match agent.status() {
                AgentStatus::Waiting => agent.skip(format!("Skipped: {}", reason)),
                AgentStatus::Running => agent.fail(&AgentError::Cancelled),
                _ => continue,
            };
            if applied.is_ok() {
                changed.insert(agent_id.clone(), agent.snapshot());
            }
        }
        state.publish_changes(changed);
    }

    async fn finish_run(&self, handle: &RunHandle) -> Result<FinalResult, AggregationError> {
        let mut state = handle.state.lock().await;
        state.run.mark_finished();
        let result = aggregate(&state.run)?;

        let terminal = match result.status {
            RunStatus::Completed => EventKind::Complete(Box::new(result.clone())),
            _ => {
                let (message, agent_id, kind) = failure_summary(&state.run);
                EventKind::Error {
                    message,
                    agent_id,
                    kind,
                    partial: Some(Box::new(result.clone())),
                }
            }
        };

        info!(
            status = ?result.status,
            succeeded = result.results.len(),
            duration_ms = result.duration_ms,
            "Run finished"
        );
        state.publisher.publish(terminal);
        state.publisher.close();
        Ok(result)
    }
}

/// Message, responsible agent and failure kind for the `error` event
fn failure_summary(run: &OrchestrationRun) -> (String, Option<String>, Option<FailureKind>) {
    if let Some(fault) = run.fault() {
        let culprit = run.agents.values().find_map(|agent| {
            agent
                .failure()
                .filter(|f| matches!(f.kind, FailureKind::MissingDependency | FailureKind::Internal))
                .map(|f| (agent.agent_id.clone(), f.kind))
        });
        return (
            format!("Engine fault: {}", fault),
            culprit.as_ref().map(|(id, _)| id.clone()),
            Some(culprit.map(|(_, kind)| kind).unwrap_or(FailureKind::Internal)),
        );
    }
    if run.is_cancelled() {
        return (
            format!(
                "Run cancelled: {}",
                run.cancel_reason().unwrap_or("cancelled")
            ),
            None,
            Some(FailureKind::Cancelled),
        );
    }
    if let Some((agent_id, failure)) = run.first_failure() {
        return (
            format!("Agent '{}' failed: {}", agent_id, failure.message),
            Some(agent_id.to_string()),
            Some(failure.kind),
        );
    }
    ("No agent produced a result".to_string(), None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{GenerationError, TextGenerator};
    use crate::intent::IntentCategory;
    use crate::registry::{
        DEVICE_INFO_COLLECTOR, EVENTS_COLLECTOR, NARRATIVE_WRITER, PATTERN_ANALYZER, RECALLS_COLLECTOR,
    };
    use crate::sources::{DataQuery, DataSource, SearchResponse, SourceError};
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl DataSource for EmptySource {
        async fn search(&self, _query: &DataQuery) -> Result<SearchResponse, SourceError> {
            Ok(SearchResponse::default())
        }
    }

    struct EchoGenerator;

    #[async_trait]
    impl TextGenerator for EchoGenerator {
        fn model(&self) -> &str {
            "echo"
        }

        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            Ok(format!("Echo: {}", prompt.lines().next().unwrap_or_default()))
        }
    }

    fn orchestrator() -> Orchestrator {
        let executors = ExecutorSet::with_defaults(Arc::new(EmptySource), Arc::new(EchoGenerator), 10);
        Orchestrator::new(
            Arc::new(AgentRegistry::with_defaults().unwrap()),
            executors,
            OrchestratorConfig::default(),
        )
    }

    #[test]
    fn test_plan_orders_by_dependency() {
        let intent = Intent::new(
            IntentCategory::SafetyAnalysis,
            [NARRATIVE_WRITER, PATTERN_ANALYZER, RECALLS_COLLECTOR, EVENTS_COLLECTOR],
        );
        let plan = orchestrator().build_plan(&intent).unwrap();
        assert_eq!(
            plan.order,
            vec![EVENTS_COLLECTOR, RECALLS_COLLECTOR, PATTERN_ANALYZER, NARRATIVE_WRITER]
        );
        assert_eq!(plan.dependencies_of(NARRATIVE_WRITER), &[PATTERN_ANALYZER.to_string()]);
        assert!(plan.optional_inputs_of(NARRATIVE_WRITER).is_empty());
    }

    #[test]
    fn test_plan_orders_writer_after_planned_profile_collector() {
        let intent = Intent::new(
            IntentCategory::Comparison,
            [
                NARRATIVE_WRITER,
                DEVICE_INFO_COLLECTOR,
                PATTERN_ANALYZER,
                EVENTS_COLLECTOR,
                RECALLS_COLLECTOR,
            ],
        );
        let plan = orchestrator().build_plan(&intent).unwrap();
        assert_eq!(plan.order.last().map(String::as_str), Some(NARRATIVE_WRITER));
        assert_eq!(
            plan.optional_inputs_of(NARRATIVE_WRITER),
            &[DEVICE_INFO_COLLECTOR.to_string()]
        );
        assert_eq!(plan.dependencies_of(NARRATIVE_WRITER), &[PATTERN_ANALYZER.to_string()]);
    }

    #[test]
    fn test_plan_rejects_incomplete_intents() {
        let orchestrator = orchestrator();
        let missing = Intent::new(IntentCategory::General, [NARRATIVE_WRITER]);
        assert!(matches!(
            orchestrator.build_plan(&missing),
            Err(PlanError::MissingDependency { .. })
        ));

        let unknown = Intent::new(IntentCategory::General, ["oracle"]);
        assert_eq!(
            orchestrator.build_plan(&unknown),
            Err(PlanError::UnknownAgent("oracle".to_string()))
        );

        let empty = Intent::new(IntentCategory::General, Vec::<String>::new());
        assert_eq!(orchestrator.build_plan(&empty), Err(PlanError::EmptyPlan));
    }

    #[tokio::test]
    async fn test_full_pipeline_completes() {
        let orchestrator = orchestrator();
        let intent = Intent::new(
            IntentCategory::SafetyAnalysis,
            [EVENTS_COLLECTOR, RECALLS_COLLECTOR, PATTERN_ANALYZER, NARRATIVE_WRITER],
        );
        let (handle, stream) = orchestrator.launch("pump safety", intent).unwrap();

        let result = orchestrator.drive(handle.clone()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.results.len(), 4);
        assert_eq!(result.answer.as_deref(), Some("Echo: Question: pump safety"));

        let events = stream.collect_all().await;
        assert_eq!(events.first().map(|e| e.kind.name()), Some("agent_states"));
        assert_eq!(events.last().map(|e| e.kind.name()), Some("complete"));
        assert_eq!(handle.status().await, RunStatus::Completed);
    }
}
