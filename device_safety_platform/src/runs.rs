//! Table of live and recently finished runs.

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Instrument};
use uuid::Uuid;

use crate::agent::ExecutorSet;
use crate::aggregator::FinalResult;
use crate::error::RunError;
use crate::events::EventStream;
use crate::generation::ChatCompletionsClient;
use crate::intent::IntentClassifier;
use crate::orchestrator::{Orchestrator, RunHandle};
use crate::registry::AgentRegistry;
use crate::run::RunSnapshot;
use crate::settings::Settings;
use crate::sources::OpenFdaClient;

struct RunEntry {
    handle: RunHandle,
    /// Taken by the one subscriber the run allows
    stream: Mutex<Option<EventStream>>,
}

pub struct RunManager {
    classifier: IntentClassifier,
    orchestrator: Arc<Orchestrator>,
    runs: DashMap<Uuid, RunEntry>,
    retention: Duration,
}

impl RunManager {
    pub fn new(orchestrator: Arc<Orchestrator>, retention: Duration) -> Self {
        Self {
            classifier: IntentClassifier::new(orchestrator.registry().clone()),
            orchestrator,
            runs: DashMap::new(),
            retention,
        }
    }

    /// Wire the default registry, collaborators and executors from settings
    pub fn from_settings(settings: &Settings) -> Result<Arc<Self>> {
        let registry = Arc::new(AgentRegistry::with_defaults().context("Invalid default agent registry")?);
        let source = Arc::new(
            OpenFdaClient::new(&settings.data_source).context("Failed to build data source client")?,
        );
        let generator = Arc::new(
            ChatCompletionsClient::new(&settings.generation)
                .context("Failed to build generation client")?,
        );
        let executors = ExecutorSet::with_defaults(source, generator, settings.data_source.record_limit);
        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            executors,
            settings.orchestrator.clone(),
        ));
        Ok(Arc::new(Self::new(orchestrator, settings.orchestrator.retention())))
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        self.orchestrator.registry()
    }

    /// Classify, plan and start a run. Empty queries fail here, before any
    /// run or event exists.
    #[instrument(skip(self, query))]
    pub fn submit(&self, query: &str) -> Result<Uuid, RunError> {
        let intent = self.classifier.classify(query)?;
        let (handle, stream) = self.orchestrator.launch(query.trim(), intent)?;
        let run_id = handle.id();

        self.runs.insert(
            run_id,
            RunEntry {
                handle: handle.clone(),
                stream: Mutex::new(Some(stream)),
            },
        );

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(
            async move {
                if let Err(e) = orchestrator.drive(handle).await {
                    error!(error = %e, "Run ended without a result");
                }
            }
            .in_current_span(),
        );

        info!(%run_id, "Run submitted");
        Ok(run_id)
    }

    /// Take the run's event stream. Only the first caller gets it.
    pub fn subscribe(&self, run_id: Uuid) -> Result<EventStream, RunError> {
        let entry = self.runs.get(&run_id).ok_or(RunError::NotFound(run_id))?;
        let stream = entry.stream.lock().take();
        stream.ok_or(RunError::AlreadySubscribed(run_id))
    }

    fn handle(&self, run_id: Uuid) -> Result<RunHandle, RunError> {
        self.runs
            .get(&run_id)
            .map(|entry| entry.handle.clone())
            .ok_or(RunError::NotFound(run_id))
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<(), RunError> {
        self.handle(run_id)?.cancel("Cancelled by request").await;
        Ok(())
    }

    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunSnapshot, RunError> {
        Ok(self.handle(run_id)?.snapshot().await)
    }

    pub async fn result(&self, run_id: Uuid) -> Result<FinalResult, RunError> {
        Ok(self.handle(run_id)?.result().await?)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Drop runs that finished longer ago than the retention window
    pub async fn sweep(&self) -> usize {
        let handles: Vec<(Uuid, RunHandle)> = self
            .runs
            .iter()
            .map(|entry| (*entry.key(), entry.handle.clone()))
            .collect();

        let retention = chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        for (run_id, handle) in handles {
            let expired = handle
                .finished_at()
                .await
                .is_some_and(|finished| finished <= cutoff);
            if expired && self.runs.remove(&run_id).is_some() {
                debug!(%run_id, "Dropped expired run");
                removed += 1;
            }
        }
        removed
    }

    pub fn spawn_retention_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.sweep().await;
                        if removed > 0 {
                            info!(removed, remaining = manager.len(), "Retention sweep");
                        }
                    }
                }
            }
        })
    }
}
