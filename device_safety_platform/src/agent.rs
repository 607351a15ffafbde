//! Agent executors: the units of work the orchestrator schedules.
//!
//! Every executor implements [`AgentExecutor`] and is looked up by agent id
//! through an [`ExecutorSet`]. Executors never touch run state directly;
//! progress travels as [`ProgressUpdate`] messages into the run's queue.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::AgentError;
use crate::generation::TextGenerator;
use crate::intent::Intent;
use crate::registry::{
    DEVICE_INFO_COLLECTOR, EVENTS_COLLECTOR, NARRATIVE_WRITER, PATTERN_ANALYZER,
    RECALLS_COLLECTOR,
};
use crate::sources::{DataQuery, DataSource, Dataset, SearchResponse};

/// Results of upstream agents keyed by agent id
pub type AgentInputs = IndexMap<String, AgentOutput>;

/// Single executor interface keyed by agent id
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, ctx: AgentContext, inputs: AgentInputs) -> Result<AgentOutput, AgentError>;
}

/// Progress side channel message
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub agent_id: String,
    pub percentage: u8,
    pub message: String,
    pub data_points: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    agent_id: String,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(agent_id: impl Into<String>, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tx,
        }
    }

    pub fn report(&self, percentage: u8, message: impl Into<String>, data_points: Option<u64>) {
        // The orchestrator outlives its agents; a closed queue means the run
        // is already finishing and the report is moot.
        let _ = self.tx.send(ProgressUpdate {
            agent_id: self.agent_id.clone(),
            percentage,
            message: message.into(),
            data_points,
        });
    }
}

/// Everything an executor may see about the run it is part of
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub run_id: Uuid,
    pub agent_id: String,
    pub query: Arc<str>,
    pub intent: Arc<Intent>,
    /// Declared dependencies; their results must be present in the inputs
    pub dependencies: Vec<String>,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

impl AgentContext {
    /// Step boundary: stop here if the run has been cancelled
    pub fn checkpoint(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    pub fn report(&self, percentage: u8, message: impl Into<String>, data_points: Option<u64>) {
        self.progress.report(percentage, message, data_points);
    }

    /// Fail with `MissingDependency` unless every declared dependency
    /// delivered a result
    pub fn validate_inputs(&self, inputs: &AgentInputs) -> Result<(), AgentError> {
        match self.dependencies.iter().find(|dep| !inputs.contains_key(*dep)) {
            Some(dep) => Err(AgentError::MissingDependency {
                agent: self.agent_id.clone(),
                dependency: dep.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Regulatory profile of one device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medical_specialty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regulation_number: Option<String>,
}

impl DeviceProfile {
    fn from_record(record: &Value) -> Option<Self> {
        let text = |field: &str| {
            record
                .get(field)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            device_name: text("device_name")?,
            device_class: text("device_class"),
            medical_specialty: text("medical_specialty_description"),
            product_code: text("product_code"),
            regulation_number: text("regulation_number"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    /// Upstream totals, not just the retrieved sample
    pub total_events: u64,
    pub total_recalls: u64,
    pub records_analyzed: u64,
    pub event_types: IndexMap<String, u64>,
    pub manufacturers: IndexMap<String, u64>,
    pub years: IndexMap<String, u64>,
    pub recall_causes: IndexMap<String, u64>,
    pub concern_mentions: IndexMap<String, u64>,
    pub signal: SignalLevel,
    pub findings: Vec<String>,
}

/// Typed result of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutput {
    DeviceProfile {
        query: DataQuery,
        total: u64,
        profiles: Vec<DeviceProfile>,
    },
    Collection {
        dataset: Dataset,
        query: DataQuery,
        records: Vec<Value>,
        total: u64,
    },
    Analysis(PatternAnalysis),
    Narrative {
        text: String,
        model: String,
    },
}

impl AgentOutput {
    pub fn data_points(&self) -> Option<u64> {
        match self {
            Self::DeviceProfile { profiles, .. } => Some(profiles.len() as u64),
            Self::Collection { records, .. } => Some(records.len() as u64),
            Self::Analysis(analysis) => Some(analysis.records_analyzed),
            Self::Narrative { .. } => None,
        }
    }

    /// One-line status message used when the agent completes
    pub fn summary(&self) -> String {
        match self {
            Self::DeviceProfile { profiles, .. } => {
                format!("Found {} device profiles", profiles.len())
            }
            Self::Collection {
                dataset,
                records,
                total,
                ..
            } => format!(
                "Retrieved {} of {} {} records",
                records.len(),
                total,
                dataset_label(*dataset)
            ),
            Self::Analysis(analysis) => format!(
                "Analyzed {} records, {:?} signal",
                analysis.records_analyzed, analysis.signal
            ),
            Self::Narrative { text, .. } => {
                format!("Wrote {} word summary", text.split_whitespace().count())
            }
        }
    }
}

fn dataset_label(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::AdverseEvents => "adverse event",
        Dataset::Recalls => "recall",
        Dataset::Classification => "classification",
    }
}

/// Executors keyed by agent id
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<String, Arc<dyn AgentExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five built-in agents wired to the given collaborators
    pub fn with_defaults(
        source: Arc<dyn DataSource>,
        generator: Arc<dyn TextGenerator>,
        record_limit: usize,
    ) -> Self {
        let mut set = Self::new();
        set.register(Arc::new(DeviceInfoCollector::new(source.clone(), record_limit)));
        set.register(Arc::new(EventsCollector::new(source.clone(), record_limit)));
        set.register(Arc::new(RecallsCollector::new(source, record_limit)));
        set.register(Arc::new(PatternAnalyzer));
        set.register(Arc::new(NarrativeWriter::new(generator)));
        set
    }

    pub fn register(&mut self, executor: Arc<dyn AgentExecutor>) {
        info!(agent_id = executor.id(), "Registering executor");
        self.executors.insert(executor.id().to_string(), executor);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.executors.contains_key(id)
    }
}

// --- Collectors ---

async fn collect(
    source: &dyn DataSource,
    dataset: Dataset,
    ctx: &AgentContext,
    limit: usize,
) -> Result<(DataQuery, SearchResponse), AgentError> {
    ctx.checkpoint()?;
    let query = DataQuery::for_intent(dataset, &ctx.intent, limit);
    ctx.report(10, format!("Querying {} data", dataset_label(dataset)), None);

    let response = source.search(&query).await?;
    ctx.checkpoint()?;

    // Count only what has actually been received
    let count = response.records.len() as u64;
    ctx.report(
        80,
        format!("Received {} {} records", count, dataset_label(dataset)),
        Some(count),
    );
    Ok((query, response))
}

pub struct DeviceInfoCollector {
    source: Arc<dyn DataSource>,
    limit: usize,
}

impl DeviceInfoCollector {
    pub fn new(source: Arc<dyn DataSource>, limit: usize) -> Self {
        Self { source, limit }
    }
}

#[async_trait]
impl AgentExecutor for DeviceInfoCollector {
    fn id(&self) -> &str {
        DEVICE_INFO_COLLECTOR
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: AgentContext, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        ctx.validate_inputs(&inputs)?;
        let (query, response) =
            collect(self.source.as_ref(), Dataset::Classification, &ctx, self.limit).await?;

        let mut profiles: Vec<DeviceProfile> = Vec::new();
        for profile in response.records.iter().filter_map(DeviceProfile::from_record) {
            if !profiles.iter().any(|p| p.product_code == profile.product_code && p.device_name == profile.device_name) {
                profiles.push(profile);
            }
        }

        ctx.report(100, format!("Found {} device profiles", profiles.len()), Some(profiles.len() as u64));
        Ok(AgentOutput::DeviceProfile {
            query,
            total: response.total,
            profiles,
        })
    }
}

pub struct EventsCollector {
    source: Arc<dyn DataSource>,
    limit: usize,
}

impl EventsCollector {
    pub fn new(source: Arc<dyn DataSource>, limit: usize) -> Self {
        Self { source, limit }
    }
}

#[async_trait]
impl AgentExecutor for EventsCollector {
    fn id(&self) -> &str {
        EVENTS_COLLECTOR
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: AgentContext, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        ctx.validate_inputs(&inputs)?;
        let (query, response) =
            collect(self.source.as_ref(), Dataset::AdverseEvents, &ctx, self.limit).await?;
        let count = response.records.len() as u64;
        ctx.report(100, format!("Collected {} adverse event reports", count), Some(count));
        Ok(AgentOutput::Collection {
            dataset: Dataset::AdverseEvents,
            query,
            records: response.records,
            total: response.total,
        })
    }
}

pub struct RecallsCollector {
    source: Arc<dyn DataSource>,
    limit: usize,
}

impl RecallsCollector {
    pub fn new(source: Arc<dyn DataSource>, limit: usize) -> Self {
        Self { source, limit }
    }
}

#[async_trait]
impl AgentExecutor for RecallsCollector {
    fn id(&self) -> &str {
        RECALLS_COLLECTOR
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: AgentContext, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        ctx.validate_inputs(&inputs)?;
        let (query, response) =
            collect(self.source.as_ref(), Dataset::Recalls, &ctx, self.limit).await?;
        let count = response.records.len() as u64;
        ctx.report(100, format!("Collected {} recall records", count), Some(count));
        Ok(AgentOutput::Collection {
            dataset: Dataset::Recalls,
            query,
            records: response.records,
            total: response.total,
        })
    }
}

// --- Analysis ---

/// Deterministic statistics over whatever collections its dependencies produced
pub struct PatternAnalyzer;

fn bump(counts: &mut IndexMap<String, u64>, key: Option<&str>) {
    if let Some(key) = key.map(str::trim).filter(|key| !key.is_empty()) {
        *counts.entry(key.to_string()).or_insert(0) += 1;
    }
}

fn sorted_desc(mut counts: IndexMap<String, u64>) -> IndexMap<String, u64> {
    // Stable sort keeps first-seen order among equal counts
    counts.sort_by(|_, a, _, b| b.cmp(a));
    counts
}

fn top(counts: &IndexMap<String, u64>) -> Option<(&String, &u64)> {
    counts.first()
}

impl PatternAnalyzer {
    fn analyze(intent: &Intent, inputs: &AgentInputs) -> PatternAnalysis {
        let mut event_types = IndexMap::new();
        let mut manufacturers = IndexMap::new();
        let mut years = IndexMap::new();
        let mut recall_causes = IndexMap::new();
        let mut concern_mentions: IndexMap<String, u64> =
            intent.concerns.iter().map(|c| (c.clone(), 0)).collect();
        let mut total_events = 0;
        let mut total_recalls = 0;
        let mut records_analyzed = 0u64;
        let mut deaths = 0u64;
        let mut injuries = 0u64;

        for output in inputs.values() {
            let AgentOutput::Collection {
                dataset,
                records,
                total,
                ..
            } = output
            else {
                continue;
            };

            match dataset {
                Dataset::AdverseEvents => total_events += total,
                Dataset::Recalls => total_recalls += total,
                Dataset::Classification => {}
            }

            for record in records {
                records_analyzed += 1;
                match dataset {
                    Dataset::AdverseEvents => {
                        let event_type = record.get("event_type").and_then(Value::as_str);
                        match event_type {
                            Some("Death") => deaths += 1,
                            Some("Injury") => injuries += 1,
                            _ => {}
                        }
                        bump(&mut event_types, event_type);
                        bump(
                            &mut manufacturers,
                            record
                                .pointer("/device/0/manufacturer_d_name")
                                .and_then(Value::as_str),
                        );
                        bump(
                            &mut years,
                            record
                                .get("date_received")
                                .and_then(Value::as_str)
                                .and_then(|date| date.get(..4)),
                        );
                    }
                    Dataset::Recalls => {
                        bump(
                            &mut manufacturers,
                            record.get("recalling_firm").and_then(Value::as_str),
                        );
                        bump(
                            &mut recall_causes,
                            record.get("root_cause_description").and_then(Value::as_str),
                        );
                        bump(
                            &mut years,
                            record
                                .get("event_date_initiated")
                                .and_then(Value::as_str)
                                .and_then(|date| date.get(..4)),
                        );
                    }
                    Dataset::Classification => {}
                }

                if !concern_mentions.is_empty() {
                    let text = record.to_string().to_lowercase();
                    for (concern, count) in concern_mentions.iter_mut() {
                        if text.contains(concern.as_str()) {
                            *count += 1;
                        }
                    }
                }
            }
        }

        let signal = if deaths > 0 {
            SignalLevel::High
        } else if injuries > 0 || total_recalls > 0 {
            SignalLevel::Moderate
        } else {
            SignalLevel::Low
        };

        let event_types = sorted_desc(event_types);
        let manufacturers = sorted_desc(manufacturers);
        let recall_causes = sorted_desc(recall_causes);
        years.sort_keys();

        let mut findings = vec![format!(
            "{} adverse event reports and {} recalls on record",
            total_events, total_recalls
        )];
        if let Some((event_type, count)) = top(&event_types) {
            findings.push(format!("Most reported event type: {} ({})", event_type, count));
        }
        if deaths > 0 {
            findings.push(format!("{} sampled reports involve a death", deaths));
        }
        if let Some((firm, count)) = top(&manufacturers) {
            findings.push(format!("Most frequent manufacturer: {} ({})", firm, count));
        }
        if let Some((cause, count)) = top(&recall_causes) {
            findings.push(format!("Leading recall cause: {} ({})", cause, count));
        }
        if let Some((year, count)) = years.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
            findings.push(format!("Peak year in sample: {} ({})", year, count));
        }
        for (concern, count) in concern_mentions.iter().filter(|(_, count)| **count > 0) {
            findings.push(format!("'{}' mentioned in {} records", concern, count));
        }

        PatternAnalysis {
            total_events,
            total_recalls,
            records_analyzed,
            event_types,
            manufacturers,
            years,
            recall_causes,
            concern_mentions,
            signal,
            findings,
        }
    }
}

#[async_trait]
impl AgentExecutor for PatternAnalyzer {
    fn id(&self) -> &str {
        PATTERN_ANALYZER
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: AgentContext, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        ctx.validate_inputs(&inputs)?;
        ctx.checkpoint()?;
        ctx.report(20, "Analyzing collected records", None);

        let analysis = Self::analyze(&ctx.intent, &inputs);
        ctx.checkpoint()?;

        debug!(signal = ?analysis.signal, findings = analysis.findings.len(), "Analysis complete");
        ctx.report(
            100,
            format!("Identified {} findings", analysis.findings.len()),
            Some(analysis.records_analyzed),
        );
        Ok(AgentOutput::Analysis(analysis))
    }
}

// --- Writer ---

pub struct NarrativeWriter {
    generator: Arc<dyn TextGenerator>,
}

impl NarrativeWriter {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn prompt(query: &str, intent: &Intent, inputs: &AgentInputs) -> String {
        let mut prompt = format!("Question: {}\n", query);
        if !intent.entities.is_empty() {
            prompt.push_str(&format!("Devices and manufacturers: {}\n", intent.entities.join(", ")));
        }
        if !intent.concerns.is_empty() {
            prompt.push_str(&format!("Concerns: {}\n", intent.concerns.join(", ")));
        }

        for output in inputs.values() {
            match output {
                AgentOutput::Analysis(analysis) => {
                    prompt.push_str(&format!("\nFindings ({:?} signal):\n", analysis.signal));
                    for finding in &analysis.findings {
                        prompt.push_str(&format!("- {}\n", finding));
                    }
                }
                AgentOutput::DeviceProfile { profiles, .. } => {
                    prompt.push_str("\nDevice profiles:\n");
                    for profile in profiles.iter().take(5) {
                        prompt.push_str(&format!(
                            "- {} (class {})\n",
                            profile.device_name,
                            profile.device_class.as_deref().unwrap_or("unknown")
                        ));
                    }
                }
                // Raw collections reach the writer only through the analysis
                AgentOutput::Collection { .. } | AgentOutput::Narrative { .. } => {}
            }
        }

        prompt.push_str("\nWrite a short safety briefing answering the question.");
        prompt
    }
}

#[async_trait]
impl AgentExecutor for NarrativeWriter {
    fn id(&self) -> &str {
        NARRATIVE_WRITER
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, model = self.generator.model()))]
    async fn run(&self, ctx: AgentContext, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        ctx.validate_inputs(&inputs)?;
        ctx.checkpoint()?;

        let prompt = Self::prompt(&ctx.query, &ctx.intent, &inputs);
        ctx.report(30, "Drafting safety narrative", None);

        let text = self.generator.generate(&prompt).await?;
        ctx.checkpoint()?;

        ctx.report(100, "Narrative ready", None);
        Ok(AgentOutput::Narrative {
            text,
            model: self.generator.model().to_string(),
        })
    }
}
