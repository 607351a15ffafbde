//! Static catalog of the specialist agents available to the orchestrator.
//!
//! The registry is built once at startup and shared read-only (behind an `Arc`)
//! by the classifier, the orchestrator and the HTTP introspection endpoint.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::error::RegistryError;

pub const DEVICE_INFO_COLLECTOR: &str = "device_info_collector";
pub const EVENTS_COLLECTOR: &str = "events_collector";
pub const RECALLS_COLLECTOR: &str = "recalls_collector";
pub const PATTERN_ANALYZER: &str = "pattern_analyzer";
pub const NARRATIVE_WRITER: &str = "narrative_writer";

/// Stage an agent occupies in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Collector,
    Analyzer,
    Writer,
}

/// Immutable registry entry describing one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub color: String,
    pub role: AgentRole,
    pub capabilities: Vec<String>,
    /// Agents that must complete before this one may start
    pub depends_on: Vec<String>,
    /// Optional inputs: when planned alongside, waited for and passed on if
    /// they completed, but their failure never skips this agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reads: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            icon: String::new(),
            color: String::new(),
            role,
            capabilities: Vec::new(),
            depends_on: Vec::new(),
            reads: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_presentation(mut self, icon: impl Into<String>, color: impl Into<String>) -> Self {
        self.icon = icon.into();
        self.color = color.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn reads_from<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Required and optional upstream agents, which both order the plan
    fn upstream(&self) -> impl Iterator<Item = &String> {
        self.depends_on.iter().chain(self.reads.iter())
    }
}

/// Read-only catalog of agent descriptors in listing order
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
    index: HashMap<String, usize>,
}

impl AgentRegistry {
    /// Build a registry, rejecting empty rosters, duplicate ids, dangling dependencies and cycles
    pub fn new(agents: Vec<AgentDescriptor>) -> Result<Self, RegistryError> {
        if agents.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut index = HashMap::with_capacity(agents.len());
        for (position, agent) in agents.iter().enumerate() {
            if index.insert(agent.id.clone(), position).is_some() {
                return Err(RegistryError::Duplicate(agent.id.clone()));
            }
        }

        for agent in &agents {
            for dependency in agent.upstream() {
                if !index.contains_key(dependency) {
                    return Err(RegistryError::UnknownDependency {
                        agent: agent.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let registry = Self { agents, index };
        let all: Vec<String> = registry.agents.iter().map(|a| a.id.clone()).collect();
        registry.topological_order(&all)?;

        debug!(agent_count = registry.agents.len(), "Agent registry initialized");
        Ok(registry)
    }

    /// The built-in device-safety agent roster
    pub fn with_defaults() -> Result<Self, RegistryError> {
        Self::new(default_agents())
    }

    pub fn list(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn get(&self, id: &str) -> Result<&AgentDescriptor, RegistryError> {
        self.index
            .get(id)
            .map(|&position| &self.agents[position])
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Listing position, used as the deterministic tie-breaker
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Add every transitive dependency of `ids`, dedupe, and return in listing order.
    /// Unknown ids are dropped.
    pub fn dependency_closure<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        let mut selected: HashSet<usize> = HashSet::new();
        let mut stack: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.position(id.as_ref()))
            .collect();

        while let Some(position) = stack.pop() {
            if selected.insert(position) {
                for dependency in &self.agents[position].depends_on {
                    if let Some(dep_position) = self.position(dependency) {
                        stack.push(dep_position);
                    }
                }
            }
        }

        let mut ordered: Vec<usize> = selected.into_iter().collect();
        ordered.sort_unstable();
        ordered
            .into_iter()
            .map(|position| self.agents[position].id.clone())
            .collect()
    }

    /// Topologically order `ids` by the dependency and optional-input edges
    /// among them.
    ///
    /// Edges to agents outside `ids` are ignored. Ready agents are emitted in
    /// registry listing order, so the result is stable.
    pub fn topological_order<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<String>, RegistryError> {
        let mut members: Vec<usize> = Vec::with_capacity(ids.len());
        for id in ids {
            let position = self
                .position(id.as_ref())
                .ok_or_else(|| RegistryError::NotFound(id.as_ref().to_string()))?;
            if !members.contains(&position) {
                members.push(position);
            }
        }
        let member_set: HashSet<usize> = members.iter().copied().collect();

        let mut in_degree: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &position in &members {
            let deps: Vec<usize> = self.agents[position]
                .upstream()
                .filter_map(|dep| self.position(dep))
                .filter(|dep| member_set.contains(dep))
                .collect();
            in_degree.insert(position, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(position);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&position, _)| position)
            .collect();
        let mut order = Vec::with_capacity(members.len());

        while let Some(position) = ready.pop_first() {
            order.push(position);
            for &dependent in dependents.get(&position).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != members.len() {
            let mut stuck: Vec<String> = members
                .iter()
                .filter(|position| !order.contains(position))
                .map(|&position| self.agents[position].id.clone())
                .collect();
            stuck.sort();
            return Err(RegistryError::Cycle(stuck));
        }

        Ok(order
            .into_iter()
            .map(|position| self.agents[position].id.clone())
            .collect())
    }
}

fn default_agents() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new(DEVICE_INFO_COLLECTOR, "Device Profile Collector", AgentRole::Collector)
            .with_description("Looks up device classification and regulatory profile")
            .with_presentation("clipboard", "#6366f1")
            .with_capabilities(["device_classification", "regulatory_profile"]),
        AgentDescriptor::new(EVENTS_COLLECTOR, "Adverse Events Collector", AgentRole::Collector)
            .with_description("Gathers adverse event reports for the devices in question")
            .with_presentation("activity", "#ef4444")
            .with_capabilities(["adverse_events", "maude_reports"]),
        AgentDescriptor::new(RECALLS_COLLECTOR, "Recalls Collector", AgentRole::Collector)
            .with_description("Gathers recall and enforcement records")
            .with_presentation("alert-triangle", "#f59e0b")
            .with_capabilities(["recalls", "enforcement_reports"]),
        AgentDescriptor::new(PATTERN_ANALYZER, "Pattern Analyzer", AgentRole::Analyzer)
            .with_description("Finds trends and safety signals across collected records")
            .with_presentation("trending-up", "#10b981")
            .with_capabilities(["trend_analysis", "signal_detection"])
            .depends_on([EVENTS_COLLECTOR, RECALLS_COLLECTOR]),
        AgentDescriptor::new(NARRATIVE_WRITER, "Safety Narrative Writer", AgentRole::Writer)
            .with_description("Writes the final answer from the analysis")
            .with_presentation("file-text", "#3b82f6")
            .with_capabilities(["narrative_generation", "summarization"])
            .depends_on([PATTERN_ANALYZER])
            .reads_from([DEVICE_INFO_COLLECTOR]),
    ]
}
