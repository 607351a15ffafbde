//! Device Safety Platform - Core Library
//!
//! Turns a free-text medical device safety question into a dependency-ordered
//! run of specialist agents, streams their progress and aggregates the result.

pub mod agent;
pub mod aggregator;
pub mod cli;
pub mod error;
pub mod events;
pub mod generation;
pub mod intent;
pub mod middleware;
pub mod orchestrator;
pub mod registry;
pub mod run;
pub mod runs;
pub mod server;
pub mod settings;
pub mod sources;
pub mod telemetry;
pub mod websocket;

pub use agent::{AgentExecutor, AgentOutput};
pub use intent::{Intent, IntentClassifier};
pub use orchestrator::Orchestrator;
pub use runs::RunManager;
