//! Command-line interface definitions using clap derive API, plus the
//! in-process `ask` and `agents` commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::events::EventKind;
use crate::registry::AgentRegistry;
use crate::run::AgentStatus;
use crate::runs::RunManager;
use crate::settings::Settings;

/// Medical device safety copilot
#[derive(Parser)]
#[command(name = "copilot-cli")]
#[command(about = "Multi-agent answers to medical device safety questions")]
#[command(version)]
pub struct Cli {
    /// Configuration file to load instead of ./config.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to, overriding the configured host and port
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Answer one question in-process, streaming agent progress
    Ask {
        query: String,
        /// Print raw events and the final result as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List the available agents
    Agents,
}

pub async fn ask(settings: &Settings, query: &str, json: bool) -> Result<()> {
    let runs = RunManager::from_settings(settings)?;
    let run_id = runs.submit(query)?;
    let mut events = runs.subscribe(run_id)?;

    while let Some(event) = events.next_event().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event.kind);
        }
        if event.is_terminal() {
            break;
        }
    }

    let result = runs
        .result(run_id)
        .await
        .context("Run ended without a result")?;
    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!();
        match &result.answer {
            Some(answer) => println!("{}", answer),
            None => println!("No narrative was produced."),
        }
        println!(
            "\n{} of {} agents succeeded in {} ms",
            result.results.len(),
            result.diagnostics.len(),
            result.duration_ms
        );
    }
    Ok(())
}

fn print_event(kind: &EventKind) {
    match kind {
        EventKind::AgentStates(agents) => {
            let ids: Vec<&str> = agents.keys().map(String::as_str).collect();
            println!("plan: {}", ids.join(" -> "));
        }
        EventKind::AgentUpdate(agents) => {
            for snapshot in agents.values() {
                let marker = match snapshot.status {
                    AgentStatus::Waiting => " ",
                    AgentStatus::Running => ">",
                    AgentStatus::Completed => "+",
                    AgentStatus::Failed => "!",
                    AgentStatus::Skipped => "-",
                };
                println!(
                    "[{}] {:<22} {:>3}% {}",
                    marker, snapshot.agent_id, snapshot.progress, snapshot.message
                );
            }
        }
        EventKind::Progress { percentage, message } => {
            println!("    overall {:>3}% ({})", percentage, message);
        }
        EventKind::Complete(_) => println!("run complete"),
        EventKind::Error {
            message, agent_id, ..
        } => match agent_id {
            Some(agent_id) => println!("run failed at {}: {}", agent_id, message),
            None => println!("run failed: {}", message),
        },
    }
}

pub fn print_agents(registry: &AgentRegistry) {
    for agent in registry.list() {
        let deps = if agent.depends_on.is_empty() {
            "-".to_string()
        } else {
            agent.depends_on.join(", ")
        };
        println!(
            "{:<22} {:<28} needs: {:<36} [{}]",
            agent.id,
            agent.name,
            deps,
            agent.capabilities.join(", ")
        );
    }
}
