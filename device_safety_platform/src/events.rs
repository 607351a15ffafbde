//! Ordered outbound event stream, one producer and one subscriber per run.

use chrono::{DateTime, Utc};
use futures::Stream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregator::FinalResult;
use crate::error::FailureKind;
use crate::run::AgentSnapshot;

/// One emitted event. Never mutated after it is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Starts at 1 and increases by one per event within a run
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl OutboundEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    /// Every agent of the plan, sent once after planning
    AgentStates(IndexMap<String, AgentSnapshot>),
    /// Only the agents that changed
    AgentUpdate(IndexMap<String, AgentSnapshot>),
    Progress { percentage: u8, message: String },
    Complete(Box<FinalResult>),
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<FailureKind>,
        /// Whatever the run produced before failing
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<Box<FinalResult>>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStates(_) => "agent_states",
            Self::AgentUpdate(_) => "agent_update",
            Self::Progress { .. } => "progress",
            Self::Complete(_) => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error { .. })
    }
}

/// Create the queue for one run. The publisher stays with the orchestrator,
/// the stream goes to the subscriber.
pub fn channel(cancel: CancellationToken) -> (EventPublisher, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventPublisher {
            tx: Some(tx),
            next_sequence: 1,
            cancel: cancel.clone(),
        },
        EventStream {
            rx,
            cancel,
            finished: false,
        },
    )
}

/// Producer side. Callers serialize access through the run lock, so
/// sequence order equals transition order.
#[derive(Debug)]
pub struct EventPublisher {
    tx: Option<mpsc::UnboundedSender<OutboundEvent>>,
    next_sequence: u64,
    cancel: CancellationToken,
}

impl EventPublisher {
    /// Returns false once the subscriber is gone; the run is cancelled on the
    /// first failed delivery and later events are discarded.
    pub fn publish(&mut self, kind: EventKind) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        let event = OutboundEvent {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            kind,
        };
        let name = event.kind.name();

        if tx.send(event).is_err() {
            warn!(event = name, "Subscriber disconnected, cancelling run");
            self.tx = None;
            self.cancel.cancel();
            return false;
        }

        debug!(sequence = self.next_sequence, event = name, "Published event");
        self.next_sequence += 1;
        true
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    pub fn subscriber_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Drop the sender so the stream ends after the queued events
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Subscriber side. Dropping it before the terminal event cancels the run.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<OutboundEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        let event = self.rx.recv().await;
        self.observe(event.as_ref());
        event
    }

    fn observe(&mut self, event: Option<&OutboundEvent>) {
        match event {
            Some(event) if event.is_terminal() => self.finished = true,
            None => self.finished = true,
            _ => {}
        }
    }

    /// Drain until the terminal event or the end of the stream
    pub async fn collect_all(mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

impl Stream for EventStream {
    type Item = OutboundEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(event) = &polled {
            let event = event.as_ref();
            self.observe(event);
        }
        polled
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Event stream dropped before the run finished");
            // Closed first so the dispatch loop sees the subscriber as gone
            self.rx.close();
            self.cancel.cancel();
        }
    }
}
