//! Event router with grace-period filtering.
//!
//! Distributes orchestrator events to two audiences: a broadcast bus for
//! passive observers, and one-shot waiters that filter by
//! `(event_type, agent)` and time out after a bound.
//!
//! The router also keeps the per-agent completion timestamps that drive
//! the grace-period filter: an `agent-stopped` event arriving shortly
//! after that agent completed a step is the natural echo of the stop
//! hook, not a real failure, and is suppressed.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use meow_types::event::OrchestratorEvent;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, oneshot};

/// Event type whose echoes are absorbed by the grace filter.
const AGENT_STOPPED: &str = "agent-stopped";

struct Waiter {
    event_type: String,
    agent: String,
    tx: oneshot::Sender<Value>,
}

/// Routes agent events to waiters and broadcasts orchestrator events.
pub struct EventRouter {
    bus: broadcast::Sender<OrchestratorEvent>,
    waiters: Mutex<Vec<Waiter>>,
    recent_completions: DashMap<String, Instant>,
    grace: Duration,
}

impl EventRouter {
    /// Create a router with the given grace period and bus capacity.
    pub fn new(grace: Duration, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        Self {
            bus,
            waiters: Mutex::new(Vec::new()),
            recent_completions: DashMap::new(),
            grace,
        }
    }

    /// Subscribe to the broadcast bus.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.bus.subscribe()
    }

    /// Publish an orchestrator event to all subscribers.
    ///
    /// With no subscribers the event is silently dropped.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.bus.send(event);
    }

    /// Record that `agent` just completed a step, opening its grace
    /// window.
    pub fn record_completion(&self, agent: &str) {
        self.recent_completions
            .insert(agent.to_string(), Instant::now());
    }

    /// Route an inbound agent event.
    ///
    /// Returns `false` when the event was suppressed by the grace filter:
    /// an `agent-stopped` event for a named agent whose last completion
    /// was under the grace period ago.
    pub async fn route(&self, event_type: &str, agent: &str, data: Value) -> bool {
        if event_type == AGENT_STOPPED && !agent.is_empty() {
            if let Some(completed_at) = self.recent_completions.get(agent) {
                if completed_at.elapsed() < self.grace {
                    tracing::debug!(
                        agent,
                        elapsed_ms = completed_at.elapsed().as_millis() as u64,
                        "suppressing agent-stopped event inside grace period"
                    );
                    return false;
                }
            }
        }

        let mut waiters = self.waiters.lock().await;
        let mut remaining = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if waiter.event_type == event_type && (waiter.agent.is_empty() || waiter.agent == agent)
            {
                // Receiver may have timed out and dropped; that's fine.
                let _ = waiter.tx.send(data.clone());
            } else {
                remaining.push(waiter);
            }
        }
        *waiters = remaining;

        self.publish(OrchestratorEvent::AgentEvent {
            event_type: event_type.to_string(),
            agent: agent.to_string(),
            data,
        });
        true
    }

    /// Wait for the next event matching `(event_type, agent)`, up to
    /// `timeout`. An empty `agent` matches any agent.
    pub async fn wait_for(
        &self,
        event_type: &str,
        agent: &str,
        timeout: Duration,
    ) -> Option<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push(Waiter {
            event_type: event_type.to_string(),
            agent: agent.to_string(),
            tx,
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Some(data),
            _ => None,
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("receiver_count", &self.bus.receiver_count())
            .field("grace", &self.grace)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
