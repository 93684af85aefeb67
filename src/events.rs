//! Typed publish/subscribe event bus. Replaces the "string-keyed emitter"
//! pattern (§9): one closed enum, one `broadcast` channel, so emit and
//! consume can never drift apart at compile time.

use crate::domain::{Direction, ExitReason};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    Created {
        recommendation_id: String,
        symbol: String,
        direction: Direction,
    },
    Closed {
        recommendation_id: String,
        symbol: String,
        exit_reason: ExitReason,
        pnl_percent: f64,
    },
    Gated {
        symbol: String,
        direction: Direction,
        error_code: &'static str,
        details: Value,
    },
    PriceOverrideSet {
        symbol: String,
        price: f64,
        ttl_ms: i64,
    },
    PriceOverrideCleared {
        symbol: Option<String>,
    },
    FgiOverrideSet {
        value: f64,
        ttl_ms: i64,
    },
    FgiOverrideCleared,
    FundingRateOverrideSet {
        symbol: String,
        rate: f64,
        ttl_ms: i64,
    },
    FundingRateOverrideCleared {
        symbol: Option<String>,
    },
    TrackerStarted,
    TrackerStopped,
}

/// Thin wrapper over `tokio::sync::broadcast`, the same primitive the
/// teacher uses for `signal_broadcast` on `AppState`, closed over a single
/// typed enum instead of an ad hoc message shape.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // A lagging/absent subscriber is not an error for the publisher;
        // broadcast channels drop the send result deliberately here.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::TrackerStarted);
        let evt = rx.recv().await.unwrap();
        assert!(matches!(evt, EngineEvent::TrackerStarted));
    }
}
