//! Fleetbot IPC - Inter-Process Communication
//!
//! Event bus for adapter-to-core communication, plus the duplicate-event
//! window that keeps platform retries from being handled twice.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_trace_id() -> String {
    generate_trace_id()
}

/// One chat message addressed to the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub event_id: String,
    pub caller_id: String,
    pub conversation_id: String,
    pub text: String,
}

impl InboundEvent {
    pub fn new(
        event_id: impl Into<String>,
        caller_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: generate_trace_id(),
            event_id: event_id.into(),
            caller_id: caller_id.into(),
            conversation_id: conversation_id.into(),
            text: text.into(),
        }
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<InboundEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { inbound: inbound_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, event: InboundEvent) -> anyhow::Result<()> {
        self.inbound.send(event)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Remembers event ids for `window` so the same delivery is processed once.
///
/// In-memory only: a restart forgets everything, which matches the lifetime
/// of the work the ids protect.
pub struct EventDeduper {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl EventDeduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` the first time `event_id` is offered within the window,
    /// `false` for every repeat.
    pub fn check_and_mark(&self, event_id: &str) -> bool {
        self.check_and_mark_at(event_id, Instant::now())
    }

    fn check_and_mark_at(&self, event_id: &str, now: Instant) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = self.window;
        seen.retain(|_, first_seen| now.saturating_duration_since(*first_seen) < window);

        if seen.contains_key(event_id) {
            debug!("Duplicate event detected: {}", event_id);
            return false;
        }
        seen.insert(event_id.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
