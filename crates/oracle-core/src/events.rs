//! # Event Bus
//!
//! Synchronous publish/subscribe channel between the oracle and its host.
//!
//! Handlers run inline on the emitting thread, in subscription order. A
//! handler must not subscribe or unsubscribe on the same bus while it runs.

use crate::session::StageTransition;
use crate::system::Stage;
use crate::{AgentId, Level, SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Event categories a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    SessionInitialized,
    ResponseGenerated,
    StageChanged,
    SafetyAlert,
}

/// Events flowing through the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OracleEvent {
    /// A session was created (or replaced).
    SessionInitialized {
        user_id: UserId,
        session_id: SessionId,
        stage: Stage,
        agent_id: AgentId,
        /// The session is the fail-safe fallback.
        fallback: bool,
    },

    /// A turn produced a reply.
    ResponseGenerated {
        user_id: UserId,
        session_id: SessionId,
        agent_id: AgentId,
        stage: Stage,
        intensity: Level,
    },

    /// A session moved between stages.
    StageChanged {
        user_id: UserId,
        session_id: SessionId,
        transition: StageTransition,
    },

    /// An external system reported a safety concern for a user.
    SafetyAlert {
        user_id: UserId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl OracleEvent {
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            OracleEvent::SessionInitialized { .. } => Topic::SessionInitialized,
            OracleEvent::ResponseGenerated { .. } => Topic::ResponseGenerated,
            OracleEvent::StageChanged { .. } => Topic::StageChanged,
            OracleEvent::SafetyAlert { .. } => Topic::SafetyAlert,
        }
    }

    /// User the event concerns.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        match self {
            OracleEvent::SessionInitialized { user_id, .. }
            | OracleEvent::ResponseGenerated { user_id, .. }
            | OracleEvent::StageChanged { user_id, .. }
            | OracleEvent::SafetyAlert { user_id, .. } => user_id,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&OracleEvent) + Send + Sync>;

/// Cloneable handle to a shared set of subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<BTreeMap<SubscriptionId, (Topic, Handler)>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every handler subscribed to its topic.
    pub fn emit(&self, event: &OracleEvent) {
        let topic = event.topic();
        let matching: Vec<Handler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .values()
                .filter(|(t, _)| *t == topic)
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        tracing::trace!(event = "bus_emit", ?topic, handlers = matching.len());
        for handler in matching {
            handler(event);
        }
    }

    /// Register a handler for one topic.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&OracleEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(id, (topic, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&id).is_some()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn alert(user: &str) -> OracleEvent {
        OracleEvent::SafetyAlert {
            user_id: UserId::new(user),
            reason: "test".to_string(),
            at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn handlers_receive_only_their_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(Topic::SafetyAlert, move |e| {
            sink.lock().expect("lock").push(e.user_id().clone());
        });
        let wrong = Arc::new(AtomicU64::new(0));
        let w = Arc::clone(&wrong);
        bus.subscribe(Topic::StageChanged, move |_| {
            w.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(&alert("u1"));
        assert_eq!(*seen.lock().expect("lock"), vec![UserId::new("u1")]);
        assert_eq!(wrong.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(Topic::SafetyAlert, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(&alert("u1"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&alert("u1"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn clones_share_subscriptions() {
        let bus = EventBus::new();
        let other = bus.clone();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        other.subscribe(Topic::SafetyAlert, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(&alert("u2"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(alert("u1")).expect("serialize");
        assert_eq!(json["type"], "safety_alert");
        assert_eq!(json["user_id"], "u1");
    }
}
