//! In-process pub/sub with typed and global handlers.
//!
//! Handlers come in sync and async flavors in one tagged union; dispatch
//! awaits async handlers and calls sync ones inline. A failing handler is
//! isolated: its error is counted and the remaining handlers still run.
//! Handler invocations always happen outside the bus lock.

use super::{Event, EventStore};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const HISTORY_CAP: usize = 1_000;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

enum Handler {
    Sync(Box<dyn Fn(&Event) -> HandlerResult + Send + Sync>),
    Async(Box<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>),
}

struct Subscription {
    id: String,
    handler: Handler,
    enabled: AtomicBool,
    handled: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BusMetrics {
    pub total_events: u64,
    pub handler_errors: u64,
    pub events_by_type: HashMap<String, u64>,
}

#[derive(Default)]
struct Inner {
    by_type: HashMap<String, Vec<Arc<Subscription>>>,
    global: Vec<Arc<Subscription>>,
    history: VecDeque<Event>,
    events_by_type: HashMap<String, u64>,
}

/// Central event bus. Cheap to clone via `Arc`.
pub struct EventBus {
    inner: Mutex<Inner>,
    total_events: AtomicU64,
    handler_errors: AtomicU64,
    store: Option<Arc<EventStore>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            total_events: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            store: None,
        }
    }

    /// Forward every published event to the on-disk store as well.
    pub fn with_store(mut self, store: Arc<EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish an event to type-specific handlers first, then global ones.
    pub async fn publish(
        &self,
        event_type: &str,
        data: serde_json::Value,
        source: &str,
    ) -> Event {
        let event = Event::new(event_type, data, source);
        self.publish_event(event.clone()).await;
        event
    }

    pub async fn publish_event(&self, event: Event) {
        let handlers: Vec<Arc<Subscription>> = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.history.push_back(event.clone());
            while inner.history.len() > HISTORY_CAP {
                inner.history.pop_front();
            }
            *inner
                .events_by_type
                .entry(event.event_type.clone())
                .or_default() += 1;

            let mut handlers: Vec<Arc<Subscription>> = inner
                .by_type
                .get(&event.event_type)
                .map(|subs| subs.to_vec())
                .unwrap_or_default();
            handlers.extend(inner.global.iter().cloned());
            handlers
        };
        self.total_events.fetch_add(1, Ordering::Relaxed);

        for subscription in handlers {
            if !subscription.enabled.load(Ordering::Acquire) {
                continue;
            }
            subscription.handled.fetch_add(1, Ordering::Relaxed);
            let outcome = match &subscription.handler {
                Handler::Sync(f) => f(&event),
                Handler::Async(f) => f(event.clone()).await,
            };
            if let Err(err) = outcome {
                subscription.errors.fetch_add(1, Ordering::Relaxed);
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    handler = %subscription.id,
                    event_type = %event.event_type,
                    error = %err,
                    "event handler failed"
                );
            }
        }

        if let Some(store) = &self.store {
            store.append(&event).await;
        }
    }

    /// Subscribe a synchronous handler to one event type.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> String
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(Some(event_type), Handler::Sync(Box::new(handler)))
    }

    /// Subscribe an async handler to one event type.
    pub fn subscribe_async<F>(&self, event_type: &str, handler: F) -> String
    where
        F: Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        self.add(Some(event_type), Handler::Async(Box::new(handler)))
    }

    /// Subscribe a synchronous handler to every event.
    pub fn subscribe_global<F>(&self, handler: F) -> String
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(None, Handler::Sync(Box::new(handler)))
    }

    fn add(&self, event_type: Option<&str>, handler: Handler) -> String {
        let id = Uuid::new_v4().to_string();
        let subscription = Arc::new(Subscription {
            id: id.clone(),
            handler,
            enabled: AtomicBool::new(true),
            handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match event_type {
            Some(event_type) => inner
                .by_type
                .entry(event_type.to_string())
                .or_default()
                .push(subscription),
            None => inner.global.push(subscription),
        }
        id
    }

    /// Remove a type-bound handler. Returns whether anything was removed.
    pub fn unsubscribe(&self, event_type: &str, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(subs) = inner.by_type.get_mut(event_type) {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            return subs.len() < before;
        }
        false
    }

    pub fn unsubscribe_global(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = inner.global.len();
        inner.global.retain(|s| s.id != id);
        inner.global.len() < before
    }

    /// Enable or disable a handler without removing it.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let found = inner
            .by_type
            .values()
            .flatten()
            .chain(inner.global.iter())
            .find(|s| s.id == id);
        match found {
            Some(subscription) => {
                subscription.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Recent events, newest last, optionally filtered by type.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let filtered: Vec<Event> = inner
            .history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn metrics(&self) -> BusMetrics {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        BusMetrics {
            total_events: self.total_events.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            events_by_type: inner.events_by_type.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("total_events", &self.total_events.load(Ordering::Relaxed))
            .finish()
    }
}
