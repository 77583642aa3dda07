use crate::types::{NodeId, PipelineId, PipelineStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// A lifecycle notification emitted by a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pipeline_id: PipelineId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(pipeline_id: PipelineId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id,
            timestamp: Utc::now(),
            event_type,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event_type.kind()
    }
}

/// Types of events that can occur during a pipeline's life
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Pipeline lifecycle events
    PipelineStart {
        node_count: usize,
    },
    PipelineEnd {
        status: PipelineStatus,
        error: Option<String>,
        duration_ms: u64,
    },
    PipelinePause,
    PipelineResume,
    PipelineStop,

    // Task lifecycle events
    TaskStart {
        node_id: NodeId,
    },
    TaskEnd {
        node_id: NodeId,
        duration_ms: u64,
    },
    TaskFailed {
        node_id: NodeId,
        error: String,
        skipped: bool,
    },
}

impl EventType {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PipelineStart { .. } => EventKind::PipelineStart,
            Self::PipelineEnd { .. } => EventKind::PipelineEnd,
            Self::PipelinePause => EventKind::PipelinePause,
            Self::PipelineResume => EventKind::PipelineResume,
            Self::PipelineStop => EventKind::PipelineStop,
            Self::TaskStart { .. } => EventKind::TaskStart,
            Self::TaskEnd { .. } => EventKind::TaskEnd,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
        }
    }
}

/// Discriminant of [`EventType`], used to filter listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PipelineStart,
    PipelineEnd,
    PipelinePause,
    PipelineResume,
    PipelineStop,
    TaskStart,
    TaskEnd,
    TaskFailed,
}

/// Handle returned by [`EventEmitter::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: Option<EventKind>,
    once: bool,
    handler: Handler,
}

/// Typed pub/sub bus for lifecycle notifications.
///
/// Handlers registered with [`on`](Self::on) run synchronously inside
/// [`emit`](Self::emit). Async consumers can [`subscribe`](Self::subscribe)
/// to a broadcast channel that receives every event.
pub struct EventEmitter {
    listeners: RwLock<Vec<Listener>>,
    tx: broadcast::Sender<Event>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for one kind of event
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Some(kind), false, Arc::new(handler))
    }

    /// Register a handler invoked for every event
    pub fn on_any<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(None, false, Arc::new(handler))
    }

    /// Register a handler removed after its first invocation
    pub fn once<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Some(kind), true, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, once: bool, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Listener {
                id,
                kind,
                once,
                handler,
            });
        id
    }

    /// Remove a handler, returning whether it was registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn remove_all_listeners(&self) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of handlers that would receive an event of `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .count()
    }

    /// Receive every event on an async channel
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Deliver an event to matching handlers and channel subscribers
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
            let handlers = listeners
                .iter()
                .filter(|l| l.kind.map_or(true, |k| k == kind))
                .map(|l| l.handler.clone())
                .collect();
            listeners.retain(|l| !(l.once && l.kind.map_or(true, |k| k == kind)));
            handlers
        };

        // Handlers run outside the lock so they may register or remove listeners.
        for handler in handlers {
            handler(&event);
        }

        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn task_start(node: &str) -> Event {
        Event::new(
            PipelineId::new("p"),
            EventType::TaskStart {
                node_id: NodeId::new(node),
            },
        )
    }

    #[test]
    fn test_handlers_filter_by_kind() {
        let emitter = EventEmitter::default();
        let starts = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let s = starts.clone();
        emitter.on(EventKind::TaskStart, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let a = all.clone();
        emitter.on_any(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(task_start("a"));
        emitter.emit(Event::new(PipelineId::new("p"), EventType::PipelinePause));

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_and_off() {
        let emitter = EventEmitter::default();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        emitter.once(EventKind::TaskStart, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = count.clone();
        let id = emitter.on(EventKind::TaskStart, move |_| {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(emitter.listener_count(EventKind::TaskStart), 2);

        emitter.emit(task_start("a"));
        assert_eq!(emitter.listener_count(EventKind::TaskStart), 1);

        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        emitter.emit(task_start("b"));

        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(task_start("a"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::TaskStart);
        assert_eq!(event.pipeline_id, PipelineId::new("p"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(task_start("a")).unwrap();
        assert_eq!(json["event_type"]["type"], "task_start");
        assert_eq!(json["event_type"]["node_id"], "a");
    }
}
