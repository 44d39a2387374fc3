//! The orchestration event bus.
//!
//! In-process pub/sub with two delivery modes:
//!
//! - [`EventBus::emit`] — fire an event and **await every subscriber**,
//!   in registration order, one at a time.  Subscriber errors are
//!   aggregated: the first is returned to the emitter, the rest are
//!   logged.
//! - [`EventBus::request`] — fire a request-style event carrying a fresh
//!   correlation id and await the matching [`EventBus::respond`] /
//!   [`EventBus::respond_error`] from any subscriber, with a timeout.
//!
//! Each handler runs in its own spawned task whose join result is
//! inspected: a panicking handler surfaces as a `SYSTEM_ERROR` to the
//! emitter instead of unwinding through the daemon.
//!
//! The subscriber registry is locked only for registration and snapshot;
//! no lock is held while a handler runs, so handlers are free to emit
//! follow-up events on the same bus.  The bus is cheaply cloneable
//! (`Arc`-backed) and `Send + Sync`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::event::{Event, EventKind, EventPayload, ResponseValue};

/// A subscriber.  Handlers must be idempotent: the event log is not
/// replayed after a restart, durable state is reconciled instead.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs when the handler fails.
    fn name(&self) -> &'static str;

    /// React to one event.  The bus reference allows follow-up emissions
    /// and request responses without reference cycles.
    async fn handle(&self, event: &Event, bus: &EventBus) -> TaskResult<()>;
}

/// Typed pub/sub bus with request/response correlation.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    /// Subscribers per event kind, in registration order.
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    /// Pending request correlations awaiting a response.
    pending: DashMap<Uuid, oneshot::Sender<TaskResult<ResponseValue>>>,
    /// How long `request` waits before giving up.
    request_timeout: Duration,
}

impl EventBus {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                pending: DashMap::new(),
                request_timeout,
            }),
        }
    }

    /// Register `handler` for `kind`.  Handlers fire in registration
    /// order; a handler may be registered for several kinds.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let list = handlers.entry(kind).or_default();
        trace!(?kind, handler = handler.name(), position = list.len(), "subscriber registered");
        list.push(handler);
    }

    /// Number of subscribers currently registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Emit an event and await all subscribers.
    ///
    /// Each subscriber completes before the next begins.  The first
    /// subscriber error is returned; subsequent errors are logged and
    /// dropped.  An event with no subscribers succeeds trivially.
    pub async fn emit(&self, payload: EventPayload) -> TaskResult<()> {
        self.dispatch(Event::new(payload)).await
    }

    /// Issue a request and await its correlated response.
    ///
    /// A fresh correlation id is attached to the event; the first
    /// subscriber to call [`respond`](Self::respond) with that id settles
    /// the request.  Times out with `TASK_TIMEOUT` after the configured
    /// window, and surfaces dispatch errors eagerly.
    pub async fn request(&self, payload: EventPayload) -> TaskResult<ResponseValue> {
        let correlation_id = Uuid::now_v7();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);

        let mut event = Event::new(payload);
        event.correlation_id = Some(correlation_id);
        let kind = event.kind();

        if let Err(err) = self.dispatch(event).await {
            self.inner.pending.remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without responding.
                self.inner.pending.remove(&correlation_id);
                Err(TaskError::system(format!("no responder settled {kind:?}")))
            }
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                Err(TaskError::timeout(format!(
                    "request {kind:?} timed out after {:?}",
                    self.inner.request_timeout
                ))
                .with_context("correlation_id", correlation_id.to_string()))
            }
        }
    }

    /// Settle a pending request with a value.
    ///
    /// Unknown or already-settled correlation ids are ignored with a
    /// debug log; a late responder racing a timeout is expected.
    pub fn respond(&self, correlation_id: Uuid, value: ResponseValue) {
        match self.inner.pending.remove(&correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(value));
            }
            None => debug!(%correlation_id, "response for unknown correlation id dropped"),
        }
    }

    /// Settle a pending request with an error.
    pub fn respond_error(&self, correlation_id: Uuid, err: TaskError) {
        match self.inner.pending.remove(&correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(err));
            }
            None => debug!(%correlation_id, "error response for unknown correlation id dropped"),
        }
    }

    /// Snapshot the subscriber list and run them sequentially, each in
    /// its own spawned task so a panic is contained to that handler.
    async fn dispatch(&self, event: Event) -> TaskResult<()> {
        let kind = event.kind();
        let subscribers: Vec<Arc<dyn EventHandler>> = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            handlers.get(&kind).cloned().unwrap_or_default()
        };

        trace!(?kind, event_id = %event.event_id, subscribers = subscribers.len(), "dispatching");

        let event = Arc::new(event);
        let mut first_error: Option<TaskError> = None;
        for handler in subscribers {
            let name = handler.name();
            let result = {
                let bus = self.clone();
                let event = Arc::clone(&event);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(&event, &bus).await }).await
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_panic() => {
                    Err(TaskError::system(format!("subscriber {name} panicked"))
                        .with_context("handler", name))
                }
                Err(join_err) => Err(TaskError::system(format!(
                    "subscriber {name} was aborted: {join_err}"
                ))),
            };

            if let Err(err) = outcome {
                if first_error.is_none() {
                    warn!(?kind, handler = name, %err, "subscriber failed");
                    first_error = Some(err);
                } else {
                    error!(?kind, handler = name, %err, "additional subscriber failure suppressed");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn handle(&self, _event: &Event, _bus: &EventBus) -> TaskResult<()> {
            self.order.lock().unwrap().push(self.label);
            if self.fail {
                Err(TaskError::system(format!("{} failed", self.label)))
            } else {
                Ok(())
            }
        }
    }

    fn queued(task_id: &str) -> EventPayload {
        EventPayload::TaskQueued {
            task_id: task_id.into(),
        }
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_succeeds() {
        let bus = EventBus::new(Duration::from_secs(1));
        assert!(bus.emit(queued("t1")).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_run_in_registration_order() {
        let bus = EventBus::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            bus.subscribe(
                EventKind::TaskQueued,
                Arc::new(Recorder {
                    label,
                    order: Arc::clone(&order),
                    fail: false,
                }),
            );
        }

        bus.emit(queued("t1")).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn first_error_returned_remaining_subscribers_still_run() {
        let bus = EventBus::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            EventKind::TaskQueued,
            Arc::new(Recorder {
                label: "boom",
                order: Arc::clone(&order),
                fail: true,
            }),
        );
        bus.subscribe(
            EventKind::TaskQueued,
            Arc::new(Recorder {
                label: "after",
                order: Arc::clone(&order),
                fail: false,
            }),
        );

        let err = bus.emit(queued("t1")).await.unwrap_err();
        assert!(err.message.contains("boom"));
        // The failing subscriber did not short-circuit the fan-out.
        assert_eq!(*order.lock().unwrap(), vec!["boom", "after"]);
    }

    struct Panicker;

    #[async_trait]
    impl EventHandler for Panicker {
        fn name(&self) -> &'static str {
            "panicker"
        }

        async fn handle(&self, _event: &Event, _bus: &EventBus) -> TaskResult<()> {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn panicking_handler_becomes_system_error() {
        let bus = EventBus::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::TaskQueued, Arc::new(Panicker));
        bus.subscribe(
            EventKind::TaskQueued,
            Arc::new(Recorder {
                label: "survivor",
                order: Arc::clone(&order),
                fail: false,
            }),
        );

        let err = bus.emit(queued("t1")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SystemError);
        assert!(err.message.contains("panicked"));
        // The panic was contained; the next subscriber still ran.
        assert_eq!(*order.lock().unwrap(), vec!["survivor"]);
    }

    struct NextTaskResponder {
        answers: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for NextTaskResponder {
        fn name(&self) -> &'static str {
            "next-task-responder"
        }

        async fn handle(&self, event: &Event, bus: &EventBus) -> TaskResult<()> {
            let correlation_id = event.correlation_id.expect("request carries correlation id");
            self.answers.fetch_add(1, Ordering::SeqCst);
            bus.respond(correlation_id, ResponseValue::NextTask(Some("t-head".into())));
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_settles_with_responder_value() {
        let bus = EventBus::new(Duration::from_secs(1));
        bus.subscribe(
            EventKind::NextTaskQuery,
            Arc::new(NextTaskResponder {
                answers: AtomicUsize::new(0),
            }),
        );

        let value = bus.request(EventPayload::NextTaskQuery).await.unwrap();
        match value {
            ResponseValue::NextTask(Some(id)) => assert_eq!(id, "t-head"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_without_responder_times_out() {
        let bus = EventBus::new(Duration::from_millis(50));
        let err = bus.request(EventPayload::NextTaskQuery).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TaskTimeout);
        // The pending table was cleaned up.
        assert!(bus.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn late_response_is_ignored() {
        let bus = EventBus::new(Duration::from_secs(1));
        bus.respond(Uuid::now_v7(), ResponseValue::Ack);
    }
}
