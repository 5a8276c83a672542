//! Streaming view of a running turn.
//!
//! A [`StreamingResult`] wraps a lazily-started producer task and a fan-out
//! hub. Nothing runs until the first consumer subscribes or awaits; from
//! then on every subscriber sees the same events in transport-arrival
//! order, while late subscribers see only what is emitted after they
//! attach. Consumers pull from bounded queues, so a slow consumer
//! backpressures the producer instead of buffering without limit; a dead
//! consumer is detected by its closed channel and removed without
//! affecting siblings.
//!
//! Producer failures are enqueued as a typed error element and then the
//! stream closes — consumers observe the error like any other item, and the
//! hub itself stays alive to serve [`StreamingResult::wait`].

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::Error;
use crate::events::{ThreadEvent, ThreadItem, TurnStatus, Usage};
use crate::thread::TurnResult;

/// Per-consumer queue depth; the producer awaits a full queue.
const CONSUMER_QUEUE_DEPTH: usize = 256;

/// Stream element: an event, or the typed error that ended the run.
pub type StreamElement = std::result::Result<ThreadEvent, Arc<Error>>;

/// Boxed event stream handed to consumers.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamElement> + Send>>;

/// How to stop a streamed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// Stop the transport now.
    Immediate,
    /// Let the current turn finish, then stop before the next
    /// continuation.
    AfterTurn,
}

/// A derived, higher-level view of the raw stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The thread id became known.
    Started { thread_id: String },
    /// A fragment of the agent's message, in order.
    MessageDelta { item_id: String, delta: String },
    /// An item finished.
    Item(ThreadItem),
    /// Cumulative usage changed.
    UsageUpdated(Usage),
    /// The turn ended.
    Completed { status: TurnStatus },
}

/// Fan-out hub shared by the producer and all consumers.
pub(crate) struct StreamHub {
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<StreamElement>>>,
    usage_tx: watch::Sender<Usage>,
    usage_rx: watch::Receiver<Usage>,
    cancel_now_tx: watch::Sender<bool>,
    cancel_now_rx: watch::Receiver<bool>,
    cancel_after_turn: AtomicBool,
    result: std::sync::Mutex<Option<std::result::Result<TurnResult, Arc<Error>>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl StreamHub {
    pub(crate) fn new() -> Arc<StreamHub> {
        let (usage_tx, usage_rx) = watch::channel(Usage::default());
        let (cancel_now_tx, cancel_now_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(StreamHub {
            subscribers: std::sync::Mutex::new(Vec::new()),
            usage_tx,
            usage_rx,
            cancel_now_tx,
            cancel_now_rx,
            cancel_after_turn: AtomicBool::new(false),
            result: std::sync::Mutex::new(None),
            done_tx,
            done_rx,
        })
    }

    /// Deliver one event to every live subscriber, with backpressure.
    pub(crate) async fn emit(&self, event: ThreadEvent) {
        self.deliver(Ok(event)).await;
    }

    /// Deliver the terminal error element.
    pub(crate) async fn emit_error(&self, error: Arc<Error>) {
        self.deliver(Err(error)).await;
    }

    async fn deliver(&self, element: StreamElement) {
        let senders: Vec<mpsc::Sender<StreamElement>> = {
            self.subscribers
                .lock()
                .expect("stream hub poisoned")
                .clone()
        };
        let mut any_dead = false;
        for sender in &senders {
            if sender.send(element.clone()).await.is_err() {
                any_dead = true;
            }
        }
        if any_dead {
            self.subscribers
                .lock()
                .expect("stream hub poisoned")
                .retain(|s| !s.is_closed());
        }
    }

    pub(crate) fn set_usage(&self, usage: Usage) {
        let _ = self.usage_tx.send(usage);
    }

    pub(crate) fn cancel_now_requested(&self) -> bool {
        *self.cancel_now_rx.borrow()
    }

    /// Watch for an immediate-cancel request (for `select!` in the
    /// producer's event loop).
    pub(crate) fn cancel_watch(&self) -> watch::Receiver<bool> {
        self.cancel_now_rx.clone()
    }

    pub(crate) fn after_turn_requested(&self) -> bool {
        self.cancel_after_turn.load(Ordering::SeqCst)
    }

    /// Record the final outcome and close all consumer queues.
    pub(crate) fn finish(&self, result: std::result::Result<TurnResult, Arc<Error>>) {
        *self.result.lock().expect("stream hub poisoned") = Some(result);
        let _ = self.done_tx.send(true);
        // Dropping the senders closes every consumer stream.
        self.subscribers
            .lock()
            .expect("stream hub poisoned")
            .clear();
    }

    fn subscribe(&self) -> mpsc::Receiver<StreamElement> {
        let (tx, rx) = mpsc::channel(CONSUMER_QUEUE_DEPTH);
        if *self.done_rx.borrow() {
            // The run already finished; the subscriber gets an immediately
            // closed stream rather than a queue no one will ever fill.
            return rx;
        }
        self.subscribers
            .lock()
            .expect("stream hub poisoned")
            .push(tx);
        rx
    }
}

type Producer = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Lazy, cancellable, multi-consumer view of one `run_streamed` call.
pub struct StreamingResult {
    hub: Arc<StreamHub>,
    producer: std::sync::Mutex<Option<Producer>>,
    started: AtomicBool,
}

impl StreamingResult {
    pub(crate) fn new(hub: Arc<StreamHub>, producer: Producer) -> StreamingResult {
        StreamingResult {
            hub,
            producer: std::sync::Mutex::new(Some(producer)),
            started: AtomicBool::new(false),
        }
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(producer) = self
            .producer
            .lock()
            .expect("streaming result poisoned")
            .take()
        {
            tokio::spawn(producer);
        }
    }

    /// The ordered, un-folded event stream. Starts the run on first call.
    pub fn raw_events(&self) -> EventStream {
        let rx = self.hub.subscribe();
        self.ensure_started();
        Box::pin(ReceiverStream::new(rx))
    }

    /// Higher-level derived events. Starts the run on first call.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = RunEvent> + Send>> {
        let raw = self.raw_events();
        Box::pin(raw.filter_map(|element| async move {
            match element {
                Ok(ThreadEvent::ThreadStarted { thread_id, .. }) => {
                    Some(RunEvent::Started { thread_id })
                }
                Ok(ThreadEvent::AgentMessageDelta { item_id, delta, .. }) => {
                    Some(RunEvent::MessageDelta { item_id, delta })
                }
                Ok(ThreadEvent::ItemCompleted { item }) => Some(RunEvent::Item(item)),
                Ok(ThreadEvent::TokenUsageUpdated { usage, .. }) => {
                    Some(RunEvent::UsageUpdated(usage))
                }
                Ok(ThreadEvent::TurnCompleted { status, .. }) => {
                    Some(RunEvent::Completed { status })
                }
                _ => None,
            }
        }))
    }

    /// Current aggregated usage snapshot, live during streaming.
    pub fn usage(&self) -> Usage {
        self.hub.usage_rx.borrow().clone()
    }

    /// Cancel the run. [`CancelMode::Immediate`] stops the transport now;
    /// [`CancelMode::AfterTurn`] lets the in-flight turn finish and stops
    /// the continuation loop.
    pub fn cancel(&self, mode: CancelMode) {
        match mode {
            CancelMode::Immediate => {
                let _ = self.hub.cancel_now_tx.send(true);
            }
            CancelMode::AfterTurn => {
                self.hub.cancel_after_turn.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Await the final result. Starts the run if nothing else has.
    pub async fn wait(&self) -> std::result::Result<TurnResult, Arc<Error>> {
        self.ensure_started();
        let mut done = self.hub.done_rx.clone();
        loop {
            if *done.borrow() {
                break;
            }
            if done.changed().await.is_err() {
                break;
            }
        }
        self.hub
            .result
            .lock()
            .expect("stream hub poisoned")
            .clone()
            .unwrap_or_else(|| Err(Arc::new(Error::stream("producer finished without a result"))))
    }
}

impl std::fmt::Debug for StreamingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResult")
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture_events() -> Vec<ThreadEvent> {
        vec![
            ThreadEvent::parse(&json!({"type": "thread.started", "thread_id": "thr_s"})).unwrap(),
            ThreadEvent::parse(
                &json!({"type": "turn.started", "thread_id": "thr_s", "turn_id": "t_1"}),
            )
            .unwrap(),
            ThreadEvent::parse(&json!({
                "type": "item.completed",
                "item": {"type": "agent_message", "id": "m_1", "text": "hi"}
            }))
            .unwrap(),
            ThreadEvent::parse(&json!({
                "type": "turn.completed", "thread_id": "thr_s", "turn_id": "t_1",
                "status": "completed"
            }))
            .unwrap(),
        ]
    }

    fn fixture_result() -> TurnResult {
        TurnResult {
            events: fixture_events(),
            items: Vec::new(),
            final_response: None,
            usage: Usage::default(),
            attempts: 1,
            continuation: None,
            raw: json!({}),
        }
    }

    fn fixture_streaming() -> StreamingResult {
        let hub = StreamHub::new();
        let producer_hub = hub.clone();
        let producer = Box::pin(async move {
            for event in fixture_events() {
                producer_hub.emit(event).await;
            }
            producer_hub.finish(Ok(fixture_result()));
        });
        StreamingResult::new(hub, producer)
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let hub = StreamHub::new();
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let producer_hub = hub.clone();
        let producer = Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            producer_hub.finish(Ok(fixture_result()));
        });
        let streaming = StreamingResult::new(hub, producer);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!started.load(Ordering::SeqCst), "producer ran before first consumer");

        let _events = streaming.raw_events();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_all_events_in_order() {
        let streaming = fixture_streaming();
        let events: Vec<StreamElement> = streaming.raw_events().collect().await;
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ThreadEvent::ThreadStarted { .. }
        ));
        assert!(matches!(
            events[3].as_ref().unwrap(),
            ThreadEvent::TurnCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_prefix_take_is_deterministic() {
        let first: Vec<StreamElement> =
            fixture_streaming().raw_events().take(2).collect().await;
        let second: Vec<StreamElement> =
            fixture_streaming().raw_events().take(2).collect().await;
        let unwrap = |elements: Vec<StreamElement>| -> Vec<ThreadEvent> {
            elements.into_iter().map(|e| e.unwrap()).collect()
        };
        assert_eq!(unwrap(first), unwrap(second));
    }

    #[tokio::test]
    async fn test_multi_consumer_sees_same_events() {
        let hub = StreamHub::new();
        let producer_hub = hub.clone();
        let producer = Box::pin(async move {
            // Give the second consumer time to attach before emitting.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            for event in fixture_events() {
                producer_hub.emit(event).await;
            }
            producer_hub.finish(Ok(fixture_result()));
        });
        let streaming = StreamingResult::new(hub, producer);

        let stream_a = streaming.raw_events();
        let stream_b = streaming.raw_events();
        let (a, b) = tokio::join!(stream_a.collect::<Vec<_>>(), stream_b.collect::<Vec<_>>());
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 4);
    }

    #[tokio::test]
    async fn test_dead_consumer_does_not_affect_siblings() {
        let hub = StreamHub::new();
        let producer_hub = hub.clone();
        let producer = Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            for event in fixture_events() {
                producer_hub.emit(event).await;
            }
            producer_hub.finish(Ok(fixture_result()));
        });
        let streaming = StreamingResult::new(hub, producer);

        let dying = streaming.raw_events();
        let surviving = streaming.raw_events();
        drop(dying);

        let events: Vec<StreamElement> = surviving.collect().await;
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_producer_error_is_an_element() {
        let hub = StreamHub::new();
        let producer_hub = hub.clone();
        let producer = Box::pin(async move {
            producer_hub.emit(fixture_events()[0].clone()).await;
            let error = Arc::new(Error::transport_retryable("stream idle timeout"));
            producer_hub.emit_error(error.clone()).await;
            producer_hub.finish(Err(error));
        });
        let streaming = StreamingResult::new(hub, producer);

        let events: Vec<StreamElement> = streaming.raw_events().collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());

        let result = streaming.wait().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_derived_events() {
        let streaming = fixture_streaming();
        let events: Vec<RunEvent> = streaming.events().collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RunEvent::Started { ref thread_id } if thread_id == "thr_s"));
        assert!(matches!(events[1], RunEvent::Item(_)));
        assert!(matches!(
            events[2],
            RunEvent::Completed {
                status: TurnStatus::Completed
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_returns_result() {
        let streaming = fixture_streaming();
        let result = streaming.wait().await.unwrap();
        assert_eq!(result.attempts, 1);
        // wait() again still answers.
        let again = streaming.wait().await.unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_flags() {
        let streaming = fixture_streaming();
        assert!(!streaming.hub.after_turn_requested());
        streaming.cancel(CancelMode::AfterTurn);
        assert!(streaming.hub.after_turn_requested());
        streaming.cancel(CancelMode::Immediate);
        assert!(streaming.hub.cancel_now_requested());
    }
}
