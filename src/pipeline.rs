use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::Error;

const RUNNING: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type BatchHandler<T> = Box<dyn Fn(Vec<T>) -> BoxedHandlerFuture + Send + Sync>;

/// Sizing and cadence knobs for a [`BatchPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Queue depth that triggers a flush.
    pub flush_at: usize,
    /// Cadence of the periodic flush.
    pub flush_interval: Duration,
    /// Maximum items handed to the batch handler at once.
    pub max_batch_size: usize,
    /// Queue capacity; beyond it the oldest items are dropped.
    pub max_queue_size: usize,
}

/// Bounded asynchronous batcher.
///
/// Items enqueue into a FIFO with drop-oldest overflow; two background
/// tasks (a periodic timer and a coalesced wake-up listener) drain the
/// queue through the caller-supplied batch handler. Enqueue order is
/// transmission order, writers never block, and at most one flush runs at
/// any moment.
pub struct BatchPipeline<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    state: AtomicU8,
    /// Flush exclusion; background passes take it with `try_lock`.
    flush_guard: tokio::sync::Mutex<()>,
    /// Single-slot "flush needed" signal; any number of triggers collapse
    /// into one stored permit.
    wakeup: Notify,
    shutdown: CancellationToken,
    options: PipelineOptions,
    handler: BatchHandler<T>,
}

impl<T: Send + 'static> BatchPipeline<T> {
    pub fn new<F, Fut>(options: PipelineOptions, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::with_capacity(options.max_queue_size.min(1024))),
            state: AtomicU8::new(RUNNING),
            flush_guard: tokio::sync::Mutex::new(()),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            options,
            handler: Box::new(move |batch| Box::pin(handler(batch)) as BoxedHandlerFuture),
        });

        let signal_task = {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = inner.wakeup.notified() => {
                            // Waiting (not skipping) keeps a wake-up that
                            // raced with an in-flight flush from being lost.
                            let _guard = inner.flush_guard.lock().await;
                            inner.drain().await;
                        }
                    }
                }
                trace!("flush signal loop stopped");
            })
        };

        let timer_task = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(inner.options.flush_interval);
                interval.tick().await; // Skip the first immediate tick
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if inner.depth() == 0 {
                                continue;
                            }
                            if let Ok(_guard) = inner.flush_guard.try_lock() {
                                inner.drain().await;
                            }
                        }
                    }
                }
                trace!("periodic flush loop stopped");
            })
        };

        Self {
            inner,
            tasks: Mutex::new(vec![signal_task, timer_task]),
        }
    }

    /// Adds an item to the queue. Returns whether it was accepted; the only
    /// rejection cause is a disposed pipeline. When the queue is full the
    /// oldest item is evicted so the writer never blocks.
    pub fn enqueue(&self, item: T) -> bool {
        if self.inner.state.load(Ordering::SeqCst) != RUNNING {
            debug!("enqueue rejected: pipeline disposed");
            return false;
        }

        let depth = {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.len() >= self.inner.options.max_queue_size {
                warn!(
                    depth = queue.len(),
                    capacity = self.inner.options.max_queue_size,
                    "queue full, dropping oldest item"
                );
                queue.pop_front();
            }
            queue.push_back(item);
            queue.len()
        };

        if depth >= self.inner.options.flush_at {
            self.inner.wakeup.notify_one();
        }
        true
    }

    /// Current queue depth.
    pub fn count(&self) -> usize {
        self.inner.depth()
    }

    /// Whether disposal has begun; a disposed pipeline rejects enqueues.
    pub fn is_disposed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != RUNNING
    }

    /// Drains the queue, waiting out any in-flight flush first. Completes
    /// once every item present at drain time has been offered to the
    /// handler.
    pub async fn flush(&self) {
        let _guard = self.inner.flush_guard.lock().await;
        self.inner.drain().await;
    }

    /// Stops the background tasks, performs a final flush, and rejects all
    /// further enqueues. Idempotent; a second call returns immediately.
    pub async fn dispose(&self) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, DISPOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("dispose called on already-disposed pipeline");
            return;
        }

        self.inner.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.flush().await;
        self.inner.state.store(DISPOSED, Ordering::SeqCst);
        debug!("pipeline disposed");
    }
}

impl<T: Send + 'static> Drop for BatchPipeline<T> {
    fn drop(&mut self) {
        // Graceful shutdown is `dispose().await`; this is the backstop.
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    fn depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn take_chunk(&self) -> Vec<T> {
        let mut queue = self.queue.lock().unwrap();
        let take = queue.len().min(self.options.max_batch_size);
        queue.drain(..take).collect()
    }

    /// Must be called with the flush guard held.
    async fn drain(&self) {
        loop {
            let chunk = self.take_chunk();
            if chunk.is_empty() {
                break;
            }
            let size = chunk.len();
            if let Err(error) = (self.handler)(chunk).await {
                // The transport already retried; the chunk is gone either way.
                warn!(%error, size, "dropping failed batch");
            }
        }
    }
}
