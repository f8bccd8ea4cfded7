//! The global delivery queue and its flush worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hearth_session::SessionId;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::context::{ContextShared, Phase};
use crate::{TransactionContext, Update};

/// Receives committed updates from the flush worker, one session at a time.
///
/// The worker awaits each call before moving on, so a target sees updates
/// for a session in commit order. Failures are the target's to log; the
/// worker never retries.
pub trait FlushTarget: Send + Sync + 'static {
    fn flush_update(
        &self,
        session: SessionId,
        update: Update,
    ) -> impl std::future::Future<Output = ()> + Send;
}

pub(crate) struct PipelineShared {
    queue: Mutex<VecDeque<Arc<ContextShared>>>,
    notify: Notify,
    shut_down: AtomicBool,
    next_id: AtomicU64,
}

impl PipelineShared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<ContextShared>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn enqueue(&self, context: Arc<ContextShared>) {
        self.queue().push_back(context);
    }

    pub(crate) fn dequeue(&self, context: &Arc<ContextShared>) {
        self.queue().retain(|queued| !Arc::ptr_eq(queued, context));
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Orders committed transaction output and hands it to a [`FlushTarget`].
///
/// Contexts enter the queue when they are prepared with output, and leave it
/// when they are aborted or once committed and flushed. The worker only ever
/// flushes the head, so a prepared-but-undecided context holds back every
/// context prepared after it. That is what keeps per-session delivery in
/// commit order.
#[derive(Clone)]
pub struct DeliveryPipeline {
    shared: Arc<PipelineShared>,
}

impl DeliveryPipeline {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                shut_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts a new transaction participant.
    pub fn begin(&self) -> TransactionContext {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        TransactionContext::new(Arc::new(ContextShared::new(id)), Arc::clone(&self.shared))
    }

    /// Contexts waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// Spawns the flush worker. Call once per pipeline.
    pub fn spawn_flusher<T: FlushTarget>(&self, target: Arc<T>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_flusher(shared, target))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Stops accepting new output. The worker flushes whatever is already
    /// committed at the head of the queue, then exits.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        self.shared.wake();
    }
}

impl Default for DeliveryPipeline {
    fn default() -> Self {
        Self::new()
    }
}

enum Head {
    Empty,
    Blocked,
    Skip(Arc<ContextShared>),
    Ready(Arc<ContextShared>, Vec<(SessionId, Update)>),
}

fn inspect_head(shared: &PipelineShared) -> Head {
    let Some(context) = shared.queue().front().cloned() else {
        return Head::Empty;
    };
    let mut state = context.lock();
    match state.phase {
        Phase::Committed => {
            let updates = std::mem::take(&mut state.updates);
            drop(state);
            Head::Ready(context, updates)
        }
        Phase::Aborted => {
            drop(state);
            Head::Skip(context)
        }
        Phase::Active | Phase::Prepared => Head::Blocked,
    }
}

async fn run_flusher<T: FlushTarget>(shared: Arc<PipelineShared>, target: Arc<T>) {
    tracing::debug!("flush worker started");
    loop {
        loop {
            match inspect_head(&shared) {
                Head::Empty | Head::Blocked => break,
                Head::Skip(context) => shared.dequeue(&context),
                Head::Ready(context, updates) => {
                    tracing::trace!(txn = context.id, sessions = updates.len(), "flushing");
                    for (session, update) in updates {
                        target.flush_update(session, update).await;
                    }
                    shared.dequeue(&context);
                }
            }
        }
        if shared.is_shut_down() {
            break;
        }
        shared.notify.notified().await;
    }
    tracing::debug!(remaining = shared.queue().len(), "flush worker stopped");
}
