//! Per-transaction participant state.

use std::sync::{Arc, Mutex, MutexGuard};

use hearth_protocol::Delivery;
use hearth_session::SessionId;

use crate::pipeline::PipelineShared;
use crate::{DeliveryError, OutboundMessage, Update};
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Active,
    Prepared,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct ContextState {
    pub(crate) phase: Phase,
    /// One update per session, in the order sessions were first touched.
    pub(crate) updates: Vec<(SessionId, Update)>,
}

/// The part of a context the global queue holds on to.
#[derive(Debug)]
pub(crate) struct ContextShared {
    pub(crate) id: u64,
    pub(crate) state: Mutex<ContextState>,
}

impl ContextShared {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(ContextState {
                phase: Phase::Active,
                updates: Vec::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState> {
        // A panic while holding this lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Collects one transaction's outbound session traffic and takes part in its
/// two-phase commit.
///
/// ```text
/// begin() ──→ Active ──prepare()──→ Prepared ──commit()──→ Committed ──→ flushed
///               │                      │
///               └───────abort()────────┴──→ Aborted (nothing delivered)
/// ```
///
/// Dropping a context that was never committed aborts it, so a forgotten
/// context cannot block the delivery queue.
pub struct TransactionContext {
    shared: Arc<ContextShared>,
    pipeline: Arc<PipelineShared>,
}

impl TransactionContext {
    pub(crate) fn new(shared: Arc<ContextShared>, pipeline: Arc<PipelineShared>) -> Self {
        Self { shared, pipeline }
    }

    /// Monotonic id, for logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    fn with_update<F>(&self, session: SessionId, f: F) -> Result<(), DeliveryError>
    where
        F: FnOnce(&mut Update),
    {
        let mut state = self.shared.lock();
        match state.phase {
            Phase::Active => {}
            Phase::Prepared | Phase::Committed => return Err(DeliveryError::AlreadyPrepared),
            Phase::Aborted => return Err(DeliveryError::Aborted),
        }
        match state.updates.iter_mut().find(|(id, _)| *id == session) {
            Some((_, update)) => f(update),
            None => {
                let mut update = Update::default();
                f(&mut update);
                state.updates.push((session, update));
            }
        }
        Ok(())
    }

    /// Queues `body` for `session` after everything this transaction queued
    /// for it so far.
    pub fn send(
        &self,
        session: SessionId,
        body: Bytes,
        delivery: Delivery,
    ) -> Result<(), DeliveryError> {
        self.with_update(session, |u| u.push_back(OutboundMessage { body, delivery }))
    }

    /// Queues `body` for `session` ahead of everything this transaction
    /// queued for it so far.
    pub fn send_first(
        &self,
        session: SessionId,
        body: Bytes,
        delivery: Delivery,
    ) -> Result<(), DeliveryError> {
        self.with_update(session, |u| u.push_front(OutboundMessage { body, delivery }))
    }

    /// Disconnects `session` once this transaction's messages for it have
    /// been sent.
    pub fn request_disconnect(&self, session: SessionId) -> Result<(), DeliveryError> {
        self.with_update(session, Update::request_disconnect)
    }

    /// First phase. Returns `true` if the transaction produced no session
    /// output (read-only), in which case commit has nothing to do.
    ///
    /// # Errors
    /// - [`DeliveryError::AlreadyPrepared`] if called twice
    /// - [`DeliveryError::Aborted`] after `abort`
    /// - [`DeliveryError::ShutDown`] if the pipeline has stopped
    pub fn prepare(&self) -> Result<bool, DeliveryError> {
        let read_only = {
            let mut state = self.shared.lock();
            match state.phase {
                Phase::Active => {}
                Phase::Prepared | Phase::Committed => return Err(DeliveryError::AlreadyPrepared),
                Phase::Aborted => return Err(DeliveryError::Aborted),
            }
            state.updates.retain(|(_, update)| !update.is_empty());
            let read_only = state.updates.is_empty();
            if !read_only && self.pipeline.is_shut_down() {
                return Err(DeliveryError::ShutDown);
            }
            state.phase = Phase::Prepared;
            read_only
        };
        if !read_only {
            self.pipeline.enqueue(Arc::clone(&self.shared));
        }
        tracing::trace!(txn = self.shared.id, read_only, "transaction prepared");
        Ok(read_only)
    }

    /// Second phase. Marks the context committed and wakes the flush worker;
    /// delivery happens later on the worker.
    ///
    /// # Errors
    /// - [`DeliveryError::NotPrepared`] if `prepare` was not called
    /// - [`DeliveryError::Aborted`] after `abort`
    pub fn commit(&self) -> Result<(), DeliveryError> {
        {
            let mut state = self.shared.lock();
            match state.phase {
                Phase::Prepared => state.phase = Phase::Committed,
                Phase::Committed => return Ok(()),
                Phase::Active => return Err(DeliveryError::NotPrepared),
                Phase::Aborted => return Err(DeliveryError::Aborted),
            }
        }
        tracing::trace!(txn = self.shared.id, "transaction committed");
        self.pipeline.wake();
        Ok(())
    }

    /// Prepares and, unless read-only, commits in one step.
    pub fn prepare_and_commit(&self) -> Result<(), DeliveryError> {
        if !self.prepare()? {
            self.commit()?;
        }
        Ok(())
    }

    /// Discards all output and removes the context from the delivery queue.
    /// Aborting twice is not an error.
    ///
    /// # Errors
    /// Returns [`DeliveryError::AlreadyCommitted`] after `commit`.
    pub fn abort(&self) -> Result<(), DeliveryError> {
        {
            let mut state = self.shared.lock();
            match state.phase {
                Phase::Committed => return Err(DeliveryError::AlreadyCommitted),
                Phase::Aborted => return Ok(()),
                Phase::Active | Phase::Prepared => {
                    state.phase = Phase::Aborted;
                    state.updates.clear();
                }
            }
        }
        self.pipeline.dequeue(&self.shared);
        tracing::trace!(txn = self.shared.id, "transaction aborted");
        // The head may have been blocking committed contexts behind it.
        self.pipeline.wake();
        Ok(())
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let phase = self.shared.lock().phase;
        if matches!(phase, Phase::Active | Phase::Prepared) {
            tracing::debug!(txn = self.shared.id, "dropping uncommitted transaction");
            let _ = self.abort();
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.shared.id)
            .field("phase", &self.shared.lock().phase)
            .finish()
    }
}
