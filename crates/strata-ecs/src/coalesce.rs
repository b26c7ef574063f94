//! Per-id coalescing of best-effort background jobs.
//!
//! Rapid successive edits to one entity often trigger the same expensive
//! follow-up (re-saving a subtree, recomputing a preview). A
//! [`CoalescingQueue`] keeps at most one job running and at most one job
//! pending per id. Submitting while a job runs replaces the pending one, so
//! the last submission wins and intermediate ones are dropped unrun.
//!
//! Jobs run on the ambient tokio runtime. A job that fails or panics is
//! logged; the next pending job for the id still runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

type Job = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Default)]
struct Shared {
    /// Present while a job runs for the id; the value is the pending job.
    slots: Mutex<HashMap<String, Option<Job>>>,
    idle: Notify,
}

/// Last-writer-wins job queue keyed by entity id. Clones share state.
#[derive(Clone, Default)]
pub struct CoalescingQueue {
    shared: Arc<Shared>,
}

impl CoalescingQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a job for `id`.
    ///
    /// Returns `true` if the job started right away, `false` if it became
    /// the pending job (replacing any earlier pending one).
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, id: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let job: Job = Box::pin(job);
        let mut slots = self.shared.slots.lock();
        if let Some(pending) = slots.get_mut(&id) {
            if pending.replace(job).is_some() {
                tracing::trace!(entity_id = %id, "replaced pending job");
            }
            return false;
        }
        slots.insert(id.clone(), None);
        drop(slots);

        tokio::spawn(run_slot(Arc::clone(&self.shared), id, job));
        true
    }

    /// Whether a job is running for `id`.
    pub fn is_busy(&self, id: &str) -> bool {
        self.shared.slots.lock().contains_key(id)
    }

    /// Number of ids with a running job.
    pub fn in_flight(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Wait until no job is running or pending.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CoalescingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingQueue")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn run_slot(shared: Arc<Shared>, id: String, mut job: Job) {
    loop {
        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(entity_id = %id, %error, "coalesced job failed");
            }
            Err(_) => {
                tracing::error!(entity_id = %id, "coalesced job panicked");
            }
        }

        let mut slots = shared.slots.lock();
        match slots.get_mut(&id).and_then(Option::take) {
            Some(next) => job = next,
            None => {
                slots.remove(&id);
                drop(slots);
                shared.idle.notify_waiters();
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
