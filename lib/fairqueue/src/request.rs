// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Admission tokens.
//!
//! A [`Request`] is the handle a caller gets back from a successful
//! `start_request`. The caller parks in [`Request::finish`] until the
//! scheduler resolves the request's decision, and only an `Execute`
//! decision runs the caller's handler body.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::promise::WriteOnce;
use crate::queueset::QueueSetCore;

/// Concurrency cost of a request. A request occupies `seats` seats for as
/// long as it executes; heavier requests may take several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Width {
    pub seats: u32,
}

impl Width {
    pub fn new(seats: u32) -> Self {
        Self { seats }
    }
}

/// Identity a request carries for fairness bookkeeping and logging.
///
/// `flow_name` and `distinguisher` identify the flow the request belongs
/// to; `descr1`/`descr2` are opaque caller context that only ever shows up
/// in log lines and dumps.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    pub flow_name: String,
    pub distinguisher: String,
    pub descr1: String,
    pub descr2: String,
}

/// Callback invoked with `true` when a request enters its queue and
/// `false` when it leaves (dispatch, timeout, or cancellation). Lets
/// callers keep their own queue-depth accounting.
pub type QueueNoteFn = Box<dyn Fn(bool) + Send + Sync>;

/// How the scheduler resolved a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Execute,
    Reject,
    Cancel,
}

/// Scheduler-side state of one admission attempt. Shared between the
/// caller's [`Request`] handle, the queue FIFO, and the cancellation
/// watcher task.
pub(crate) struct RequestInner {
    pub(crate) id: u64,
    pub(crate) context: FlowContext,
    pub(crate) width: Width,
    pub(crate) arrival_time: Instant,
    pub(crate) decision: WriteOnce<Decision>,
    pub(crate) queue_note_fn: Option<QueueNoteFn>,
    /// Queue this request was assigned to; `None` for sans-queue
    /// dispatches. Queues are tracked by stable id, not index, because
    /// indices renumber when surplus queues drain away.
    pub(crate) queue_id: Option<u64>,
    /// Set when the request leaves its queue and starts executing.
    pub(crate) start_time: Mutex<Option<Instant>>,
}

impl RequestInner {
    pub(crate) fn seats(&self) -> usize {
        self.width.seats as usize
    }

    pub(crate) fn note_queued(&self, queued: bool) {
        if let Some(note) = &self.queue_note_fn {
            note(queued);
        }
    }
}

/// A pending or executing admission attempt.
///
/// Dropping a `Request` without calling [`finish`](Request::finish) leaks
/// its seats if it was already dispatched; callers must always finish the
/// requests they are handed.
pub struct Request {
    pub(crate) core: Arc<QueueSetCore>,
    pub(crate) inner: Arc<RequestInner>,
}

impl Request {
    /// Seats this request occupies while executing.
    pub fn seats(&self) -> usize {
        self.inner.seats()
    }

    pub fn context(&self) -> &FlowContext {
        &self.inner.context
    }

    /// Wait for the scheduler's decision and, if it is to execute, run
    /// `exec_fn`. Seats are released and further dispatch is triggered
    /// when `exec_fn` returns, or when it unwinds.
    ///
    /// Returns whether the queue set is idle afterwards. Consuming `self`
    /// makes a second wait on the same request a compile error rather
    /// than a runtime one.
    pub async fn finish<F, Fut>(self, exec_fn: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let (execute, idle) = self.wait().await;
        if !execute {
            return idle;
        }
        let idle_after = Arc::new(AtomicBool::new(false));
        {
            let _guard = CompletionGuard {
                core: Arc::clone(&self.core),
                request: Arc::clone(&self.inner),
                idle_after: Arc::clone(&idle_after),
            };
            exec_fn().await;
        }
        idle_after.load(Ordering::SeqCst)
    }

    /// Block until the decision resolves. Returns `(execute, idle)`.
    async fn wait(&self) -> (bool, bool) {
        let decision = self.inner.decision.wait().await;
        let state = self.core.lock_and_sync_time();
        match decision {
            Decision::Reject => {
                tracing::debug!(
                    queue_set = %state.qcfg.name,
                    flow = %self.inner.context.flow_name,
                    descr1 = %self.inner.context.descr1,
                    descr2 = %self.inner.context.descr2,
                    "request timed out while queued"
                );
                (false, state.is_idle())
            }
            Decision::Cancel => {
                tracing::debug!(
                    queue_set = %state.qcfg.name,
                    flow = %self.inner.context.flow_name,
                    descr1 = %self.inner.context.descr1,
                    descr2 = %self.inner.context.descr2,
                    "request cancelled while queued"
                );
                (false, state.is_idle())
            }
            Decision::Execute => (true, false),
        }
    }
}

/// Releases a dispatched request's seats when dropped, so completion
/// bookkeeping runs even if the handler body unwinds.
struct CompletionGuard {
    core: Arc<QueueSetCore>,
    request: Arc<RequestInner>,
    idle_after: Arc<AtomicBool>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let idle = self.core.finish_request_and_dispatch(&self.request);
        self.idle_after.store(idle, Ordering::SeqCst);
    }
}
