// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The fair-queuing scheduler.
//!
//! A [`QueueSet`] arbitrates a single shared resource, a budget of seats,
//! among competing request flows. Requests hash to one of a fixed set of
//! FIFO queues via shuffle sharding, and queues are served in an order
//! derived from start-time fair queuing: each queue carries a virtual
//! start tag, the scheduler picks the queue whose next virtual finish
//! time is smallest, and a global virtual clock advances with contention
//! so that idle queues never fall behind.
//!
//! Construction is two-phase. [`QueueSetFactory::begin_construction`]
//! validates the queuing parameters (and can fail, e.g. on an infeasible
//! shuffle-sharding pair) without committing anything;
//! [`QueueSetCompleter::complete`] then binds the dispatching parameters
//! and yields the live queue set. Runtime reconfiguration reuses the same
//! two-phase shape through [`QueueSet::begin_config_change`]: growing the
//! queue count takes effect immediately, while shrinking merely lowers
//! the target and lets surplus queues drain away on their own.
//!
//! All scheduler state sits behind one mutex. Virtual time, the
//! round-robin cursor, and the seat counters have to be read and updated
//! as a unit, so the lock is held across whole operations; nothing blocks
//! or does I/O while holding it.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{ConfigError, DispatchingConfig, QueuingConfig};
use crate::counter::TaskCounter;
use crate::dump::QueueSetDump;
use crate::metrics::TimedObserverPair;
use crate::promise::WriteOnce;
use crate::queue::Queue;
use crate::request::{Decision, FlowContext, QueueNoteFn, Request, RequestInner, Width};
use crate::shuffle::Dealer;

/// Nominal service time, in virtual seconds, charged to a queue when one
/// of its requests is dispatched. The charge is corrected to the actual
/// service time when the request finishes, so this only has to be a
/// plausible scale, not an accurate estimate.
const DEFAULT_ESTIMATED_SERVICE_SECS: f64 = 60.0;

/// Makes [`QueueSet`]s that share a clock and a task counter.
pub struct QueueSetFactory {
    clock: Arc<dyn Clock>,
    counter: TaskCounter,
}

impl QueueSetFactory {
    pub fn new(clock: Arc<dyn Clock>, counter: TaskCounter) -> Self {
        Self { clock, counter }
    }

    /// Validate `qcfg` and return a completer for a new queue set. Fails
    /// if the queuing parameters imply an infeasible shuffle-sharding
    /// deal; on failure nothing has been constructed.
    pub fn begin_construction(
        &self,
        qcfg: QueuingConfig,
        observers: TimedObserverPair,
    ) -> Result<QueueSetCompleter, ConfigError> {
        let dealer = check_config(&qcfg)?;
        Ok(QueueSetCompleter {
            target: CompleterTarget::New {
                clock: Arc::clone(&self.clock),
                counter: self.counter.clone(),
                observers,
            },
            qcfg,
            dealer,
        })
    }
}

/// Returns the dealer for `qcfg` if it calls for one. A config with
/// queuing disabled needs no dealer and cannot fail.
fn check_config(qcfg: &QueuingConfig) -> Result<Option<Dealer>, ConfigError> {
    if qcfg.desired_num_queues == 0 {
        return Ok(None);
    }
    Ok(Some(Dealer::new(qcfg.desired_num_queues, qcfg.hand_size)?))
}

enum CompleterTarget {
    New {
        clock: Arc<dyn Clock>,
        counter: TaskCounter,
        observers: TimedObserverPair,
    },
    Existing(QueueSet),
}

/// Second phase of construction or reconfiguration: holds validated
/// queuing parameters waiting for their dispatching counterpart.
pub struct QueueSetCompleter {
    target: CompleterTarget,
    qcfg: QueuingConfig,
    dealer: Option<Dealer>,
}

impl QueueSetCompleter {
    /// Bind `dcfg` and produce the configured queue set. For a
    /// reconfiguration this swaps both configs atomically under the
    /// scheduler lock and immediately dispatches anything the new budget
    /// allows.
    pub fn complete(self, dcfg: DispatchingConfig) -> QueueSet {
        let queue_set = match self.target {
            CompleterTarget::New {
                clock,
                counter,
                observers,
            } => {
                let last_real_time = clock.now();
                QueueSet {
                    core: Arc::new(QueueSetCore {
                        clock,
                        counter,
                        estimated_service_secs: DEFAULT_ESTIMATED_SERVICE_SECS,
                        observers,
                        state: Mutex::new(State {
                            qcfg: self.qcfg.clone(),
                            dcfg: DispatchingConfig {
                                concurrency_limit: 0,
                            },
                            dealer: None,
                            queues: Vec::new(),
                            virtual_time: 0.0,
                            last_real_time,
                            robin_index: 0,
                            tot_requests_waiting: 0,
                            tot_requests_executing: 0,
                            tot_seats_in_use: 0,
                            next_queue_id: 0,
                            next_request_id: 0,
                        }),
                    }),
                }
            }
            CompleterTarget::Existing(queue_set) => queue_set,
        };
        queue_set.core.set_configuration(self.qcfg, self.dealer, dcfg);
        queue_set
    }
}

/// Mutable scheduler state, all guarded by the one lock in
/// [`QueueSetCore`].
pub(crate) struct State {
    /// Current queuing configuration. Its `desired_num_queues` may be
    /// less than `queues.len()` while surplus queues drain.
    pub(crate) qcfg: QueuingConfig,
    dcfg: DispatchingConfig,
    /// Present exactly when `qcfg.desired_num_queues > 0`.
    dealer: Option<Dealer>,
    queues: Vec<Queue>,
    /// Virtual seconds since this queue set was created. Only increases.
    virtual_time: f64,
    /// What the clock read when `virtual_time` was last advanced.
    last_real_time: std::time::Instant,
    /// Index of the queue last dispatched from; scanning resumes after it.
    robin_index: i64,
    tot_requests_waiting: usize,
    tot_requests_executing: usize,
    tot_seats_in_use: usize,
    next_queue_id: u64,
    next_request_id: u64,
}

impl State {
    pub(crate) fn is_idle(&self) -> bool {
        self.tot_requests_waiting == 0 && self.tot_requests_executing == 0
    }
}

/// Shared immutable collaborators plus the locked [`State`].
pub(crate) struct QueueSetCore {
    clock: Arc<dyn Clock>,
    counter: TaskCounter,
    estimated_service_secs: f64,
    observers: TimedObserverPair,
    state: Mutex<State>,
}

/// A fair, seat-aware request scheduler. Cloning yields another handle to
/// the same scheduler.
#[derive(Clone)]
pub struct QueueSet {
    pub(crate) core: Arc<QueueSetCore>,
}

impl QueueSet {
    /// Validate `qcfg` for this live queue set and return a completer.
    /// The configuration is not touched until the completer runs.
    pub fn begin_config_change(
        &self,
        qcfg: QueuingConfig,
    ) -> Result<QueueSetCompleter, ConfigError> {
        let dealer = check_config(&qcfg)?;
        Ok(QueueSetCompleter {
            target: CompleterTarget::Existing(self.clone()),
            qcfg,
            dealer,
        })
    }

    /// Begin handling one request.
    ///
    /// With queuing disabled (`desired_num_queues == 0`) the request is
    /// admitted immediately if its seats fit under the concurrency limit
    /// and rejected otherwise. With queuing enabled the request hashes to
    /// a queue, requests there that outstayed the wait limit are evicted,
    /// and the new request is enqueued unless both the seat budget and
    /// that queue are full. Enqueuing triggers a dispatch pass, and a
    /// watcher task relays `token` cancellation for as long as the
    /// request stays undecided.
    ///
    /// Returns `(None, is_idle)` on rejection, `(Some(request), false)`
    /// on admission; the caller must then invoke
    /// [`Request::finish`](crate::Request::finish). When queuing is
    /// enabled this must run inside a Tokio runtime.
    pub fn start_request(
        &self,
        token: CancellationToken,
        width: Width,
        hash_value: u64,
        context: FlowContext,
        queue_note_fn: Option<QueueNoteFn>,
    ) -> (Option<Request>, bool) {
        let core = &self.core;
        let mut st = core.lock_and_sync_time();

        // Queuing disabled: apply only the concurrency limit.
        if st.qcfg.desired_num_queues < 1 {
            if !core.can_accommodate_seats(&st, width.seats as usize) {
                tracing::debug!(
                    queue_set = %st.qcfg.name,
                    flow = %context.flow_name,
                    seats = width.seats,
                    seats_in_use = st.tot_seats_in_use,
                    executing = st.tot_requests_executing,
                    limit = st.dcfg.concurrency_limit,
                    "rejecting request over the concurrency limit"
                );
                return (None, st.is_idle());
            }
            let inner = core.dispatch_sans_queue(&mut st, width, context);
            drop(st);
            return (
                Some(Request {
                    core: Arc::clone(core),
                    inner,
                }),
                false,
            );
        }

        // Pick a queue by shuffle sharding, evict what has waited too
        // long, then enqueue unless the seat budget and the queue are
        // both full.
        let flow_name = context.flow_name.clone();
        let Some(inner) = core.timeout_old_requests_and_reject_or_enqueue(
            &mut st,
            width,
            hash_value,
            context,
            queue_note_fn,
        ) else {
            tracing::debug!(
                queue_set = %st.qcfg.name,
                flow = %flow_name,
                "rejecting request, queue full"
            );
            return (None, st.is_idle());
        };

        // Promote as many waiting requests as the budget allows; the new
        // request may come straight back out of its queue here.
        core.dispatch_as_much_as_possible(&mut st);
        drop(st);

        // Relay caller cancellation into the scheduler. The watcher also
        // wakes when the decision resolves normally, so it never outlives
        // its request.
        core.counter.add(1);
        let watcher_core = Arc::clone(core);
        let watcher_request = Arc::clone(&inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(
                        flow = %watcher_request.context.flow_name,
                        descr1 = %watcher_request.context.descr1,
                        descr2 = %watcher_request.context.descr2,
                        "request cancelled by caller"
                    );
                    watcher_core.cancel_wait(&watcher_request);
                }
                _ = watcher_request.decision.wait() => {}
            }
            watcher_core.counter.add(-1);
        });

        (
            Some(Request {
                core: Arc::clone(core),
                inner,
            }),
            false,
        )
    }

    /// Whether nothing is waiting or executing. Callers use this to learn
    /// when the queue set may be torn down.
    pub fn is_idle(&self) -> bool {
        self.core.state.lock().is_idle()
    }

    /// Nudge both observers with a zero delta so time-weighted sinks can
    /// integrate up to now.
    pub fn update_observations(&self) {
        self.core.observers.requests_waiting.add(0.0);
        self.core.observers.requests_executing.add(0.0);
    }

    /// Snapshot every queue for a debug endpoint.
    pub fn dump(&self, include_request_details: bool) -> QueueSetDump {
        let now = self.core.clock.now();
        let st = self.core.state.lock();
        QueueSetDump {
            queues: st
                .queues
                .iter()
                .map(|q| q.dump(include_request_details, now))
                .collect(),
            waiting: st.tot_requests_waiting,
            executing: st.tot_requests_executing,
            seats_in_use: st.tot_seats_in_use,
        }
    }
}

impl QueueSetCore {
    /// Acquire the lock and advance virtual time in one motion, so no
    /// state is ever mutated against a stale virtual clock.
    pub(crate) fn lock_and_sync_time(&self) -> MutexGuard<'_, State> {
        let mut st = self.state.lock();
        self.sync_time(&mut st);
        st
    }

    /// Advance virtual time assuming the current queue population has
    /// been in effect since `last_real_time`.
    fn sync_time(&self, st: &mut State) {
        let real_now = self.clock.now();
        let elapsed = real_now
            .saturating_duration_since(st.last_real_time)
            .as_secs_f64();
        st.last_real_time = real_now;
        st.virtual_time += elapsed * Self::virtual_time_ratio(st);
    }

    /// Rate at which virtual time advances: the seats being asked for
    /// (capped at the concurrency limit) spread over the active queues.
    /// Fewer active queues means each one's virtual clock runs faster.
    fn virtual_time_ratio(st: &State) -> f64 {
        let mut active_queues = 0usize;
        let mut seats_requested = 0usize;
        for queue in &st.queues {
            seats_requested += queue.seats_in_use + queue.requests.seats_sum();
            if queue.is_active() {
                active_queues += 1;
            }
        }
        if active_queues == 0 {
            return 0.0;
        }
        (seats_requested as f64).min(st.dcfg.concurrency_limit as f64) / active_queues as f64
    }

    /// Swap in a validated configuration pair. Growing the queue count
    /// appends empty queues now; shrinking is deferred to the drain check
    /// in `finish_request`. Disabling queuing keeps the previous queuing
    /// parameters so a later re-enable restores them.
    fn set_configuration(
        &self,
        mut qcfg: QueuingConfig,
        dealer: Option<Dealer>,
        dcfg: DispatchingConfig,
    ) {
        let mut st = self.lock_and_sync_time();

        if qcfg.desired_num_queues > 0 {
            let current = st.queues.len();
            for index in current..qcfg.desired_num_queues {
                let id = st.next_queue_id;
                st.next_queue_id += 1;
                st.queues.push(Queue::new(id, index));
            }
        } else {
            qcfg.queue_length_limit = st.qcfg.queue_length_limit;
            qcfg.hand_size = st.qcfg.hand_size;
            qcfg.request_wait_limit = st.qcfg.request_wait_limit;
        }

        st.qcfg = qcfg;
        st.dcfg = dcfg;
        st.dealer = dealer;

        self.observers
            .requests_waiting
            .set_denominator(st.qcfg.queue_length_limit.max(1) as f64);
        self.observers
            .requests_executing
            .set_denominator(st.dcfg.concurrency_limit as f64);

        self.dispatch_as_much_as_possible(&mut st);
    }

    /// Whether `seats` can be seated right now. A request wider than the
    /// whole concurrency limit is seated anyway when nothing at all is
    /// executing, so oversized requests cannot starve forever.
    fn can_accommodate_seats(&self, st: &State, seats: usize) -> bool {
        if seats > st.dcfg.concurrency_limit {
            if st.tot_requests_executing == 0 {
                return true;
            }
            tracing::debug!(
                queue_set = %st.qcfg.name,
                seats,
                seats_in_use = st.tot_seats_in_use,
                executing = st.tot_requests_executing,
                limit = st.dcfg.concurrency_limit,
                "oversized request waits for the queue set to empty"
            );
            return false;
        }
        st.tot_seats_in_use + seats <= st.dcfg.concurrency_limit
    }

    /// Shuffle-shard `hash_value` into a hand of candidate queues and
    /// take the one with the least seats already asked for. Least-loaded
    /// within the hand balances load without giving up flow affinity.
    fn choose_queue_index(&self, st: &State, hash_value: u64, context: &FlowContext) -> usize {
        let dealer = st.dealer.expect("queuing enabled implies a dealer");
        let mut best_index = 0usize;
        let mut best_seats_sum = usize::MAX;
        dealer.deal(hash_value, |index| {
            let seats_sum = st.queues[index].requests.seats_sum();
            if seats_sum < best_seats_sum {
                best_index = index;
                best_seats_sum = seats_sum;
            }
        });
        tracing::trace!(
            queue_set = %st.qcfg.name,
            flow = %context.flow_name,
            queue = best_index,
            seats_sum = best_seats_sum,
            "chose queue"
        );
        best_index
    }

    /// Reject and drop every request in queue `qidx` that has waited
    /// longer than the wait limit. Arrival order is monotonic, so the
    /// scan stops at the first request still within its limit. Timeouts
    /// are only checked here, when a new request lands on the queue.
    fn remove_timed_out_requests(&self, st: &mut State, qidx: usize) {
        let now = self.clock.now();
        let Some(wait_limit) = now.checked_sub(st.qcfg.request_wait_limit) else {
            return;
        };
        let mut timed_out = 0usize;
        let queue = &st.queues[qidx];
        queue.requests.walk(|request| {
            if request.arrival_time < wait_limit {
                request.decision.set(Decision::Reject);
                request.note_queued(false);
                timed_out += 1;
                true
            } else {
                false
            }
        });
        if timed_out > 0 {
            let queue = &mut st.queues[qidx];
            for _ in 0..timed_out {
                queue.requests.dequeue();
            }
            st.tot_requests_waiting -= timed_out;
            self.observers.requests_waiting.add(-(timed_out as f64));
            tracing::debug!(
                queue_set = %st.qcfg.name,
                queue = qidx,
                timed_out,
                "rejected requests waiting beyond the limit"
            );
        }
    }

    /// Queue selection, timeout eviction, and the enqueue-or-reject
    /// choice for one arriving request. Returns `None` when the seat
    /// budget is exhausted and the chosen queue is already at its length
    /// limit.
    fn timeout_old_requests_and_reject_or_enqueue(
        &self,
        st: &mut State,
        width: Width,
        hash_value: u64,
        context: FlowContext,
        queue_note_fn: Option<QueueNoteFn>,
    ) -> Option<Arc<RequestInner>> {
        let qidx = self.choose_queue_index(st, hash_value, &context);
        self.remove_timed_out_requests(st, qidx);

        let id = st.next_request_id;
        st.next_request_id += 1;
        let request = Arc::new(RequestInner {
            id,
            context,
            width,
            arrival_time: self.clock.now(),
            decision: WriteOnce::new(),
            queue_note_fn,
            queue_id: Some(st.queues[qidx].id),
            start_time: Mutex::new(None),
        });

        if !self.reject_or_enqueue(st, qidx, Arc::clone(&request)) {
            return None;
        }
        Some(request)
    }

    /// Enqueue unless the queue set is out of seats and queue `qidx` is
    /// at its length limit.
    fn reject_or_enqueue(&self, st: &mut State, qidx: usize, request: Arc<RequestInner>) -> bool {
        let queue_length = st.queues[qidx].requests.len();
        if st.tot_seats_in_use >= st.dcfg.concurrency_limit
            && queue_length >= st.qcfg.queue_length_limit
        {
            return false;
        }
        self.enqueue(st, qidx, request);
        true
    }

    fn enqueue(&self, st: &mut State, qidx: usize, request: Arc<RequestInner>) {
        let virtual_time = st.virtual_time;
        let queue = &mut st.queues[qidx];
        if queue.requests.is_empty() && queue.requests_executing == 0 {
            // A queue going from idle to busy starts "now" in virtual
            // time, not at whatever stale tag it last carried.
            queue.virtual_start = virtual_time;
            tracing::trace!(
                queue_set = %st.qcfg.name,
                queue = qidx,
                virtual_start = virtual_time,
                "initialized queue virtual start"
            );
        }
        request.note_queued(true);
        st.queues[qidx].requests.enqueue(request);
        st.tot_requests_waiting += 1;
        self.observers.requests_waiting.add(1.0);
    }

    /// Admit a request without any queuing. Only the counters move; there
    /// is no virtual-time bookkeeping without a queue.
    fn dispatch_sans_queue(
        &self,
        st: &mut State,
        width: Width,
        context: FlowContext,
    ) -> Arc<RequestInner> {
        let now = self.clock.now();
        let id = st.next_request_id;
        st.next_request_id += 1;
        let request = Arc::new(RequestInner {
            id,
            context,
            width,
            arrival_time: now,
            decision: WriteOnce::new(),
            queue_note_fn: None,
            queue_id: None,
            start_time: Mutex::new(Some(now)),
        });
        request.decision.set(Decision::Execute);
        st.tot_requests_executing += 1;
        st.tot_seats_in_use += request.seats();
        self.observers.requests_executing.add(1.0);
        tracing::debug!(
            queue_set = %st.qcfg.name,
            flow = %request.context.flow_name,
            executing = st.tot_requests_executing,
            "immediate dispatch without queuing"
        );
        request
    }

    /// Keep dispatching while something is waiting and seats remain.
    fn dispatch_as_much_as_possible(&self, st: &mut State) {
        while st.tot_requests_waiting != 0 && st.tot_seats_in_use < st.dcfg.concurrency_limit {
            if !self.dispatch_one(st) {
                break;
            }
        }
    }

    /// Dispatch the oldest request of the fair-queuing winner, if any
    /// queue is selectable. Charges the estimated service cost to the
    /// queue's virtual start up front.
    fn dispatch_one(&self, st: &mut State) -> bool {
        let Some(qidx) = self.select_queue(st) else {
            return false;
        };
        let now = self.clock.now();
        let queue = &mut st.queues[qidx];
        let Some(request) = queue.requests.dequeue() else {
            return false;
        };
        // The request leaves its queue and starts executing here; there
        // is no interim state between "queued" and "executing".
        *request.start_time.lock() = Some(now);
        queue.requests_executing += 1;
        queue.seats_in_use += request.seats();
        queue.virtual_start += self.estimated_service_secs * request.seats() as f64;
        let queue_virtual_start = queue.virtual_start;
        let queue_waiting = queue.requests.len();
        let queue_executing = queue.requests_executing;

        st.tot_requests_waiting -= 1;
        st.tot_requests_executing += 1;
        st.tot_seats_in_use += request.seats();
        request.note_queued(false);
        self.observers.requests_waiting.add(-1.0);
        self.observers.requests_executing.add(1.0);
        tracing::debug!(
            queue_set = %st.qcfg.name,
            flow = %request.context.flow_name,
            queue = qidx,
            virtual_start = queue_virtual_start,
            waiting = queue_waiting,
            executing = queue_executing,
            "dispatching request"
        );
        request.decision.set(Decision::Execute);
        true
    }

    /// Scan all queues round-robin, starting after the last winner, and
    /// pick the non-empty queue with the smallest virtual finish time for
    /// its next request. The finish time deliberately ignores the
    /// request's width: scaling it by seats would let a stream of narrow
    /// requests starve a wide one in another queue for a very long time.
    ///
    /// If the winner's oldest request cannot be seated, no queue is
    /// selected at all. Skipping to a different queue instead would serve
    /// requests out of fair order.
    fn select_queue(&self, st: &mut State) -> Option<usize> {
        let nq = st.queues.len();
        if nq == 0 {
            return None;
        }
        let mut min_virtual_finish = f64::INFINITY;
        let mut min_index = None;
        let mut robin = st.robin_index;
        for _ in 0..nq {
            robin = (robin + 1).rem_euclid(nq as i64);
            let queue = &st.queues[robin as usize];
            if !queue.requests.is_empty() {
                let virtual_finish = queue.virtual_start + self.estimated_service_secs;
                if virtual_finish < min_virtual_finish {
                    min_virtual_finish = virtual_finish;
                    min_index = Some(robin as usize);
                }
            }
        }
        let min_index = min_index?;
        let oldest_seats = st.queues[min_index].requests.peek().map(|r| r.seats())?;
        if !self.can_accommodate_seats(st, oldest_seats) {
            // The fair winner was not served, so the cursor stays put; a
            // full scan leaves it where it started.
            return None;
        }
        // Re-anchor the cursor on the winner so that on a virtual-finish
        // tie the queues that did not just win go first next round.
        st.robin_index = min_index as i64;

        // Start-time fair queuing keeps each queue's start tag at or
        // ahead of global virtual time: if this queue's tag (net of work
        // already in progress) fell behind, pull it forward.
        let virtual_time = st.virtual_time;
        let queue = &mut st.queues[min_index];
        let in_progress = queue.seats_in_use as f64 * self.estimated_service_secs;
        if virtual_time > queue.virtual_start - in_progress {
            queue.virtual_start = virtual_time + in_progress;
        }
        Some(min_index)
    }

    /// Undo a queued request's wait without a decision having been made.
    /// A no-op when the decision already resolved, so cancellation racing
    /// dispatch (or a second cancellation) changes nothing.
    pub(crate) fn cancel_wait(&self, request: &Arc<RequestInner>) {
        let mut st = self.state.lock();
        if request.decision.is_set() {
            return;
        }
        request.decision.set(Decision::Cancel);
        let Some(queue_id) = request.queue_id else {
            return;
        };
        let removed = st
            .queues
            .iter_mut()
            .find(|q| q.id == queue_id)
            .and_then(|q| q.requests.remove(request.id))
            .is_some();
        if removed {
            st.tot_requests_waiting -= 1;
            request.note_queued(false);
            self.observers.requests_waiting.add(-1.0);
        }
    }

    /// Completion bookkeeping plus a dispatch pass; everything that has
    /// to happen when a request finishes executing. Returns whether the
    /// queue set is now idle.
    pub(crate) fn finish_request_and_dispatch(&self, request: &Arc<RequestInner>) -> bool {
        let mut st = self.lock_and_sync_time();
        self.finish_request(&mut st, request);
        self.dispatch_as_much_as_possible(&mut st);
        st.is_idle()
    }

    /// Release a finished request's seats and correct its queue's virtual
    /// start by the gap between the estimated and the measured service
    /// time. That correction is what keeps fairness calibrated despite
    /// the fixed global estimate. Also the point where a surplus queue
    /// that just drained is removed.
    fn finish_request(&self, st: &mut State, request: &Arc<RequestInner>) {
        let now = self.clock.now();
        st.tot_requests_executing -= 1;
        st.tot_seats_in_use -= request.seats();
        self.observers.requests_executing.add(-1.0);

        let Some(queue_id) = request.queue_id else {
            tracing::trace!(
                queue_set = %st.qcfg.name,
                flow = %request.context.flow_name,
                executing = st.tot_requests_executing,
                "request finished without queuing"
            );
            return;
        };
        let pos = st
            .queues
            .iter()
            .position(|q| q.id == queue_id)
            .expect("an executing request keeps its queue alive");

        let start_time = (*request.start_time.lock()).unwrap_or(now);
        let actual_service_secs = now.saturating_duration_since(start_time).as_secs_f64();

        let queue = &mut st.queues[pos];
        queue.virtual_start -=
            (self.estimated_service_secs - actual_service_secs) * request.seats() as f64;
        queue.requests_executing -= 1;
        queue.seats_in_use -= request.seats();
        let drained = queue.requests.is_empty() && queue.requests_executing == 0;
        let removed_index = queue.index;
        let queue_virtual_start = queue.virtual_start;

        tracing::trace!(
            queue_set = %st.qcfg.name,
            flow = %request.context.flow_name,
            queue = removed_index,
            virtual_start = queue_virtual_start,
            service_secs = actual_service_secs,
            "request finished"
        );

        if drained && st.queues.len() > st.qcfg.desired_num_queues {
            st.queues.remove(pos);
            for queue in st.queues.iter_mut().skip(pos) {
                queue.index -= 1;
            }
            // Keep "(robin_index + 1) % len" pointing at the queue after
            // the one last dispatched from.
            if st.robin_index >= removed_index as i64 {
                st.robin_index -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shuffle::ShuffleShardingError;

    fn bypass_queue_set(concurrency_limit: usize) -> QueueSet {
        let factory = QueueSetFactory::new(Arc::new(ManualClock::new()), TaskCounter::new());
        factory
            .begin_construction(
                QueuingConfig::builder()
                    .name("bypass")
                    .desired_num_queues(0usize)
                    .build()
                    .unwrap(),
                TimedObserverPair::noop(),
            )
            .unwrap()
            .complete(DispatchingConfig { concurrency_limit })
    }

    fn flow(name: &str) -> FlowContext {
        FlowContext {
            flow_name: name.to_string(),
            ..FlowContext::default()
        }
    }

    #[test]
    fn test_begin_construction_rejects_infeasible_sharding() {
        let factory = QueueSetFactory::new(Arc::new(ManualClock::new()), TaskCounter::new());
        let err = factory
            .begin_construction(
                QueuingConfig::builder()
                    .desired_num_queues(512usize)
                    .hand_size(7usize)
                    .build()
                    .unwrap(),
                TimedObserverPair::noop(),
            )
            .err()
            .expect("512 queues at hand size 7 need more entropy than a hash carries");
        let ConfigError::ShuffleSharding(inner) = err;
        assert!(matches!(
            inner,
            ShuffleShardingError::NotEnoughEntropy { .. }
        ));
    }

    #[tokio::test]
    async fn test_bypass_applies_only_the_concurrency_limit() {
        let qs = bypass_queue_set(2);
        let (r1, _) = qs.start_request(
            CancellationToken::new(),
            Width::new(1),
            0,
            flow("a"),
            None,
        );
        let (r2, _) = qs.start_request(
            CancellationToken::new(),
            Width::new(1),
            0,
            flow("b"),
            None,
        );
        let (r3, idle) = qs.start_request(
            CancellationToken::new(),
            Width::new(1),
            0,
            flow("c"),
            None,
        );
        let r1 = r1.expect("one seat of two is free");
        let r2 = r2.expect("two seats of two are free");
        assert!(r3.is_none(), "no seats left for a third request");
        assert!(!idle, "two requests are executing");

        assert!(!r1.finish(|| async {}).await);
        let (r4, _) = qs.start_request(
            CancellationToken::new(),
            Width::new(1),
            0,
            flow("d"),
            None,
        );
        let r4 = r4.expect("finishing r1 freed a seat");
        assert!(!r2.finish(|| async {}).await);
        assert!(r4.finish(|| async {}).await, "last one out reports idle");
    }

    #[tokio::test]
    async fn test_oversized_request_admitted_only_into_an_empty_set() {
        let qs = bypass_queue_set(1);
        let (r1, _) = qs.start_request(
            CancellationToken::new(),
            Width::new(3),
            0,
            flow("wide"),
            None,
        );
        let r1 = r1.expect("an oversized request is seated while nothing executes");

        let (r2, _) = qs.start_request(
            CancellationToken::new(),
            Width::new(1),
            0,
            flow("narrow"),
            None,
        );
        assert!(r2.is_none(), "no seat fits beside the oversized request");

        let executed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = executed.clone();
        assert!(
            r1.finish(|| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await
        );
        assert!(executed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_idle_reflects_executing_requests() {
        let qs = bypass_queue_set(1);
        assert!(qs.is_idle());
        let (r1, _) = qs.start_request(
            CancellationToken::new(),
            Width::new(1),
            0,
            flow("a"),
            None,
        );
        assert!(!qs.is_idle());
        r1.unwrap().finish(|| async {}).await;
        assert!(qs.is_idle());
    }
}
