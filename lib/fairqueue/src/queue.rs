// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! FIFO sub-queues and their bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::dump::{QueueDump, RequestDump};
use crate::request::RequestInner;

/// Requests waiting in one queue, oldest first.
#[derive(Default)]
pub(crate) struct RequestFifo {
    requests: VecDeque<Arc<RequestInner>>,
}

impl RequestFifo {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, request: Arc<RequestInner>) {
        self.requests.push_back(request);
    }

    pub(crate) fn dequeue(&mut self) -> Option<Arc<RequestInner>> {
        self.requests.pop_front()
    }

    /// The oldest waiting request.
    pub(crate) fn peek(&self) -> Option<&Arc<RequestInner>> {
        self.requests.front()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Total seats requested by all waiting requests.
    pub(crate) fn seats_sum(&self) -> usize {
        self.requests.iter().map(|r| r.seats()).sum()
    }

    /// Visit requests oldest-first while `f` keeps returning `true`.
    pub(crate) fn walk(&self, mut f: impl FnMut(&Arc<RequestInner>) -> bool) {
        for request in &self.requests {
            if !f(request) {
                return;
            }
        }
    }

    /// Remove the request with the given id, wherever it sits.
    pub(crate) fn remove(&mut self, id: u64) -> Option<Arc<RequestInner>> {
        let pos = self.requests.iter().position(|r| r.id == id)?;
        self.requests.remove(pos)
    }
}

/// One FIFO sub-queue plus its fair-queuing bookkeeping.
pub(crate) struct Queue {
    /// Stable identity; survives index renumbering.
    pub(crate) id: u64,
    /// Position in the queue set's queue list. Renumbered when an earlier
    /// queue is removed.
    pub(crate) index: usize,
    pub(crate) requests: RequestFifo,
    /// The queue's fair-queuing start tag in virtual seconds.
    pub(crate) virtual_start: f64,
    pub(crate) requests_executing: usize,
    pub(crate) seats_in_use: usize,
}

impl Queue {
    pub(crate) fn new(id: u64, index: usize) -> Self {
        Self {
            id,
            index,
            requests: RequestFifo::new(),
            virtual_start: 0.0,
            requests_executing: 0,
            seats_in_use: 0,
        }
    }

    /// A queue is active while it has work waiting or executing.
    pub(crate) fn is_active(&self) -> bool {
        !self.requests.is_empty() || self.requests_executing > 0
    }

    pub(crate) fn dump(&self, include_request_details: bool, now: Instant) -> QueueDump {
        let requests = if include_request_details {
            let mut details = Vec::with_capacity(self.requests.len());
            self.requests.walk(|r| {
                details.push(RequestDump {
                    flow_name: r.context.flow_name.clone(),
                    distinguisher: r.context.distinguisher.clone(),
                    seats: r.width.seats,
                    age_secs: now.saturating_duration_since(r.arrival_time).as_secs_f64(),
                });
                true
            });
            details
        } else {
            Vec::new()
        };
        QueueDump {
            virtual_start: self.virtual_start,
            waiting: self.requests.len(),
            executing: self.requests_executing,
            seats_in_use: self.seats_in_use,
            requests,
        }
    }
}
