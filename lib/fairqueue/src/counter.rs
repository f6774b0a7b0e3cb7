// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared task accounting.
//!
//! The queue set spawns one watcher task per queued request to relay
//! cancellation. The counter tracks how many of those tasks are alive so
//! tests can await quiescence instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A shared counter of live helper tasks. Clones observe the same count.
#[derive(Debug, Clone, Default)]
pub struct TaskCounter {
    count: Arc<AtomicI64>,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: i64) {
        self.count.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn value(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}
