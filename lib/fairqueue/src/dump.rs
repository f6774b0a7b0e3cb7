// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Introspection snapshots.
//!
//! [`QueueSet::dump`](crate::QueueSet::dump) produces these for debug
//! endpoints. The shapes are not a stable API.

use serde::Serialize;

/// Point-in-time snapshot of a whole queue set.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSetDump {
    pub queues: Vec<QueueDump>,
    pub waiting: usize,
    pub executing: usize,
    pub seats_in_use: usize,
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDump {
    pub virtual_start: f64,
    pub waiting: usize,
    pub executing: usize,
    pub seats_in_use: usize,
    /// Per-request details; populated only when the dump asks for them.
    pub requests: Vec<RequestDump>,
}

/// Snapshot of one waiting request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDump {
    pub flow_name: String,
    pub distinguisher: String,
    pub seats: u32,
    /// Seconds since the request arrived.
    pub age_secs: f64,
}
