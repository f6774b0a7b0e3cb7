// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Queue set configuration.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::shuffle::ShuffleShardingError;

/// Error returned by the two-phase construction entry points when the
/// queuing parameters cannot be realized.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the queuing config implies an invalid shuffle sharding config (desired_num_queues is the deck size): {0}")]
    ShuffleSharding(#[from] ShuffleShardingError),
}

/// How requests queue while they wait for seats.
///
/// Use [`QueuingConfig::builder()`] to construct; every field has a
/// default. A `desired_num_queues` of zero disables queuing entirely: the
/// queue set then only enforces the concurrency limit, and the remaining
/// fields are ignored.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(pattern = "owned", setter(into))]
pub struct QueuingConfig {
    /// Name of the queue set, used in log lines.
    #[builder(default = "String::new()")]
    pub name: String,

    /// How many queues the scheduler aims to keep. The live count may
    /// transiently exceed this after a shrink, until surplus queues drain.
    #[builder(default = "64")]
    pub desired_num_queues: usize,

    /// Maximum number of requests waiting in any one queue.
    #[builder(default = "50")]
    pub queue_length_limit: usize,

    /// Shuffle-sharding hand size: how many candidate queues a flow's hash
    /// is dealt.
    #[builder(default = "6")]
    pub hand_size: usize,

    /// How long a request may wait in its queue before it is rejected.
    #[builder(default = "Duration::from_secs(15)")]
    pub request_wait_limit: Duration,
}

impl QueuingConfig {
    pub fn builder() -> QueuingConfigBuilder {
        QueuingConfigBuilder::default()
    }
}

impl Default for QueuingConfig {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("every field has a default")
    }
}

/// How much work may execute at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchingConfig {
    /// Maximum total seats occupied by executing requests.
    pub concurrency_limit: usize,
}
