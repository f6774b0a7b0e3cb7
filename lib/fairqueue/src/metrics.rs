// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Observability hooks.
//!
//! The queue set reports two quantities on every state transition: requests
//! waiting and requests executing. It does not care where they go; callers
//! inject a [`TimedObserverPair`] at construction. This module ships a
//! no-op sink and a Prometheus-gauge-backed sink.

use std::sync::Arc;

use prometheus::Gauge;

/// Sink for one tracked quantity. `add` moves the current level;
/// `set_denominator` records the capacity the level should be read
/// against (queue length limit, concurrency limit), letting sinks export
/// a utilization ratio.
pub trait TimedObserver: Send + Sync {
    fn add(&self, delta: f64);
    fn set_denominator(&self, denominator: f64);
}

/// The two observers a queue set updates.
#[derive(Clone)]
pub struct TimedObserverPair {
    pub requests_waiting: Arc<dyn TimedObserver>,
    pub requests_executing: Arc<dyn TimedObserver>,
}

impl TimedObserverPair {
    /// A pair that discards every observation.
    pub fn noop() -> Self {
        Self {
            requests_waiting: Arc::new(NoopObserver),
            requests_executing: Arc::new(NoopObserver),
        }
    }
}

/// Discards all observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TimedObserver for NoopObserver {
    fn add(&self, _delta: f64) {}
    fn set_denominator(&self, _denominator: f64) {}
}

/// A [`TimedObserver`] backed by a pair of Prometheus gauges: the level
/// itself and the capacity it is read against.
pub struct GaugeObserver {
    level: Gauge,
    capacity: Gauge,
}

impl GaugeObserver {
    pub fn new(name: &str, help: &str) -> Result<Self, prometheus::Error> {
        Ok(Self {
            level: Gauge::new(name.to_string(), help.to_string())?,
            capacity: Gauge::new(
                format!("{name}_capacity"),
                format!("Capacity against which {name} is read"),
            )?,
        })
    }

    /// Register both gauges with `registry`.
    pub fn register(&self, registry: &prometheus::Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.level.clone()))?;
        registry.register(Box::new(self.capacity.clone()))
    }
}

impl TimedObserver for GaugeObserver {
    fn add(&self, delta: f64) {
        self.level.add(delta);
    }

    fn set_denominator(&self, denominator: f64) {
        self.capacity.set(denominator);
    }
}
