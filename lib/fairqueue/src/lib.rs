// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Flowgate fair queuing
//!
//! Fair, seat-aware admission scheduling for server request flows.
//!
//! A [`QueueSet`] sits between a serving layer and its handlers and
//! decides, for each incoming request, whether it executes now, waits its
//! turn, or is turned away. Competing flows are isolated from each other
//! by shuffle sharding across FIFO queues, served in start-time
//! fair-queuing order under a total budget of concurrency "seats", with
//! per-request widths, queued-wait timeouts, caller cancellation, and
//! live reconfiguration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use flowgate_fairqueue::{
//!     DispatchingConfig, FlowContext, QueueSetFactory, QueuingConfig, RealClock,
//!     TaskCounter, TimedObserverPair, Width,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = QueueSetFactory::new(Arc::new(RealClock), TaskCounter::new());
//! let queue_set = factory
//!     .begin_construction(
//!         QueuingConfig::builder().name("api").build()?,
//!         TimedObserverPair::noop(),
//!     )?
//!     .complete(DispatchingConfig { concurrency_limit: 100 });
//!
//! let (request, _idle) = queue_set.start_request(
//!     CancellationToken::new(),
//!     Width::new(1),
//!     0x5eed_cafe, // the flow's hash, stable per flow
//!     FlowContext {
//!         flow_name: "tenant-a".into(),
//!         ..Default::default()
//!     },
//!     None,
//! );
//! if let Some(request) = request {
//!     request
//!         .finish(|| async {
//!             // handle the request
//!         })
//!         .await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod counter;
pub mod dump;
pub mod metrics;
pub mod promise;
pub mod queueset;
pub mod request;
pub mod shuffle;

mod queue;

pub use clock::{Clock, ManualClock, RealClock};
pub use config::{ConfigError, DispatchingConfig, QueuingConfig, QueuingConfigBuilder};
pub use counter::TaskCounter;
pub use dump::{QueueDump, QueueSetDump, RequestDump};
pub use metrics::{GaugeObserver, NoopObserver, TimedObserver, TimedObserverPair};
pub use queueset::{QueueSet, QueueSetCompleter, QueueSetFactory};
pub use request::{FlowContext, QueueNoteFn, Request, Width};
pub use shuffle::{Dealer, ShuffleShardingError};
