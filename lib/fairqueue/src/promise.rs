// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Write-once promise.
//!
//! A [`WriteOnce`] carries a single value from whichever scheduler path
//! resolves a request first (dispatch, timeout eviction, cancellation) to
//! any number of waiters. The first write wins; later writes are ignored
//! and report that they lost.

use tokio::sync::watch;

/// A cell that can be written exactly once and awaited by many readers.
#[derive(Debug)]
pub struct WriteOnce<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> WriteOnce<T> {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    /// Set the value if it has not been set yet. Returns whether this call
    /// was the one that set it.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// The value, if one has been set.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until a value is set and return it. Safe to call from multiple
    /// tasks; all of them observe the same value.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("the sending half lives as long as this promise");
        (*slot).clone().expect("wait_for returned with the slot filled")
    }
}

impl<T: Clone + Send + Sync> Default for WriteOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}
