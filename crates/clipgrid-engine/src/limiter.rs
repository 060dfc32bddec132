// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide bound on simultaneous remote calls.
///
/// One limiter is created at startup and cloned into the matrix engine, the
/// flow engine, and the single-action runner, so their combined in-flight
/// calls never exceed `capacity`.  A permit is held for exactly the network
/// critical section (upload + completion) and released on every exit path by
/// RAII — an early `?` cannot leak a slot.
#[derive(Clone)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free slots; used by status displays, not for gating.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Suspend until a slot is free.  There is no acquire timeout — the hard
    /// timeout lives around the guarded call itself (`EngineSettings`).
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        // The semaphore is never closed for the life of the limiter.
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .unwrap()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded_and_released() {
        let limiter = Limiter::new(2);
        assert_eq!(limiter.capacity(), 2);
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;
        assert_eq!(limiter.available(), 0);
        drop(a);
        assert_eq!(limiter.available(), 1);
        drop(b);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn third_acquire_waits_for_a_release() {
        let limiter = Limiter::new(1);
        let held = limiter.acquire().await;

        let l2 = limiter.clone();
        let waiter = tokio::spawn(async move {
            let _p = l2.acquire().await;
        });

        // The waiter cannot finish while the permit is held.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }
}
