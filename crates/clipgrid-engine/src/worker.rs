// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long startup waits for the loop thread to signal readiness before the
/// process fails fast.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long shutdown waits for the loop thread to exit before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("could not build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("worker loop did not become ready within {READY_TIMEOUT:?}")]
    ReadyTimeout,
}

/// The single background event loop hosting all remote I/O.
///
/// One dedicated OS thread runs one cooperative (current-thread) runtime for
/// the life of the process.  GUI threads hand work to it through [`spawn`],
/// which is thread-safe; results travel back through the engine event channel.
/// The GUI must not proceed without a working loop — [`start`] is fallible and
/// a failure is fatal to the caller.
///
/// [`spawn`]: WorkerLoop::spawn
/// [`start`]: WorkerLoop::start
pub struct WorkerLoop {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerLoop {
    /// Spawn the loop thread and wait (bounded) for its readiness signal.
    pub fn start() -> Result<Self, WorkerError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("clipgrid-worker".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                // Park on the stop signal; spawned tasks are driven by the
                // runtime while this future is pending.  Tasks still queued
                // when the signal arrives are dropped with the runtime.
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                debug!("worker loop exited");
            })
            .map_err(WorkerError::Spawn)?;

        let handle = match ready_rx.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(WorkerError::Runtime(e)),
            Err(_) => return Err(WorkerError::ReadyTimeout),
        };

        debug!("worker loop ready");
        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Handle for submitting work from any thread.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Schedule a future as a task on the loop.  Safe from any thread.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Signal the loop to stop and join the thread, bounded by
    /// [`JOIN_TIMEOUT`].  On timeout the thread is detached so shutdown never
    /// blocks process exit indefinitely.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!("worker thread did not exit in time; detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = thread.join();
    }
}

impl Drop for WorkerLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_spawn_and_stop() {
        let worker = WorkerLoop::start().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        worker.spawn(async move {
            let _ = tx.send(21 * 2);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        worker.stop();
    }

    #[test]
    fn spawn_is_thread_safe() {
        let worker = WorkerLoop::start().unwrap();
        let handle = worker.handle().clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let t = std::thread::spawn(move || {
            let tx2 = tx.clone();
            handle.spawn(async move {
                let _ = tx2.send("from another thread");
            });
        });
        t.join().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "from another thread");
        worker.stop();
    }

    #[test]
    fn tasks_interleave_cooperatively() {
        let worker = WorkerLoop::start().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..4u32 {
            let tx = tx.clone();
            worker.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = tx.send(i);
            });
        }
        drop(tx);
        let start = Instant::now();
        let mut got: Vec<u32> = Vec::new();
        while let Ok(v) = rx.recv_timeout(Duration::from_secs(2)) {
            got.push(v);
            if got.len() == 4 {
                break;
            }
        }
        assert_eq!(got.len(), 4);
        // Sleeps overlap on the single loop; four 20 ms waits finish in far
        // less than 80 ms of wall time.
        assert!(start.elapsed() < Duration::from_millis(70));
        worker.stop();
    }

    #[test]
    fn drop_without_stop_does_not_hang() {
        let worker = WorkerLoop::start().unwrap();
        drop(worker);
    }
}
