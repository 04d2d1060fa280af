//! Background cleanup on a fixed interval.
//!
//! A dedicated thread waits on a `crossbeam_channel::tick` and a shutdown
//! channel. Each pass's report is offered to subscribers without blocking:
//! a subscriber whose buffer is full misses that report, and one whose
//! receiver is gone is dropped.

use crate::engine::SessionEngine;
use crate::error::Result;
use crate::types::CleanupReport;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Subscribers = Arc<RwLock<Vec<Sender<CleanupReport>>>>;

/// Runs `SessionEngine::run_cleanup` every `cleanup_interval_ms`.
pub struct CleanupScheduler {
    engine: Arc<SessionEngine>,
    subscribers: Subscribers,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupScheduler {
    /// Create a stopped scheduler for `engine`.
    pub fn new(engine: Arc<SessionEngine>) -> Self {
        Self {
            engine,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            shutdown: None,
            handle: None,
        }
    }

    /// Receive every subsequent cleanup report, buffering up to `buffer_size`.
    pub fn subscribe(&self, buffer_size: usize) -> Receiver<CleanupReport> {
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.subscribers.write().push(sender);
        receiver
    }

    /// Spawn the cleanup thread. Starting a running scheduler is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let interval = Duration::from_millis(self.engine.config().cleanup_interval_ms);
        let run_on_start = self.engine.config().cleanup_on_start;
        let engine = Arc::clone(&self.engine);
        let subscribers = Arc::clone(&self.subscribers);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("session-cleanup".into())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "cleanup scheduler started");
                if run_on_start {
                    run_pass(&engine, &subscribers);
                }

                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => run_pass(&engine, &subscribers),
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::info!("cleanup scheduler stopped");
            })?;

        self.shutdown = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the cleanup thread and wait for an in-progress pass to finish.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel, which also wakes the thread.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("cleanup thread panicked");
            }
        }
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pass(engine: &SessionEngine, subscribers: &Subscribers) {
    let report = engine.run_cleanup();

    let mut subs = subscribers.write();
    subs.retain(|sender| match sender.try_send(report.clone()) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Disconnected(_)) => false,
    });
}
