//! Per-destination dispatch queue
//!
//! Alerts for one destination are delivered one at a time, in submission
//! order. Each task runs in its own spawned task so that an error or panic
//! is logged and the worker moves on to the next one.
//!
//! Created: 2026-10-05

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::WatchResult;
use crate::types::DestinationId;

pub type DispatchTask = Pin<Box<dyn Future<Output = WatchResult<()>> + Send + 'static>>;

pub trait DispatchQueue: Send + Sync {
    fn submit(&self, destination: &DestinationId, task: DispatchTask);
}

/// One worker per destination, created on first submit.
#[derive(Default)]
pub struct SerialDispatcher {
    workers: DashMap<DestinationId, mpsc::UnboundedSender<DispatchTask>>,
}

impl SerialDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_worker(destination: DestinationId) -> mpsc::UnboundedSender<DispatchTask> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchTask>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match tokio::spawn(task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Dispatch to {} failed: {}", destination, e),
                    Err(e) => warn!("Dispatch to {} aborted: {}", destination, e),
                }
            }
            debug!("Dispatch worker for {} stopped", destination);
        });
        tx
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl DispatchQueue for SerialDispatcher {
    fn submit(&self, destination: &DestinationId, task: DispatchTask) {
        let mut sender = self
            .workers
            .entry(destination.clone())
            .or_insert_with(|| Self::spawn_worker(destination.clone()));

        if let Err(mpsc::error::SendError(task)) = sender.send(task) {
            // Worker gone; replace it and hand over the task
            let fresh = Self::spawn_worker(destination.clone());
            let _ = fresh.send(task);
            *sender = fresh;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WatchError;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recording(log: &Arc<Mutex<Vec<String>>>, label: &str, delay_ms: u64) -> DispatchTask {
        let log = Arc::clone(log);
        let label = label.to_string();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(label);
            Ok(())
        })
    }

    async fn exploding() -> WatchResult<()> {
        panic!("boom")
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_order_per_destination() {
        let d = SerialDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let dest = DestinationId::new("-1");

        // Earlier tasks are slower; order must still hold
        d.submit(&dest, recording(&log, "a", 30));
        d.submit(&dest, recording(&log, "b", 10));
        d.submit(&dest, recording(&log, "c", 0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(d.worker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_panic_do_not_block_queue() {
        let d = SerialDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let dest = DestinationId::new("-1");

        d.submit(&dest, Box::pin(async { Err::<(), _>(WatchError::lookup("sink down")) }));
        d.submit(&dest, Box::pin(exploding()));
        d.submit(&dest, recording(&log, "after", 0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destinations_are_independent() {
        let d = SerialDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        d.submit(&DestinationId::new("-1"), recording(&log, "slow", 1_000));
        d.submit(&DestinationId::new("-2"), recording(&log, "fast", 0));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*log.lock().unwrap(), vec!["fast"]);
        assert_eq!(d.worker_count(), 2);
    }
}
