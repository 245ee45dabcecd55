// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::modules::error::{SyncError, SyncResult};

enum WaiterEvent {
    Created,
    Finished(Option<SyncError>),
}

/// Counts the outstanding tasks of one job and yields a single aggregate result.
///
/// The counter lives in a coordinator task; every [`WaiterTask`] reports into it
/// through an unbounded channel, so reports sent by one task are observed in the
/// order they were made. The count starts at one for the task returned by
/// [`JobWaiter::spawn`]. When it drops to zero the first reported error (or
/// success) is sent on the one-shot receiver and the coordinator exits.
///
/// If every task handle is dropped without reporting, the job resolves with the
/// first error seen so far or a cancellation error.
pub struct JobWaiter {
    rx: mpsc::UnboundedReceiver<WaiterEvent>,
    done: oneshot::Sender<SyncResult<()>>,
    remaining: usize,
    first_error: Option<SyncError>,
}

impl JobWaiter {
    /// Starts the coordinator and returns the handle of the initial task.
    pub fn spawn() -> (WaiterTask, oneshot::Receiver<SyncResult<()>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let waiter = JobWaiter {
            rx,
            done,
            remaining: 1,
            first_error: None,
        };
        tokio::spawn(waiter.run());
        (WaiterTask { tx }, done_rx)
    }

    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                WaiterEvent::Created => self.remaining += 1,
                WaiterEvent::Finished(err) => {
                    self.remaining = self.remaining.saturating_sub(1);
                    if self.first_error.is_none() {
                        self.first_error = err;
                    }
                    if self.remaining == 0 {
                        break;
                    }
                }
            }
        }

        let result = if self.remaining == 0 {
            self.first_error.map_or(Ok(()), Err)
        } else {
            debug!(
                "Job waiter lost {} unreported task(s), resolving job as cancelled",
                self.remaining
            );
            Err(self.first_error.unwrap_or_else(SyncError::cancelled))
        };
        let _ = self.done.send(result);
    }
}

/// One outstanding unit of work of a job. Must be finished exactly once;
/// finishing consumes the handle.
pub struct WaiterTask {
    tx: mpsc::UnboundedSender<WaiterEvent>,
}

impl WaiterTask {
    /// Registers a new task with the waiter before returning its handle.
    pub fn new_task(&self) -> WaiterTask {
        let _ = self.tx.send(WaiterEvent::Created);
        WaiterTask {
            tx: self.tx.clone(),
        }
    }

    pub fn finish(self, err: Option<SyncError>) {
        let _ = self.tx.send(WaiterEvent::Finished(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::error::code::ErrorCode;
    use crate::raise_error;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_after_every_task_finishes() {
        let (parent, mut done) = JobWaiter::spawn();
        let children: Vec<_> = (0..5).map(|_| parent.new_task()).collect();
        parent.finish(None);

        for child in children {
            assert!(done.try_recv().is_err());
            child.finish(None);
        }
        let result = tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn keeps_only_the_first_error() {
        let (parent, done) = JobWaiter::spawn();
        let first = parent.new_task();
        let second = parent.new_task();
        first.finish(Some(raise_error!(
            "apply failed".into(),
            ErrorCode::UpdateApplierFailed
        )));
        second.finish(Some(SyncError::cancelled()));
        parent.finish(Some(SyncError::cancelled()));

        let err = done.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UpdateApplierFailed);
    }

    #[tokio::test]
    async fn child_created_from_child_keeps_job_open() {
        let (parent, mut done) = JobWaiter::spawn();
        let child = parent.new_task();
        parent.finish(None);
        let grandchild = child.new_task();
        child.finish(None);
        tokio::task::yield_now().await;
        assert!(done.try_recv().is_err());
        grandchild.finish(None);
        assert!(done.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_tasks_resolve_as_cancelled() {
        let (parent, done) = JobWaiter::spawn();
        let child = parent.new_task();
        parent.finish(None);
        drop(child);
        assert!(done.await.unwrap().unwrap_err().is_cancelled());
    }
}
