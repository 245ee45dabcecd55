// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    modules::error::{code::ErrorCode, SyncError, SyncResult},
    raise_error,
};

/// Creates a bounded hand-off between two adjacent pipeline stages.
pub fn stage_channel<T: Send>(capacity: usize) -> (StageProducer<T>, StageConsumer<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StageProducer { tx }, StageConsumer { rx })
}

fn no_more_input() -> SyncError {
    raise_error!("stage input closed".into(), ErrorCode::NoMoreInput)
}

pub struct StageProducer<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for StageProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send> StageProducer<T> {
    /// Waits for room in the channel. Fails with `Cancelled` if `token` fires
    /// first, or `NoMoreInput` once the consumer is gone.
    pub async fn produce(&self, token: &CancellationToken, item: T) -> SyncResult<()> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::cancelled()),
            res = self.tx.send(item) => res.map_err(|_| no_more_input()),
        }
    }

    /// Closes this end. The consumer drains queued items once every producer is closed.
    pub fn close(self) {}
}

pub struct StageConsumer<T> {
    rx: mpsc::Receiver<T>,
}

impl<T: Send> StageConsumer<T> {
    /// Fails with `Cancelled` if `token` fires first, or `NoMoreInput` once all
    /// producers are closed and the queue is drained.
    pub async fn consume(&mut self, token: &CancellationToken) -> SyncResult<T> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::cancelled()),
            item = self.rx.recv() => item.ok_or_else(no_more_input),
        }
    }

    /// Stops accepting new items and hands back whatever was still queued.
    pub fn close_and_drain(&mut self) -> Vec<T> {
        self.rx.close();
        let mut queued = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            queued.push(item);
        }
        queued
    }
}
