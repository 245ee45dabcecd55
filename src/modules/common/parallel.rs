// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::{future::Future, sync::Arc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    modules::error::{code::ErrorCode, SyncError, SyncResult},
    raise_error,
};

/// Maps `f` over `iter` with at most `concurrency` futures in flight.
///
/// Results come back in input order. The first error (or cancellation of `token`)
/// stops further spawning, aborts in-flight tasks and is returned.
pub async fn run_with_limit<I, Item, Fut, F, O>(
    token: &CancellationToken,
    concurrency: usize,
    iter: I,
    f: F,
) -> SyncResult<Vec<O>>
where
    I: IntoIterator<Item = Item>,
    Item: Send + 'static,
    Fut: Future<Output = SyncResult<O>> + Send + 'static,
    F: Fn(Item) -> Fut + Send + Sync + 'static,
    O: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let f = Arc::new(f);
    let mut handles = Vec::new();

    for item in iter {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                abort_all(&handles);
                return Err(SyncError::cancelled());
            }
            permit = sem.clone().acquire_owned() => permit.map_err(|e| {
                raise_error!(
                    format!("Failed to acquire semaphore: {e}"),
                    ErrorCode::InternalError
                )
            })?,
        };
        let f = f.clone();
        let token = token.clone();

        handles.push(tokio::spawn(async move {
            let res = tokio::select! {
                biased;
                _ = token.cancelled() => Err(SyncError::cancelled()),
                res = f(item) => res,
            };
            drop(permit);
            res
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for idx in 0..handles.len() {
        let res = match (&mut handles[idx]).await {
            Ok(res) => res,
            Err(e) => Err(raise_error!(
                format!("Task panicked or was cancelled: {e}"),
                ErrorCode::InternalError
            )),
        };
        match res {
            Ok(value) => results.push(value),
            Err(e) => {
                abort_all(&handles[idx + 1..]);
                return Err(e);
            }
        }
    }

    Ok(results)
}

fn abort_all<T>(handles: &[tokio::task::JoinHandle<T>]) {
    for handle in handles {
        handle.abort();
    }
}
