// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::modules::{
    error::{SyncError, SyncResult},
    sync::{
        api::{
            ApiClient, LabelMap, MessageBuilder, Reporter, StateProvider, UpdateApplier,
            ALL_MAIL_LABEL,
        },
        cache::DownloadCache,
        job::{FailureReporter, Job, JobContext, JobProgress, MetricsFailureReporter},
        ratelimit::{ApiClientRetryWrapper, CoolDownPolicy},
        service::Regulator,
    },
    utils::sleep_or_cancel,
};

/// Drives the sync of one account until it completes or is cancelled.
///
/// Progress lives in the account's [`Status`](crate::modules::sync::status::Status);
/// a failed attempt is retried from whatever was persisted, after a cool-down.
pub struct Handler {
    account_id: String,
    regulator: Arc<dyn Regulator>,
    client: Arc<dyn ApiClient>,
    state: Arc<dyn StateProvider>,
    cache: Arc<DownloadCache>,
    failure_reporter: Arc<dyn FailureReporter>,
    api_cool_down: CoolDownPolicy,
    token: CancellationToken,
    finished_tx: Mutex<Option<mpsc::UnboundedSender<SyncResult<()>>>>,
    finished_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncResult<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything one `execute` call syncs with.
#[derive(Clone)]
struct SyncRun {
    reporter: Arc<dyn Reporter>,
    labels: Arc<LabelMap>,
    update_applier: Arc<dyn UpdateApplier>,
    message_builder: Arc<dyn MessageBuilder>,
}

impl Handler {
    pub fn new(
        account_id: impl Into<String>,
        regulator: Arc<dyn Regulator>,
        client: Arc<dyn ApiClient>,
        state: Arc<dyn StateProvider>,
        api_cool_down: CoolDownPolicy,
    ) -> Arc<Self> {
        Self::with_failure_reporter(
            account_id,
            regulator,
            client,
            state,
            api_cool_down,
            Arc::new(MetricsFailureReporter),
        )
    }

    pub fn with_failure_reporter(
        account_id: impl Into<String>,
        regulator: Arc<dyn Regulator>,
        client: Arc<dyn ApiClient>,
        state: Arc<dyn StateProvider>,
        api_cool_down: CoolDownPolicy,
        failure_reporter: Arc<dyn FailureReporter>,
    ) -> Arc<Self> {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            account_id: account_id.into(),
            regulator,
            client,
            state,
            cache: Arc::new(DownloadCache::new()),
            failure_reporter,
            api_cool_down,
            token: CancellationToken::new(),
            finished_tx: Mutex::new(Some(finished_tx)),
            finished_rx: Mutex::new(Some(finished_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn download_cache(&self) -> &Arc<DownloadCache> {
        &self.cache
    }

    /// Receives one result per `execute` call. Can be taken once.
    pub fn on_sync_finished(&self) -> Option<mpsc::UnboundedReceiver<SyncResult<()>>> {
        self.finished_rx.lock().ok()?.take()
    }

    /// Starts syncing in the background; failed attempts retry after `cool_down`.
    /// Does nothing while an earlier sync of this handler is still running.
    pub fn execute(
        self: &Arc<Self>,
        reporter: Arc<dyn Reporter>,
        labels: LabelMap,
        update_applier: Arc<dyn UpdateApplier>,
        message_builder: Arc<dyn MessageBuilder>,
        cool_down: Duration,
    ) {
        info!("Sync triggered for account {}", self.account_id);
        let Some(finished_tx) = self
            .finished_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
        else {
            warn!("Sync handler for account {} is closed", self.account_id);
            return;
        };

        let Ok(mut tasks) = self.tasks.lock() else {
            error!("Sync handler for account {} is poisoned", self.account_id);
            return;
        };
        tasks.retain(|t| !t.is_finished());
        if !tasks.is_empty() {
            warn!("Sync already running for account {}", self.account_id);
            return;
        }

        let run = SyncRun {
            reporter,
            labels: Arc::new(labels),
            update_applier,
            message_builder,
        };
        let handler = self.clone();
        tasks.push(tokio::spawn(async move {
            let result = handler.sync_until_done(&run, cool_down).await;
            let _ = finished_tx.send(result);
        }));
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub async fn cancel_and_wait(&self) {
        self.cancel();
        let tasks = self
            .tasks
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                error!("Sync handler task for account {} failed: {}", self.account_id, e);
            }
        }
    }

    /// Cancels, waits, and closes the finished channel.
    pub async fn close(&self) {
        self.cancel_and_wait().await;
        if let Ok(mut tx) = self.finished_tx.lock() {
            tx.take();
        }
    }

    async fn sync_until_done(&self, run: &SyncRun, cool_down: Duration) -> SyncResult<()> {
        loop {
            if self.token.is_cancelled() {
                return Err(SyncError::cancelled());
            }
            match self.run_once(run).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    error!(
                        "Failed to sync account {}, will retry in {}s: {}",
                        self.account_id,
                        cool_down.as_secs(),
                        err
                    );
                    if !sleep_or_cancel(&self.token, cool_down).await {
                        return Err(SyncError::cancelled());
                    }
                }
            }
        }
    }

    async fn run_once(&self, run: &SyncRun) -> SyncResult<()> {
        run.reporter.on_start();
        let result = self.sync(run).await;
        run.reporter.on_finished();
        if let Err(err) = &result {
            run.reporter.on_error(err);
        }
        result
    }

    async fn sync(&self, run: &SyncRun) -> SyncResult<()> {
        let mut status = self.state.get_sync_status().await?;
        if status.is_complete() {
            info!(
                "Sync already complete for account {}, updating system labels only",
                self.account_id
            );
            return run.update_applier.sync_system_labels_only(&run.labels).await;
        }

        if !status.has_labels {
            run.update_applier.sync_labels(&run.labels).await?;
            self.state.set_has_labels(true).await?;
            info!("Synced {} label(s) for account {}", run.labels.len(), self.account_id);
        }

        if !status.has_message_count {
            let client =
                ApiClientRetryWrapper::new(self.client.as_ref(), &self.token, self.api_cool_down);
            let total = client
                .get_grouped_message_count()
                .await?
                .into_iter()
                .find(|group| group.label_id == ALL_MAIL_LABEL)
                .map(|group| group.total)
                .unwrap_or_default();
            self.state.set_message_count(total).await?;
            status.total_message_count = total;
            info!("Account {} has {} message(s) to sync", self.account_id, total);
        }

        if !status.has_messages {
            let job = Job::new(
                &self.token,
                JobContext {
                    account_id: self.account_id.clone(),
                    client: self.client.clone(),
                    labels: run.labels.clone(),
                    message_builder: run.message_builder.clone(),
                    update_applier: run.update_applier.clone(),
                    reporter: run.reporter.clone(),
                    state: self.state.clone(),
                    cache: self.cache.clone(),
                    failure_reporter: self.failure_reporter.clone(),
                    cool_down: self.api_cool_down,
                },
                JobProgress {
                    last_synced_message_id: status.last_synced_message_id.clone(),
                    num_synced_messages: status.num_synced_messages,
                    total_message_count: status.total_message_count,
                },
            );

            let result = match self.regulator.sync(&self.token, job.clone()).await {
                Ok(()) => {
                    tokio::select! {
                        result = job.wait_and_close() => result,
                        _ = self.token.cancelled() => Err(SyncError::cancelled()),
                    }
                }
                Err(err) => Err(err),
            };
            job.close();
            result?;

            self.state.set_has_messages(true).await?;
            self.cache.clear();
            info!("Finished syncing messages for account {}", self.account_id);
        }
        Ok(())
    }
}
