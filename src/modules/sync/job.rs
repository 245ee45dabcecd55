// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::{Arc, Mutex};

use ahash::AHashSet;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    modules::{
        error::{code::ErrorCode, SyncError, SyncResult},
        metrics::MAILBRIDGE_SYNC_MESSAGE_BUILD_FAILURES_TOTAL,
        sync::{
            api::{
                ApiClient, FullMessage, LabelMap, MessageBuilder, Reporter, StateProvider,
                UpdateApplier,
            },
            cache::DownloadCache,
            ratelimit::CoolDownPolicy,
            waiter::{JobWaiter, WaiterTask},
        },
    },
    raise_error,
};

/// Every message passes through metadata, download, build and apply; each stage
/// advances progress by the message count of the batch.
pub const NUM_SYNC_STAGES: i64 = 4;

/// Receives messages that could not be built.
pub trait FailureReporter: Send + Sync {
    fn report_build_failure(&self, message_id: &str, reason: &str);
}

/// Counts build failures by reason in prometheus and logs them.
#[derive(Debug, Default)]
pub struct MetricsFailureReporter;

impl FailureReporter for MetricsFailureReporter {
    fn report_build_failure(&self, message_id: &str, reason: &str) {
        MAILBRIDGE_SYNC_MESSAGE_BUILD_FAILURES_TOTAL
            .with_label_values(&[reason])
            .inc();
        warn!("Failed to build message {}: {}", message_id, reason);
    }
}

/// Collaborators shared by every batch of a job.
#[derive(Clone)]
pub struct JobContext {
    pub account_id: String,
    pub client: Arc<dyn ApiClient>,
    pub labels: Arc<LabelMap>,
    pub message_builder: Arc<dyn MessageBuilder>,
    pub update_applier: Arc<dyn UpdateApplier>,
    pub reporter: Arc<dyn Reporter>,
    pub state: Arc<dyn StateProvider>,
    pub cache: Arc<DownloadCache>,
    pub failure_reporter: Arc<dyn FailureReporter>,
    pub cool_down: CoolDownPolicy,
}

/// Where a job resumes from, as persisted in the account's sync status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub last_synced_message_id: String,
    pub num_synced_messages: i64,
    pub total_message_count: i64,
}

/// One attempt at syncing the messages of an account.
pub struct Job {
    ctx: JobContext,
    progress: JobProgress,
    token: CancellationToken,
    parent: Mutex<Option<WaiterTask>>,
    result: Mutex<Option<oneshot::Receiver<SyncResult<()>>>>,
}

impl Job {
    /// The job's token is a child of `token`: cancelling the caller cancels the job.
    pub fn new(token: &CancellationToken, ctx: JobContext, progress: JobProgress) -> Arc<Self> {
        let (parent, result) = JobWaiter::spawn();
        Arc::new(Self {
            ctx,
            progress,
            token: token.child_token(),
            parent: Mutex::new(Some(parent)),
            result: Mutex::new(Some(result)),
        })
    }

    pub fn ctx(&self) -> &JobContext {
        &self.ctx
    }

    pub fn progress(&self) -> &JobProgress {
        &self.progress
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn account_id(&self) -> &str {
        &self.ctx.account_id
    }

    /// Starts the parent task and seeds the progress counter. Returns `None`
    /// if the job was already started.
    pub fn begin(self: &Arc<Self>) -> Option<ParentJob> {
        let task = self.parent.lock().ok()?.take()?;
        info!(
            "Job started for account {}, resuming after '{}' ({}/{} messages)",
            self.ctx.account_id,
            self.progress.last_synced_message_id,
            self.progress.num_synced_messages,
            self.progress.total_message_count
        );
        self.ctx.reporter.initialize_progress_counter(
            self.progress.num_synced_messages * NUM_SYNC_STAGES,
            self.progress.total_message_count * NUM_SYNC_STAGES,
        );
        Some(ParentJob {
            job: self.clone(),
            task,
        })
    }

    /// Waits for the aggregate result, then cancels whatever may still hold the
    /// job's token.
    pub async fn wait_and_close(&self) -> SyncResult<()> {
        let receiver = self.result.lock().ok().and_then(|mut guard| guard.take());
        let result = match receiver {
            Some(receiver) => receiver.await.unwrap_or_else(|_| {
                Err(raise_error!(
                    "job waiter stopped without a result".into(),
                    ErrorCode::InternalError
                ))
            }),
            None => Err(raise_error!(
                "job result already consumed".into(),
                ErrorCode::InternalError
            )),
        };
        self.close();
        result
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn new_child_job(
        self: &Arc<Self>,
        task: &WaiterTask,
        last_message_id: String,
        message_count: i64,
    ) -> ChildJob {
        ChildJob {
            job: self.clone(),
            task: task.new_task(),
            last_message_id,
            message_count,
            cached_message_ids: Vec::new(),
            cached_attachment_ids: Vec::new(),
        }
    }

    fn on_error(&self, task: WaiterTask, err: SyncError) {
        if err.is_cancelled() {
            task.finish(Some(err));
            return;
        }
        error!("Sync job for account {} failed: {}", self.ctx.account_id, err);
        task.finish(Some(err));
        self.token.cancel();
    }

    fn on_stage_completed(&self, count: i64) {
        self.ctx.reporter.on_progress(count);
    }

    /// Records messages that could not be built and drops them from the failed
    /// set once they build again.
    pub(crate) async fn update_failed_messages(
        &self,
        failed: &[String],
        succeeded: &[String],
    ) -> SyncResult<()> {
        if !failed.is_empty() {
            self.ctx.state.add_failed_message_ids(failed).await?;
        }
        if !succeeded.is_empty() {
            self.ctx.state.remove_failed_message_ids(succeeded).await?;
        }
        Ok(())
    }
}

/// The metadata-paging task of a job. Produces the job's child jobs; `end` marks
/// that no more will follow.
pub struct ParentJob {
    job: Arc<Job>,
    task: WaiterTask,
}

impl ParentJob {
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn new_child_job(&self, last_message_id: String, message_count: i64) -> ChildJob {
        self.job
            .new_child_job(&self.task, last_message_id, message_count)
    }

    /// Counts `count` messages as discovered.
    pub fn on_stage_completed(&self, count: i64) {
        self.job.on_stage_completed(count);
    }

    /// Reports cancellation and returns `None` if the job is cancelled.
    pub fn check_cancelled(self) -> Option<Self> {
        if self.job.is_cancelled() {
            self.task.finish(Some(SyncError::cancelled()));
            return None;
        }
        Some(self)
    }

    pub fn on_error(self, err: SyncError) {
        self.job.on_error(self.task, err);
    }

    pub fn end(self) {
        info!("Job for account {} produced all batches", self.job.account_id());
        self.task.finish(None);
    }
}

/// One batch of a job moving through the download, build and apply stages.
pub struct ChildJob {
    job: Arc<Job>,
    task: WaiterTask,
    last_message_id: String,
    message_count: i64,
    cached_message_ids: Vec<String>,
    cached_attachment_ids: Vec<String>,
}

impl ChildJob {
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn last_message_id(&self) -> &str {
        &self.last_message_id
    }

    pub fn message_count(&self) -> i64 {
        self.message_count
    }

    pub fn cached_message_ids(&self) -> &[String] {
        &self.cached_message_ids
    }

    pub fn cached_attachment_ids(&self) -> &[String] {
        &self.cached_attachment_ids
    }

    /// Spawns a sibling batch belonging to the same job.
    pub fn new_child_job(&self, last_message_id: String, message_count: i64) -> ChildJob {
        self.job
            .new_child_job(&self.task, last_message_id, message_count)
    }

    pub fn set_message_count(&mut self, message_count: i64) {
        self.message_count = message_count;
    }

    pub fn set_cached_ids(&mut self, message_ids: Vec<String>, attachment_ids: Vec<String>) {
        self.cached_message_ids = message_ids;
        self.cached_attachment_ids = attachment_ids;
    }

    /// Records the cache entries owned by `messages`.
    pub fn set_cached_from(&mut self, messages: &[FullMessage]) {
        let mut attachment_ids = AHashSet::new();
        let message_ids = messages.iter().map(|m| m.id().to_string()).collect();
        for message in messages {
            for attachment in &message.message.attachments {
                attachment_ids.insert(attachment.id.clone());
            }
        }
        self.set_cached_ids(message_ids, attachment_ids.into_iter().collect());
    }

    /// Reports cancellation and returns `None` if the job is cancelled.
    pub fn check_cancelled(self) -> Option<Self> {
        if self.job.is_cancelled() {
            self.task.finish(Some(SyncError::cancelled()));
            return None;
        }
        Some(self)
    }

    pub fn on_error(self, err: SyncError) {
        self.job.on_error(self.task, err);
    }

    pub fn on_stage_completed(&self) {
        self.job.on_stage_completed(self.message_count);
    }

    /// Persists the batch cursor, evicts its cache entries and completes the
    /// final stage.
    pub async fn on_finished(self) {
        if !self.last_message_id.is_empty() {
            let persisted = self
                .job
                .ctx
                .state
                .set_last_message_id(&self.last_message_id, self.message_count)
                .await;
            if let Err(err) = persisted {
                let err = raise_error!(
                    format!("Failed to persist sync cursor: {err}"),
                    ErrorCode::StateProviderFailed
                );
                self.on_error(err);
                return;
            }
        }
        let cache = &self.job.ctx.cache;
        cache.delete_messages(&self.cached_message_ids);
        cache.delete_attachments(&self.cached_attachment_ids);
        self.job.on_stage_completed(self.message_count);
        self.task.finish(None);
    }
}
