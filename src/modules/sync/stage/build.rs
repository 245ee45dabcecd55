// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    modules::{
        common::parallel::run_with_limit,
        error::{code::ErrorCode, SyncError, SyncResult},
        metrics::{BUILD_FAILED, NO_UNLOCKED_KEYRING},
        sync::{
            api::{BuildResult, FullMessage, LabelMap, MessageBuilder, UnlockedKeyrings},
            channel::{StageConsumer, StageProducer},
            job::ChildJob,
            stage::{ApplyRequest, BuildRequest},
        },
    },
    raise_error,
};

/// Splits `batch` into consecutive chunks whose build memory stays within
/// `max_build_mem`. A message that alone exceeds the budget gets a chunk of its own.
pub fn chunk_by_build_memory(batch: Vec<FullMessage>, max_build_mem: u64) -> Vec<Vec<FullMessage>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_mem = 0u64;

    for message in batch {
        let mem = message.build_memory();
        if !current.is_empty() && current_mem + mem > max_build_mem {
            chunks.push(std::mem::take(&mut current));
            current_mem = 0;
        }
        current_mem += mem;
        current.push(message);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

enum BuildOutcome {
    Built(BuildResult),
    Failed { message_id: String, reason: &'static str },
}

fn build_one(
    builder: &dyn MessageBuilder,
    labels: &LabelMap,
    keyrings: &UnlockedKeyrings,
    message: FullMessage,
) -> BuildOutcome {
    let Some(keyring) = keyrings.get(message.address_id()) else {
        return BuildOutcome::Failed {
            message_id: message.id().to_string(),
            reason: NO_UNLOCKED_KEYRING,
        };
    };
    match builder.build_message(labels, &message, keyring.as_ref()) {
        Ok(result) => BuildOutcome::Built(result),
        Err(err) => {
            debug!("Build of message {} failed: {}", message.id(), err);
            BuildOutcome::Failed {
                message_id: message.id().to_string(),
                reason: BUILD_FAILED,
            }
        }
    }
}

/// Turns downloaded messages into literals on the blocking pool, one chunk per
/// memory budget, with as many builds in flight as there are CPU cores.
pub struct BuildStage {
    input: StageConsumer<BuildRequest>,
    output: StageProducer<ApplyRequest>,
    max_build_mem: u64,
    max_parallel_builds: usize,
}

impl BuildStage {
    pub fn new(
        input: StageConsumer<BuildRequest>,
        output: StageProducer<ApplyRequest>,
        max_build_mem: u64,
    ) -> Self {
        Self {
            input,
            output,
            max_build_mem,
            max_parallel_builds: num_cpus::get(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let request = match self.input.consume(&token).await {
                Ok(request) => request,
                Err(err) => {
                    if err.code() != ErrorCode::NoMoreInput && !err.is_cancelled() {
                        error!("Build stage stopped: {}", err);
                    }
                    break;
                }
            };

            let BuildRequest { child, batch } = request;
            let Some(child) = child.check_cancelled() else {
                continue;
            };

            let open = if batch.is_empty() {
                child.on_stage_completed();
                self.produce(&token, child, Vec::new()).await
            } else {
                self.build_batch(&token, child, batch).await
            };
            if !open {
                break;
            }
        }

        for request in self.input.close_and_drain() {
            request.child.on_error(SyncError::cancelled());
        }
        debug!("Build stage exited");
    }

    /// Returns `false` once the apply stage no longer accepts requests.
    async fn produce(
        &self,
        token: &CancellationToken,
        child: ChildJob,
        messages: Vec<BuildResult>,
    ) -> bool {
        match self.output.produce(token, ApplyRequest { child, messages }).await {
            Ok(()) => true,
            Err(err) => {
                debug!("Build stage output closed: {}", err);
                false
            }
        }
    }

    async fn build_batch(
        &self,
        token: &CancellationToken,
        mut child: ChildJob,
        batch: Vec<FullMessage>,
    ) -> bool {
        let keyrings = match self.unlock_keyrings(&child).await {
            Ok(keyrings) => Arc::new(keyrings),
            Err(err) => {
                child.on_error(err);
                return true;
            }
        };

        let mut chunks = chunk_by_build_memory(batch, self.max_build_mem);
        let Some(last_chunk) = chunks.pop() else {
            child.on_stage_completed();
            return self.produce(token, child, Vec::new()).await;
        };

        // Every chunk but the last becomes a sibling batch; the incoming batch
        // keeps the last chunk, its cursor and whatever count is left over.
        let mut remaining = child.message_count();
        let mut work = Vec::with_capacity(chunks.len() + 1);
        for chunk in chunks {
            let last_id = chunk.last().map(|m| m.id().to_string()).unwrap_or_default();
            let count = chunk.len() as i64;
            remaining -= count;
            work.push((child.new_child_job(last_id, count), chunk));
        }
        child.set_message_count(remaining);
        work.push((child, last_chunk));

        for (mut chunk_child, chunk) in work {
            chunk_child.set_cached_from(&chunk);
            let Some(chunk_child) = chunk_child.check_cancelled() else {
                continue;
            };
            match self.build_chunk(&chunk_child, keyrings.clone(), chunk).await {
                Ok(messages) => {
                    chunk_child.on_stage_completed();
                    if !self.produce(token, chunk_child, messages).await {
                        return false;
                    }
                }
                Err(err) => chunk_child.on_error(err),
            }
        }
        true
    }

    async fn unlock_keyrings(&self, child: &ChildJob) -> SyncResult<UnlockedKeyrings> {
        let builder = child.job().ctx().message_builder.clone();
        tokio::task::spawn_blocking(move || builder.unlock_keyrings())
            .await
            .map_err(|e| {
                raise_error!(
                    format!("Keyring unlock task failed: {e}"),
                    ErrorCode::InternalError
                )
            })?
    }

    async fn build_chunk(
        &self,
        child: &ChildJob,
        keyrings: Arc<UnlockedKeyrings>,
        chunk: Vec<FullMessage>,
    ) -> SyncResult<Vec<BuildResult>> {
        let job = child.job();
        let ctx = job.ctx();
        let builder = ctx.message_builder.clone();
        let labels = ctx.labels.clone();

        let outcomes = run_with_limit(job.token(), self.max_parallel_builds, chunk, move |message| {
            let builder = builder.clone();
            let labels = labels.clone();
            let keyrings = keyrings.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    build_one(builder.as_ref(), &labels, &keyrings, message)
                })
                .await
                .map_err(|e| {
                    raise_error!(
                        format!("Message build task failed: {e}"),
                        ErrorCode::InternalError
                    )
                })
            }
        })
        .await?;

        let mut built = Vec::with_capacity(outcomes.len());
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                BuildOutcome::Built(result) => built.push(result),
                BuildOutcome::Failed { message_id, reason } => {
                    ctx.failure_reporter.report_build_failure(&message_id, reason);
                    failed.push(message_id);
                }
            }
        }
        let succeeded: Vec<String> = built.iter().map(|r| r.message_id.clone()).collect();
        job.update_failed_messages(&failed, &succeeded)
            .await
            .map_err(|e| {
                raise_error!(
                    format!("Failed to update failed message set: {e}"),
                    ErrorCode::StateProviderFailed
                )
            })?;
        Ok(built)
    }
}
