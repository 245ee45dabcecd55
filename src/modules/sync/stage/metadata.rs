// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::{collections::VecDeque, sync::Arc};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::modules::{
    error::{code::ErrorCode, SyncError, SyncResult},
    sync::{
        api::{MessageFilter, MessageMetadata},
        channel::{StageConsumer, StageProducer},
        job::{Job, ParentJob},
        ratelimit::ApiClientRetryWrapper,
        stage::DownloadRequest,
    },
};

#[derive(Clone, Copy, Debug)]
pub struct MetadataConfig {
    /// Batches are cut once their declared sizes add up to this.
    pub max_download_mem: u64,
    pub max_messages: usize,
    pub page_size: u32,
}

/// Pages through the account's message metadata, newest first, and cuts it into
/// download batches. Every job is paged in its own task so a slow job never
/// holds back a newer one.
pub struct MetadataStage {
    input: StageConsumer<Arc<Job>>,
    output: StageProducer<DownloadRequest>,
    config: MetadataConfig,
}

impl MetadataStage {
    pub fn new(
        input: StageConsumer<Arc<Job>>,
        output: StageProducer<DownloadRequest>,
        config: MetadataConfig,
    ) -> Self {
        Self {
            input,
            output,
            config,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                job = self.input.consume(&token) => match job {
                    Ok(job) => {
                        let Some(parent) = job.begin() else {
                            warn!("Job for account {} submitted twice, ignoring", job.account_id());
                            continue;
                        };
                        tasks.spawn(page_job(parent, self.output.clone(), self.config));
                    }
                    Err(err) => {
                        if err.code() != ErrorCode::NoMoreInput && !err.is_cancelled() {
                            error!("Metadata stage stopped: {}", err);
                        }
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Metadata task panicked: {}", e);
                    }
                }
            }
        }

        for job in self.input.close_and_drain() {
            if let Some(parent) = job.begin() {
                parent.on_error(SyncError::cancelled());
            }
        }
        if token.is_cancelled() {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
        debug!("Metadata stage exited");
    }
}

async fn page_job(
    parent: ParentJob,
    output: StageProducer<DownloadRequest>,
    config: MetadataConfig,
) {
    let job = parent.job().clone();
    let token = job.token().clone();
    let client = ApiClientRetryWrapper::new(job.ctx().client.as_ref(), &token, job.ctx().cool_down);
    let mut iterator = MetadataIterator::new(&job.progress().last_synced_message_id, config);

    let mut parent = parent;
    loop {
        parent = match parent.check_cancelled() {
            Some(parent) => parent,
            None => return,
        };

        let batch = match iterator.next(&client).await {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(err) => {
                parent.on_error(err);
                return;
            }
        };

        parent = match parent.check_cancelled() {
            Some(parent) => parent,
            None => return,
        };

        let count = batch.ids.len() as i64;
        debug!(
            "Account {}: download batch of {} message(s) ending at {} (more: {})",
            job.account_id(),
            count,
            batch.last_message_id,
            batch.has_more
        );
        let child = parent.new_child_job(batch.last_message_id, count);
        if let Err(err) = output
            .produce(
                &token,
                DownloadRequest {
                    child,
                    ids: batch.ids,
                },
            )
            .await
        {
            parent.on_error(err);
            return;
        }
        parent.on_stage_completed(count);
    }

    info!(
        "Account {}: metadata exhausted after {} page(s)",
        job.account_id(),
        iterator.pages
    );
    parent.end();
}

/// One download batch cut from the metadata stream.
#[derive(Debug, PartialEq, Eq)]
pub struct MetadataBatch {
    pub ids: Vec<String>,
    pub last_message_id: String,
    pub has_more: bool,
}

/// Cursor-driven metadata pager. The remote includes the cursor row in the page
/// that follows it; that row is skipped so no message is emitted twice.
pub struct MetadataIterator {
    cursor: Option<String>,
    buffer: VecDeque<MessageMetadata>,
    exhausted: bool,
    pages: usize,
    config: MetadataConfig,
}

impl MetadataIterator {
    /// An empty `last_synced_message_id` starts from the newest message.
    pub fn new(last_synced_message_id: &str, config: MetadataConfig) -> Self {
        Self {
            cursor: (!last_synced_message_id.is_empty())
                .then(|| last_synced_message_id.to_string()),
            buffer: VecDeque::new(),
            exhausted: false,
            pages: 0,
            config,
        }
    }

    /// Returns the next batch, or `None` once the remote has nothing left.
    pub async fn next(
        &mut self,
        client: &ApiClientRetryWrapper<'_>,
    ) -> SyncResult<Option<MetadataBatch>> {
        let mut ids = Vec::new();
        let mut size = 0u64;

        loop {
            if self.buffer.is_empty() {
                if self.exhausted {
                    break;
                }
                self.fetch_page(client).await?;
                if self.buffer.is_empty() {
                    break;
                }
            }

            while let Some(meta) = self.buffer.pop_front() {
                size += meta.size;
                ids.push(meta.id);
                if size >= self.config.max_download_mem || ids.len() >= self.config.max_messages {
                    return Ok(Self::batch(ids, true));
                }
            }
        }

        Ok(Self::batch(ids, false))
    }

    fn batch(ids: Vec<String>, has_more: bool) -> Option<MetadataBatch> {
        let last_message_id = ids.last()?.clone();
        Some(MetadataBatch {
            ids,
            last_message_id,
            has_more,
        })
    }

    async fn fetch_page(&mut self, client: &ApiClientRetryWrapper<'_>) -> SyncResult<()> {
        let filter = MessageFilter {
            end_id: self.cursor.clone(),
            desc: true,
        };
        let mut page = client
            .get_message_metadata_page(0, self.config.page_size, &filter)
            .await?;
        self.pages += 1;

        if let (Some(first), Some(cursor)) = (page.first(), self.cursor.as_deref()) {
            if first.id == cursor {
                page.remove(0);
            }
        }

        match page.last() {
            Some(last) => self.cursor = Some(last.id.clone()),
            None => self.exhausted = true,
        }
        self.buffer.extend(page);
        Ok(())
    }
}
