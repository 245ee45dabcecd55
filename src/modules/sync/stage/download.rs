// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::modules::{
    common::parallel::run_with_limit,
    error::{code::ErrorCode, SyncError, SyncResult},
    metrics::{MAILBRIDGE_SYNC_DOWNLOAD_PARALLELISM, MAILBRIDGE_SYNC_MESSAGES_SKIPPED_TOTAL},
    sync::{
        api::{ApiClient, FullMessage, Message},
        cache::DownloadCache,
        channel::{StageConsumer, StageProducer},
        job::ChildJob,
        ratelimit::{ApiClientRetryWrapper, CoolDownPolicy},
        stage::{BuildRequest, DownloadRequest},
    },
};

/// Picks the parallelism of the next download chunk.
pub trait DownloadRateModifier: Send + Sync {
    fn apply(&self, was_success: bool, current: usize, max: usize) -> usize;
}

/// Halves parallelism (never below 2) after a chunk that hit throttling or
/// server errors, otherwise doubles it up to `max`.
#[derive(Debug, Default)]
pub struct DefaultDownloadRateModifier;

impl DownloadRateModifier for DefaultDownloadRateModifier {
    fn apply(&self, was_success: bool, current: usize, max: usize) -> usize {
        if !was_success {
            (current / 2).max(2).min(max.max(1))
        } else {
            current.saturating_mul(2).min(max).max(1)
        }
    }
}

/// Runs `f` over `data` in chunks of `max_parallel` items, letting `modifier`
/// choose the parallelism of each chunk from how the previous one went.
///
/// `f` receives a counter that the API wrapper bumps on every throttled or
/// failed-server response. Results keep the order of `data`.
pub async fn auto_download_rate<T, O, F, Fut>(
    token: &CancellationToken,
    modifier: &dyn DownloadRateModifier,
    max_parallel: usize,
    data: Vec<T>,
    f: F,
) -> SyncResult<Vec<O>>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(T, Arc<AtomicU32>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<O>> + Send + 'static,
{
    let max_parallel = max_parallel.max(1);
    let counter = Arc::new(AtomicU32::new(0));
    let mut parallel = max_parallel;
    let mut results = Vec::with_capacity(data.len());
    let mut data = data.into_iter().peekable();

    while data.peek().is_some() {
        let chunk: Vec<T> = data.by_ref().take(max_parallel).collect();
        let was_success = counter.swap(0, Ordering::SeqCst) == 0;
        parallel = modifier.apply(was_success, parallel, max_parallel);
        MAILBRIDGE_SYNC_DOWNLOAD_PARALLELISM.set(parallel as i64);

        let f = f.clone();
        let chunk_counter = counter.clone();
        let out = run_with_limit(token, parallel, chunk, move |item| {
            f(item, chunk_counter.clone())
        })
        .await?;
        results.extend(out);
    }
    Ok(results)
}

/// Fetches message bodies and attachments for each batch, reusing whatever a
/// previous attempt already cached.
pub struct DownloadStage {
    input: StageConsumer<DownloadRequest>,
    output: StageProducer<BuildRequest>,
    max_parallel_downloads: usize,
    rate_modifier: Arc<dyn DownloadRateModifier>,
}

impl DownloadStage {
    pub fn new(
        input: StageConsumer<DownloadRequest>,
        output: StageProducer<BuildRequest>,
        max_parallel_downloads: usize,
        rate_modifier: Arc<dyn DownloadRateModifier>,
    ) -> Self {
        Self {
            input,
            output,
            max_parallel_downloads,
            rate_modifier,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let request = match self.input.consume(&token).await {
                Ok(request) => request,
                Err(err) => {
                    if err.code() != ErrorCode::NoMoreInput && !err.is_cancelled() {
                        error!("Download stage stopped: {}", err);
                    }
                    break;
                }
            };

            let DownloadRequest { child, ids } = request;
            let Some(mut child) = child.check_cancelled() else {
                continue;
            };

            let batch = if ids.is_empty() {
                Vec::new()
            } else {
                match self.download(&child, ids).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        child.on_error(err);
                        continue;
                    }
                }
            };

            child.set_cached_from(&batch);
            child.on_stage_completed();
            if let Err(err) = self.output.produce(&token, BuildRequest { child, batch }).await {
                debug!("Download stage output closed: {}", err);
                break;
            }
        }

        for request in self.input.close_and_drain() {
            request.child.on_error(SyncError::cancelled());
        }
        debug!("Download stage exited");
    }

    async fn download(&self, child: &ChildJob, ids: Vec<String>) -> SyncResult<Vec<FullMessage>> {
        let job = child.job();
        let token = job.token().clone();
        let ctx = job.ctx();
        let policy = ctx.cool_down;

        let messages = auto_download_rate(
            &token,
            self.rate_modifier.as_ref(),
            self.max_parallel_downloads,
            ids,
            {
                let client = ctx.client.clone();
                let cache = ctx.cache.clone();
                let token = token.clone();
                move |id: String, counter: Arc<AtomicU32>| {
                    download_message(
                        client.clone(),
                        cache.clone(),
                        token.clone(),
                        policy,
                        counter,
                        id,
                    )
                }
            },
        )
        .await?;
        let messages: Vec<Message> = messages.into_iter().flatten().collect();

        let attachment_ids: Vec<String> = messages
            .iter()
            .flat_map(|m| m.attachments.iter().map(|a| a.id.clone()))
            .collect();
        let attachment_data = auto_download_rate(
            &token,
            self.rate_modifier.as_ref(),
            self.max_parallel_downloads,
            attachment_ids,
            {
                let client = ctx.client.clone();
                let cache = ctx.cache.clone();
                let token = token.clone();
                move |id: String, counter: Arc<AtomicU32>| {
                    download_attachment(
                        client.clone(),
                        cache.clone(),
                        token.clone(),
                        policy,
                        counter,
                        id,
                    )
                }
            },
        )
        .await?;

        let mut attachment_data = attachment_data.into_iter();
        Ok(messages
            .into_iter()
            .map(|message| {
                let data = attachment_data
                    .by_ref()
                    .take(message.attachments.len())
                    .collect();
                FullMessage {
                    message,
                    attachment_data: data,
                }
            })
            .collect())
    }
}

/// Returns `None` when the remote refuses the message as unprocessable.
async fn download_message(
    client: Arc<dyn ApiClient>,
    cache: Arc<DownloadCache>,
    token: CancellationToken,
    policy: CoolDownPolicy,
    counter: Arc<AtomicU32>,
    message_id: String,
) -> SyncResult<Option<Message>> {
    if let Some(message) = cache.get_message(&message_id) {
        return Ok(Some(message));
    }
    let client = ApiClientRetryWrapper::new(client.as_ref(), &token, policy).with_counter(counter);
    match client.get_message(&message_id).await {
        Ok(message) => {
            cache.store_message(message.clone());
            Ok(Some(message))
        }
        Err(err) if err.is_unprocessable() => {
            MAILBRIDGE_SYNC_MESSAGES_SKIPPED_TOTAL.inc();
            warn!("Skipping message {}: {}", message_id, err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

async fn download_attachment(
    client: Arc<dyn ApiClient>,
    cache: Arc<DownloadCache>,
    token: CancellationToken,
    policy: CoolDownPolicy,
    counter: Arc<AtomicU32>,
    attachment_id: String,
) -> SyncResult<Arc<Vec<u8>>> {
    if let Some(data) = cache.get_attachment(&attachment_id) {
        return Ok(data);
    }
    let client = ApiClientRetryWrapper::new(client.as_ref(), &token, policy).with_counter(counter);
    let data = Arc::new(client.get_attachment(&attachment_id).await?);
    cache.store_attachment(&attachment_id, data.clone());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::sync::{
        channel::stage_channel,
        job::JobProgress,
        testing::{attachment_id, message_id, FakeApiClient, FakeMessageBuilder, Fixture},
    };
    use std::sync::Mutex;

    #[test]
    fn default_modifier_halves_and_doubles() {
        let modifier = DefaultDownloadRateModifier;
        assert_eq!(modifier.apply(false, 20, 20), 10);
        assert_eq!(modifier.apply(false, 3, 20), 2);
        assert_eq!(modifier.apply(false, 2, 20), 2);
        assert_eq!(modifier.apply(true, 10, 20), 20);
        assert_eq!(modifier.apply(true, 16, 20), 20);
        assert_eq!(modifier.apply(true, 2, 20), 4);
    }

    #[derive(Default)]
    struct RecordingModifier {
        calls: Mutex<Vec<(bool, usize)>>,
    }

    impl DownloadRateModifier for RecordingModifier {
        fn apply(&self, was_success: bool, current: usize, max: usize) -> usize {
            self.calls.lock().unwrap().push((was_success, current));
            DefaultDownloadRateModifier.apply(was_success, current, max)
        }
    }

    #[tokio::test]
    async fn rate_drops_after_throttled_chunk() {
        let token = CancellationToken::new();
        let modifier = RecordingModifier::default();
        let out = auto_download_rate(
            &token,
            &modifier,
            4,
            (0..12).collect(),
            |n: u32, counter| async move {
                // Items 0..4 form the first chunk; pretend one of them was throttled.
                if n == 1 {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(n * 10)
            },
        )
        .await
        .unwrap();

        assert_eq!(out, (0..12).map(|n| n * 10).collect::<Vec<_>>());
        let calls = modifier.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(true, 4), (false, 4), (true, 2)]);
    }

    #[tokio::test]
    async fn skips_unprocessable_and_reuses_cache() {
        let client = FakeApiClient::with_messages(4, 1).unprocessable([message_id(2)]);
        let fixture = Fixture::new(client, FakeMessageBuilder::new());
        let cached = fixture.client.get_message(&message_id(3)).await.unwrap();
        fixture.cache.store_message(cached);
        fixture.client.message_calls.store(0, Ordering::SeqCst);

        let token = CancellationToken::new();
        let (download_tx, download_rx) = stage_channel(4);
        let (build_tx, mut build_rx) = stage_channel(4);
        let stage =
            DownloadStage::new(download_rx, build_tx, 2, Arc::new(DefaultDownloadRateModifier));
        let handle = tokio::spawn(stage.run(token.clone()));

        let job = fixture.job(&token, JobProgress::default());
        let parent = job.begin().unwrap();
        let ids: Vec<_> = (1..=4).rev().map(message_id).collect();
        let child = parent.new_child_job(message_id(1), 4);
        download_tx
            .produce(&token, DownloadRequest { child, ids })
            .await
            .unwrap();

        let request = build_rx.consume(&token).await.unwrap();
        let got: Vec<_> = request.batch.iter().map(|m| m.id().to_string()).collect();
        assert_eq!(got, vec![message_id(4), message_id(3), message_id(1)]);
        assert!(request.batch.iter().all(|m| m.attachment_data.len() == 1));
        assert_eq!(request.child.cached_message_ids().len(), 3);
        assert!(request
            .child
            .cached_attachment_ids()
            .contains(&attachment_id(4, 0)));
        // m3 came from the cache; m4, m2 and m1 hit the API.
        assert_eq!(fixture.client.message_calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.cache.count(), (3, 3));

        request.child.on_finished().await;
        parent.end();
        assert!(job.wait_and_close().await.is_ok());
        assert_eq!(fixture.cache.count(), (0, 0));

        download_tx.close();
        handle.await.unwrap();
    }
}
