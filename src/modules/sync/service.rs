// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    mailbridge_version,
    modules::{
        error::SyncResult,
        settings::cli::Settings,
        sync::{
            channel::{stage_channel, StageProducer},
            job::Job,
            limits::SyncLimits,
            stage::{
                apply::ApplyStage,
                build::BuildStage,
                download::{DefaultDownloadRateModifier, DownloadRateModifier, DownloadStage},
                metadata::{MetadataConfig, MetadataStage},
            },
        },
    },
};

/// Accepts jobs into the sync pipeline.
#[async_trait]
pub trait Regulator: Send + Sync {
    /// Waits for room in the pipeline, then hands `job` to the metadata stage.
    async fn sync(&self, token: &CancellationToken, job: Arc<Job>) -> SyncResult<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncServiceConfig {
    pub limits: SyncLimits,
    pub metadata_page_size: u32,
    pub max_messages_per_batch: usize,
    pub channel_capacity: usize,
}

impl SyncServiceConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            limits: SyncLimits::from_settings(settings),
            metadata_page_size: settings.mailbridge_metadata_page_size,
            max_messages_per_batch: settings.mailbridge_max_messages_per_batch as usize,
            channel_capacity: settings.mailbridge_stage_channel_capacity as usize,
        }
    }
}

struct Stages {
    metadata: MetadataStage,
    download: DownloadStage,
    build: BuildStage,
    apply: ApplyStage,
}

/// The four sync stages and the channels between them. One service is shared by
/// the handlers of every account.
pub struct Service {
    token: CancellationToken,
    jobs: StageProducer<Arc<Job>>,
    stages: Mutex<Option<Stages>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(config: SyncServiceConfig) -> Self {
        Self::with_rate_modifier(config, Arc::new(DefaultDownloadRateModifier))
    }

    pub fn with_rate_modifier(
        config: SyncServiceConfig,
        rate_modifier: Arc<dyn DownloadRateModifier>,
    ) -> Self {
        let capacity = config.channel_capacity;
        let (jobs, metadata_input) = stage_channel(capacity);
        let (download_output, download_input) = stage_channel(capacity);
        let (build_output, build_input) = stage_channel(capacity);
        let (apply_output, apply_input) = stage_channel(capacity);

        let stages = Stages {
            metadata: MetadataStage::new(
                metadata_input,
                download_output,
                MetadataConfig {
                    max_download_mem: config.limits.download_request_mem,
                    max_messages: config.max_messages_per_batch.max(1),
                    // A page must hold the cursor row and at least one new row.
                    page_size: config.metadata_page_size.max(2),
                },
            ),
            download: DownloadStage::new(
                download_input,
                build_output,
                config.limits.max_parallel_downloads,
                rate_modifier,
            ),
            build: BuildStage::new(build_input, apply_output, config.limits.message_build_mem),
            apply: ApplyStage::new(apply_input),
        };

        Self {
            token: CancellationToken::new(),
            jobs,
            stages: Mutex::new(Some(stages)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts the stage workers. Calling it again has no effect.
    pub fn run(&self) {
        let Some(stages) = self.stages.lock().ok().and_then(|mut s| s.take()) else {
            warn!("Sync service already started");
            return;
        };
        info!("Starting sync service v{}", mailbridge_version!());
        let handles = vec![
            tokio::spawn(stages.metadata.run(self.token.clone())),
            tokio::spawn(stages.download.run(self.token.clone())),
            tokio::spawn(stages.build.run(self.token.clone())),
            tokio::spawn(stages.apply.run(self.token.clone())),
        ];
        if let Ok(mut guard) = self.handles.lock() {
            guard.extend(handles);
        }
    }

    /// Stops every stage and waits for them to exit. Batches still queued
    /// between stages resolve as cancelled.
    pub async fn close(&self) {
        self.token.cancel();
        let handles = self
            .handles
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                warn!("Sync stage task ended abnormally: {}", e);
            }
        }
        info!("Sync service stopped");
    }
}

#[async_trait]
impl Regulator for Service {
    async fn sync(&self, token: &CancellationToken, job: Arc<Job>) -> SyncResult<()> {
        self.jobs.produce(token, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{
        error::code::ErrorCode,
        sync::{
            job::JobProgress,
            testing::{message_id, FakeApiClient, FakeMessageBuilder, Fixture},
        },
        utils::GIGABYTE,
    };

    fn test_config() -> SyncServiceConfig {
        SyncServiceConfig {
            limits: SyncLimits::compute(2 * GIGABYTE, 16 * GIGABYTE, false),
            metadata_page_size: 16,
            max_messages_per_batch: 8,
            channel_capacity: 2,
        }
    }

    #[test]
    fn config_from_settings() {
        let config = SyncServiceConfig::from_settings(&Settings::new_for_test());
        assert_eq!(config.metadata_page_size, 128);
        assert_eq!(config.max_messages_per_batch, 200);
        assert_eq!(config.channel_capacity, 8);
    }

    #[tokio::test]
    async fn runs_a_job_end_to_end() {
        let fixture = Fixture::new(FakeApiClient::with_messages(20, 1), FakeMessageBuilder::new());
        let service = Service::new(test_config());
        service.run();
        service.run();

        let token = CancellationToken::new();
        let job = fixture.job(&token, JobProgress {
            total_message_count: 20,
            ..Default::default()
        });
        service.sync(&token, job.clone()).await.unwrap();
        assert!(job.wait_and_close().await.is_ok());
        assert_eq!(fixture.applier.applied_ids().len(), 20);
        assert_eq!(fixture.state.snapshot().await.num_synced_messages, 20);

        service.close().await;
    }

    #[tokio::test]
    async fn tiny_page_size_still_pages_past_the_cursor() {
        let fixture = Fixture::new(FakeApiClient::with_messages(20, 0), FakeMessageBuilder::new());
        let service = Service::new(SyncServiceConfig {
            metadata_page_size: 1,
            ..test_config()
        });
        service.run();

        let token = CancellationToken::new();
        let job = fixture.job(&token, JobProgress {
            last_synced_message_id: message_id(11),
            num_synced_messages: 10,
            total_message_count: 20,
        });
        service.sync(&token, job.clone()).await.unwrap();
        assert!(job.wait_and_close().await.is_ok());
        let expected: Vec<_> = (1..=10).rev().map(message_id).collect();
        assert_eq!(fixture.applier.applied_ids(), expected);
        assert_eq!(fixture.state.snapshot().await.num_synced_messages, 10);

        service.close().await;
    }

    #[tokio::test]
    async fn closed_service_rejects_jobs() {
        let fixture = Fixture::new(FakeApiClient::with_messages(1, 0), FakeMessageBuilder::new());
        let service = Service::new(test_config());
        service.run();
        service.close().await;

        let token = CancellationToken::new();
        let job = fixture.job(&token, JobProgress::default());
        let err = service.sync(&token, job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoMoreInput);
    }
}
