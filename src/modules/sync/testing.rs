// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

//! In-memory collaborators for exercising the pipeline in tests.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use ahash::AHashSet;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    modules::{
        error::{code::ErrorCode, SyncError, SyncResult},
        sync::{
            api::{
                AddressKeyring, ApiClient, Attachment, BuildResult, FullMessage, Label, LabelMap,
                LabelType, Message, MessageBuilder, MessageFilter, MessageGroupCount,
                MessageMetadata, Reporter, UnlockedKeyrings, UpdateApplier, ALL_MAIL_LABEL,
            },
            cache::DownloadCache,
            job::{FailureReporter, Job, JobContext, JobProgress},
            memory::MemoryStateProvider,
            ratelimit::CoolDownPolicy,
        },
    },
    raise_error,
};

pub const ADDRESS_ID: &str = "addr-1";

/// Message IDs sort lexically in the same order as numerically.
pub fn message_id(n: usize) -> String {
    format!("m{n:05}")
}

pub fn attachment_id(message: usize, n: usize) -> String {
    format!("a{message:05}-{n}")
}

pub fn labels() -> LabelMap {
    let mut labels = LabelMap::new();
    labels.insert(
        ALL_MAIL_LABEL.to_string(),
        Label {
            id: ALL_MAIL_LABEL.into(),
            parent_id: None,
            name: "All Mail".into(),
            path: vec!["All Mail".into()],
            label_type: LabelType::System,
        },
    );
    labels
}

pub fn metadata(n: usize, size: u64, num_attachments: usize) -> MessageMetadata {
    MessageMetadata {
        id: message_id(n),
        address_id: ADDRESS_ID.into(),
        label_ids: vec![ALL_MAIL_LABEL.into()],
        size,
        num_attachments,
        time: n as i64,
    }
}

pub fn full_message(n: usize, body_len: usize, attachment_sizes: &[u64]) -> FullMessage {
    let attachments: Vec<_> = attachment_sizes
        .iter()
        .enumerate()
        .map(|(i, size)| Attachment {
            id: attachment_id(n, i),
            name: format!("file-{i}.bin"),
            size: *size,
            mime_type: "application/octet-stream".into(),
        })
        .collect();
    let attachment_data = attachment_sizes
        .iter()
        .map(|size| Arc::new(vec![0u8; *size as usize]))
        .collect();
    FullMessage {
        message: Message {
            metadata: metadata(n, body_len as u64, attachments.len()),
            body: "x".repeat(body_len),
            attachments,
        },
        attachment_data,
    }
}

#[derive(Default)]
pub struct FakeApiClient {
    /// Sorted by descending ID.
    metadata: Vec<MessageMetadata>,
    messages: HashMap<String, Message>,
    attachments: HashMap<String, Vec<u8>>,
    unprocessable: AHashSet<String>,
    /// Number of upcoming calls that fail with 429.
    throttle: AtomicUsize,
    pub metadata_calls: AtomicUsize,
    pub message_calls: AtomicUsize,
    pub attachment_calls: AtomicUsize,
    pub filters: Mutex<Vec<MessageFilter>>,
}

impl FakeApiClient {
    /// Messages `1..=count`, each with `attachments_per_message` attachments.
    pub fn with_messages(count: usize, attachments_per_message: usize) -> Self {
        let mut client = Self::default();
        for n in 1..=count {
            let attachments: Vec<_> = (0..attachments_per_message)
                .map(|i| Attachment {
                    id: attachment_id(n, i),
                    name: format!("file-{i}.bin"),
                    size: 16,
                    mime_type: "application/octet-stream".into(),
                })
                .collect();
            for attachment in &attachments {
                client
                    .attachments
                    .insert(attachment.id.clone(), vec![n as u8; 16]);
            }
            let meta = metadata(n, 64, attachments.len());
            client.messages.insert(
                meta.id.clone(),
                Message {
                    metadata: meta.clone(),
                    body: format!("body of {}", meta.id),
                    attachments,
                },
            );
            client.metadata.push(meta);
        }
        client.metadata.sort_by(|a, b| b.id.cmp(&a.id));
        client
    }

    /// Fetching any of `ids` answers 422.
    pub fn unprocessable<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.unprocessable.extend(ids);
        self
    }

    pub fn throttle_next(&self, calls: usize) {
        self.throttle.store(calls, Ordering::SeqCst);
    }

    fn check_throttle(&self) -> SyncResult<()> {
        let throttled = self
            .throttle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(SyncError::from_http_status(429, "too many requests"));
        }
        Ok(())
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    async fn get_grouped_message_count(&self) -> SyncResult<Vec<MessageGroupCount>> {
        self.check_throttle()?;
        Ok(vec![
            MessageGroupCount {
                label_id: "0".into(),
                total: 1,
                unread: 0,
            },
            MessageGroupCount {
                label_id: ALL_MAIL_LABEL.into(),
                total: self.metadata.len() as i64,
                unread: 0,
            },
        ])
    }

    async fn get_message_metadata_page(
        &self,
        _page: u32,
        page_size: u32,
        filter: MessageFilter,
    ) -> SyncResult<Vec<MessageMetadata>> {
        self.check_throttle()?;
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let start = match &filter.end_id {
            Some(end_id) => self
                .metadata
                .iter()
                .position(|m| m.id <= *end_id)
                .unwrap_or(self.metadata.len()),
            None => 0,
        };
        self.filters.lock().unwrap().push(filter);
        Ok(self
            .metadata
            .iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn get_message(&self, message_id: &str) -> SyncResult<Message> {
        self.check_throttle()?;
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if self.unprocessable.contains(message_id) {
            return Err(SyncError::from_http_status(422, "message unprocessable"));
        }
        self.messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::from_http_status(404, "message not found"))
    }

    async fn get_attachment(&self, attachment_id: &str) -> SyncResult<Vec<u8>> {
        self.check_throttle()?;
        self.attachment_calls.fetch_add(1, Ordering::SeqCst);
        self.attachments
            .get(attachment_id)
            .cloned()
            .ok_or_else(|| SyncError::from_http_status(404, "attachment not found"))
    }
}

pub struct FakeKeyring;

impl AddressKeyring for FakeKeyring {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FakeMessageBuilder {
    /// Addresses with an unlocked keyring.
    pub addresses: Vec<String>,
    pub failing: AHashSet<String>,
    pub unlock_fails: bool,
    pub unlock_calls: AtomicUsize,
}

impl FakeMessageBuilder {
    pub fn new() -> Self {
        Self {
            addresses: vec![ADDRESS_ID.into()],
            ..Default::default()
        }
    }

    pub fn without_keyrings() -> Self {
        Self::default()
    }
}

impl MessageBuilder for FakeMessageBuilder {
    fn unlock_keyrings(&self) -> SyncResult<UnlockedKeyrings> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        if self.unlock_fails {
            return Err(raise_error!(
                "bad passphrase".into(),
                ErrorCode::KeyringUnlockFailed
            ));
        }
        let mut keyrings = UnlockedKeyrings::new();
        for address in &self.addresses {
            keyrings.insert(address.clone(), Arc::new(FakeKeyring));
        }
        Ok(keyrings)
    }

    fn build_message(
        &self,
        _labels: &LabelMap,
        message: &FullMessage,
        keyring: &dyn AddressKeyring,
    ) -> SyncResult<BuildResult> {
        if keyring.as_any().downcast_ref::<FakeKeyring>().is_none() {
            return Err(raise_error!(
                "unexpected keyring".into(),
                ErrorCode::MessageBuildFailed
            ));
        }
        if self.failing.contains(message.id()) {
            return Err(raise_error!(
                "malformed message".into(),
                ErrorCode::MessageBuildFailed
            ));
        }
        Ok(BuildResult {
            message_id: message.id().to_string(),
            address_id: message.address_id().to_string(),
            label_ids: message.message.metadata.label_ids.clone(),
            literal: message.message.body.clone().into_bytes(),
        })
    }
}

#[derive(Default)]
pub struct RecordingApplier {
    pub applied: Mutex<Vec<BuildResult>>,
    pub batches: AtomicUsize,
    pub label_syncs: AtomicUsize,
    pub system_label_syncs: AtomicUsize,
    /// Number of upcoming `apply_sync_updates` calls that fail.
    pub fail_next: AtomicUsize,
}

impl RecordingApplier {
    pub fn applied_ids(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message_id.clone())
            .collect()
    }
}

#[async_trait]
impl UpdateApplier for RecordingApplier {
    async fn sync_labels(&self, _labels: &LabelMap) -> SyncResult<()> {
        self.label_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_system_labels_only(&self, _labels: &LabelMap) -> SyncResult<()> {
        self.system_label_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_sync_updates(&self, updates: Vec<BuildResult>) -> SyncResult<()> {
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(raise_error!(
                "store unavailable".into(),
                ErrorCode::UpdateApplierFailed
            ));
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.applied.lock().unwrap().extend(updates);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub errors: AtomicUsize,
    pub progress: AtomicI64,
    pub initialized: Mutex<Vec<(i64, i64)>>,
}

impl Reporter for RecordingReporter {
    fn on_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _err: &SyncError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_progress(&self, delta: i64) {
        self.progress.fetch_add(delta, Ordering::SeqCst);
    }

    fn initialize_progress_counter(&self, current: i64, total: i64) {
        self.initialized.lock().unwrap().push((current, total));
        self.progress.store(current, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingFailureReporter {
    pub failures: Mutex<Vec<(String, String)>>,
}

impl FailureReporter for RecordingFailureReporter {
    fn report_build_failure(&self, message_id: &str, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((message_id.to_string(), reason.to_string()));
    }
}

/// Every collaborator of a job, kept concrete so tests can inspect them.
pub struct Fixture {
    pub client: Arc<FakeApiClient>,
    pub builder: Arc<FakeMessageBuilder>,
    pub applier: Arc<RecordingApplier>,
    pub reporter: Arc<RecordingReporter>,
    pub state: Arc<MemoryStateProvider>,
    pub cache: Arc<DownloadCache>,
    pub failures: Arc<RecordingFailureReporter>,
}

impl Fixture {
    pub fn new(client: FakeApiClient, builder: FakeMessageBuilder) -> Self {
        Self {
            client: Arc::new(client),
            builder: Arc::new(builder),
            applier: Arc::new(RecordingApplier::default()),
            reporter: Arc::new(RecordingReporter::default()),
            state: Arc::new(MemoryStateProvider::new()),
            cache: Arc::new(DownloadCache::new()),
            failures: Arc::new(RecordingFailureReporter::default()),
        }
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            account_id: "account-1".into(),
            client: self.client.clone(),
            labels: Arc::new(labels()),
            message_builder: self.builder.clone(),
            update_applier: self.applier.clone(),
            reporter: self.reporter.clone(),
            state: self.state.clone(),
            cache: self.cache.clone(),
            failure_reporter: self.failures.clone(),
            cool_down: CoolDownPolicy::Immediate,
        }
    }

    pub fn job(&self, token: &CancellationToken, progress: JobProgress) -> Arc<Job> {
        Job::new(token, self.context(), progress)
    }
}
