// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

//! Capabilities the sync engine consumes, and the remote data it moves around.
//!
//! Wire protocols, authentication, cryptography and storage live behind these
//! traits; the pipeline only orchestrates them.

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::modules::{error::SyncResult, sync::status::Status};

/// Label ID of the aggregate that contains every message of the account.
pub const ALL_MAIL_LABEL: &str = "5";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelType {
    Label,
    ContactGroup,
    Folder,
    System,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: Vec<String>,
    pub label_type: LabelType,
}

pub type LabelMap = HashMap<String, Label>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageGroupCount {
    pub label_id: String,
    pub total: i64,
    pub unread: i64,
}

/// Cursor filter for metadata pagination. With `end_id` set, the remote returns
/// rows starting at (and including) that ID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub end_id: Option<String>,
    pub desc: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub address_id: String,
    pub label_ids: Vec<String>,
    /// Declared size in bytes, used to size download batches.
    pub size: u64,
    pub num_attachments: usize,
    pub time: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// A remote message with its (still encrypted) body and attachment descriptors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub metadata: MessageMetadata,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// A message together with the downloaded bytes of every attachment, in
/// `message.attachments` order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FullMessage {
    pub message: Message,
    pub attachment_data: Vec<Arc<Vec<u8>>>,
}

impl FullMessage {
    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn address_id(&self) -> &str {
        &self.message.metadata.address_id
    }

    /// Memory needed to build this message: attachments count double for the
    /// decrypt buffer, plus the body.
    pub fn build_memory(&self) -> u64 {
        let attachments: u64 = self.message.attachments.iter().map(|a| a.size).sum();
        attachments * 2 + self.message.body.len() as u64
    }
}

/// A message converted into a literal the local store can deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildResult {
    pub message_id: String,
    pub address_id: String,
    pub label_ids: Vec<String>,
    pub literal: Vec<u8>,
}

/// An unlocked address keyring. Only the builder that produced it knows the
/// concrete type and downcasts through [`AddressKeyring::as_any`].
pub trait AddressKeyring: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Keyrings unlocked for one build pass, keyed by address ID. Keys stay unlocked
/// for as long as this value lives.
#[derive(Clone, Default)]
pub struct UnlockedKeyrings {
    by_address: HashMap<String, Arc<dyn AddressKeyring>>,
}

impl UnlockedKeyrings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address_id: impl Into<String>, keyring: Arc<dyn AddressKeyring>) {
        self.by_address.insert(address_id.into(), keyring);
    }

    pub fn get(&self, address_id: &str) -> Option<&Arc<dyn AddressKeyring>> {
        self.by_address.get(address_id)
    }
}

impl fmt::Debug for UnlockedKeyrings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedKeyrings")
            .field("addresses", &self.by_address.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The remote mail API.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_grouped_message_count(&self) -> SyncResult<Vec<MessageGroupCount>>;

    async fn get_message_metadata_page(
        &self,
        page: u32,
        page_size: u32,
        filter: MessageFilter,
    ) -> SyncResult<Vec<MessageMetadata>>;

    async fn get_message(&self, message_id: &str) -> SyncResult<Message>;

    async fn get_attachment(&self, attachment_id: &str) -> SyncResult<Vec<u8>>;
}

/// Durable per-account sync progress.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn get_sync_status(&self) -> SyncResult<Status>;

    async fn clear_sync_status(&self) -> SyncResult<()>;

    async fn set_has_labels(&self, value: bool) -> SyncResult<()>;

    async fn set_has_messages(&self, value: bool) -> SyncResult<()>;

    /// Moves the cursor and adds `count` to the synced-message counter atomically.
    async fn set_last_message_id(&self, message_id: &str, count: i64) -> SyncResult<()>;

    async fn set_message_count(&self, total: i64) -> SyncResult<()>;

    async fn add_failed_message_ids(&self, message_ids: &[String]) -> SyncResult<()>;

    async fn remove_failed_message_ids(&self, message_ids: &[String]) -> SyncResult<()>;
}

/// Decrypts remote messages into deliverable literals.
pub trait MessageBuilder: Send + Sync {
    fn unlock_keyrings(&self) -> SyncResult<UnlockedKeyrings>;

    fn build_message(
        &self,
        labels: &LabelMap,
        message: &FullMessage,
        keyring: &dyn AddressKeyring,
    ) -> SyncResult<BuildResult>;
}

/// The local mailbox store. Every call must be idempotent under retry.
#[async_trait]
pub trait UpdateApplier: Send + Sync {
    async fn sync_labels(&self, labels: &LabelMap) -> SyncResult<()>;

    async fn sync_system_labels_only(&self, labels: &LabelMap) -> SyncResult<()>;

    async fn apply_sync_updates(&self, updates: Vec<BuildResult>) -> SyncResult<()>;
}

/// User-facing progress notifications.
pub trait Reporter: Send + Sync {
    fn on_start(&self);

    fn on_finished(&self);

    fn on_error(&self, err: &crate::modules::error::SyncError);

    fn on_progress(&self, delta: i64);

    fn initialize_progress_counter(&self, current: i64, total: i64);
}
