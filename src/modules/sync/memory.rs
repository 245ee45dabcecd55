// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::modules::{
    error::SyncResult,
    sync::{api::StateProvider, status::Status},
};

/// A [`StateProvider`] that keeps the sync status in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateProvider {
    status: RwLock<Status>,
}

impl MemoryStateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status: RwLock::new(status),
        }
    }

    pub async fn snapshot(&self) -> Status {
        self.status.read().await.clone()
    }
}

#[async_trait]
impl StateProvider for MemoryStateProvider {
    async fn get_sync_status(&self) -> SyncResult<Status> {
        Ok(self.snapshot().await)
    }

    async fn clear_sync_status(&self) -> SyncResult<()> {
        *self.status.write().await = Status::default();
        Ok(())
    }

    async fn set_has_labels(&self, value: bool) -> SyncResult<()> {
        self.status.write().await.has_labels = value;
        Ok(())
    }

    async fn set_has_messages(&self, value: bool) -> SyncResult<()> {
        self.status.write().await.has_messages = value;
        Ok(())
    }

    async fn set_last_message_id(&self, message_id: &str, count: i64) -> SyncResult<()> {
        let mut status = self.status.write().await;
        status.last_synced_message_id = message_id.to_string();
        status.num_synced_messages += count;
        Ok(())
    }

    async fn set_message_count(&self, total: i64) -> SyncResult<()> {
        let mut status = self.status.write().await;
        status.total_message_count = total;
        status.has_message_count = true;
        Ok(())
    }

    async fn add_failed_message_ids(&self, message_ids: &[String]) -> SyncResult<()> {
        let mut status = self.status.write().await;
        status.failed_messages.extend(message_ids.iter().cloned());
        Ok(())
    }

    async fn remove_failed_message_ids(&self, message_ids: &[String]) -> SyncResult<()> {
        let mut status = self.status.write().await;
        for id in message_ids {
            status.failed_messages.remove(id);
        }
        Ok(())
    }
}
