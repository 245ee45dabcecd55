// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::Arc;

use dashmap::DashMap;

use crate::modules::sync::api::Message;

/// In-flight message and attachment data shared by the download workers of a
/// handler. Entries are only removed explicitly, once a batch has been applied.
#[derive(Default)]
pub struct DownloadCache {
    messages: DashMap<String, Message>,
    attachments: DashMap<String, Arc<Vec<u8>>>,
}

impl DownloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_message(&self, message: Message) {
        self.messages.insert(message.metadata.id.clone(), message);
    }

    pub fn store_attachment(&self, attachment_id: &str, data: Arc<Vec<u8>>) {
        self.attachments.insert(attachment_id.to_string(), data);
    }

    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        self.messages.get(message_id).map(|m| m.value().clone())
    }

    pub fn get_attachment(&self, attachment_id: &str) -> Option<Arc<Vec<u8>>> {
        self.attachments.get(attachment_id).map(|a| a.value().clone())
    }

    pub fn delete_messages<S: AsRef<str>>(&self, message_ids: &[S]) {
        for id in message_ids {
            self.messages.remove(id.as_ref());
        }
    }

    pub fn delete_attachments<S: AsRef<str>>(&self, attachment_ids: &[S]) {
        for id in attachment_ids {
            self.attachments.remove(id.as_ref());
        }
    }

    pub fn clear(&self) {
        self.messages.clear();
        self.attachments.clear();
    }

    /// Returns `(messages, attachments)`.
    pub fn count(&self) -> (usize, usize) {
        (self.messages.len(), self.attachments.len())
    }
}
