// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

/// Persisted sync progress of one account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Status {
    pub has_labels: bool,
    pub has_message_count: bool,
    pub has_messages: bool,
    pub last_synced_message_id: String,
    pub num_synced_messages: i64,
    pub total_message_count: i64,
    pub failed_messages: AHashSet<String>,
}

impl Status {
    pub fn is_complete(&self) -> bool {
        self.has_labels && self.has_messages
    }

    pub fn in_progress(&self) -> bool {
        self.has_labels || self.has_message_count
    }
}
