// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    modules::{
        error::{code::ErrorCode, SyncError},
        metrics::MAILBRIDGE_SYNC_MESSAGES_APPLIED_TOTAL,
        sync::{channel::StageConsumer, stage::ApplyRequest},
    },
    raise_error,
};

/// Last stage: hands built messages to the local store, one batch at a time.
pub struct ApplyStage {
    input: StageConsumer<ApplyRequest>,
}

impl ApplyStage {
    pub fn new(input: StageConsumer<ApplyRequest>) -> Self {
        Self { input }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            let request = match self.input.consume(&token).await {
                Ok(request) => request,
                Err(err) => {
                    if err.code() != ErrorCode::NoMoreInput && !err.is_cancelled() {
                        error!("Apply stage stopped: {}", err);
                    }
                    break;
                }
            };

            let ApplyRequest { child, messages } = request;
            let Some(child) = child.check_cancelled() else {
                continue;
            };

            if messages.is_empty() {
                child.on_finished().await;
                continue;
            }

            let count = messages.len() as u64;
            let applier = child.job().ctx().update_applier.clone();
            match applier.apply_sync_updates(messages).await {
                Ok(()) => {
                    MAILBRIDGE_SYNC_MESSAGES_APPLIED_TOTAL.inc_by(count);
                    child.on_finished().await;
                }
                Err(err) => child.on_error(raise_error!(
                    format!("Failed to apply sync updates: {err}"),
                    ErrorCode::UpdateApplierFailed
                )),
            }
        }

        for request in self.input.close_and_drain() {
            request.child.on_error(SyncError::cancelled());
        }
        debug!("Apply stage exited");
    }
}
