// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::modules::{
    error::{SyncError, SyncResult},
    metrics::MAILBRIDGE_SYNC_API_COOL_DOWN_TOTAL,
    sync::api::{ApiClient, Message, MessageFilter, MessageGroupCount, MessageMetadata},
    utils::sleep_or_cancel,
};

const EXP_COOL_DOWN_STEPS: [u64; 6] = [20, 40, 80, 160, 300, 600];
const EXP_COOL_DOWN_MAX_JITTER_SECS: u64 = 10;

/// Wait policy applied between retries of a throttled remote call.
pub trait CoolDown: Send {
    fn reset(&mut self);
    fn next_wait(&mut self) -> Duration;
}

/// Steps through 20s, 40s, 80s, 160s, 300s, 600s (then stays at 600s), each
/// with 0–10s of jitter.
#[derive(Debug, Default)]
pub struct ExpCoolDown {
    step: usize,
}

impl CoolDown for ExpCoolDown {
    fn reset(&mut self) {
        self.step = 0;
    }

    fn next_wait(&mut self) -> Duration {
        let base = EXP_COOL_DOWN_STEPS[self.step.min(EXP_COOL_DOWN_STEPS.len() - 1)];
        if self.step < EXP_COOL_DOWN_STEPS.len() - 1 {
            self.step += 1;
        }
        let jitter = rand::rng().random_range(0..=EXP_COOL_DOWN_MAX_JITTER_SECS);
        Duration::from_secs(base + jitter)
    }
}

/// Retries immediately. Meant for tests.
#[derive(Debug, Default)]
pub struct NoCoolDown;

impl CoolDown for NoCoolDown {
    fn reset(&mut self) {}

    fn next_wait(&mut self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CoolDownPolicy {
    #[default]
    Exponential,
    Immediate,
}

impl CoolDownPolicy {
    pub fn new_cool_down(self) -> Box<dyn CoolDown> {
        match self {
            CoolDownPolicy::Exponential => Box::new(ExpCoolDown::default()),
            CoolDownPolicy::Immediate => Box::new(NoCoolDown),
        }
    }
}

/// Invokes `call` until it succeeds or fails with anything other than a
/// throttling/server error, sleeping `cool_down` between attempts.
///
/// `on_rate_limited` runs once per throttled attempt.
pub async fn with_rate_limit<T, F, Fut>(
    token: &CancellationToken,
    cool_down: &mut dyn CoolDown,
    on_rate_limited: impl Fn(),
    mut call: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    cool_down.reset();
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SyncError::cancelled()),
            result = call() => result,
        };
        match result {
            Err(err) if err.is_rate_limited() => {
                on_rate_limited();
                let wait = cool_down.next_wait();
                MAILBRIDGE_SYNC_API_COOL_DOWN_TOTAL.inc();
                warn!(
                    "API call throttled ({}), retrying in {}s",
                    err,
                    wait.as_secs()
                );
                if !sleep_or_cancel(token, wait).await {
                    return Err(SyncError::cancelled());
                }
            }
            other => return other,
        }
    }
}

/// Exposes the [`ApiClient`] operations through [`with_rate_limit`].
///
/// When built with a counter, every throttled attempt bumps it so callers can
/// adapt their request rate.
pub struct ApiClientRetryWrapper<'a> {
    client: &'a dyn ApiClient,
    token: &'a CancellationToken,
    policy: CoolDownPolicy,
    rate_limited: Option<Arc<AtomicU32>>,
}

impl<'a> ApiClientRetryWrapper<'a> {
    pub fn new(
        client: &'a dyn ApiClient,
        token: &'a CancellationToken,
        policy: CoolDownPolicy,
    ) -> Self {
        Self {
            client,
            token,
            policy,
            rate_limited: None,
        }
    }

    pub fn with_counter(mut self, counter: Arc<AtomicU32>) -> Self {
        self.rate_limited = Some(counter);
        self
    }

    async fn invoke<T, F, Fut>(&self, call: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut cool_down = self.policy.new_cool_down();
        let counter = self.rate_limited.clone();
        with_rate_limit(
            self.token,
            cool_down.as_mut(),
            move || {
                if let Some(counter) = &counter {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            },
            call,
        )
        .await
    }

    pub async fn get_grouped_message_count(&self) -> SyncResult<Vec<MessageGroupCount>> {
        self.invoke(|| self.client.get_grouped_message_count()).await
    }

    pub async fn get_message_metadata_page(
        &self,
        page: u32,
        page_size: u32,
        filter: &MessageFilter,
    ) -> SyncResult<Vec<MessageMetadata>> {
        self.invoke(|| self.client.get_message_metadata_page(page, page_size, filter.clone()))
            .await
    }

    pub async fn get_message(&self, message_id: &str) -> SyncResult<Message> {
        self.invoke(|| self.client.get_message(message_id)).await
    }

    pub async fn get_attachment(&self, attachment_id: &str) -> SyncResult<Vec<u8>> {
        self.invoke(|| self.client.get_attachment(attachment_id)).await
    }
}
