//! Bounded exponential-backoff retry for remote calls.
//!
//! Only [`RemoteError::is_retryable`] failures are retried. A rate-limit
//! response that names its own `retry_after` waits at least that long.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use boardsync_core::{BoardRef, FieldMap, GroupRef, RemoteId, RemoteItem};

use crate::error::RemoteError;
use crate::remote::{GroupInfo, RemoteClient};

/// Retry schedule: `initial_delay`, then ×`multiplier` per further attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.multiplier.saturating_pow(retry))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < attempts => {
                let mut delay = policy.delay_for(attempt - 1);
                if let RemoteError::RateLimited {
                    retry_after: Some(after),
                } = &err
                {
                    delay = delay.max(*after);
                }
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient remote error, retrying",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A [`RemoteClient`] that retries every call of the wrapped client.
#[derive(Clone)]
pub struct RetryingClient {
    inner: Arc<dyn RemoteClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn RemoteClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl RemoteClient for RetryingClient {
    async fn fetch_items(
        &self,
        board: &BoardRef,
        group: Option<&GroupRef>,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "fetch_items", move || {
            inner.fetch_items(board, group)
        })
        .await
    }

    async fn get_item(&self, id: &RemoteId) -> Result<Option<RemoteItem>, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "get_item", move || inner.get_item(id)).await
    }

    async fn item_exists(&self, id: &RemoteId) -> Result<bool, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "item_exists", move || inner.item_exists(id)).await
    }

    async fn create_item(
        &self,
        board: &BoardRef,
        group: &GroupRef,
        name: &str,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "create_item", move || {
            inner.create_item(board, group, name, fields)
        })
        .await
    }

    async fn update_item(
        &self,
        board: &BoardRef,
        id: &RemoteId,
        fields: &FieldMap,
    ) -> Result<RemoteItem, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "update_item", move || {
            inner.update_item(board, id, fields)
        })
        .await
    }

    async fn delete_item(&self, id: &RemoteId) -> Result<bool, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "delete_item", move || inner.delete_item(id)).await
    }

    async fn list_groups(&self, board: &BoardRef) -> Result<Vec<GroupInfo>, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "list_groups", move || inner.list_groups(board)).await
    }

    async fn post_note(&self, id: &RemoteId, body: &str) -> Result<String, RemoteError> {
        let inner = &self.inner;
        with_retry(&self.policy, "post_note", move || inner.post_note(id, body)).await
    }
}
