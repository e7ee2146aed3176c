//! Delivery outcome hooks.
//!
//! The dispatcher calls these for every attempt and terminal outcome. Errors
//! returned by a hook, and panics inside one, are logged and otherwise ignored.

use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{error, warn};
use wh_common::WorkItem;

use crate::error::SenderError;

#[async_trait]
pub trait DeliveryHooks: Send + Sync {
    /// Before each HTTP attempt; `item.attempt` is the zero-based attempt about to run
    async fn on_attempt(&self, _item: &WorkItem) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_success(&self, _item: &WorkItem, _status: u16) -> anyhow::Result<()> {
        Ok(())
    }

    /// Destination answered 410; the caller should disable or remove it
    async fn on_gone(&self, _item: &WorkItem) -> anyhow::Result<()> {
        Ok(())
    }

    /// Terminal failure: retries exhausted, a non-retryable response, or an open circuit
    async fn on_failure(&self, _item: &WorkItem, _error: &SenderError) -> anyhow::Result<()> {
        Ok(())
    }

    /// A retry was scheduled after `error`, to run after `delay`
    async fn on_retry(&self, _item: &WorkItem, _delay: Duration, _error: &SenderError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl DeliveryHooks for NoopHooks {}

/// Await a hook, logging its error or panic
pub(crate) async fn run_hook<F>(hook: &'static str, item: &WorkItem, call: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => log_hook_error(hook, item, result),
        Err(_) => {
            error!(
                hook,
                work_item_id = %item.id,
                destination_id = %item.destination_id(),
                "Delivery hook panicked"
            );
        }
    }
}

fn log_hook_error(hook: &'static str, item: &WorkItem, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(
            hook,
            work_item_id = %item.id,
            destination_id = %item.destination_id(),
            error = %e,
            "Delivery hook failed"
        );
    }
}
