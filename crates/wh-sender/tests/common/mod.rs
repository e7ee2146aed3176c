//! Shared fixtures for wh-sender integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wh_sender::{
    Backoff, DeliveryHooks, Destination, DispatcherConfig, Notification, PolicyConfig,
    PolicyRegistry, RegistrationStore, RetryPolicy, SenderError, WebhookDispatcher, WorkItem,
};

pub const SECRET: &str = "test-secret";

/// What a hook saw, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    Attempt { id: String, attempt: u32 },
    Success { id: String, status: u16 },
    Gone { id: String },
    Failure { id: String, kind: &'static str },
    Retry { id: String, attempt: u32 },
}

#[derive(Default)]
pub struct RecordingHooks {
    pub events: Mutex<Vec<HookEvent>>,
    pub attempts: AtomicU32,
    pub successes: AtomicU32,
    pub gones: AtomicU32,
    pub failures: AtomicU32,
    pub retries: AtomicU32,
    /// Make every hook return an error
    pub fail: bool,
    /// Panic inside `on_attempt` while set
    pub panic_on_attempt: AtomicBool,
}

impl RecordingHooks {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    pub fn failure_kinds(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HookEvent::Failure { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }

    fn record(&self, counter: &AtomicU32, event: HookEvent) -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(event);
        if self.fail {
            anyhow::bail!("hook exploded");
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryHooks for RecordingHooks {
    async fn on_attempt(&self, item: &WorkItem) -> anyhow::Result<()> {
        if self.panic_on_attempt.load(Ordering::SeqCst) {
            panic!("on_attempt hook panicked for {}", item.id);
        }
        self.record(
            &self.attempts,
            HookEvent::Attempt { id: item.id.clone(), attempt: item.attempt },
        )
    }

    async fn on_success(&self, item: &WorkItem, status: u16) -> anyhow::Result<()> {
        self.record(&self.successes, HookEvent::Success { id: item.id.clone(), status })
    }

    async fn on_gone(&self, item: &WorkItem) -> anyhow::Result<()> {
        self.record(&self.gones, HookEvent::Gone { id: item.id.clone() })
    }

    async fn on_failure(&self, item: &WorkItem, error: &SenderError) -> anyhow::Result<()> {
        self.record(&self.failures, HookEvent::Failure { id: item.id.clone(), kind: error.kind() })
    }

    async fn on_retry(&self, item: &WorkItem, _delay: Duration, _error: &SenderError) -> anyhow::Result<()> {
        self.record(&self.retries, HookEvent::Retry { id: item.id.clone(), attempt: item.attempt })
    }
}

/// Registration store backed by a Vec, recording disable calls
#[derive(Default)]
pub struct InMemoryStore {
    pub destinations: Mutex<Vec<Destination>>,
    pub disabled: Mutex<Vec<String>>,
    pub list_calls: AtomicU32,
}

impl InMemoryStore {
    pub fn with(destinations: Vec<Destination>) -> Self {
        Self {
            destinations: Mutex::new(destinations),
            ..Default::default()
        }
    }

    pub fn disabled(&self) -> Vec<String> {
        self.disabled.lock().clone()
    }
}

#[async_trait]
impl RegistrationStore for InMemoryStore {
    async fn list_destinations(&self) -> anyhow::Result<Vec<Destination>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.destinations.lock().clone())
    }

    async fn disable_destination(&self, destination_id: &str) -> anyhow::Result<()> {
        let mut destinations = self.destinations.lock();
        let destination = destinations
            .iter_mut()
            .find(|d| d.id == destination_id)
            .ok_or_else(|| anyhow::anyhow!("unknown destination {}", destination_id))?;
        destination.is_paused = true;
        self.disabled.lock().push(destination_id.to_string());
        Ok(())
    }
}

/// Dispatcher config with millisecond backoff so retries finish quickly
pub fn fast_config(max_retries: u32) -> DispatcherConfig {
    DispatcherConfig {
        request_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries,
            backoff: Backoff::Linear(Duration::from_millis(10)),
        },
        ..Default::default()
    }
}

pub fn registry(failure_threshold: u32) -> Arc<PolicyRegistry> {
    Arc::new(PolicyRegistry::new(PolicyConfig {
        failure_threshold,
        cooldown: Duration::from_secs(30),
    }))
}

pub fn dispatcher(
    config: DispatcherConfig,
    registry: Arc<PolicyRegistry>,
    hooks: Arc<RecordingHooks>,
) -> WebhookDispatcher {
    WebhookDispatcher::new(config, registry, hooks).unwrap()
}

pub fn destination(id: &str, uri: String) -> Arc<Destination> {
    Arc::new(Destination::new(id, uri, SECRET))
}

pub fn work_item(destination: &Arc<Destination>) -> WorkItem {
    WorkItem::new(
        Arc::clone(destination),
        vec![Notification::new("order.created", serde_json::json!({"orderId": 1})).unwrap()],
    )
}
