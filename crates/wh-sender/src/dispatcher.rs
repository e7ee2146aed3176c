//! Dispatcher - bounded-concurrency delivery pool
//!
//! `submit` validates a batch and queues it on an unbounded channel, so it
//! never waits on delivery. A run loop spawns one task per work item; each
//! task walks the item through its destination's policy:
//!
//! 1. acquire a semaphore permit (the concurrency cap)
//! 2. pass the circuit gate (`DestinationPolicy::acquire_use`)
//! 3. build, sign and send with a per-attempt timeout
//! 4. record the outcome, then either finish or release the permit and sleep
//!    for the backoff delay before the next attempt
//!
//! Cancellation (per batch, or the dispatcher-wide abort on shutdown) abandons
//! the attempt without counting it against the circuit.

use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wh_common::{generate_work_item_id, WorkItem};
use wh_config::AppConfig;

use crate::backoff::RetryPolicy;
use crate::error::SenderError;
use crate::hooks::{run_hook, DeliveryHooks};
use crate::policy::DestinationPolicy;
use crate::registry::PolicyRegistry;
use crate::request::RequestBuilder;
use crate::sender_metrics;
use crate::signer::SIGNATURE_HEADER;
use crate::Result;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent HTTP attempts
    pub concurrency: usize,
    /// Upper bound on a single attempt
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long `shutdown` waits for queued and in-flight work
    pub shutdown_timeout: Duration,
    pub signature_header: String,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            signature_header: SIGNATURE_HEADER.to_string(),
            user_agent: concat!("wh-sender/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&AppConfig> for DispatcherConfig {
    fn from(config: &AppConfig) -> Self {
        let dispatcher = &config.dispatcher;
        Self {
            concurrency: dispatcher.concurrency.max(1),
            request_timeout: Duration::from_millis(dispatcher.request_timeout_ms),
            connect_timeout: Duration::from_millis(dispatcher.connect_timeout_ms),
            shutdown_timeout: Duration::from_secs(dispatcher.shutdown_timeout_secs),
            signature_header: dispatcher.signature_header.clone(),
            user_agent: dispatcher.user_agent.clone(),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Terminal result for one work item
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Gone,
    Failed(SenderError),
    /// Cancelled before reaching any other outcome
    Abandoned,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Gone => "gone",
            DeliveryOutcome::Failed(_) => "failed",
            DeliveryOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub submitted: u64,
    /// Accepted and not yet terminal
    pub in_flight: u64,
    pub delivered: u64,
    pub gone: u64,
    pub failed: u64,
    pub abandoned: u64,
    /// Dropped at submission because the destination is paused
    pub skipped: u64,
    pub attempts: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    in_flight: AtomicU64,
    delivered: AtomicU64,
    gone: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    skipped: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
}

struct Job {
    item: WorkItem,
    batch: CancellationToken,
}

/// Batch token plus the dispatcher-wide abort token
struct JobCancel<'a> {
    batch: &'a CancellationToken,
    abort: &'a CancellationToken,
}

impl JobCancel<'_> {
    async fn cancelled(&self) {
        tokio::select! {
            _ = self.batch.cancelled() => {}
            _ = self.abort.cancelled() => {}
        }
    }

    fn is_cancelled(&self) -> bool {
        self.batch.is_cancelled() || self.abort.is_cancelled()
    }
}

/// Accepted work item that has not reached an outcome yet.
///
/// Dropping it unsettled (a panicking or aborted task) counts the item as
/// abandoned; either way the in-flight count is released.
struct InFlight<'a> {
    inner: &'a Inner,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self { inner, settled: false }
    }

    fn settle(mut self, outcome: &DeliveryOutcome) {
        self.settled = true;
        self.inner.record_outcome(outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Delivery task ended without an outcome, counting item as abandoned");
            self.inner.record_outcome(&DeliveryOutcome::Abandoned);
        }
        self.inner.finish();
    }
}

enum AttemptResult {
    Delivered(u16),
    Gone,
    Failed(SenderError),
    Cancelled,
}

struct Inner {
    config: DispatcherConfig,
    client: Client,
    builder: RequestBuilder,
    registry: Arc<PolicyRegistry>,
    hooks: Arc<dyn DeliveryHooks>,
    semaphore: Semaphore,
    abort: CancellationToken,
    counters: Counters,
    idle: Notify,
}

pub struct WebhookDispatcher {
    inner: Arc<Inner>,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl WebhookDispatcher {
    /// Create the dispatcher and start its run loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<PolicyRegistry>,
        hooks: Arc<dyn DeliveryHooks>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| SenderError::Config(format!("failed to build HTTP client: {}", e)))?;

        Self::with_client(config, client, registry, hooks)
    }

    /// Create the dispatcher with a caller-supplied HTTP client
    pub fn with_client(
        config: DispatcherConfig,
        client: Client,
        registry: Arc<PolicyRegistry>,
        hooks: Arc<dyn DeliveryHooks>,
    ) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(SenderError::Config("concurrency must be at least 1".to_string()));
        }

        let builder = RequestBuilder::with_signature_header(&config.signature_header)?;

        info!(
            concurrency = config.concurrency,
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            max_retries = config.retry.max_retries,
            "Webhook dispatcher started"
        );

        let inner = Arc::new(Inner {
            semaphore: Semaphore::new(config.concurrency),
            config,
            client,
            builder,
            registry,
            hooks,
            abort: CancellationToken::new(),
            counters: Counters::default(),
            idle: Notify::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_loop(Arc::clone(&inner), rx));

        Ok(Self {
            inner,
            tx: Mutex::new(Some(tx)),
            run_handle: Mutex::new(Some(handle)),
            accepting: AtomicBool::new(true),
        })
    }

    /// Queue a batch for delivery. Returns as soon as the batch is queued.
    pub fn submit(&self, items: Vec<WorkItem>) -> Result<()> {
        self.submit_with_cancellation(items, CancellationToken::new())
    }

    /// Queue a batch whose attempts stop when `cancel` fires.
    ///
    /// Every item is validated first; one invalid item rejects the whole batch
    /// and nothing is queued. Items for paused destinations are skipped.
    pub fn submit_with_cancellation(&self, items: Vec<WorkItem>, cancel: CancellationToken) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SenderError::ShutdownInProgress);
        }

        for item in &items {
            RequestBuilder::validate_item(item)?;
        }

        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(SenderError::ShutdownInProgress)?;

        let counters = &self.inner.counters;
        let mut queued = 0usize;
        let mut skipped = 0usize;

        for mut item in items {
            if item.destination.is_paused {
                info!(
                    work_item_id = %item.id,
                    destination_id = %item.destination_id(),
                    "Destination is paused, skipping work item"
                );
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                skipped += 1;
                continue;
            }

            if item.id.is_empty() {
                item.id = generate_work_item_id();
            }

            counters.submitted.fetch_add(1, Ordering::Relaxed);
            counters.in_flight.fetch_add(1, Ordering::SeqCst);

            if let Err(mpsc::error::SendError(job)) = tx.send(Job {
                item,
                batch: cancel.clone(),
            }) {
                self.inner.finish();
                warn!(work_item_id = %job.item.id, "Dispatcher run loop is gone, dropping work item");
                return Err(SenderError::ShutdownInProgress);
            }
            queued += 1;
        }

        debug!(queued, skipped, "Batch submitted");
        Ok(())
    }

    /// Wait until no accepted work remains. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.counters.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.counters.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Stop intake, drain queued and in-flight work up to the shutdown
    /// timeout, then cancel whatever is left.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        let in_flight = self.inner.counters.in_flight.load(Ordering::SeqCst);
        info!(in_flight, "Shutting down webhook dispatcher");

        // Closing the channel lets the run loop finish once the queue is empty
        drop(self.tx.lock().take());

        let handle = self.run_handle.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        match tokio::time::timeout(self.inner.config.shutdown_timeout, &mut handle).await {
            Ok(_) => info!("Webhook dispatcher drained"),
            Err(_) => {
                warn!(
                    in_flight = self.inner.counters.in_flight.load(Ordering::SeqCst),
                    "Shutdown timeout reached, cancelling remaining deliveries"
                );
                self.inner.abort.cancel();
                if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                    error!("Dispatcher run loop did not stop after cancellation, aborting");
                    handle.abort();
                }
            }
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        DispatcherStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            delivered: c.delivered.load(Ordering::Relaxed),
            gone: c.gone.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            circuit_rejections: c.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}

async fn run_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Job>) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => {
                    let inner = Arc::clone(&inner);
                    tasks.spawn(async move { inner.process(job).await });
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join_error(joined);
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_join_error(joined);
    }

    debug!("Dispatcher run loop exited");
}

fn log_join_error(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Delivery task failed");
    }
}

impl Inner {
    async fn process(&self, job: Job) {
        let Job { item, batch } = job;
        let cancel = JobCancel {
            batch: &batch,
            abort: &self.abort,
        };

        let in_flight = InFlight::new(self);
        let outcome = self.deliver(item, &cancel).await;
        in_flight.settle(&outcome);
    }

    fn record_outcome(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered { .. } => &self.counters.delivered,
            DeliveryOutcome::Gone => &self.counters.gone,
            DeliveryOutcome::Failed(_) => &self.counters.failed,
            DeliveryOutcome::Abandoned => &self.counters.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        sender_metrics::record_delivery(outcome.as_str());
    }

    fn finish(&self) {
        if self.counters.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn deliver(&self, mut item: WorkItem, cancel: &JobCancel<'_>) -> DeliveryOutcome {
        let policy = self.registry.get_or_create(item.destination_id());

        loop {
            let error = match self.attempt(&policy, &item, cancel).await {
                AttemptResult::Delivered(status) => {
                    info!(
                        work_item_id = %item.id,
                        destination_id = %item.destination_id(),
                        attempt = item.wire_attempt(),
                        status_code = status,
                        "Webhook delivered"
                    );
                    run_hook("on_success", &item, self.hooks.on_success(&item, status)).await;
                    return DeliveryOutcome::Delivered { status };
                }
                AttemptResult::Gone => {
                    warn!(
                        work_item_id = %item.id,
                        destination_id = %item.destination_id(),
                        attempt = item.wire_attempt(),
                        "Destination gone (410), not retrying"
                    );
                    run_hook("on_gone", &item, self.hooks.on_gone(&item)).await;
                    return DeliveryOutcome::Gone;
                }
                AttemptResult::Cancelled => {
                    debug!(
                        work_item_id = %item.id,
                        destination_id = %item.destination_id(),
                        attempt = item.wire_attempt(),
                        "Delivery cancelled"
                    );
                    return DeliveryOutcome::Abandoned;
                }
                AttemptResult::Failed(error) => error,
            };

            let retry_delay = if error.is_retryable() {
                self.config.retry.next_delay(item.attempt)
            } else {
                None
            };

            let Some(delay) = retry_delay else {
                let error = if error.is_retryable() {
                    SenderError::DeliveryFailed {
                        attempts: item.wire_attempt(),
                        reason: error.to_string(),
                    }
                } else {
                    error
                };

                warn!(
                    work_item_id = %item.id,
                    destination_id = %item.destination_id(),
                    attempt = item.wire_attempt(),
                    error = %error,
                    "Webhook delivery failed"
                );
                run_hook("on_failure", &item, self.hooks.on_failure(&item, &error)).await;
                return DeliveryOutcome::Failed(error);
            };

            info!(
                work_item_id = %item.id,
                destination_id = %item.destination_id(),
                attempt = item.wire_attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Scheduling webhook retry"
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            sender_metrics::record_retry_scheduled();
            run_hook("on_retry", &item, self.hooks.on_retry(&item, delay, &error)).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(work_item_id = %item.id, "Delivery cancelled during backoff");
                    return DeliveryOutcome::Abandoned;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            item.attempt += 1;
        }
    }

    /// One gated, timed HTTP attempt. The permit is held only for its duration.
    async fn attempt(&self, policy: &DestinationPolicy, item: &WorkItem, cancel: &JobCancel<'_>) -> AttemptResult {
        if cancel.is_cancelled() {
            return AttemptResult::Cancelled;
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptResult::Cancelled,
            permit = self.semaphore.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return AttemptResult::Failed(SenderError::ShutdownInProgress),
            },
        };

        // Dropping `gate` on any early return abandons the use
        let gate = match policy.begin_use() {
            Ok(gate) => gate,
            Err(e) => {
                debug!(
                    work_item_id = %item.id,
                    destination_id = %item.destination_id(),
                    "Circuit open, rejecting attempt"
                );
                self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                sender_metrics::record_circuit_rejection();
                return AttemptResult::Failed(e);
            }
        };

        let request = match self.builder.build(item) {
            Ok(r) => r,
            Err(e) => return AttemptResult::Failed(e),
        };

        run_hook("on_attempt", item, self.hooks.on_attempt(item)).await;
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let timeout = self.config.request_timeout;
        let send = tokio::time::timeout(timeout, request.into_reqwest(&self.client).send());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptResult::Cancelled,
            response = send => response,
        };

        let result = match response {
            Err(_) => {
                gate.failed();
                AttemptResult::Failed(SenderError::Timeout(timeout))
            }
            Ok(Err(e)) if e.is_timeout() => {
                gate.failed();
                AttemptResult::Failed(SenderError::Timeout(timeout))
            }
            Ok(Err(e)) => {
                gate.failed();
                AttemptResult::Failed(SenderError::TransientNetwork(e.to_string()))
            }
            Ok(Ok(response)) => {
                let status = response.status();
                let code = status.as_u16();
                debug!(
                    work_item_id = %item.id,
                    destination_id = %item.destination_id(),
                    status_code = code,
                    "Webhook response"
                );

                if status.is_success() {
                    gate.succeeded();
                    AttemptResult::Delivered(code)
                } else if code == 410 {
                    // Says nothing about destination health
                    drop(gate);
                    AttemptResult::Gone
                } else if status.is_server_error() || code == 408 || code == 429 {
                    gate.failed();
                    AttemptResult::Failed(SenderError::TransientStatus(code))
                } else {
                    gate.failed();
                    AttemptResult::Failed(SenderError::UnexpectedStatus(code))
                }
            }
        };

        let label = match &result {
            AttemptResult::Delivered(_) => "success",
            AttemptResult::Gone => "gone",
            AttemptResult::Failed(e) => e.kind(),
            AttemptResult::Cancelled => "cancelled",
        };
        sender_metrics::record_attempt(label, start.elapsed());

        result
    }
}
