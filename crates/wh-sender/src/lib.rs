//! WebHooks Delivery Engine
//!
//! Turns batches of notifications into signed HTTP POSTs and delivers them
//! with retries and per-destination circuit breaking:
//! - Signer: HMAC-SHA256 over the exact body bytes (`sha256=<hex>`)
//! - RequestBuilder: wire payload, signature header, custom headers
//! - DestinationPolicy: per-destination circuit breaker state machine
//! - PolicyRegistry: lazily created policies keyed by destination id
//! - WebhookDispatcher: bounded-concurrency pool with retry and backoff
//! - PolicySweeper: drops idle policies and disables long-failing destinations
//! - DeliveryHooks: per-outcome callbacks for observability and tests

pub mod backoff;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod policy;
pub mod registry;
pub mod request;
pub mod sender_metrics;
pub mod signer;
pub mod store;
pub mod sweeper;

pub use backoff::{Backoff, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DeliveryOutcome, DispatcherConfig, DispatcherStats, WebhookDispatcher};
pub use error::SenderError;
pub use hooks::{DeliveryHooks, NoopHooks};
pub use policy::{CircuitState, DestinationPolicy, PolicyConfig, PolicySnapshot, PolicyUse};
pub use registry::PolicyRegistry;
pub use request::{RequestBuilder, WebhookRequest};
pub use signer::{sign, SIGNATURE_HEADER};
pub use store::RegistrationStore;
pub use sweeper::{PolicySweeper, SweepReport, SweeperConfig};

// Re-export the data model so callers need only this crate
pub use wh_common::{Destination, Notification, WorkItem};

pub type Result<T> = std::result::Result<T, SenderError>;
