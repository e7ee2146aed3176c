//! Registration store seam.
//!
//! Registrations live outside the engine. The sweeper only needs to list them
//! and to disable one.

use async_trait::async_trait;
use wh_common::Destination;

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn list_destinations(&self) -> anyhow::Result<Vec<Destination>>;

    /// Pause a destination so no further work is accepted for it
    async fn disable_destination(&self, destination_id: &str) -> anyhow::Result<()>;
}
