//! Pauses destinations that answer 410 Gone

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use wh_sender::{DeliveryHooks, RegistrationStore, WorkItem};

pub struct DisableOnGone {
    store: Arc<dyn RegistrationStore>,
}

impl DisableOnGone {
    pub fn new(store: Arc<dyn RegistrationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeliveryHooks for DisableOnGone {
    async fn on_gone(&self, item: &WorkItem) -> anyhow::Result<()> {
        info!(destination_id = %item.destination_id(), "Destination reported gone, pausing registration");
        self.store.disable_destination(item.destination_id()).await
    }
}
