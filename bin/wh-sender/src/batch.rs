//! Batch file loading
//!
//! A batch file is a JSON array of entries:
//!
//! ```json
//! [{"destinationId": "orders", "notifications": [{"eventType": "order.created", "orderId": 7}]}]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use wh_sender::{Destination, Notification, WorkItem};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub destination_id: String,
    /// Work item id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

pub async fn load_entries(path: &Path) -> Result<Vec<BatchEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read batch file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse batch file {}", path.display()))
}

/// Resolve entries against the registered destinations
pub fn into_work_items(entries: Vec<BatchEntry>, destinations: Vec<Destination>) -> Result<Vec<WorkItem>> {
    let by_id: HashMap<String, Arc<Destination>> = destinations
        .into_iter()
        .map(|d| (d.id.clone(), Arc::new(d)))
        .collect();

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(destination) = by_id.get(&entry.destination_id) else {
            bail!("batch references unknown destination {}", entry.destination_id);
        };

        let mut item = WorkItem::new(Arc::clone(destination), entry.notifications)
            .with_properties(entry.properties);
        if let Some(id) = entry.id {
            item = item.with_id(id);
        }
        items.push(item);
    }

    Ok(items)
}
