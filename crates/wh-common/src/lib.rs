use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod logging;

// ============================================================================
// Registration Types
// ============================================================================

/// A registered delivery target.
///
/// Owned by the registration store; the delivery engine only ever holds a
/// read-only snapshot per work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: String,
    pub uri: String,
    /// Signing secret for the HMAC-SHA256 body signature
    pub secret: String,
    /// Extra request headers, sent in insertion order
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub is_paused: bool,
}

impl Destination {
    pub fn new(id: impl Into<String>, uri: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            secret: secret.into(),
            headers: IndexMap::new(),
            is_paused: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn paused(mut self) -> Self {
        self.is_paused = true;
        self
    }
}

// ============================================================================
// Notification Types
// ============================================================================

/// A single event occurrence.
///
/// Serializes as `{"eventType": "...", ...event fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event_type: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Notification {
    /// Create a notification from any serializable event payload.
    ///
    /// Object payloads are flattened next to `eventType`; anything else is
    /// nested under a `data` field.
    pub fn new<T: Serialize>(event_type: impl Into<String>, data: T) -> Result<Self, serde_json::Error> {
        let data = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        Ok(Self {
            event_type: event_type.into(),
            data,
        })
    }

    /// Notification with no event-specific fields
    pub fn empty(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
        }
    }
}

// ============================================================================
// Work Items
// ============================================================================

/// One delivery task bundling notifications for one destination.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub destination: Arc<Destination>,
    pub notifications: Vec<Notification>,
    /// Zero-based attempt counter, incremented on each retry
    pub attempt: u32,
    /// Opaque side-channel, forwarded on the wire but never interpreted
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(destination: Arc<Destination>, notifications: Vec<Notification>) -> Self {
        Self {
            id: generate_work_item_id(),
            destination,
            notifications,
            attempt: 0,
            properties: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.id = id;
        }
        self
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn destination_id(&self) -> &str {
        &self.destination.id
    }

    /// 1-based attempt number as sent on the wire
    pub fn wire_attempt(&self) -> u32 {
        self.attempt + 1
    }
}

/// Generate an opaque work item id (32 lowercase hex chars, no hyphens)
pub fn generate_work_item_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
