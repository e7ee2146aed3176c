//! Request Builder - turns a work item into a signed POST
//!
//! The body is serialized exactly once; the same bytes are signed and sent.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, warn};
use wh_common::{Destination, Notification, WorkItem};

use crate::error::SenderError;
use crate::signer::{self, SIGNATURE_HEADER};
use crate::Result;

/// Wire payload, one per attempt
#[derive(Serialize)]
struct WebhookBody<'a> {
    id: &'a str,
    attempt: u32,
    #[serde(skip_serializing_if = "is_empty_map")]
    properties: &'a Map<String, Value>,
    notifications: &'a [Notification],
}

fn is_empty_map(map: &&Map<String, Value>) -> bool {
    map.is_empty()
}

/// A fully assembled delivery request
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn signature<'a>(&'a self, header: &HeaderName) -> Option<&'a str> {
        self.headers.get(header).and_then(|v| v.to_str().ok())
    }

    pub fn into_reqwest(&self, client: &Client) -> reqwest::RequestBuilder {
        client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(self.body.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RequestBuilder {
    signature_header: HeaderName,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            signature_header: HeaderName::from_static(SIGNATURE_HEADER),
        }
    }

    /// Use a different signature header name
    pub fn with_signature_header(name: &str) -> Result<Self> {
        let signature_header = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| SenderError::Config(format!("invalid signature header '{}': {}", name, e)))?;
        Ok(Self { signature_header })
    }

    pub fn signature_header(&self) -> &HeaderName {
        &self.signature_header
    }

    /// Check that a destination can be delivered to at all
    pub fn validate(destination: &Destination) -> Result<Url> {
        if destination.uri.trim().is_empty() {
            return Err(SenderError::InvalidDestination {
                id: destination.id.clone(),
                reason: "uri is empty".to_string(),
            });
        }

        let url = Url::parse(destination.uri.trim()).map_err(|e| SenderError::InvalidDestination {
            id: destination.id.clone(),
            reason: format!("uri is not a valid URL: {}", e),
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SenderError::InvalidDestination {
                id: destination.id.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if destination.secret.is_empty() {
            return Err(SenderError::InvalidSecret(destination.id.clone()));
        }

        Ok(url)
    }

    /// Validate a whole work item before it is accepted
    pub fn validate_item(item: &WorkItem) -> Result<()> {
        Self::validate(&item.destination)?;
        if item.notifications.is_empty() {
            return Err(SenderError::InvalidWorkItem {
                id: item.id.clone(),
                reason: "no notifications".to_string(),
            });
        }
        Ok(())
    }

    pub fn build(&self, item: &WorkItem) -> Result<WebhookRequest> {
        let destination = &item.destination;
        let url = Self::validate(destination)?;

        let body = serde_json::to_vec(&WebhookBody {
            id: &item.id,
            attempt: item.wire_attempt(),
            properties: &item.properties,
            notifications: &item.notifications,
        })?;

        let signature = signer::sign(&destination.secret, &body)
            .map_err(|_| SenderError::InvalidSecret(destination.id.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            self.signature_header.clone(),
            HeaderValue::from_str(&signature).map_err(|e| SenderError::Config(e.to_string()))?,
        );

        for (name, value) in &destination.headers {
            let header_name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(n) => n,
                Err(_) => {
                    error!(
                        destination_id = %destination.id,
                        header = %name,
                        "Invalid header name, dropping"
                    );
                    continue;
                }
            };

            if header_name == CONTENT_TYPE || header_name == self.signature_header {
                warn!(
                    destination_id = %destination.id,
                    header = %name,
                    "Custom header collides with a reserved header, dropping"
                );
                continue;
            }

            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.append(header_name, v);
                }
                Err(_) => {
                    error!(
                        destination_id = %destination.id,
                        header = %name,
                        "Invalid header value, dropping"
                    );
                }
            }
        }

        Ok(WebhookRequest {
            url,
            headers,
            body: Bytes::from(body),
        })
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
