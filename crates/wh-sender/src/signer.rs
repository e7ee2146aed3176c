//! HMAC-SHA256 body signing.
//!
//! The signature covers the exact bytes sent as the request body and is
//! rendered as `sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SenderError;
use crate::Result;

/// Default header carrying the body signature
pub const SIGNATURE_HEADER: &str = "ms-signature";

/// Algorithm tag prefixed to the hex digest
pub const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Sign `body` with `secret`, returning the header value.
///
/// Fails with [`SenderError::InvalidSecret`] on an empty secret; never fails on
/// body content.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    if secret.is_empty() {
        return Err(SenderError::InvalidSecret("secret is empty".to_string()));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SenderError::InvalidSecret(e.to_string()))?;
    mac.update(body);

    Ok(format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes())))
}
