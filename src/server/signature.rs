//! Webhook signature verification
//!
//! Deliveries are signed with HMAC-SHA256 over the raw request body and the
//! digest is sent as `X-Hub-Signature-256: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Why a delivery was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {SIGNATURE_HEADER} header")]
    MissingHeader,

    #[error("invalid signature prefix")]
    InvalidPrefix,

    #[error("invalid signature encoding")]
    InvalidEncoding,

    #[error("signature mismatch")]
    Mismatch,

    #[error("secret cannot be used as an HMAC key")]
    InvalidKey,
}

/// Check `header` against the HMAC of `body` under `secret`.
///
/// The digest comparison is constant-time.
///
/// # Examples
///
/// ```
/// use gh_pulse::server::signature::{sign, verify_signature};
///
/// let body = br#"{"zen":"Keep it logically awesome."}"#;
/// let header = sign(body, "s3cret").unwrap();
/// assert!(verify_signature(body, Some(&header), "s3cret").is_ok());
/// assert!(verify_signature(body, Some(&header), "other").is_err());
/// ```
pub fn verify_signature(
    body: &[u8],
    header: Option<&str>,
    secret: &str,
) -> Result<(), SignatureError> {
    let header = match header {
        Some(value) if !value.is_empty() => value,
        _ => return Err(SignatureError::MissingHeader),
    };
    let encoded = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::InvalidPrefix)?;
    let provided = hex::decode(encoded).map_err(|_| SignatureError::InvalidEncoding)?;

    let mut mac = keyed(secret)?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

/// Produce the header value for `body`, as a sender would.
pub fn sign(body: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = keyed(secret)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn keyed(secret: &str) -> Result<HmacSha256, SignatureError> {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)
}
