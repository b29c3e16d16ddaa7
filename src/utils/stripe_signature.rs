use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed webhook timestamp.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header has no timestamp")]
    MissingTimestamp,
    #[error("signature header has no v1 signature")]
    MissingSignature,
    #[error("signature timestamp is not an integer")]
    InvalidTimestamp,
    #[error("payload is not valid utf-8")]
    Encoding,
    #[error("no signature matches the expected signature for payload")]
    Mismatch,
    #[error("timestamp outside the tolerance zone")]
    Expired,
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, SignatureError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = Some(value),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp
        .ok_or(SignatureError::MissingTimestamp)?
        .parse::<i64>()
        .map_err(|_| SignatureError::InvalidTimestamp)?;
    if signatures.is_empty() {
        return Err(SignatureError::MissingSignature);
    }

    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>]`) over the
/// raw request body. `now` is unix seconds.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let parsed = parse_header(header)?;
    let payload = std::str::from_utf8(payload).map_err(|_| SignatureError::Encoding)?;
    let expected = compute_signature(secret, parsed.timestamp, payload);

    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    if now.abs_diff(parsed.timestamp) > tolerance_secs.max(0) as u64 {
        return Err(SignatureError::Expired);
    }

    Ok(())
}

/// Builds a header the way the processor would. Used by tests and local tooling.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)
    )
}
