//! Request authentication.
//!
//! Two accepted credentials: `X-API-Key: <shared secret>` or
//! `X-Webhook-Signature: sha256=<hex(HMAC-SHA256(secret, body))>`. Both
//! comparisons are constant time. Signature verification buffers the body
//! once and reassembles the request for downstream extractors.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::utils::ApiError;

type HmacSha256 = Hmac<Sha256>;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AuthState {
    pub api_key: String,
    pub webhook_secret: String,
}

impl AuthState {
    /// With neither credential configured the API runs open (development
    /// mode); `Config::validate` already warned about it.
    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty() || !self.webhook_secret.is_empty()
    }
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.is_enabled() {
        return Ok(next.run(req).await);
    }

    // Fast path: shared API key
    if let Some(provided) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !state.api_key.is_empty() && constant_time_eq(provided.as_bytes(), state.api_key.as_bytes())
        {
            return Ok(next.run(req).await);
        }
        tracing::warn!("Invalid API key for {} {}", req.method(), req.uri().path());
        return Err(ApiError::unauthorized("Invalid API key"));
    }

    // HMAC body signature
    let signature = req
        .headers()
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(signature) = signature else {
        tracing::warn!("Missing credentials for {} {}", req.method(), req.uri().path());
        return Err(ApiError::unauthorized("Missing X-API-Key or X-Webhook-Signature"));
    };

    if state.webhook_secret.is_empty() {
        return Err(ApiError::unauthorized("Signature auth not configured"));
    }

    let (parts, body) = req.into_parts();
    let body_bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::bad_request("Unable to read request body"))?;

    if !verify_signature(&state.webhook_secret, &body_bytes, &signature) {
        tracing::warn!("Invalid signature for {} {}", parts.method, parts.uri.path());
        return Err(ApiError::unauthorized("Invalid signature"));
    }

    let req = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(req).await)
}

/// Expected format: `sha256=<hex digest>`.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    constant_time_eq(&provided, &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let secret = "webhook-secret";
        let body = br#"{"job_id": "abc"}"#;
        let header = sign(secret, body);
        assert!(verify_signature(secret, body, &header));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let secret = "webhook-secret";
        let header = sign(secret, b"original");
        assert!(!verify_signature(secret, b"tampered", &header));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign("secret-a", b"body");
        assert!(!verify_signature("secret-b", b"body", &header));
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(!verify_signature("s", b"body", "md5=abcd"));
        assert!(!verify_signature("s", b"body", "sha256=not-hex"));
        assert!(!verify_signature("s", b"body", ""));
    }

    #[test]
    fn test_constant_time_eq_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"abc", b"abd"));
    }
}
