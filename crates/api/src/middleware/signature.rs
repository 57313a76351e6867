//! Provider request signing (`X-Twilio-Signature`).
//!
//! The signature is base64(HMAC-SHA1(auth_token, url + each form param as key+value,
//! sorted by key)), where `url` is the full public URL the provider called.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use herald_common::error::AppError;

use crate::state::AppState;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Callback bodies are a handful of short fields.
const MAX_SIGNED_BODY: usize = 64 * 1024;

fn signing_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload
}

fn mac_for(auth_token: &str, url: &str, params: &[(String, String)]) -> Option<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(signing_payload(url, params).as_bytes());
    Some(mac)
}

/// Signature the provider would send for this request.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> Option<String> {
    let mac = mac_for(auth_token, url, params)?;
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature.
pub fn is_valid_signature(
    auth_token: &str,
    url: &str,
    params: &[(String, String)],
    signature: &str,
) -> bool {
    let Ok(received) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    mac_for(auth_token, url, params).is_some_and(|mac| mac.verify_slice(&received).is_ok())
}

/// Reject callbacks whose signature does not match `PUBLIC_BASE_URL` + path + query.
pub async fn verify_provider_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_token = state
        .config
        .twilio_auth_token
        .clone()
        .ok_or_else(|| AppError::Config("TWILIO_AUTH_TOKEN is required to verify callbacks".to_string()))?;

    let signature = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| AppError::Forbidden("Missing provider signature".to_string()))?;

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_SIGNED_BODY)
        .await
        .map_err(|e| AppError::Validation(format!("Unreadable callback body: {}", e)))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}{}",
        state.config.public_base_url.trim_end_matches('/'),
        path_and_query
    );
    let params: Vec<(String, String)> = url::form_urlencoded::parse(&bytes).into_owned().collect();

    if !is_valid_signature(&auth_token, &url, &params, &signature) {
        tracing::warn!(url = %url, "Rejected callback with invalid provider signature");
        return Err(AppError::Forbidden("Invalid provider signature".to_string()));
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<(String, String)> {
        vec![
            ("MessageStatus".to_string(), "delivered".to_string()),
            ("MessageSid".to_string(), "SM123".to_string()),
            ("To".to_string(), "+15550001".to_string()),
        ]
    }

    #[test]
    fn test_payload_sorts_params_by_key() {
        let payload = signing_payload("https://x.test/callback?notification_id=1", &params());
        assert_eq!(
            payload,
            "https://x.test/callback?notification_id=1MessageSidSM123MessageStatusdeliveredTo+15550001"
        );
    }

    #[test]
    fn test_signature_round_trip() {
        let url = "https://x.test/callback?notification_id=1";
        let sig = compute_signature("secret", url, &params()).unwrap();
        assert!(is_valid_signature("secret", url, &params(), &sig));
    }

    #[test]
    fn test_param_order_does_not_matter() {
        let url = "https://x.test/callback";
        let mut reversed = params();
        reversed.reverse();
        assert_eq!(
            compute_signature("secret", url, &params()),
            compute_signature("secret", url, &reversed)
        );
    }

    #[test]
    fn test_tampering_is_detected() {
        let url = "https://x.test/callback?notification_id=1";
        let sig = compute_signature("secret", url, &params()).unwrap();

        let mut tampered = params();
        tampered[0].1 = "failed".to_string();
        assert!(!is_valid_signature("secret", url, &tampered, &sig));
        assert!(!is_valid_signature("other", url, &params(), &sig));
        assert!(!is_valid_signature("secret", "https://x.test/callback?notification_id=2", &params(), &sig));
        assert!(!is_valid_signature("secret", url, &params(), "not base64!"));
    }
}
