//! Compact JWS tokens signed with ES512.
//!
//! Format: `base64url(header) . base64url(claims) . base64url(r || s)` with
//! no padding. The header is always `{"alg":"ES512","typ":"JWT"}` and
//! verification accepts no other algorithm.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p521::ecdsa::signature::{Signer, Verifier};
use p521::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use veil_core::now_secs;

use crate::error::{CredError, CredResult};

/// The only signature algorithm issued or accepted.
pub const ALGORITHM: &str = "ES512";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Sign an arbitrary JSON claim set.
pub fn sign_claims(key: &SigningKey, claims: &Value) -> CredResult<String> {
    if !claims.is_object() {
        return Err(CredError::InvalidClaims("claims must be a JSON object".into()));
    }
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: Some("JWT".to_string()),
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| CredError::EncodingFailed(e.to_string()))?;
    let claims_json =
        serde_json::to_vec(claims).map_err(|e| CredError::EncodingFailed(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let signature: Signature = key
        .try_sign(signing_input.as_bytes())
        .map_err(|_| CredError::SigningFailed)?;

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Verify `token` against `key` at the current time.
pub fn verify(key: &VerifyingKey, token: &str) -> CredResult<Value> {
    verify_at(key, token, now_secs())
}

/// Verify `token` against `key` as of `now` (seconds since the epoch).
///
/// Checks, in order: structure, algorithm pinning, signature, `exp`, `nbf`.
/// Returns the claim set on success.
pub fn verify_at(key: &VerifyingKey, token: &str, now: i64) -> CredResult<Value> {
    let parts = split(token)?;

    let header: Header = decode_json(parts.header, "header")?;
    if header.alg != ALGORITHM {
        return Err(CredError::AlgorithmNotAllowed(header.alg));
    }

    let signature_bytes = decode_segment(parts.signature, "signature")?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| CredError::SignatureInvalid)?;
    key.verify(parts.signing_input.as_bytes(), &signature)
        .map_err(|_| CredError::SignatureInvalid)?;

    let claims: Value = decode_json(parts.claims, "claims")?;
    let obj = claims
        .as_object()
        .ok_or_else(|| CredError::MalformedToken("claims are not a JSON object".into()))?;

    if let Some(exp) = time_claim(obj, "exp")? {
        if now > exp {
            return Err(CredError::TokenExpired { exp, now });
        }
    }
    if let Some(nbf) = time_claim(obj, "nbf")? {
        if now < nbf {
            return Err(CredError::TokenNotYetValid { nbf, now });
        }
    }

    Ok(claims)
}

/// Decode the claim segment without checking anything.
///
/// Only for routing decisions such as picking the issuer key; never trust
/// the result before [`verify_at`] has accepted the token.
pub fn peek_claims(token: &str) -> CredResult<Value> {
    let parts = split(token)?;
    decode_json(parts.claims, "claims")
}

struct Parts<'a> {
    header: &'a str,
    claims: &'a str,
    signature: &'a str,
    signing_input: &'a str,
}

fn split(token: &str) -> CredResult<Parts<'_>> {
    let token = token.trim();
    let mut segments = token.split('.');
    let (header, claims, signature) = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => {
            return Err(CredError::MalformedToken(
                "expected three dot-separated segments".into(),
            ))
        }
    };
    if header.is_empty() || claims.is_empty() {
        return Err(CredError::MalformedToken("empty segment".into()));
    }
    let signing_input = &token[..header.len() + 1 + claims.len()];
    Ok(Parts {
        header,
        claims,
        signature,
        signing_input,
    })
}

fn decode_segment(segment: &str, what: &str) -> CredResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| CredError::MalformedToken(format!("{} is not base64url: {}", what, e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str, what: &str) -> CredResult<T> {
    let bytes = decode_segment(segment, what)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CredError::MalformedToken(format!("{} is not valid JSON: {}", what, e)))
}

fn time_claim(obj: &serde_json::Map<String, Value>, name: &str) -> CredResult<Option<i64>> {
    match obj.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| CredError::MalformedToken(format!("'{}' is not an integer", name))),
    }
}
