//! Issuer-level operations: sign claims as a named issuer, authenticate a
//! token against the issuer it names.

use std::path::Path;

use veil_core::{now_secs, IdentityClaims};

use crate::error::{CredError, CredResult};
use crate::keys::{load_keypair, load_public_key, IssuerKeys};
use crate::token::{peek_claims, sign_claims, verify_at};

/// Lifetime of a freshly signed token, in seconds.
pub const VALIDITY_WINDOW_SECS: i64 = 2 * 60 * 60;

/// Sign `claims_json` with the keypair at `issuer_base`.
///
/// `exp` is overwritten with now plus [`VALIDITY_WINDOW_SECS`] and `iss`
/// with the file name of `issuer_base`, whatever the input said.
pub fn sign(issuer_base: &Path, claims_json: &str) -> CredResult<String> {
    sign_at(issuer_base, claims_json, now_secs())
}

/// [`sign`] with an explicit issuance instant.
pub fn sign_at(issuer_base: &Path, claims_json: &str, now: i64) -> CredResult<String> {
    let issuer = issuer_name_of(issuer_base)?;
    let keys = load_keypair(issuer_base)?;
    sign_with_keys(&keys, &issuer, claims_json, now)
}

/// Stamp and sign claims with already-loaded keys.
pub fn sign_with_keys(
    keys: &IssuerKeys,
    issuer: &str,
    claims_json: &str,
    now: i64,
) -> CredResult<String> {
    let mut claims = IdentityClaims::from_json(claims_json)?;
    claims.exp = Some(now + VALIDITY_WINDOW_SECS);
    claims.iss = Some(issuer.to_string());
    sign_claims(keys.signing_key(), &claims.to_value()?)
}

/// Verify `token` against `<keys_dir>/<issuer>.pub` at the current time.
pub fn authenticate(keys_dir: &Path, issuer: &str, token: &str) -> CredResult<IdentityClaims> {
    authenticate_at(keys_dir, issuer, token, now_secs())
}

/// [`authenticate`] with an explicit clock.
pub fn authenticate_at(
    keys_dir: &Path,
    issuer: &str,
    token: &str,
    now: i64,
) -> CredResult<IdentityClaims> {
    validate_issuer_name(issuer)?;
    let public = load_public_key(&keys_dir.join(issuer))?;
    let claims = verify_at(&public, token, now)?;
    Ok(IdentityClaims::from_value(claims)?)
}

/// The issuer a token claims to come from. Unverified; only good for
/// choosing which key to verify with.
pub fn find_issuer(token: &str) -> CredResult<String> {
    let claims = peek_claims(token)?;
    let issuer = claims
        .get("iss")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CredError::InvalidClaims("token has no 'iss' claim".into()))?;
    validate_issuer_name(issuer)?;
    Ok(issuer.to_string())
}

/// Issuer names are file stems inside the keys directory. Anything that
/// could escape it is refused.
pub fn validate_issuer_name(name: &str) -> CredResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(CredError::InvalidIssuerName(name.to_string()));
    }
    Ok(())
}

fn issuer_name_of(base: &Path) -> CredResult<String> {
    let name = base
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CredError::InvalidIssuerName(base.display().to_string()))?;
    validate_issuer_name(name)?;
    Ok(name.to_string())
}
