//! Veil Credential Manager
//!
//! Issuer keypairs on NIST P-521, ES512-signed identity tokens in JWS
//! compact form, and JWK export of issuer public keys.
//!
//! Key material lives on disk by naming convention (`<issuer>.priv`,
//! `<issuer>.pub`, `<issuer>.pub.jwk`). Verification accepts exactly one
//! algorithm, ES512; tokens naming anything else are refused before the
//! signature is even looked at.

pub mod error;
pub mod issuer;
pub mod keys;
pub mod token;

pub use error::{CredError, CredResult};
pub use issuer::{
    authenticate, authenticate_at, find_issuer, sign, sign_at, sign_with_keys,
    validate_issuer_name, VALIDITY_WINDOW_SECS,
};
pub use keys::{
    export_public_key, generate_keypair, load_keypair, load_public_key, public_key_jwk,
    IssuerKeys, KeyPaths, PROBE_MESSAGE,
};
pub use token::{peek_claims, sign_claims, verify, verify_at, ALGORITHM};
