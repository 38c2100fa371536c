//! Issuer keypairs on NIST P-521.
//!
//! A keypair lives on disk under one base name:
//!
//! ```text
//! <base>.priv      SEC1 "EC PRIVATE KEY" PEM, mode 0600
//! <base>.pub       SPKI "PUBLIC KEY" PEM, mode 0644
//! <base>.pub.jwk   JSON Web Key for publication, mode 0644
//! ```
//!
//! Every generated pair must survive a sign/verify round trip before any
//! file is written.

use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use p521::ecdsa::signature::{Signer, Verifier};
use p521::ecdsa::{Signature, SigningKey, VerifyingKey};
use p521::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{CredError, CredResult};

/// Fixed message signed and verified when a keypair is generated.
pub const PROBE_MESSAGE: &[u8] = b"This is a message to be signed and verified by ECDSA!";

/// `use` annotation written into exported JWKs.
pub const JWK_KEY_USE: &str = "sig";

/// `kid` written into exported JWKs. One issuer keypair per instance.
pub const JWK_KEY_ID: &str = "1";

const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_KEY_MODE: u32 = 0o644;

// ---------------------------------------------------------------------------
// KeyPaths: file naming convention for one keypair
// ---------------------------------------------------------------------------

/// The three artifacts belonging to one base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub private: PathBuf,
    pub public: PathBuf,
    pub jwk: PathBuf,
}

impl KeyPaths {
    pub fn for_base(base: &Path) -> Self {
        Self {
            private: with_suffix(base, ".priv"),
            public: with_suffix(base, ".pub"),
            jwk: with_suffix(base, ".pub.jwk"),
        }
    }
}

// `set_extension` would clobber dotted base names such as `issuer.v2`.
fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// IssuerKeys: a loaded signing keypair
// ---------------------------------------------------------------------------

/// A P-521 signing key together with its verifying key.
#[derive(Clone)]
pub struct IssuerKeys {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl std::fmt::Debug for IssuerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerKeys").finish_non_exhaustive()
    }
}

impl IssuerKeys {
    /// Fresh random keypair.
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::random(&mut OsRng))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let verifying = VerifyingKey::from(&signing);
        Self { signing, verifying }
    }

    fn from_secret(secret: &SecretKey) -> CredResult<Self> {
        SigningKey::from_bytes(&secret.to_bytes())
            .map(Self::from_signing)
            .map_err(|_| CredError::InvalidPem("EC private key scalar out of range".into()))
    }

    /// Decode a PEM pair and check that the halves belong together.
    pub fn from_pem(private_pem: &str, public_pem: &str) -> CredResult<Self> {
        let secret = SecretKey::from_sec1_pem(private_pem)
            .map_err(|_| CredError::InvalidPem("unable to parse EC private key".into()))?;
        let public = parse_public_pem(public_pem)?;
        if secret.public_key() != public {
            return Err(CredError::KeyMismatch);
        }
        Self::from_secret(&secret)
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    pub fn public_key(&self) -> CredResult<PublicKey> {
        PublicKey::from_affine(*self.verifying.as_affine())
            .map_err(|_| CredError::EncodingFailed("public key is the identity point".into()))
    }

    /// SEC1 PEM encoding of the private half.
    pub fn private_pem(&self) -> CredResult<Zeroizing<String>> {
        let secret = SecretKey::from_bytes(&self.signing.to_bytes())
            .map_err(|_| CredError::EncodingFailed("private key".into()))?;
        secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|_| CredError::EncodingFailed("private key PEM".into()))
    }

    /// SPKI PEM encoding of the public half.
    pub fn public_pem(&self) -> CredResult<String> {
        self.public_key()?
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| CredError::EncodingFailed("public key PEM".into()))
    }

    /// Sign the probe message and verify it with the public half.
    pub fn self_test(&self) -> CredResult<()> {
        let signature: Signature = self
            .signing
            .try_sign(PROBE_MESSAGE)
            .map_err(|_| CredError::SigningFailed)?;
        self.verifying
            .verify(PROBE_MESSAGE, &signature)
            .map_err(|_| CredError::KeygenSelfTestFailed)
    }
}

// ---------------------------------------------------------------------------
// Generation, loading and export
// ---------------------------------------------------------------------------

/// Generate a keypair and write `<base>.priv`, `<base>.pub` and
/// `<base>.pub.jwk`.
///
/// The PEM encodings are decoded again and put through [`IssuerKeys::self_test`]
/// before anything touches the filesystem; a pair that cannot round-trip is
/// never written.
pub fn generate_keypair(base: &Path) -> CredResult<KeyPaths> {
    let generated = IssuerKeys::generate();
    let private_pem = generated.private_pem()?;
    let public_pem = generated.public_pem()?;

    let reloaded = IssuerKeys::from_pem(&private_pem, &public_pem)?;
    reloaded.self_test()?;
    debug!(base = %base.display(), "keypair passed self-test");

    let paths = KeyPaths::for_base(base);
    write_key_file(&paths.public, public_pem.as_bytes(), PUBLIC_KEY_MODE)?;
    write_key_file(&paths.private, private_pem.as_bytes(), PRIVATE_KEY_MODE)?;
    write_jwk(&reloaded.public_key()?, &paths.jwk)?;

    info!(
        private = %paths.private.display(),
        public = %paths.public.display(),
        jwk = %paths.jwk.display(),
        "issuer keypair written"
    );
    Ok(paths)
}

/// Load both halves of the keypair named by `base`.
pub fn load_keypair(base: &Path) -> CredResult<IssuerKeys> {
    let paths = KeyPaths::for_base(base);
    let private_pem = Zeroizing::new(read_key_file(base, &paths.private)?);
    let public_pem = read_key_file(base, &paths.public)?;
    IssuerKeys::from_pem(&private_pem, &public_pem)
}

/// Load only `<base>.pub`, as a verifying key.
pub fn load_public_key(base: &Path) -> CredResult<VerifyingKey> {
    let paths = KeyPaths::for_base(base);
    let public_pem = read_key_file(base, &paths.public)?;
    let public = parse_public_pem(&public_pem)?;
    VerifyingKey::from_affine(*public.as_affine())
        .map_err(|_| CredError::InvalidPem("public key is the identity point".into()))
}

/// Convert a PEM public key file into a JWK file at `dest`.
pub fn export_public_key(public_pem_path: &Path, dest: &Path) -> CredResult<()> {
    let public_pem = fs::read_to_string(public_pem_path).map_err(|source| {
        CredError::KeyFileUnreadable {
            issuer: issuer_label(public_pem_path),
            path: public_pem_path.to_path_buf(),
            source,
        }
    })?;
    let public = parse_public_pem(&public_pem)?;
    write_jwk(&public, dest)
}

/// JWK publication document for `public`, tagged with the fixed key use
/// and key id.
pub fn public_key_jwk(public: &PublicKey) -> CredResult<serde_json::Value> {
    let mut jwk = serde_json::to_value(public.to_jwk())
        .map_err(|e| CredError::EncodingFailed(format!("jwk: {}", e)))?;
    let obj = jwk
        .as_object_mut()
        .ok_or_else(|| CredError::EncodingFailed("jwk is not a JSON object".into()))?;
    obj.insert("use".into(), JWK_KEY_USE.into());
    obj.insert("kid".into(), JWK_KEY_ID.into());
    Ok(jwk)
}

fn parse_public_pem(pem: &str) -> CredResult<PublicKey> {
    PublicKey::from_public_key_pem(pem)
        .map_err(|_| CredError::InvalidPem("unable to parse EC public key".into()))
}

fn write_jwk(public: &PublicKey, dest: &Path) -> CredResult<()> {
    let jwk = public_key_jwk(public)?;
    let bytes = serde_json::to_vec_pretty(&jwk)
        .map_err(|e| CredError::EncodingFailed(format!("jwk: {}", e)))?;
    write_key_file(dest, &bytes, PUBLIC_KEY_MODE)
}

fn read_key_file(base: &Path, path: &Path) -> CredResult<String> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            CredError::KeyFileMissing {
                issuer: issuer_label(base),
                path: path.to_path_buf(),
            }
        } else {
            CredError::KeyFileUnreadable {
                issuer: issuer_label(base),
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn issuer_label(base: &Path) -> String {
    base.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| base.display().to_string())
}

fn write_key_file(path: &Path, contents: &[u8], mode: u32) -> CredResult<()> {
    let write_err = |source| CredError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(path).map_err(write_err)?;
    file.write_all(contents).map_err(write_err)?;

    // `mode` only applies on creation; tighten files that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(write_err)?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
