//! Veil Root Library
//!
//! Wires the subsystem crates together for the `veil` binary: the
//! configuration file, the process-wide identity directory, the policy
//! adapter every listing consults, and the control plane that binds
//! authenticated identities to process ids.
//!
//! # Architecture
//!
//! ```text
//! signed token ──► control plane ──► Credential Manager (verify)
//!                                      │
//!                                      ▼
//!                              Identity Directory ◄── Policy Adapter ◄── directory stream
//! ```
//!
//! The mount itself and the passthrough file operations belong to the
//! filesystem protocol layer; this crate only provides the pieces it calls.

pub mod config;
pub mod error;
pub mod http;

pub use config::{ControlConfig, ListingConfig, VeilConfig};
pub use error::{RootError, RootResult};

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use veil_core::{IdentityClaims, IdentityDirectory, Pid};
use veil_cred::CredResult;
use veil_policy::{CommandEngine, PolicyAdapter, PolicyEngine};

// ---------------------------------------------------------------------------
// Root state
// ---------------------------------------------------------------------------

/// Runtime state shared by the control plane and every directory stream.
pub struct VeilState {
    pub config: VeilConfig,
    pub identities: Arc<IdentityDirectory>,
    pub adapter: Arc<PolicyAdapter>,
}

impl std::fmt::Debug for VeilState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeilState")
            .field("config", &self.config)
            .field("bound_identities", &self.identities.len())
            .finish()
    }
}

impl VeilState {
    /// Verify `token` against the issuer key it names.
    ///
    /// The issuer is read from the unverified token only to pick
    /// `<keys_dir>/<iss>.pub`; everything returned has been verified.
    pub fn authenticate_token(&self, token: &str) -> CredResult<IdentityClaims> {
        let issuer = veil_cred::find_issuer(token)?;
        veil_cred::authenticate(&self.config.keys_dir, &issuer, token)
    }

    /// Record `claims` as the identity acting for `pid`.
    pub fn bind(&self, pid: Pid, claims: IdentityClaims) {
        info!(
            pid,
            sub = claims.subject().unwrap_or("-"),
            iss = claims.issuer().unwrap_or("-"),
            "identity bound"
        );
        self.identities.put(pid, claims);
    }

    /// Open a policy-gated listing of `dir` on behalf of `pid`.
    #[cfg(target_os = "linux")]
    pub fn open_listing(
        &self,
        dir: &std::path::Path,
        pid: Pid,
    ) -> RootResult<veil_fs::PolicyDirStream> {
        Ok(veil_fs::PolicyDirStream::open(
            dir,
            pid,
            Arc::clone(&self.adapter),
            self.config.listing.buffer_size,
        )?)
    }
}

/// Build the runtime state, evaluating policies with the configured
/// external engine.
pub fn initialize(config: VeilConfig) -> RootResult<VeilState> {
    let engine = Arc::new(
        CommandEngine::new(config.engine.clone()).with_deadline(config.policy.timeout()),
    );
    initialize_with_engine(config, engine)
}

/// Build the runtime state around a caller-supplied policy engine.
pub fn initialize_with_engine(
    config: VeilConfig,
    engine: Arc<dyn PolicyEngine>,
) -> RootResult<VeilState> {
    config.validate()?;

    info!(
        keys_dir = %config.keys_dir.display(),
        sidecar_prefix = %config.policy.sidecar_prefix,
        missing_policy = ?config.policy.missing_policy,
        "initializing veil"
    );

    let identities = Arc::new(IdentityDirectory::new());
    let adapter = Arc::new(PolicyAdapter::new(
        engine,
        Arc::clone(&identities),
        config.policy.clone(),
    ));
    Ok(VeilState {
        config,
        identities,
        adapter,
    })
}

/// Run the control plane on the configured loopback address until
/// `shutdown` resolves.
pub async fn serve_control_plane<F>(state: Arc<VeilState>, shutdown: F) -> RootResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state.config.control.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "control plane listening");

    let router = http::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("control plane stopped");
    Ok(())
}
