//! Veil core types
//!
//! Shared by every veil crate: the identity claims carried inside signed
//! tokens, and the process-wide directory that maps an operating-system
//! process id to the identity most recently authenticated for it.

pub mod claims;
pub mod directory;
pub mod error;

pub use claims::{now_secs, IdentityClaims, Pid};
pub use directory::IdentityDirectory;
pub use error::{CoreError, CoreResult};
