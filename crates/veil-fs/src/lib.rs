//! Veil directory streams
//!
//! Reads packed `linux_dirent64` records from a directory descriptor,
//! rebuilds entries over a bounds-checked cursor, and drops every entry
//! whose sidecar policy does not grant read to the acting process.

pub mod error;
pub mod record;
pub mod source;
pub mod stream;

pub use error::{StreamError, StreamResult};
pub use record::{DirEntry, RawRecord, RecordCursor};
#[cfg(target_os = "linux")]
pub use source::KernelDirectory;
pub use source::RawDirectory;
pub use stream::{DirStream, PolicyDirStream, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
