use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by directory enumeration.
///
/// Every variant maps to an errno through [`StreamError::errno`] so the
/// protocol layer can answer the kernel directly.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot open directory {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reading directory records failed: {0}")]
    Read(#[source] io::Error),

    #[error("malformed directory record at offset {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: &'static str },
}

impl StreamError {
    /// errno equivalent of this error. I/O errors keep their OS code;
    /// anything without one is `EIO`.
    pub fn errno(&self) -> i32 {
        match self {
            StreamError::Open { source, .. } | StreamError::Read(source) => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            StreamError::MalformedRecord { .. } => libc::EIO,
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
