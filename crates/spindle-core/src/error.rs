//! Error taxonomy shared by every spindle crate.

use std::fmt;
use std::path::PathBuf;

/// Accelerator failures. Always fatal for the run; nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device {device} init failed: {msg}")]
    Init { device: usize, msg: String },

    #[error("device {device} allocation of {bytes} bytes failed: {msg}")]
    Alloc { device: usize, bytes: usize, msg: String },

    #[error("device {device} copy failed: {msg}")]
    Copy { device: usize, msg: String },

    #[error("device {device} kernel '{kernel}' failed: {msg}")]
    Launch { device: usize, kernel: String, msg: String },

    #[error("device {device} synchronization failed: {msg}")]
    Sync { device: usize, msg: String },

    #[error("device {device} graph capture failed: {msg}")]
    Capture { device: usize, msg: String },
}

/// Coarse class of a [`SpindleError`], used for reporting and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Io,
    Device,
    Data,
}

impl ErrorCategory {
    /// Whether errors of this class terminate the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCategory::Data)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Device => write!(f, "device"),
            ErrorCategory::Data => write!(f, "data"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpindleError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{mismatches} of {total} predictions differ from the golden reference")]
    Data { mismatches: usize, total: usize },
}

impl SpindleError {
    pub fn config(msg: impl Into<String>) -> Self {
        SpindleError::Config(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpindleError::Io { path: path.into(), source }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SpindleError::Malformed { path: path.into(), reason: reason.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SpindleError::Config(_) => ErrorCategory::Config,
            SpindleError::Io { .. } | SpindleError::Malformed { .. } => ErrorCategory::Io,
            SpindleError::Device(_) => ErrorCategory::Device,
            SpindleError::Data { .. } => ErrorCategory::Data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(SpindleError::config("x").category(), ErrorCategory::Config);
        assert_eq!(
            SpindleError::malformed("/tmp/w.b", "truncated").category(),
            ErrorCategory::Io
        );
        let dev: SpindleError = DeviceError::Sync { device: 1, msg: "lost".into() }.into();
        assert_eq!(dev.category(), ErrorCategory::Device);
        assert!(dev.category().is_fatal());
        assert!(!SpindleError::Data { mismatches: 1, total: 4 }.category().is_fatal());
    }

    #[test]
    fn test_display() {
        let err = DeviceError::Launch { device: 0, kernel: "sparse_layer".into(), msg: "oob".into() };
        assert_eq!(err.to_string(), "device 0 kernel 'sparse_layer' failed: oob");
        let err = SpindleError::Data { mismatches: 2, total: 10 };
        assert_eq!(err.to_string(), "2 of 10 predictions differ from the golden reference");
    }
}
