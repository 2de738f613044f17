//! Error types shared by the reader, builder and container codec.

use std::path::PathBuf;

/// Failure to decode an index file. Decoding never yields a partial result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("index file is truncated")]
    Truncated,
    #[error("index file has a bad magic number")]
    BadMagic,
    #[error("index format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("index file is corrupt: {0}")]
    Corrupt(String),
}

impl FormatError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        FormatError::Corrupt(reason.into())
    }
}

/// Coarse outcome of opening or writing an index, as seen by a compiler driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error occurred.
    None,
    /// No index was found.
    NotFound,
    /// Another process is currently building the index.
    Building,
    /// An unspecified I/O error reading or writing the index.
    IoError,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no global module index in {0}")]
    NotFound(PathBuf),
    #[error("global module index in {0} is being built by another process")]
    Building(PathBuf),
    #[error("i/o error on global module index: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid module file pattern: {0}")]
    Pattern(#[from] globset::Error),
}

impl IndexError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IndexError::NotFound(_) => ErrorCode::NotFound,
            IndexError::Building(_) => ErrorCode::Building,
            IndexError::Io(_)
            | IndexError::Format(_)
            | IndexError::Publish { .. }
            | IndexError::Pattern(_) => ErrorCode::IoError,
        }
    }

    /// Whether the caller should recover by building a fresh index.
    pub fn should_rebuild(&self) -> bool {
        matches!(self, IndexError::NotFound(_) | IndexError::Format(_))
    }

    /// `Building` is transient; the caller may retry or proceed without the index.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Building(_))
    }
}

/// Failure to extract names from a single module file.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to read module file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse module file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let dir = PathBuf::from("/cache");
        assert_eq!(IndexError::NotFound(dir.clone()).code(), ErrorCode::NotFound);
        assert_eq!(IndexError::Building(dir).code(), ErrorCode::Building);
        assert_eq!(
            IndexError::Format(FormatError::BadMagic).code(),
            ErrorCode::IoError
        );
    }

    #[test]
    fn test_format_errors_trigger_rebuild() {
        assert!(IndexError::Format(FormatError::Truncated).should_rebuild());
        assert!(IndexError::NotFound(PathBuf::new()).should_rebuild());
        assert!(!IndexError::Building(PathBuf::new()).should_rebuild());
        assert!(IndexError::Building(PathBuf::new()).is_transient());
    }
}
