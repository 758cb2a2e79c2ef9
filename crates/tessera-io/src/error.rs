//! I/O error types.

/// Errors from the I/O layer.
///
/// Every OS failure carries the name of the syscall that produced it, so a
/// probe failure reads as e.g. `mkstemp: No such file or directory (os error 2)`.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// A syscall failed.
    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The operation is not available on this platform or filesystem.
    #[error("{op}: operation not supported")]
    NotSupported { op: &'static str },

    /// Direct I/O was rejected on a filesystem we know nothing about.
    #[error("unsupported file system: {magic:#x}")]
    UnsupportedFileSystem { magic: u64 },

    /// The allocator returned null.
    #[error("can't allocate {size} bytes aligned to {alignment}")]
    OutOfMemory { size: usize, alignment: usize },

    /// A write transferred fewer bytes than requested.
    #[error("{op}: short write: {actual} bytes instead of {expected}")]
    ShortWrite {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A read hit end of file before filling the buffer.
    #[error("short read: {actual} bytes instead of {expected}")]
    ShortRead { expected: usize, actual: usize },

    /// Probe configuration could not be parsed.
    #[error("failed to parse probe configuration: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// Probe configuration parsed but is unusable.
    #[error("invalid probe configuration: {0}")]
    InvalidConfig(String),
}

impl IoError {
    /// Wraps an `std::io::Error` raised by `op`.
    pub fn os(op: &'static str, source: std::io::Error) -> Self {
        Self::Os { op, source }
    }

    /// Builds an error from a raw (positive) errno value.
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        Self::os(op, std::io::Error::from_raw_os_error(errno))
    }

    /// Captures `errno` right after a failed libc call.
    pub fn last_os_error(op: &'static str) -> Self {
        Self::os(op, std::io::Error::last_os_error())
    }

    /// The raw OS error code, if this is an OS error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// The syscall this error came from, when known.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Self::Os { op, .. } | Self::NotSupported { op } | Self::ShortWrite { op, .. } => {
                Some(op)
            }
            _ => None,
        }
    }

    /// True for the distinguished "feature absent" outcome.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. }) || self.errno() == Some(libc::EOPNOTSUPP)
    }

    /// True when the OS reported that the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Os { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for I/O operations.
pub type IoResult<T> = Result<T, IoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_names_syscall_and_code() {
        let err = IoError::from_errno("mkstemp", libc::ENOENT);
        let msg = err.to_string();
        assert!(msg.starts_with("mkstemp: "), "{msg}");
        assert!(msg.contains("os error 2"), "{msg}");
        assert_eq!(err.op(), Some("mkstemp"));
        assert!(err.is_not_found());
    }

    #[test]
    fn eopnotsupp_counts_as_not_supported() {
        assert!(IoError::from_errno("io_submit", libc::EOPNOTSUPP).is_not_supported());
        assert!(IoError::NotSupported { op: "fallocate" }.is_not_supported());
        assert!(!IoError::from_errno("write", libc::EIO).is_not_supported());
    }

    #[test]
    fn unsupported_file_system_shows_magic_in_hex() {
        let err = IoError::UnsupportedFileSystem { magic: 0xef53 };
        assert_eq!(err.to_string(), "unsupported file system: 0xef53");
        assert_eq!(err.errno(), None);
    }
}
