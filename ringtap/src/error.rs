use std::io;

/// Errors surfaced by a [`TPacket`](crate::TPacket) handle.
///
/// `PollTimeout` is the only recoverable read error: nothing was consumed and
/// the caller may read again. `PollFailure` leaves the socket in an error
/// state and the handle should be closed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad interface, unsupported version, invalid options, or geometry the
    /// kernel rejected.
    #[error("configuration error: {reason}")]
    Configuration {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The ring could not be allocated or mapped.
    #[error("ring setup failed during {op}")]
    Setup {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("packet poll timeout expired")]
    PollTimeout,

    #[error("packet poll failed")]
    PollFailure,

    #[error("{op} failed")]
    Syscall {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Classic filter programs carry their length in a 16-bit field.
    #[error("filter too large: {len} instructions (max {})", u16::MAX)]
    FilterTooLarge { len: usize },

    #[error("handle is closed")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn config_os(reason: impl Into<String>, source: io::Error) -> Self {
        Error::Configuration {
            reason: reason.into(),
            source: Some(source),
        }
    }

    pub(crate) fn syscall(op: &'static str) -> Self {
        Error::Syscall {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::PollTimeout)
    }

    /// True when the handle should be closed rather than read again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PollFailure | Error::Closed)
    }

    /// The OS error behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Setup { source, .. } | Error::Syscall { source, .. } => source.raw_os_error(),
            Error::Configuration {
                source: Some(source),
                ..
            } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_recoverable() {
        assert!(Error::PollTimeout.is_timeout());
        assert!(!Error::PollTimeout.is_fatal());
        assert!(Error::PollFailure.is_fatal());
    }

    #[test]
    fn test_syscall_keeps_os_error() {
        let err = Error::Syscall {
            op: "write",
            source: io::Error::from_raw_os_error(libc::ENETDOWN),
        };
        assert_eq!(err.raw_os_error(), Some(libc::ENETDOWN));
        assert_eq!(err.to_string(), "write failed");
    }

    #[test]
    fn test_filter_too_large_message() {
        let err = Error::FilterTooLarge { len: 70000 };
        assert_eq!(
            err.to_string(),
            "filter too large: 70000 instructions (max 65535)"
        );
    }
}
