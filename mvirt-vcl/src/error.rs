//! Error types for the session layer.
//!
//! Every failure maps to a negative errno-style code via [`VclError::code`],
//! which is what socket-like callers see.

use nix::errno::Errno;
use thiserror::Error;

use crate::config::ConfigError;
use crate::session::SessionState;

/// Errors raised by the control channel transport itself.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The dataplane side of the channel is gone.
    #[error("control channel disconnected")]
    Disconnected,

    /// A request could not be sent.
    #[error("control send failed: {0}")]
    Send(String),
}

/// Main error type for session layer operations.
#[derive(Debug, Error)]
pub enum VclError {
    /// Handle does not name an allocated session.
    #[error("invalid session handle {0:#x}")]
    InvalidHandle(u32),

    /// Handle belongs to another worker.
    #[error("session handle {handle:#x} belongs to worker {owner}, not worker {current}")]
    ForeignHandle { handle: u32, owner: u32, current: u32 },

    /// No session is known under this dataplane handle.
    #[error("unknown vpp handle {0:#x}")]
    UnknownVppHandle(u64),

    /// Segment handle is not mapped in this process.
    #[error("unknown segment handle {0:#x}")]
    UnknownSegment(u64),

    /// Worker index is not registered.
    #[error("unknown worker {0}")]
    UnknownWorker(u32),

    /// Calling thread has no registered worker.
    #[error("no worker registered for this thread")]
    NoWorker,

    /// Operation is not valid in the session's current state.
    #[error("invalid session state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    /// Session is not a listener.
    #[error("session {0:#x} is not listening")]
    NotListener(u32),

    /// Session is already connected or connecting.
    #[error("session {0:#x} already connected")]
    AlreadyConnected(u32),

    /// Attribute id or value is not supported.
    #[error("invalid session attribute {0}")]
    InvalidAttribute(u32),

    /// Generic argument error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Session closed gracefully, or never connected.
    #[error("session not connected")]
    NotConnected,

    /// Session was reset by the peer.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Operation would block on a non-blocking session.
    #[error("operation would block")]
    WouldBlock,

    /// Deadline expired before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// Session pool has no free slot left.
    #[error("session pool exhausted")]
    PoolExhausted,

    /// Worker pool is at the configured maximum.
    #[error("too many workers (max {0})")]
    TooManyWorkers(u32),

    /// No room for another segment mapping.
    #[error("segment table full")]
    SegmentTableFull,

    /// Application is not attached to the dataplane.
    #[error("application not attached")]
    NotAttached,

    /// Dataplane answered a control request with a failure.
    #[error("{op} rejected by dataplane: {reason}")]
    Rejected {
        op: &'static str,
        retval: i32,
        reason: &'static str,
    },

    /// Control channel transport failure.
    #[error("control channel: {0}")]
    Control(#[from] ControlError),

    /// Configuration rejected at startup.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// OS-level failure (eventfd, epoll, mmap).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Errno> for VclError {
    fn from(e: Errno) -> Self {
        VclError::Io(std::io::Error::from(e))
    }
}

impl VclError {
    /// Build a `Rejected` error from a control reply retval.
    pub fn rejected(op: &'static str, retval: i32) -> Self {
        VclError::Rejected {
            op,
            retval,
            reason: api_error_str(retval),
        }
    }

    /// Negative errno-style code for the socket-like API surface.
    pub fn code(&self) -> i32 {
        let errno = match self {
            VclError::InvalidHandle(_)
            | VclError::ForeignHandle { .. }
            | VclError::UnknownVppHandle(_)
            | VclError::InvalidState { .. } => Errno::EBADFD,
            VclError::UnknownSegment(_) => Errno::EFAULT,
            VclError::UnknownWorker(_) | VclError::NoWorker => Errno::EINVAL,
            VclError::NotListener(_) => Errno::EINVAL,
            VclError::AlreadyConnected(_) => Errno::EALREADY,
            VclError::InvalidAttribute(_)
            | VclError::InvalidArgument(_)
            | VclError::Config(_) => Errno::EINVAL,
            VclError::NotConnected => Errno::ENOTCONN,
            VclError::ConnectionReset => Errno::ECONNRESET,
            VclError::WouldBlock => Errno::EAGAIN,
            VclError::TimedOut => Errno::ETIMEDOUT,
            VclError::PoolExhausted | VclError::TooManyWorkers(_) => Errno::ENOMEM,
            VclError::SegmentTableFull => Errno::ENOSPC,
            VclError::NotAttached => Errno::ENOTCONN,
            VclError::Rejected { .. } => Errno::ECONNREFUSED,
            VclError::Control(_) => Errno::ECONNABORTED,
            VclError::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
        };
        -(errno as i32)
    }

    /// True if the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VclError::WouldBlock
                | VclError::TimedOut
                | VclError::PoolExhausted
                | VclError::TooManyWorkers(_)
                | VclError::SegmentTableFull
        )
    }
}

/// Human readable text for a dataplane API return value.
pub fn api_error_str(retval: i32) -> &'static str {
    match retval {
        0 => "success",
        -1 => "unspecified error",
        -2 => "invalid software interface index",
        -7 => "no such entry",
        -10 => "invalid value",
        -63 => "no such table",
        -78 => "invalid application namespace",
        -110 => "session connect failed",
        -111 => "session bind failed",
        -112 => "segment create failed",
        -113 => "session address already in use",
        -114 => "application not attached",
        -115 => "invalid worker",
        _ => "unknown error",
    }
}

/// Result type for session layer operations.
pub type Result<T> = std::result::Result<T, VclError>;
