//! Session handle codec.
//!
//! A session handle packs the owning worker index into the top 8 bits and
//! the worker-local pool index into the low 24 bits.

use std::fmt;

/// Bits reserved for the session index.
pub const SESSION_INDEX_BITS: u32 = 24;

/// Mask selecting the session index.
pub const SESSION_INDEX_MASK: u32 = (1 << SESSION_INDEX_BITS) - 1;

/// Upper bound on workers addressable by a handle.
pub const MAX_WORKERS: u32 = 1 << (32 - SESSION_INDEX_BITS);

/// Upper bound on live sessions per worker.
pub const MAX_SESSIONS_PER_WORKER: u32 = 1 << SESSION_INDEX_BITS;

/// Sentinel for "no session".
pub const INVALID_SESSION_INDEX: u32 = u32::MAX;

/// Opaque session handle handed to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u32);

impl SessionHandle {
    /// Encode a handle. Returns `None` if either part is out of range.
    pub fn new(wrk_index: u32, session_index: u32) -> Option<Self> {
        if wrk_index >= MAX_WORKERS || session_index > SESSION_INDEX_MASK {
            return None;
        }
        Some(SessionHandle(wrk_index << SESSION_INDEX_BITS | session_index))
    }

    /// Wrap a raw value received from an application.
    pub fn from_raw(raw: u32) -> Self {
        SessionHandle(raw)
    }

    /// Raw value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Owning worker index.
    pub fn wrk_index(&self) -> u32 {
        self.0 >> SESSION_INDEX_BITS
    }

    /// Worker-local pool index.
    pub fn session_index(&self) -> u32 {
        self.0 & SESSION_INDEX_MASK
    }

    /// Split into (worker index, session index).
    pub fn parse(&self) -> (u32, u32) {
        (self.wrk_index(), self.session_index())
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.wrk_index(), self.session_index())
    }
}

impl From<SessionHandle> for u32 {
    fn from(h: SessionHandle) -> u32 {
        h.0
    }
}
