//! Socket-option-like session attributes.

use bitflags::bitflags;

use crate::error::{Result, VclError};

/// Attribute ids, numbered as on the application-facing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SessionAttr {
    Server = 0,
    CutThru = 1,
    Listen = 4,
    NonBlock = 5,
    ReuseAddr = 6,
    ReusePort = 7,
    Broadcast = 8,
    V6Only = 9,
    KeepAlive = 10,
    TcpNoDelay = 11,
    TcpKeepIdle = 12,
    TcpKeepIntvl = 13,
    ShutRd = 14,
    ShutWr = 15,
}

impl TryFrom<u32> for SessionAttr {
    type Error = VclError;

    fn try_from(id: u32) -> Result<Self> {
        Ok(match id {
            0 => SessionAttr::Server,
            1 => SessionAttr::CutThru,
            4 => SessionAttr::Listen,
            5 => SessionAttr::NonBlock,
            6 => SessionAttr::ReuseAddr,
            7 => SessionAttr::ReusePort,
            8 => SessionAttr::Broadcast,
            9 => SessionAttr::V6Only,
            10 => SessionAttr::KeepAlive,
            11 => SessionAttr::TcpNoDelay,
            12 => SessionAttr::TcpKeepIdle,
            13 => SessionAttr::TcpKeepIntvl,
            14 => SessionAttr::ShutRd,
            15 => SessionAttr::ShutWr,
            _ => return Err(VclError::InvalidAttribute(id)),
        })
    }
}

impl SessionAttr {
    /// Scalar attributes carry a value next to their flag bit.
    pub fn is_scalar(self) -> bool {
        matches!(self, SessionAttr::TcpKeepIdle | SessionAttr::TcpKeepIntvl)
    }

    fn flag(self) -> AttrFlags {
        AttrFlags::from_bits_truncate(1 << self as u32)
    }
}

bitflags! {
    /// Boolean attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttrFlags: u32 {
        const SERVER         = 1 << 0;
        const CUT_THRU       = 1 << 1;
        const LISTEN         = 1 << 4;
        const NONBLOCK       = 1 << 5;
        const REUSEADDR      = 1 << 6;
        const REUSEPORT      = 1 << 7;
        const BROADCAST      = 1 << 8;
        const V6ONLY         = 1 << 9;
        const KEEPALIVE      = 1 << 10;
        const TCP_NODELAY    = 1 << 11;
        const TCP_KEEPIDLE   = 1 << 12;
        const TCP_KEEPINTVL  = 1 << 13;
        const SHUT_RD        = 1 << 14;
        const SHUT_WR        = 1 << 15;
    }
}

/// Attribute bitmask plus the scalar values that go with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionAttrs {
    flags: AttrFlags,
    keepidle_secs: u32,
    keepintvl_secs: u32,
}

impl SessionAttrs {
    pub fn flags(&self) -> AttrFlags {
        self.flags
    }

    pub fn test(&self, attr: SessionAttr) -> bool {
        self.flags.contains(attr.flag())
    }

    pub fn set(&mut self, attr: SessionAttr) {
        self.flags.insert(attr.flag());
    }

    pub fn clear(&mut self, attr: SessionAttr) {
        self.flags.remove(attr.flag());
    }

    /// Read an attribute as an integer (booleans read as 0/1).
    pub fn get_value(&self, attr: SessionAttr) -> u32 {
        match attr {
            SessionAttr::TcpKeepIdle => self.keepidle_secs,
            SessionAttr::TcpKeepIntvl => self.keepintvl_secs,
            _ => self.test(attr) as u32,
        }
    }

    /// Write an attribute. Scalars store `value` and set their bit when non-zero.
    pub fn set_value(&mut self, attr: SessionAttr, value: u32) {
        match attr {
            SessionAttr::TcpKeepIdle => self.keepidle_secs = value,
            SessionAttr::TcpKeepIntvl => self.keepintvl_secs = value,
            _ => {}
        }
        if value != 0 {
            self.set(attr);
        } else {
            self.clear(attr);
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        self.test(SessionAttr::NonBlock)
    }

    pub fn set_nonblocking(&mut self, on: bool) {
        self.set_value(SessionAttr::NonBlock, on as u32);
    }

    pub fn keepalive_idle(&self) -> u32 {
        self.keepidle_secs
    }

    pub fn keepalive_interval(&self) -> u32 {
        self.keepintvl_secs
    }
}
