//! Session state machine.

use std::fmt;

/// Session state. Values are distinct bits so open/closing masks can be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Start = 0,
    Connect = 0x01,
    Listen = 0x02,
    Accept = 0x04,
    VppClosing = 0x08,
    Disconnect = 0x10,
    Failed = 0x20,
    Updated = 0x40,
    ListenNoMq = 0x80,
}

/// States in which a server-side session can move data.
pub const SERVER_STATE_OPEN: u8 = SessionState::Accept as u8 | SessionState::VppClosing as u8;

/// States in which a client-side session can move data.
pub const CLIENT_STATE_OPEN: u8 = SessionState::Connect as u8 | SessionState::VppClosing as u8;

/// Either side open.
pub const STATE_OPEN: u8 = SERVER_STATE_OPEN | CLIENT_STATE_OPEN;

/// Listener states.
pub const STATE_LISTEN_ANY: u8 = SessionState::Listen as u8 | SessionState::ListenNoMq as u8;

impl SessionState {
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// True if the state has any bit of `mask`.
    pub fn intersects(self, mask: u8) -> bool {
        self.bits() & mask != 0
    }

    pub fn is_listener(self) -> bool {
        self.intersects(STATE_LISTEN_ANY)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Start => "STATE_START",
            SessionState::Connect => "STATE_CONNECT",
            SessionState::Listen => "STATE_LISTEN",
            SessionState::Accept => "STATE_ACCEPT",
            SessionState::VppClosing => "STATE_VPP_CLOSING",
            SessionState::Disconnect => "STATE_DISCONNECT",
            SessionState::Failed => "STATE_FAILED",
            SessionState::Updated => "STATE_UPDATED",
            SessionState::ListenNoMq => "STATE_LISTEN_NO_MQ",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application registration state, also tracked per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Start,
    ConnVpp,
    Enabled,
    Attached,
    AddingWorker,
    Failed,
    Ready,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Start => "start",
            AppState::ConnVpp => "conn_vpp",
            AppState::Enabled => "enabled",
            AppState::Attached => "attached",
            AppState::AddingWorker => "adding_worker",
            AppState::Failed => "failed",
            AppState::Ready => "ready",
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_masks() {
        assert!(SessionState::Connect.intersects(CLIENT_STATE_OPEN));
        assert!(SessionState::Accept.intersects(SERVER_STATE_OPEN));
        assert!(SessionState::VppClosing.intersects(STATE_OPEN));
        assert!(!SessionState::Disconnect.intersects(STATE_OPEN));
        assert!(!SessionState::Start.intersects(STATE_OPEN));
    }

    #[test]
    fn test_listener_family() {
        assert!(SessionState::Listen.is_listener());
        assert!(SessionState::ListenNoMq.is_listener());
        assert!(!SessionState::Accept.is_listener());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::VppClosing.to_string(), "STATE_VPP_CLOSING");
        assert_eq!(AppState::AddingWorker.to_string(), "adding_worker");
    }
}
