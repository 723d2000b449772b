//! Client-side session layer for a userspace dataplane.
//!
//! Applications attach through a [`VclContext`], register one worker per
//! thread, and drive sessions by handle. Session completions and peer
//! activity arrive on each worker's event queue and are reported through
//! [`VclContext::wait_for_events`].

pub mod api;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod event;
pub mod fifo;
pub mod handle;
pub mod logging;
pub mod messaging;
pub mod multiplexer;
pub mod pool;
pub mod segment;
pub mod session;
pub mod test_util;
pub mod worker;

pub use config::{ForkPolicy, VclConfig};
pub use context::{PidSource, ProcessPid, VclContext};
pub use control::ControlChannel;
pub use error::{ControlError, Result, VclError};
pub use event::{VclEvent, VclEventKind};
pub use handle::SessionHandle;
pub use session::{AppState, SessionAttr, SessionState, TransportProto};
