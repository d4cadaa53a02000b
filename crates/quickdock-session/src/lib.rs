//! Long-lived session coordination for quickdock.
//!
//! Provides:
//! - `BroadcastHub` - periodic snapshot polling and fan-out to subscribers
//! - `ExecBridge` - interactive shell sessions inside containers
//! - `LogTail` - reconnecting per-client container log streams

pub mod error;
pub mod exec;
pub mod hub;
pub mod logs;

pub use error::{HubError, SessionError};
pub use exec::{
    ExecBridge, ExecConfig, ExecEnd, ExecOutput, ExecSession, ExecWriter, SessionState,
};
pub use hub::{BroadcastHub, HubConfig, Subscription};
pub use logs::{LogEnd, LogLine, LogMessage, LogTail, LogTailConfig, LogTailHandle};
