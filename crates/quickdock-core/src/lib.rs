//! Core abstractions for quickdock.
//!
//! This crate provides the fundamental building blocks:
//! - `ContainerView`, `ProjectView`, `StateSnapshot` - the immutable state model
//! - `Engine` and `ComposeRunner` - contracts for the external collaborators
//! - `SnapshotBuilder` - turns engine queries into a grouped snapshot

pub mod model;
pub mod snapshot;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use model::{
    ComposeAction, ContainerAction, ContainerStatus, ContainerView, EngineHealth, ExecHandle,
    LogCursor, LogFrame, LogSource, ProjectStatus, ProjectView, STANDALONE_PROJECT,
    SharedSnapshot, StateSnapshot, TermSize, UnknownAction,
};
pub use snapshot::SnapshotBuilder;
pub use traits::{ComposeError, ComposeRunner, Engine, EngineError, ExecIo, LogStream};
