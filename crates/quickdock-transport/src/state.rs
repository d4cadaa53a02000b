//! Shared router state.

use std::sync::Arc;

use quickdock_core::{ComposeRunner, Engine, SnapshotBuilder};
use quickdock_session::{BroadcastHub, ExecBridge, LogTail};

/// Everything the handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine>,
    pub compose: Arc<dyn ComposeRunner>,
    pub hub: Arc<BroadcastHub>,
    pub exec: ExecBridge,
    pub logs: LogTail,
    snapshots: SnapshotBuilder,
}

impl AppState {
    #[must_use]
    pub fn new(
        engine: Arc<dyn Engine>,
        compose: Arc<dyn ComposeRunner>,
        hub: Arc<BroadcastHub>,
        exec: ExecBridge,
        logs: LogTail,
    ) -> Self {
        Self {
            snapshots: SnapshotBuilder::new(Arc::clone(&engine)),
            engine,
            compose,
            hub,
            exec,
            logs,
        }
    }

    /// Builder for on-demand snapshots, independent of the hub's tick.
    #[must_use]
    pub const fn snapshots(&self) -> &SnapshotBuilder {
        &self.snapshots
    }
}
