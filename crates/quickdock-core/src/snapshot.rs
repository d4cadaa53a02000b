//! Builds normalized state snapshots from engine queries.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    model::{ContainerView, ProjectStatus, ProjectView, STANDALONE_PROJECT, StateSnapshot},
    traits::{Engine, EngineError},
};

/// Turns the engine's container list into a grouped, ordered snapshot.
#[derive(Clone)]
pub struct SnapshotBuilder {
    engine: Arc<dyn Engine>,
}

impl SnapshotBuilder {
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Query the engine and build a complete snapshot.
    ///
    /// # Errors
    /// Propagates the enumeration failure; never returns a partial snapshot.
    pub async fn build(&self) -> Result<StateSnapshot, EngineError> {
        let containers = self.engine.list_containers().await?;
        let snapshot = group_containers(containers, now_millis());
        tracing::trace!(
            projects = snapshot.projects.len(),
            containers = snapshot.containers().count(),
            "Snapshot built"
        );
        Ok(snapshot)
    }
}

/// Group containers by project label.
///
/// Projects are ordered by name with the standalone group last; containers keep
/// the order in which they were given.
#[must_use]
pub fn group_containers(containers: Vec<ContainerView>, taken_at: i64) -> StateSnapshot {
    let mut groups: BTreeMap<String, Vec<ContainerView>> = BTreeMap::new();
    for container in containers {
        groups
            .entry(container.project_key().to_string())
            .or_default()
            .push(container);
    }

    let standalone = groups.remove(STANDALONE_PROJECT);
    let projects = groups
        .into_iter()
        .chain(standalone.map(|c| (STANDALONE_PROJECT.to_string(), c)))
        .map(|(name, containers)| ProjectView {
            status: ProjectStatus::aggregate(containers.iter().map(|c| c.status)),
            working_dir: containers.iter().find_map(|c| c.working_dir.clone()),
            name,
            containers,
        })
        .collect();

    StateSnapshot {
        seq: 0,
        taken_at,
        projects,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
