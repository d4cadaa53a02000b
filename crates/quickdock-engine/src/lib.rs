//! Production collaborators for quickdock.
//!
//! Provides:
//! - `DockerEngine` - `Engine` facade over the Docker Engine API
//! - `ComposeCli` - `ComposeRunner` that shells out to `docker compose`
//! - Executable resolution utilities

pub mod compose;
pub mod docker;
pub mod resolve;

pub use compose::{ComposeCli, ComposeCommand, ComposeConfig};
pub use docker::DockerEngine;
pub use resolve::resolve_executable_path;
