//! Process spawning abstractions
//!
//! [`ProcessSpawner`] is the seam between the orchestration layer and the
//! operating system: production code uses [`EngineLauncher`], tests script an
//! engine with [`mock::MockSpawner`].

use crate::errors::Result;
use crate::process::ProcessHandle;
use crate::types::SessionConfig;
use async_trait::async_trait;

pub mod launcher;
pub mod mock;

pub use launcher::EngineLauncher;
pub use mock::{MockBehavior, MockSpawner, ScriptedEngine};

/// Spawns engine processes for sessions.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Start one engine child for the given config.
    async fn spawn(&self, config: &SessionConfig) -> Result<ProcessHandle>;
}
