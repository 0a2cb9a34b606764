//! Store abstraction for Cephalon's state management.
//!
//! A Store is the logical container for the knowledge bins (graph, memory,
//! task). All subsystem state is scoped to a store root.

use std::path::PathBuf;

/// Store type discriminator.
///
/// - `User`: agent-local scratch state (blank slate, no seeding)
/// - `Repo`: project-scoped state at `<repo>/.cephalon/data/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    User,
    Repo,
}

/// Handle to a Cephalon state workspace.
#[derive(Debug, Clone)]
pub struct Store {
    pub kind: StoreKind,
    /// Absolute path to the store root directory
    pub root: PathBuf,
}
