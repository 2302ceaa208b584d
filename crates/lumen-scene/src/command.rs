//! Deferred scene mutations.
//!
//! Native callbacks invoked from script code never mutate the [`Scene`]
//! directly: they record a [`SceneCommand`], and the owner of the scene
//! applies the batch with [`Scene::apply_commands`] after the update pass.
//!
//! [`Scene`]: crate::scene::Scene
//! [`Scene::apply_commands`]: crate::scene::Scene::apply_commands

use serde::{Deserialize, Serialize};

use crate::uuid::Uuid;

/// A mutation queued by script code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SceneCommand {
    /// Remove an entity from the scene.
    DestroyEntity {
        /// The entity to destroy.
        entity: Uuid,
    },
}
