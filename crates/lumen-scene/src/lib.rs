//! Lumen Scene -- entity store consumed by the scripting bridge.
//!
//! This crate provides the scene-side collaborators of the Lumen scripting
//! runtime: persistent entity identifiers ([`Uuid`]), a [`Scene`] of
//! [`Entity`] records carrying an optional [`ScriptComponent`], and the
//! deferred [`SceneCommand`] queue that script callbacks write into.
//!
//! # Quick Start
//!
//! ```
//! use lumen_scene::prelude::*;
//!
//! let mut scene = Scene::new("level");
//! let player = scene.create_entity("Player");
//! scene.attach_script(player, "Sandbox.Player").unwrap();
//!
//! assert_eq!(scene.scripted_entities().count(), 1);
//! ```

#![deny(unsafe_code)]

pub mod command;
pub mod scene;
pub mod uuid;

use std::path::PathBuf;

pub use command::SceneCommand;
pub use scene::{Entity, Scene, ScriptComponent};
pub use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by scene operations.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// The entity does not exist in this scene.
    #[error("entity {uuid} does not exist in the scene")]
    UnknownEntity { uuid: Uuid },

    /// An entity with this UUID already exists.
    #[error("entity {uuid} already exists in the scene")]
    DuplicateEntity { uuid: Uuid },

    /// The scene file could not be read or written.
    #[error("scene file {path}: {details}")]
    Io { path: PathBuf, details: String },

    /// The scene JSON is malformed.
    #[error("scene serialization failed: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command::SceneCommand;
    pub use crate::scene::{Entity, Scene, ScriptComponent};
    pub use crate::uuid::Uuid;
    pub use crate::SceneError;
}
