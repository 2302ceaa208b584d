//! Lumen Script -- the managed scripting runtime bridge.
//!
//! User gameplay scripts are compiled to WebAssembly and run inside a
//! fuel-metered Wasmtime store. This crate loads the engine-provided core
//! assembly and the project's user assembly, discovers the script classes the
//! user assembly defines, binds one live managed object to every scripted
//! entity, and reloads everything when the user assembly changes on disk.
//!
//! # Architecture
//!
//! - **`AssemblyManager`**: owns the root [`wasmtime::Engine`] and the current
//!   [`AppDomain`]; loads the core and user assemblies and rebuilds the domain
//!   wholesale on reload.
//! - **`ClassReflector`**: reads the type metadata a loaded domain exports and
//!   produces a [`ClassRegistry`] of [`ScriptClass`] descriptors.
//! - **`ScriptInstance`**: one entity bound to one managed object, with
//!   lifecycle callbacks and typed field access.
//! - **`FieldValueStore`**: per-entity field values that outlive instances
//!   (edit-time values, persisted in scenes).
//! - **`HotReloadWatcher`**: filesystem watcher that debounces writes to the
//!   user assembly and queues a single reload on the main thread.
//! - **`ScriptEngine`**: the facade that composes all of the above.
//!
//! # Type metadata
//!
//! Script classes are described by export names of the loaded modules:
//!
//! | Export | Kind | Value |
//! |--------|------|-------|
//! | `class <Full.Name> <Parent \| ->` | `i32` global | instance size |
//! | `field <Class> <name> <Type> <public \| private>` | `i32` global | field offset |
//! | `method <Class> <name>` | function | first param is `this` |
//!
//! # Example
//!
//! ```no_run
//! use lumen_scene::Scene;
//! use lumen_script::{AssemblyPaths, ScriptEngine, ScriptEngineConfig};
//!
//! let mut engine = ScriptEngine::new(ScriptEngineConfig::default());
//! engine
//!     .init(AssemblyPaths::new("LumenCore.wat", "Sandbox.wasm"))
//!     .unwrap();
//!
//! let mut scene = Scene::new("level");
//! let player = scene.create_entity("Player");
//! scene.attach_script(player, "Sandbox.Player").unwrap();
//!
//! engine.set_scene_context(&scene);
//! for entity in scene.scripted_entities() {
//!     engine.on_create_entity(entity);
//! }
//! engine.on_update_entity(player, 1.0 / 60.0);
//! engine.clear_scene_context();
//! ```

#![deny(unsafe_code)]

pub mod assembly;
pub mod config;
pub mod engine;
pub mod fault;
pub mod field;
pub mod field_store;
pub mod handle;
pub mod host_api;
pub mod instance;
pub mod main_thread;
pub mod reflect;
pub mod watcher;

use std::path::PathBuf;

pub use assembly::{AppDomain, AssemblyManager, CORE_MODULE_NAME};
pub use config::{AssemblyPaths, ProjectConfig, ScriptEngineConfig};
pub use engine::{EngineState, ScriptEngine};
pub use fault::{FaultKind, ScriptFault};
pub use field::{EntityRef, FieldBuffer, FieldType, FieldValue, Vector2, Vector3, Vector4};
pub use field_store::{FieldValueStore, ScriptFieldValue, SerializedFieldValue};
pub use handle::{ClassHandle, FieldHandle, Generation, MethodHandle, ObjectHandle};
pub use host_api::HostState;
pub use instance::ScriptInstance;
pub use main_thread::MainThreadQueue;
pub use reflect::{ClassReflector, ClassRegistry, FieldDescriptor, ScriptClass};
pub use watcher::{HotReloadWatcher, ReloadTrigger, WatchState};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by loading, discovery, and field access.
///
/// Faults raised by script code itself are [`ScriptFault`]s; they appear here
/// only when an operation that returns `ScriptError` ran script code.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// An assembly file is missing, unreadable, malformed, or failed to
    /// instantiate.
    #[error("failed to load assembly {}: {reason}", path.display())]
    AssemblyLoad { path: PathBuf, reason: String },

    /// The user assembly does not exist. The caller may build it and retry.
    #[error("user assembly {} does not exist", path.display())]
    UserAssemblyMissing { path: PathBuf },

    /// The external build step for the user assembly failed.
    #[error("build command `{command}` failed: {reason}")]
    BuildFailed { command: String, reason: String },

    /// The core assembly does not define the base script type.
    #[error("core assembly does not define the base script type '{name}'")]
    MissingBaseType { name: String },

    /// A class has no usable base-type constructor.
    #[error("class '{class}' has no base-type constructor")]
    MissingConstructor { class: String },

    /// A metadata export is malformed.
    #[error("malformed metadata export '{export}': {reason}")]
    Metadata { export: String, reason: String },

    /// A handle from another load generation was used.
    #[error("stale handle: expected {expected}, found {found}")]
    StaleHandle {
        expected: Generation,
        found: Generation,
    },

    /// The operation needs a loaded domain.
    #[error("script engine is not initialized")]
    NotInitialized,

    /// No script class with this name is loaded.
    #[error("unknown script class '{name}'")]
    UnknownClass { name: String },

    /// No instance is bound to the entity.
    #[error("entity {entity} has no script instance")]
    NoInstance { entity: lumen_scene::Uuid },

    /// The class does not expose a field with this name.
    #[error("class '{class}' has no field '{field}'")]
    FieldNotFound { class: String, field: String },

    /// The field's managed type has no engine counterpart.
    #[error("field '{field}' of '{class}' has an unsupported type")]
    UnsupportedField { class: String, field: String },

    /// A field was accessed as the wrong type.
    #[error("field '{field}' is {found}, accessed as {expected}")]
    FieldTypeMismatch {
        field: String,
        expected: FieldType,
        found: FieldType,
    },

    /// A read or write fell outside the domain's linear memory.
    #[error("managed memory access out of bounds: address={address}, len={len}")]
    MemoryAccess { address: u64, len: usize },

    /// The filesystem watcher could not be installed.
    #[error("assembly watcher error: {0}")]
    Watch(String),

    /// Script code faulted.
    #[error(transparent)]
    Fault(#[from] ScriptFault),

    /// A general runtime error from Wasmtime.
    #[error("script runtime error: {0}")]
    Runtime(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::config::{AssemblyPaths, ProjectConfig, ScriptEngineConfig};
    pub use crate::engine::{EngineState, ScriptEngine};
    pub use crate::fault::{FaultKind, ScriptFault};
    pub use crate::field::{EntityRef, FieldType, FieldValue, Vector2, Vector3, Vector4};
    pub use crate::field_store::{FieldValueStore, SerializedFieldValue};
    pub use crate::ScriptError;
}
