//! Lumen Runtime -- composition root for the scripting bridge.
//!
//! Ties a [`ScriptEngine`](lumen_script::ScriptEngine) to a scene and drives
//! the edit/play/stop cycle:
//!
//! - **Edit**: the authored scene is inert; stored field values can be edited.
//! - **Play**: a runtime copy of the scene is simulated. Every scripted entity
//!   gets a live instance, `OnUpdate` runs once per frame, and scene commands
//!   queued by scripts are applied after the update pass.
//! - **Stop**: instances are destroyed and the runtime copy is discarded. Any
//!   hot reload that arrived during play runs at the next frame.
//!
//! # Quick Start
//!
//! ```no_run
//! use lumen_runtime::prelude::*;
//! use lumen_script::{AssemblyPaths, ScriptEngine, ScriptEngineConfig};
//!
//! let mut engine = ScriptEngine::new(ScriptEngineConfig::default());
//! engine.init(AssemblyPaths::new("LumenCore.wat", "Sandbox.wasm")).unwrap();
//!
//! let document = SceneDocument::load("level.scene.json".as_ref()).unwrap();
//! let mut runtime = Runtime::new(engine, document, RuntimeConfig::default());
//! runtime.play();
//! let summary = runtime.run(120);
//! runtime.stop();
//! println!("{} frames, {} faults", summary.frames, summary.faults);
//! ```

#![deny(unsafe_code)]

pub mod document;
pub mod runtime;

use std::path::PathBuf;

pub use document::SceneDocument;
pub use runtime::{FrameDiagnostics, RunSummary, Runtime, RuntimeConfig, RuntimeMode};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The scene document could not be read or written.
    #[error("scene document {}: {details}", path.display())]
    Document { path: PathBuf, details: String },

    /// A scene operation failed.
    #[error(transparent)]
    Scene(#[from] lumen_scene::SceneError),

    /// A scripting operation failed.
    #[error(transparent)]
    Script(#[from] lumen_script::ScriptError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::document::SceneDocument;
    pub use crate::runtime::{FrameDiagnostics, RunSummary, Runtime, RuntimeConfig, RuntimeMode};
    pub use crate::RuntimeError;
}
