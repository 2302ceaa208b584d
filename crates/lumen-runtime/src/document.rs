//! Scene files: the authored scene plus the stored script field values of its
//! entities.

use std::path::Path;

use lumen_scene::Scene;
use lumen_script::SerializedFieldValue;
use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// The on-disk form of a scene.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDocument {
    pub scene: Scene,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script_fields: Vec<SerializedFieldValue>,
}

impl SceneDocument {
    pub fn new(scene: Scene) -> Self {
        Self {
            scene,
            script_fields: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Read a scene document from disk.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let document_error = |details: String| RuntimeError::Document {
            path: path.to_path_buf(),
            details,
        };
        let text = std::fs::read_to_string(path).map_err(|e| document_error(e.to_string()))?;
        Self::from_json(&text).map_err(|e| document_error(e.to_string()))
    }

    /// Write the document to disk.
    pub fn save(&self, path: &Path) -> Result<(), RuntimeError> {
        let document_error = |details: String| RuntimeError::Document {
            path: path.to_path_buf(),
            details,
        };
        let text = self.to_json().map_err(|e| document_error(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| document_error(e.to_string()))
    }
}
