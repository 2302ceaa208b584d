//! Minimal scene store.
//!
//! A [`Scene`] owns a set of [`Entity`] records keyed by [`Uuid`]. Each entity
//! has a tag (its display name) and may carry a [`ScriptComponent`] naming the
//! script class bound to it. Iteration order is by UUID and carries no
//! gameplay meaning.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::SceneCommand;
use crate::uuid::Uuid;
use crate::SceneError;

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Binds an entity to a script class by its full name
/// (`"Namespace.ClassName"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptComponent {
    /// Full name of the script class, e.g. `"Sandbox.Player"`.
    pub class_name: String,
}

impl ScriptComponent {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
        }
    }
}

/// One entity in a [`Scene`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    uuid: Uuid,
    tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<ScriptComponent>,
}

impl Entity {
    /// The entity's persistent identifier.
    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The entity's display name.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The attached script component, if any.
    pub fn script(&self) -> Option<&ScriptComponent> {
        self.script.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

/// An entity container that can be saved to and loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    name: String,
    entities: BTreeMap<Uuid, Entity>,
}

impl Scene {
    /// Create an empty scene.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create an entity with a freshly generated UUID.
    pub fn create_entity(&mut self, tag: impl Into<String>) -> Uuid {
        let mut uuid = Uuid::new();
        while self.entities.contains_key(&uuid) {
            uuid = Uuid::new();
        }
        self.insert(uuid, tag.into());
        uuid
    }

    /// Create an entity with a caller-chosen UUID (scene deserialization,
    /// prefab instantiation).
    ///
    /// # Errors
    ///
    /// [`SceneError::DuplicateEntity`] if the UUID is already in use.
    pub fn create_entity_with_uuid(
        &mut self,
        uuid: Uuid,
        tag: impl Into<String>,
    ) -> Result<(), SceneError> {
        if self.entities.contains_key(&uuid) {
            return Err(SceneError::DuplicateEntity { uuid });
        }
        self.insert(uuid, tag.into());
        Ok(())
    }

    fn insert(&mut self, uuid: Uuid, tag: String) {
        tracing::trace!(entity = %uuid, tag = %tag, "entity created");
        self.entities.insert(
            uuid,
            Entity {
                uuid,
                tag,
                script: None,
            },
        );
    }

    /// Attach (or replace) the script component of an entity.
    pub fn attach_script(
        &mut self,
        uuid: Uuid,
        class_name: impl Into<String>,
    ) -> Result<(), SceneError> {
        let entity = self
            .entities
            .get_mut(&uuid)
            .ok_or(SceneError::UnknownEntity { uuid })?;
        entity.script = Some(ScriptComponent::new(class_name));
        Ok(())
    }

    /// Remove the script component of an entity, returning it.
    pub fn detach_script(&mut self, uuid: Uuid) -> Option<ScriptComponent> {
        self.entities.get_mut(&uuid).and_then(|e| e.script.take())
    }

    /// Destroy an entity. Returns `false` if it did not exist.
    pub fn destroy_entity(&mut self, uuid: Uuid) -> bool {
        let removed = self.entities.remove(&uuid).is_some();
        if removed {
            tracing::trace!(entity = %uuid, "entity destroyed");
        }
        removed
    }

    pub fn entity(&self, uuid: Uuid) -> Option<&Entity> {
        self.entities.get(&uuid)
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.entities.contains_key(&uuid)
    }

    /// First entity whose tag equals `name`, in iteration order.
    pub fn find_entity_by_name(&self, name: &str) -> Option<&Entity> {
        self.entities.values().find(|e| e.tag == name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities that carry a [`ScriptComponent`].
    pub fn scripted_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| e.script.is_some())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Apply deferred commands in FIFO order. Returns how many took effect.
    pub fn apply_commands(&mut self, commands: impl IntoIterator<Item = SceneCommand>) -> usize {
        let mut applied = 0;
        for command in commands {
            let took_effect = match &command {
                SceneCommand::DestroyEntity { entity } => self.destroy_entity(*entity),
            };
            if took_effect {
                applied += 1;
            } else {
                tracing::debug!(?command, "scene command had no effect");
            }
        }
        applied
    }

    // -- Persistence -----------------------------------------------------------

    /// Serialize the scene to pretty JSON.
    pub fn to_json(&self) -> Result<String, SceneError> {
        serde_json::to_string_pretty(self).map_err(|e| SceneError::Serialization(e.to_string()))
    }

    /// Deserialize a scene from JSON.
    pub fn from_json(json: &str) -> Result<Self, SceneError> {
        serde_json::from_str(json).map_err(|e| SceneError::Serialization(e.to_string()))
    }

    /// Load a scene from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let text = std::fs::read_to_string(path).map_err(|e| SceneError::Io {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Write the scene to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), SceneError> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|e| SceneError::Io {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
