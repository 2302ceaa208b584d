//! The scripting facade.
//!
//! [`ScriptEngine`] is an explicit context object owned by whatever composes
//! the engine. It owns the assembly manager, the class registry of the
//! current generation, the entity -> instance and entity -> field-value maps,
//! the main-thread work queue, and the hot-reload watcher.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --init--> Ready --reload_assembly--> Reloading --> Ready
//!       ^                   |
//!       |                shutdown
//!       +-- ShuttingDown <--+
//! ```
//!
//! A failed first `init` leaves the engine `Degraded` (no scripting); a
//! later `init` or `reload_assembly` may recover it. A failed reload returns
//! to the state it started from with the previous generation intact.

use std::collections::{HashMap, HashSet};

use lumen_scene::{Entity, Scene, SceneCommand, Uuid};

use crate::assembly::{run_build_command, AppDomain, AssemblyManager};
use crate::config::{AssemblyPaths, ScriptEngineConfig};
use crate::fault::ScriptFault;
use crate::field::{FieldType, FieldValue};
use crate::field_store::{FieldValueStore, SerializedFieldValue};
use crate::handle::{Generation, ObjectHandle};
use crate::instance::ScriptInstance;
use crate::main_thread::MainThreadQueue;
use crate::reflect::{ClassReflector, ClassRegistry, ScriptClass};
use crate::watcher::{HotReloadWatcher, ReloadTrigger, WatchState};
use crate::ScriptError;

/// Lifecycle state of a [`ScriptEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Reloading,
    /// The first load failed; scripting is unavailable.
    Degraded,
    ShuttingDown,
}

/// The simulated scene the engine is bound to.
#[derive(Debug, Clone)]
struct SceneContext {
    name: String,
}

// ---------------------------------------------------------------------------
// ScriptEngine
// ---------------------------------------------------------------------------

/// Orchestrates assembly loading, class discovery, script instances, stored
/// field values, and hot reload.
#[derive(Debug)]
pub struct ScriptEngine {
    config: ScriptEngineConfig,
    state: EngineState,
    paths: Option<AssemblyPaths>,
    assemblies: Option<AssemblyManager>,
    registry: Option<ClassRegistry>,
    scene: Option<SceneContext>,
    instances: HashMap<Uuid, ScriptInstance>,
    field_stores: HashMap<Uuid, FieldValueStore>,
    pressed_keys: HashSet<i32>,
    main_thread: MainThreadQueue<ScriptEngine>,
    reload_trigger: ReloadTrigger,
    watcher: Option<HotReloadWatcher>,
    reload_deferred: bool,
    fault_count: u64,
}

impl ScriptEngine {
    pub fn new(config: ScriptEngineConfig) -> Self {
        Self {
            config,
            state: EngineState::Uninitialized,
            paths: None,
            assemblies: None,
            registry: None,
            scene: None,
            instances: HashMap::new(),
            field_stores: HashMap::new(),
            pressed_keys: HashSet::new(),
            main_thread: MainThreadQueue::new(),
            reload_trigger: ReloadTrigger::new(),
            watcher: None,
            reload_deferred: false,
            fault_count: 0,
        }
    }

    pub fn config(&self) -> &ScriptEngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    /// Generation of the loaded domain, if any.
    pub fn generation(&self) -> Option<Generation> {
        self.registry.as_ref().map(ClassRegistry::generation)
    }

    pub fn domain(&self) -> Option<&AppDomain> {
        self.assemblies.as_ref().and_then(AssemblyManager::current)
    }

    pub fn domain_mut(&mut self) -> Option<&mut AppDomain> {
        self.assemblies.as_mut().and_then(AssemblyManager::current_mut)
    }

    /// Faults raised by script code since the engine was created.
    pub fn fault_count(&self) -> u64 {
        self.fault_count
    }

    fn report(&mut self, fault: &ScriptFault) {
        self.fault_count += 1;
        fault.report();
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Load both assemblies, discover classes, and install the hot-reload
    /// watcher. Calling `init` on a ready engine reloads with `paths`.
    ///
    /// If the user assembly is missing and `paths` names a build command, the
    /// command runs once and the load is retried.
    ///
    /// # Errors
    ///
    /// Any load or discovery error. The engine is then
    /// [`EngineState::Degraded`] (first load) or keeps its previous generation
    /// (re-entry). A degraded engine still watches the user assembly when hot
    /// reload is enabled.
    pub fn init(&mut self, paths: AssemblyPaths) -> Result<(), ScriptError> {
        if self.state == EngineState::Ready {
            tracing::debug!("init on a ready script engine, reloading");
            self.paths = Some(paths);
            return self.reload_assembly().map(|_| ());
        }

        match self.load_first_generation(&paths) {
            Ok(registry) => {
                tracing::info!(
                    generation = %registry.generation(),
                    classes = registry.len(),
                    "script engine initialized"
                );
                self.registry = Some(registry);
                self.paths = Some(paths);
                self.state = EngineState::Ready;
                self.install_watcher();
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "script engine failed to initialize, scripting disabled"
                );
                if let Some(manager) = self.assemblies.as_mut() {
                    manager.unload();
                }
                self.registry = None;
                self.paths = Some(paths);
                self.state = EngineState::Degraded;
                // A user assembly that shows up later recovers the engine.
                self.install_watcher();
                Err(e)
            }
        }
    }

    fn load_first_generation(
        &mut self,
        paths: &AssemblyPaths,
    ) -> Result<ClassRegistry, ScriptError> {
        if self.assemblies.is_none() {
            self.assemblies = Some(AssemblyManager::new(self.config.clone())?);
        }
        let manager = self.assemblies.as_mut().ok_or(ScriptError::NotInitialized)?;

        manager.load_core(&paths.core)?;
        match manager.load_app(&paths.app) {
            Err(ScriptError::UserAssemblyMissing { path }) if paths.build_command.is_some() => {
                tracing::warn!(
                    path = %path.display(),
                    "user assembly missing, running build command"
                );
                run_build_command(paths)?;
                manager.load_app(&paths.app)?;
            }
            other => other?,
        }

        let domain = manager.current_mut().ok_or(ScriptError::NotInitialized)?;
        ClassReflector::default().discover(domain)
    }

    /// Destroy every instance, drop the domain, and return to
    /// [`EngineState::Uninitialized`]. Stored field values are discarded.
    pub fn shutdown(&mut self) {
        if self.state == EngineState::Uninitialized {
            return;
        }
        self.state = EngineState::ShuttingDown;
        self.clear_scene_context();
        self.watcher = None;
        drop(self.main_thread.drain());
        self.reload_trigger.finish();
        self.reload_deferred = false;
        self.registry = None;
        self.assemblies = None;
        self.field_stores.clear();
        self.paths = None;
        self.state = EngineState::Uninitialized;
        tracing::info!("script engine shut down");
    }

    /// Rebuild the domain from disk and rediscover classes.
    ///
    /// The new generation is built aside and published only if both
    /// assemblies load and discovery succeeds. Stored field values are then
    /// revalidated against the new classes.
    ///
    /// Live instances should be cleared first. If they are not, this logs an
    /// error and proceeds; the old instances then refuse every call with a
    /// stale-handle fault.
    ///
    /// # Errors
    ///
    /// [`ScriptError::NotInitialized`] before `init`, or any load or discovery
    /// error (the previous generation stays current).
    pub fn reload_assembly(&mut self) -> Result<Generation, ScriptError> {
        let paths = match (self.state, &self.paths) {
            (EngineState::Uninitialized | EngineState::ShuttingDown, _) | (_, None) => {
                return Err(ScriptError::NotInitialized)
            }
            (_, Some(paths)) => paths.clone(),
        };

        if self.state == EngineState::Degraded {
            self.state = EngineState::Uninitialized;
            self.init(paths)?;
            return self.generation().ok_or(ScriptError::NotInitialized);
        }

        if !self.instances.is_empty() {
            tracing::error!(
                live_instances = self.instances.len(),
                "reloading scripts while instances are live, their handles become stale"
            );
        }

        let previous = self.state;
        self.state = EngineState::Reloading;
        match self.stage_and_commit(&paths) {
            Ok(generation) => {
                self.state = EngineState::Ready;
                self.revalidate_field_stores();
                tracing::info!(
                    generation = %generation,
                    classes = self.registry.as_ref().map_or(0, ClassRegistry::len),
                    "script assemblies reloaded"
                );
                Ok(generation)
            }
            Err(e) => {
                self.state = previous;
                tracing::error!(
                    error = %e,
                    "script reload failed, keeping the previous generation"
                );
                Err(e)
            }
        }
    }

    fn stage_and_commit(&mut self, paths: &AssemblyPaths) -> Result<Generation, ScriptError> {
        let manager = self.assemblies.as_mut().ok_or(ScriptError::NotInitialized)?;
        let previous_fingerprint = manager
            .current()
            .and_then(AppDomain::app)
            .map(|a| a.fingerprint);

        let mut staged = manager.stage(&paths.core, &paths.app)?;
        let registry = ClassReflector::default().discover(&mut staged)?;
        let generation = staged.generation();
        if staged.app().map(|a| a.fingerprint) == previous_fingerprint {
            tracing::debug!(generation = %generation, "user assembly unchanged");
        }

        manager.commit(staged);
        self.registry = Some(registry);
        Ok(generation)
    }

    fn revalidate_field_stores(&mut self) {
        let Some(registry) = self.registry.as_ref() else {
            return;
        };
        for (entity, store) in &mut self.field_stores {
            let Some(class) = registry.get(store.class_name()) else {
                tracing::debug!(
                    entity = %entity,
                    class = %store.class_name(),
                    "stored field values kept for a class that no longer exists"
                );
                continue;
            };
            let report = store.revalidate(class);
            if !report.is_empty() {
                tracing::info!(
                    entity = %entity,
                    pruned = report.pruned.len(),
                    resolved = report.resolved.len(),
                    dropped = report.dropped.len(),
                    "stored field values revalidated"
                );
            }
        }
    }

    // -- Hot reload ----------------------------------------------------------

    fn install_watcher(&mut self) {
        if !self.config.hot_reload {
            return;
        }
        let Some(paths) = &self.paths else {
            return;
        };
        let queue = self.main_thread.clone();
        match HotReloadWatcher::install(&paths.app, self.reload_trigger.clone(), move || {
            queue.submit(hot_reload_task)
        }) {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(e) => tracing::warn!(error = %e, "hot reload unavailable"),
        }
    }

    /// Record a modification of the user assembly, as the watcher does.
    /// Queues one reload task per burst; returns whether this call queued it.
    pub fn notify_assembly_modified(&self) -> bool {
        if self.reload_trigger.notify_modified() {
            self.main_thread.submit(hot_reload_task);
            return true;
        }
        false
    }

    pub fn hot_reload_state(&self) -> WatchState {
        self.reload_trigger.state()
    }

    /// A hot reload is waiting for the scene to stop.
    pub fn is_reload_deferred(&self) -> bool {
        self.reload_deferred
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Handle for submitting work to run on the main thread.
    pub fn main_thread(&self) -> MainThreadQueue<ScriptEngine> {
        self.main_thread.clone()
    }

    /// Run queued main-thread tasks, then any deferred hot reload that can now
    /// proceed. Call at the start of every frame.
    pub fn process_main_thread_tasks(&mut self) {
        for task in self.main_thread.drain() {
            task(self);
        }
        if self.reload_deferred && self.instances.is_empty() {
            self.reload_deferred = false;
            self.run_hot_reload();
        }
    }

    fn run_hot_reload(&mut self) {
        self.reload_trigger.begin_reload();
        if let Err(e) = self.reload_assembly() {
            tracing::debug!(error = %e, "hot reload kept the previous generation");
        }
        self.install_watcher();
        self.reload_trigger.finish();
    }

    // -- Scene binding -------------------------------------------------------

    /// Bind the scene that is about to simulate.
    pub fn set_scene_context(&mut self, scene: &Scene) {
        self.scene = Some(SceneContext {
            name: scene.name().to_owned(),
        });
        if let Some(domain) = self.domain_mut() {
            domain.host_mut().snapshot_scene(scene);
        }
        tracing::debug!(scene = %scene.name(), "scene context set");
    }

    /// Unbind the scene, destroy every live instance, and release their
    /// objects from the managed heap. Stored field values are kept.
    pub fn clear_scene_context(&mut self) {
        let destroyed = self.instances.len();
        self.instances.clear();
        if let Some(domain) = self.domain_mut() {
            match domain.reset_heap() {
                Ok(reclaimed) => tracing::trace!(bytes = reclaimed, "managed heap reset"),
                Err(fault) => fault.report(),
            }
        }
        if let Some(scene) = self.scene.take() {
            tracing::debug!(scene = %scene.name, destroyed, "scene context cleared");
        }
    }

    pub fn scene_context(&self) -> Option<&str> {
        self.scene.as_ref().map(|s| s.name.as_str())
    }

    /// Refresh the scene snapshot and frame metadata native callbacks read.
    pub fn begin_frame(&mut self, scene: &Scene, frame: u64, delta_time: f32) {
        let keys = self.pressed_keys.clone();
        if let Some(domain) = self.domain_mut() {
            let host = domain.host_mut();
            host.begin_frame(scene, frame, delta_time);
            host.pressed_keys = keys;
        }
    }

    pub fn set_key_down(&mut self, key: i32, down: bool) {
        if down {
            self.pressed_keys.insert(key);
        } else {
            self.pressed_keys.remove(&key);
        }
    }

    /// Take the scene mutations scripts queued since the last drain.
    pub fn drain_scene_commands(&mut self) -> Vec<SceneCommand> {
        self.domain_mut()
            .map(|domain| domain.host_mut().drain_commands())
            .unwrap_or_default()
    }

    // -- Entities ------------------------------------------------------------

    /// Create the script instance of `entity`, seed it from its stored field
    /// values, and invoke `OnCreate`.
    ///
    /// Entities without a script component, with an unknown class, or that
    /// already have an instance are skipped. Faults are logged.
    pub fn on_create_entity(&mut self, entity: &Entity) {
        let Some(component) = entity.script() else {
            return;
        };
        let uuid = entity.uuid();
        if self.scene.is_none() {
            tracing::warn!(entity = %uuid, "on_create_entity without a scene context");
            return;
        }
        if self.instances.contains_key(&uuid) {
            tracing::debug!(entity = %uuid, "entity already has a script instance");
            return;
        }
        let Some(registry) = self.registry.as_ref() else {
            tracing::warn!(entity = %uuid, "scripting is not initialized");
            return;
        };
        let Some(class) = registry.get(&component.class_name).cloned() else {
            tracing::warn!(entity = %uuid, class = %component.class_name, "script class not found");
            return;
        };
        let Some(domain) = self.assemblies.as_mut().and_then(AssemblyManager::current_mut) else {
            return;
        };

        let instance = match ScriptInstance::new(domain, registry, class.clone(), uuid) {
            Ok(instance) => instance,
            Err(ScriptError::Fault(fault)) => {
                self.fault_count += 1;
                fault.report();
                return;
            }
            Err(e) => {
                tracing::error!(
                    entity = %uuid,
                    class = %class.full_name(),
                    error = %e,
                    "failed to create script instance"
                );
                return;
            }
        };

        if let Some(store) = self.field_stores.get_mut(&uuid) {
            if store.class_name() == class.full_name() {
                sync_fields(domain, &instance, &class, store);
            } else {
                tracing::warn!(
                    entity = %uuid,
                    stored = %store.class_name(),
                    class = %class.full_name(),
                    "stored field values belong to another class, ignored"
                );
            }
        }

        let created = instance.invoke_create(domain);
        self.instances.insert(uuid, instance);
        if let Err(fault) = created {
            self.report(&fault);
        }
    }

    /// Invoke `OnUpdate(delta_time)` on the instance of `entity`. A missing
    /// instance is logged and skipped; faults are logged.
    pub fn on_update_entity(&mut self, entity: Uuid, delta_time: f32) {
        let Some(instance) = self.instances.get(&entity) else {
            tracing::error!(entity = %entity, "no script instance for entity");
            return;
        };
        let Some(domain) = self.assemblies.as_mut().and_then(AssemblyManager::current_mut) else {
            return;
        };
        if let Err(fault) = instance.invoke_update(domain, delta_time) {
            self.report(&fault);
        }
    }

    pub fn instance(&self, entity: Uuid) -> Option<&ScriptInstance> {
        self.instances.get(&entity)
    }

    /// The live managed object bound to `entity`.
    pub fn managed_object(&self, entity: Uuid) -> Option<ObjectHandle> {
        self.instances.get(&entity).map(ScriptInstance::object)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Read a field of the live instance of `entity`.
    pub fn get_field<T: FieldValue>(&mut self, entity: Uuid, name: &str) -> Result<T, ScriptError> {
        let instance = self
            .instances
            .get(&entity)
            .ok_or(ScriptError::NoInstance { entity })?;
        let domain = self
            .assemblies
            .as_mut()
            .and_then(AssemblyManager::current_mut)
            .ok_or(ScriptError::NotInitialized)?;
        instance.try_get_field(domain, name)
    }

    /// Write a field of the live instance of `entity`.
    pub fn set_field<T: FieldValue>(
        &mut self,
        entity: Uuid,
        name: &str,
        value: T,
    ) -> Result<(), ScriptError> {
        let instance = self
            .instances
            .get(&entity)
            .ok_or(ScriptError::NoInstance { entity })?;
        let domain = self
            .assemblies
            .as_mut()
            .and_then(AssemblyManager::current_mut)
            .ok_or(ScriptError::NotInitialized)?;
        instance.try_set_field(domain, name, value)
    }

    // -- Classes -------------------------------------------------------------

    /// Sorted full names of the discovered script classes.
    pub fn class_names(&self) -> Vec<String> {
        self.registry
            .as_ref()
            .map(ClassRegistry::class_names)
            .unwrap_or_default()
    }

    pub fn entity_class_exists(&self, full_name: &str) -> bool {
        self.registry
            .as_ref()
            .is_some_and(|registry| registry.contains(full_name))
    }

    pub fn class(&self, full_name: &str) -> Option<&std::sync::Arc<ScriptClass>> {
        self.registry.as_ref().and_then(|registry| registry.get(full_name))
    }

    pub fn registry(&self) -> Option<&ClassRegistry> {
        self.registry.as_ref()
    }

    // -- Stored field values -------------------------------------------------

    pub fn field_store(&self, entity: Uuid) -> Option<&FieldValueStore> {
        self.field_stores.get(&entity)
    }

    /// The stored field values of `entity` for `class_name`, created empty if
    /// absent. Values stored for a different class are replaced.
    pub fn field_store_mut(&mut self, entity: Uuid, class_name: &str) -> &mut FieldValueStore {
        let store = self
            .field_stores
            .entry(entity)
            .or_insert_with(|| FieldValueStore::new(class_name));
        if store.class_name() != class_name {
            tracing::debug!(
                entity = %entity,
                old = %store.class_name(),
                new = %class_name,
                "stored field values reset for new class"
            );
            *store = FieldValueStore::new(class_name);
        }
        store
    }

    /// Drop the stored field values of `entity` (entity destroyed or script
    /// detached).
    pub fn remove_field_store(&mut self, entity: Uuid) -> Option<FieldValueStore> {
        self.field_stores.remove(&entity)
    }

    /// All stored field values as persisted records, ordered by entity and
    /// field name.
    pub fn export_field_values(&self) -> Vec<SerializedFieldValue> {
        let mut entities: Vec<&Uuid> = self.field_stores.keys().collect();
        entities.sort();
        entities
            .into_iter()
            .filter_map(|entity| self.field_stores.get(entity).map(|s| s.to_serialized(*entity)))
            .flatten()
            .collect()
    }

    /// Load persisted records into the stores. Returns how many were
    /// accepted.
    pub fn import_field_values(&mut self, records: &[SerializedFieldValue]) -> usize {
        let mut accepted = 0;
        for record in records {
            let store = self.field_store_mut(record.entity, &record.class_name);
            if store.insert_serialized(record) {
                accepted += 1;
            }
        }
        accepted
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main-thread half of a hot reload: drop the watcher, then reload now or,
/// while a scene is playing, once it stops.
fn hot_reload_task(engine: &mut ScriptEngine) {
    engine.watcher = None;
    if !engine.instances.is_empty() {
        tracing::info!("scene is playing, hot reload deferred until it stops");
        engine.reload_deferred = true;
        return;
    }
    engine.run_hot_reload();
}

/// Push stored field values into a fresh instance.
fn sync_fields(
    domain: &mut AppDomain,
    instance: &ScriptInstance,
    class: &ScriptClass,
    store: &mut FieldValueStore,
) {
    store.revalidate(class);
    for value in store.iter() {
        let Some(descriptor) = class.field(value.name()) else {
            continue;
        };
        match descriptor.field_type {
            FieldType::Invalid => continue,
            FieldType::Entity if value.buffer().entity_uuid() == 0 => {
                tracing::error!(
                    entity = %instance.entity(),
                    field = %value.name(),
                    "entity reference field is unset, left empty"
                );
                continue;
            }
            _ => {}
        }
        if let Err(e) = instance.set_field_raw(domain, value.name(), value.buffer()) {
            tracing::error!(
                entity = %instance.entity(),
                field = %value.name(),
                error = %e,
                "failed to apply stored field value"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
