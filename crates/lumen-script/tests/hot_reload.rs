//! Reload and hot-reload tests.
//!
//! Each test works on a private copy of the sandbox assembly in a temporary
//! directory so it can be rewritten between reloads.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lumen_scene::{Scene, Uuid};
use lumen_script::prelude::*;
use lumen_script::WatchState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn core_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/LumenCore.wat")
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A temporary project whose user assembly starts as `sandbox.wat`.
struct Project {
    _dir: tempfile::TempDir,
    app: PathBuf,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Sandbox.wat");
        std::fs::copy(fixture("sandbox.wat"), &app).unwrap();
        Self { _dir: dir, app }
    }

    fn paths(&self) -> AssemblyPaths {
        AssemblyPaths::new(core_path(), &self.app)
    }

    /// Replace the user assembly with another fixture.
    fn rewrite(&self, fixture_name: &str) {
        std::fs::copy(fixture(fixture_name), &self.app).unwrap();
    }

    fn engine(&self, hot_reload: bool) -> ScriptEngine {
        let mut engine = ScriptEngine::new(ScriptEngineConfig {
            hot_reload,
            ..ScriptEngineConfig::default()
        });
        engine.init(self.paths()).unwrap();
        engine
    }
}

fn scripted_scene(class: &str) -> (Scene, Uuid) {
    let mut scene = Scene::new("reload");
    let id = scene.create_entity("Subject");
    scene.attach_script(id, class).unwrap();
    (scene, id)
}

/// Every class with its fields (name, type, offset), sorted.
fn class_shape(engine: &ScriptEngine) -> Vec<(String, Vec<(String, FieldType, u32)>)> {
    let mut shape: Vec<_> = engine
        .registry()
        .expect("engine is initialized")
        .classes()
        .map(|class| {
            let fields = class
                .fields()
                .values()
                .map(|f| (f.name.clone(), f.field_type, f.handle.offset()))
                .collect();
            (class.full_name().to_owned(), fields)
        })
        .collect();
    shape.sort_by(|a, b| a.0.cmp(&b.0));
    shape
}

// ---------------------------------------------------------------------------
// Test 1: Explicit reload
// ---------------------------------------------------------------------------

#[test]
fn reload_is_idempotent() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let names = engine.class_names();
    let shape = class_shape(&engine);
    let first = engine.generation().unwrap();

    let second = engine.reload_assembly().unwrap();
    let after_second = class_shape(&engine);
    let third = engine.reload_assembly().unwrap();
    assert!(first < second && second < third);
    assert_eq!(engine.class_names(), names);
    assert_eq!(after_second, shape);
    assert_eq!(class_shape(&engine), shape);
    assert!(shape.iter().any(|(class, fields)| class == "Sandbox.Player" && fields.len() == 8));
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn failed_reload_keeps_previous_generation() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let names = engine.class_names();
    let generation = engine.generation();

    project.rewrite("broken.wat");
    let err = engine.reload_assembly().unwrap_err();
    assert!(matches!(err, ScriptError::AssemblyLoad { .. }), "got {err:?}");
    assert_eq!(engine.class_names(), names);
    assert_eq!(engine.generation(), generation);
    assert_eq!(engine.state(), EngineState::Ready);

    // The previous generation still runs scripts.
    let (scene, id) = scripted_scene("Sandbox.Foo");
    engine.set_scene_context(&scene);
    engine.on_create_entity(scene.entity(id).unwrap());
    assert_eq!(engine.get_field::<i32>(id, "Speed").unwrap(), 5);
}

#[test]
fn failed_reload_leaves_live_instances_running() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let (scene, id) = scripted_scene("Sandbox.Player");
    engine.set_scene_context(&scene);
    engine.on_create_entity(scene.entity(id).unwrap());
    engine.on_update_entity(id, 0.1);

    project.rewrite("broken.wat");
    assert!(engine.reload_assembly().is_err());

    engine.on_update_entity(id, 0.1);
    assert_eq!(engine.get_field::<i32>(id, "UpdateCount").unwrap(), 2);
    assert_eq!(engine.fault_count(), 0);
}

#[test]
fn reload_picks_up_changed_classes() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let (scene, id) = scripted_scene("Sandbox.Player");

    project.rewrite("sandbox_v2.wat");
    engine.reload_assembly().unwrap();
    assert_eq!(engine.class_names(), vec!["Sandbox.Enemy", "Sandbox.Player"]);

    engine.set_scene_context(&scene);
    engine.on_create_entity(scene.entity(id).unwrap());
    assert_eq!(engine.get_field::<f32>(id, "Speed").unwrap(), 2.5);
    assert_eq!(engine.get_field::<i32>(id, "Stamina").unwrap(), 50);
    assert!(matches!(
        engine.get_field::<f32>(id, "Health"),
        Err(ScriptError::FieldNotFound { .. })
    ));
}

#[test]
fn reload_revalidates_stored_values() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let id = Uuid::from_raw(5).unwrap();
    let store = engine.field_store_mut(id, "Sandbox.Player");
    store.set("Speed", 7i32);
    store.set("Health", 50.0f32);
    store.set("UpdateCount", 2i32);

    project.rewrite("sandbox_v2.wat");
    engine.reload_assembly().unwrap();

    let store = engine.field_store(id).unwrap();
    // Speed changed type, Health was removed.
    assert!(!store.contains("Speed"));
    assert!(!store.contains("Health"));
    assert_eq!(store.get::<i32>("UpdateCount"), Some(2));
}

#[test]
fn stores_of_removed_classes_are_kept() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let id = Uuid::from_raw(6).unwrap();
    engine.field_store_mut(id, "Sandbox.Foo").set("Speed", 4i32);

    project.rewrite("sandbox_v2.wat");
    engine.reload_assembly().unwrap();
    assert!(!engine.entity_class_exists("Sandbox.Foo"));
    assert_eq!(engine.field_store(id).and_then(|s| s.get::<i32>("Speed")), Some(4));
}

#[test]
fn handles_from_previous_generation_are_refused() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let (scene, id) = scripted_scene("Sandbox.Player");
    engine.set_scene_context(&scene);
    engine.on_create_entity(scene.entity(id).unwrap());
    let stale_object = engine.managed_object(id).unwrap();

    // Reloading with a live instance is allowed but leaves it stale.
    engine.reload_assembly().unwrap();
    assert_ne!(stale_object.generation(), engine.generation().unwrap());

    let mut bytes = [0u8; 4];
    assert!(matches!(
        engine.domain().unwrap().read_bytes(stale_object, 8, &mut bytes),
        Err(ScriptError::StaleHandle { .. })
    ));
    assert!(matches!(
        engine.get_field::<i32>(id, "Speed"),
        Err(ScriptError::StaleHandle { .. })
    ));

    engine.on_update_entity(id, 0.1);
    assert_eq!(engine.fault_count(), 1);
}

// ---------------------------------------------------------------------------
// Test 2: Hot reload through the main-thread queue
// ---------------------------------------------------------------------------

#[test]
fn hot_reload_waits_for_the_scene_to_stop() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let (scene, id) = scripted_scene("Sandbox.Foo");
    engine.set_scene_context(&scene);
    engine.on_create_entity(scene.entity(id).unwrap());
    let generation = engine.generation();

    project.rewrite("sandbox_v2.wat");
    assert!(engine.notify_assembly_modified());
    assert!(!engine.notify_assembly_modified());

    engine.process_main_thread_tasks();
    assert!(engine.is_reload_deferred());
    assert_eq!(engine.generation(), generation);
    assert_eq!(engine.get_field::<i32>(id, "Speed").unwrap(), 5);

    engine.clear_scene_context();
    engine.process_main_thread_tasks();
    assert!(!engine.is_reload_deferred());
    assert!(engine.generation() > generation);
    assert!(engine.entity_class_exists("Sandbox.Enemy"));
    assert_eq!(engine.hot_reload_state(), WatchState::Idle);
}

#[test]
fn hot_reload_runs_immediately_when_idle() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let generation = engine.generation();

    project.rewrite("sandbox_v2.wat");
    engine.notify_assembly_modified();
    assert_eq!(engine.hot_reload_state(), WatchState::PendingReload);
    engine.process_main_thread_tasks();

    assert!(engine.generation() > generation);
    assert_eq!(engine.hot_reload_state(), WatchState::Idle);
    assert!(engine.main_thread().is_empty());
}

#[test]
fn failed_hot_reload_returns_to_idle() {
    let project = Project::new();
    let mut engine = project.engine(false);
    let generation = engine.generation();

    project.rewrite("broken.wat");
    engine.notify_assembly_modified();
    engine.process_main_thread_tasks();

    assert_eq!(engine.generation(), generation);
    assert_eq!(engine.hot_reload_state(), WatchState::Idle);
    assert!(engine.notify_assembly_modified());
}

#[test]
fn watcher_reloads_after_file_change() {
    let project = Project::new();
    let mut engine = project.engine(true);
    assert!(engine.is_watching());
    let generation = engine.generation();

    project.rewrite("sandbox_v2.wat");

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.generation() == generation && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
        engine.process_main_thread_tasks();
    }
    assert!(engine.generation() > generation, "watcher never triggered a reload");
    assert!(engine.entity_class_exists("Sandbox.Enemy"));
    assert!(engine.is_watching());
}

// ---------------------------------------------------------------------------
// Test 3: Recovery from a failed first load
// ---------------------------------------------------------------------------

/// A project directory with no user assembly yet.
fn empty_project() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("Sandbox.wat");
    (dir, app)
}

fn degraded_engine(app: &Path, hot_reload: bool) -> ScriptEngine {
    let mut engine = ScriptEngine::new(ScriptEngineConfig {
        hot_reload,
        ..ScriptEngineConfig::default()
    });
    let err = engine.init(AssemblyPaths::new(core_path(), app)).unwrap_err();
    assert!(matches!(err, ScriptError::UserAssemblyMissing { .. }), "got {err:?}");
    assert_eq!(engine.state(), EngineState::Degraded);
    engine
}

#[test]
fn degraded_engine_keeps_watching() {
    let (_dir, app) = empty_project();
    let mut engine = degraded_engine(&app, true);
    assert!(engine.is_watching());

    engine.shutdown();
    assert!(!engine.is_watching());
}

#[test]
fn degraded_engine_does_not_watch_without_hot_reload() {
    let (_dir, app) = empty_project();
    let engine = degraded_engine(&app, false);
    assert!(!engine.is_watching());
}

#[test]
fn queued_reload_recovers_a_degraded_engine() {
    let (_dir, app) = empty_project();
    let mut engine = degraded_engine(&app, false);

    // Still missing: the engine stays degraded and the trigger settles.
    assert!(engine.notify_assembly_modified());
    engine.process_main_thread_tasks();
    assert_eq!(engine.state(), EngineState::Degraded);
    assert_eq!(engine.hot_reload_state(), WatchState::Idle);

    std::fs::copy(fixture("sandbox.wat"), &app).unwrap();
    assert!(engine.notify_assembly_modified());
    engine.process_main_thread_tasks();
    assert_eq!(engine.state(), EngineState::Ready);
    assert!(engine.entity_class_exists("Sandbox.Player"));
    assert_eq!(engine.hot_reload_state(), WatchState::Idle);
}

#[test]
fn watcher_recovers_a_degraded_engine() {
    let (_dir, app) = empty_project();
    let mut engine = degraded_engine(&app, true);

    std::fs::copy(fixture("sandbox.wat"), &app).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.state() != EngineState::Ready && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
        engine.process_main_thread_tasks();
    }
    assert_eq!(engine.state(), EngineState::Ready, "watcher never recovered the engine");
    assert!(engine.entity_class_exists("Sandbox.Player"));
    assert!(engine.is_watching());
}
