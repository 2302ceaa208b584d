//! Play sessions against the sandbox assembly of `lumen-script`.

use std::path::{Path, PathBuf};

use lumen_runtime::prelude::*;
use lumen_scene::{Scene, Uuid};
use lumen_script::{AssemblyPaths, ScriptEngine, ScriptEngineConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn script_crate(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../lumen-script")
        .join(relative)
}

fn engine_for(app: &Path) -> ScriptEngine {
    let mut engine = ScriptEngine::new(ScriptEngineConfig {
        hot_reload: false,
        ..ScriptEngineConfig::default()
    });
    engine
        .init(AssemblyPaths::new(script_crate("assets/LumenCore.wat"), app))
        .expect("sandbox assembly should load");
    engine
}

fn sandbox_engine() -> ScriptEngine {
    engine_for(&script_crate("tests/fixtures/sandbox.wat"))
}

/// Player, a Destroyer, and the entity it destroys.
fn level() -> (SceneDocument, Uuid, Uuid, Uuid) {
    let mut scene = Scene::new("level");
    let player = scene.create_entity("Player");
    scene.attach_script(player, "Sandbox.Player").unwrap();
    let destroyer = scene.create_entity("Destroyer");
    scene.attach_script(destroyer, "Sandbox.Destroyer").unwrap();
    let target = scene.create_entity("Target");
    (SceneDocument::new(scene), player, destroyer, target)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn play_simulates_a_copy_of_the_scene() {
    let (document, player, _destroyer, target) = level();
    let mut runtime = Runtime::new(sandbox_engine(), document, RuntimeConfig::default());

    runtime.play();
    assert_eq!(runtime.engine().instance_count(), 2);
    let diagnostics = runtime.step().clone();
    assert_eq!(diagnostics.frame, 1);
    assert_eq!(diagnostics.scripts_updated, 2);
    assert_eq!(diagnostics.commands_applied, 1);
    assert!(!runtime.active_scene().contains(target));
    assert!(runtime.edit_scene().contains(target));

    let summary = runtime.run(4);
    assert_eq!(summary.frames, 4);
    assert_eq!(summary.faults, 0);
    assert_eq!(summary.entities, 2);
    assert_eq!(
        runtime.engine_mut().get_field::<i32>(player, "UpdateCount").unwrap(),
        5
    );

    runtime.stop();
    assert_eq!(runtime.engine().instance_count(), 0);
    assert_eq!(runtime.active_scene().entity_count(), 3);
}

#[test]
fn stored_field_values_flow_from_the_document() {
    let (mut document, player, _destroyer, _target) = level();
    let mut engine = sandbox_engine();
    engine.field_store_mut(player, "Sandbox.Player").set("Speed", 40i32);
    document.script_fields = engine.export_field_values();

    let mut runtime = Runtime::new(sandbox_engine(), document, RuntimeConfig::default());
    runtime.play();
    assert_eq!(
        runtime.engine_mut().get_field::<i32>(player, "Speed").unwrap(),
        40
    );

    let saved = runtime.to_document();
    assert_eq!(saved.script_fields.len(), 1);
    assert_eq!(saved.scene.entity_count(), 3);
}

#[test]
fn faulting_scripts_do_not_stop_the_loop() {
    let mut scene = Scene::new("faults");
    let faulty = scene.create_entity("Faulty");
    scene.attach_script(faulty, "Sandbox.Faulty").unwrap();
    let player = scene.create_entity("Player");
    scene.attach_script(player, "Sandbox.Player").unwrap();

    let mut engine = ScriptEngine::new(ScriptEngineConfig {
        hot_reload: false,
        fuel_per_call: 20_000,
        ..ScriptEngineConfig::default()
    });
    engine
        .init(AssemblyPaths::new(
            script_crate("assets/LumenCore.wat"),
            script_crate("tests/fixtures/sandbox.wat"),
        ))
        .unwrap();

    let mut runtime = Runtime::new(engine, SceneDocument::new(scene), RuntimeConfig::default());
    runtime.play();
    let summary = runtime.run(3);
    assert_eq!(summary.faults, 3);
    assert_eq!(runtime.engine().fault_count(), 4);
    assert_eq!(
        runtime.engine_mut().get_field::<i32>(player, "UpdateCount").unwrap(),
        3
    );
}

#[test]
fn hot_reload_waits_for_stop() {
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("Sandbox.wat");
    std::fs::copy(script_crate("tests/fixtures/sandbox.wat"), &app).unwrap();

    let (document, _player, _destroyer, _target) = level();
    let mut runtime = Runtime::new(engine_for(&app), document, RuntimeConfig::default());
    let generation = runtime.engine().generation();

    runtime.play();
    std::fs::copy(script_crate("tests/fixtures/sandbox_v2.wat"), &app).unwrap();
    assert!(runtime.engine().notify_assembly_modified());
    runtime.step();
    assert!(runtime.engine().is_reload_deferred());
    assert_eq!(runtime.engine().generation(), generation);

    runtime.stop();
    runtime.step();
    assert!(runtime.engine().generation() > generation);
    assert!(runtime.engine().entity_class_exists("Sandbox.Enemy"));
}
