//! Scripting bridge benchmarks.
//!
//! Measures the per-frame costs of the bridge:
//!
//! - `OnUpdate` dispatch for one entity (call boundary plus fuel reset).
//! - Typed field reads and writes against a live object.
//! - A full reload: both assemblies rebuilt and classes rediscovered.
//!
//! Run with: `cargo bench --bench script_benchmarks`

use std::path::{Path, PathBuf};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lumen_scene::{Scene, Uuid};
use lumen_script::{AssemblyPaths, ScriptEngine, ScriptEngineConfig, Vector3};

fn asset(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(relative)
}

/// An engine with one live `Sandbox.Player`.
fn engine_with_player() -> (ScriptEngine, Scene, Uuid) {
    let mut engine = ScriptEngine::new(ScriptEngineConfig {
        hot_reload: false,
        ..ScriptEngineConfig::default()
    });
    engine
        .init(AssemblyPaths::new(
            asset("assets/LumenCore.wat"),
            asset("tests/fixtures/sandbox.wat"),
        ))
        .expect("sandbox assembly should load");

    let mut scene = Scene::new("bench");
    let player = scene.create_entity("Player");
    scene
        .attach_script(player, "Sandbox.Player")
        .expect("entity exists");
    engine.set_scene_context(&scene);
    engine.on_create_entity(scene.entity(player).expect("entity exists"));
    (engine, scene, player)
}

// ---------------------------------------------------------------------------
// Benchmark 1: OnUpdate dispatch
// ---------------------------------------------------------------------------

fn bench_on_update(c: &mut Criterion) {
    let (mut engine, scene, player) = engine_with_player();

    c.bench_function("on_update_single_entity", |b| {
        let mut frame = 0;
        b.iter(|| {
            frame += 1;
            engine.begin_frame(&scene, frame, 0.016);
            engine.on_update_entity(black_box(player), 0.016);
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark 2: Field access
// ---------------------------------------------------------------------------

fn bench_field_access(c: &mut Criterion) {
    let (mut engine, _scene, player) = engine_with_player();

    c.bench_function("field_get_int", |b| {
        b.iter(|| {
            let speed: i32 = engine.get_field(player, "Speed").expect("Speed is an int");
            black_box(speed);
        });
    });

    c.bench_function("field_set_vector3", |b| {
        b.iter(|| {
            engine
                .set_field(player, "Velocity", black_box(Vector3::new(1.0, 2.0, 3.0)))
                .expect("Velocity is a Vector3");
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark 3: Reload
// ---------------------------------------------------------------------------

fn bench_reload(c: &mut Criterion) {
    let (mut engine, _scene, _player) = engine_with_player();
    engine.clear_scene_context();

    c.bench_function("reload_assembly", |b| {
        b.iter(|| {
            let generation = engine.reload_assembly().expect("reload should succeed");
            black_box(generation);
        });
    });
}

criterion_group!(benches, bench_on_update, bench_field_access, bench_reload);
criterion_main!(benches);
