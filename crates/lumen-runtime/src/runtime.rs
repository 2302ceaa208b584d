//! Edit/play/stop loop.
//!
//! Each [`Runtime::step`]:
//!
//! 1. Runs queued main-thread work (hot reloads).
//! 2. In play mode, refreshes the scripts' scene snapshot and runs `OnUpdate`
//!    on every scripted entity in UUID order.
//! 3. Applies the scene commands the scripts queued (FIFO).

use std::time::{Duration, Instant};

use lumen_scene::{Entity, Scene, Uuid};
use lumen_script::ScriptEngine;

use crate::document::SceneDocument;

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Frame loop configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Seconds passed to `OnUpdate` every frame. Must be positive and finite.
    pub fixed_dt: f32,
    /// Upper bound on frames simulated by one [`Runtime::run`] call.
    pub max_frames: Option<u64>,
}

impl Default for RuntimeConfig {
    /// 60 Hz, unbounded.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_frames: None,
        }
    }
}

/// Whether the scene is being authored or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Edit,
    Play,
}

/// Timing and counts for the last frame.
#[derive(Debug, Clone, Default)]
pub struct FrameDiagnostics {
    pub frame: u64,
    /// Entities whose `OnUpdate` was dispatched.
    pub scripts_updated: usize,
    /// Scene commands that took effect.
    pub commands_applied: usize,
    pub update_time: Duration,
}

/// Result of [`Runtime::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    /// Script faults raised during the run.
    pub faults: u64,
    /// Entities left in the simulated scene.
    pub entities: usize,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Owns the script engine and the scene it simulates.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    engine: ScriptEngine,
    edit_scene: Scene,
    play_scene: Option<Scene>,
    frame: u64,
    last_diagnostics: FrameDiagnostics,
}

impl Runtime {
    /// Bind `engine` to the scene of `document`, loading its stored field
    /// values into the engine.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is not positive and finite.
    pub fn new(mut engine: ScriptEngine, document: SceneDocument, config: RuntimeConfig) -> Self {
        assert!(
            config.fixed_dt > 0.0 && config.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        let accepted = engine.import_field_values(&document.script_fields);
        if accepted < document.script_fields.len() {
            tracing::warn!(
                skipped = document.script_fields.len() - accepted,
                "some stored field values could not be loaded"
            );
        }
        Self {
            config,
            engine,
            edit_scene: document.scene,
            play_scene: None,
            frame: 0,
            last_diagnostics: FrameDiagnostics::default(),
        }
    }

    pub fn mode(&self) -> RuntimeMode {
        if self.play_scene.is_some() {
            RuntimeMode::Play
        } else {
            RuntimeMode::Edit
        }
    }

    /// Frames simulated since the last [`play`](Self::play).
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ScriptEngine {
        &mut self.engine
    }

    /// The authored scene.
    pub fn edit_scene(&self) -> &Scene {
        &self.edit_scene
    }

    /// Mutable access to the authored scene. Edits made during play take
    /// effect at the next [`play`](Self::play).
    pub fn edit_scene_mut(&mut self) -> &mut Scene {
        &mut self.edit_scene
    }

    /// The simulated scene while playing, the authored scene otherwise.
    pub fn active_scene(&self) -> &Scene {
        self.play_scene.as_ref().unwrap_or(&self.edit_scene)
    }

    pub fn last_diagnostics(&self) -> &FrameDiagnostics {
        &self.last_diagnostics
    }

    /// Snapshot the authored scene and its stored field values.
    pub fn to_document(&self) -> SceneDocument {
        SceneDocument {
            scene: self.edit_scene.clone(),
            script_fields: self.engine.export_field_values(),
        }
    }

    // -- Mode changes --------------------------------------------------------

    /// Start simulating a copy of the authored scene. Every scripted entity
    /// gets an instance and its `OnCreate` runs.
    pub fn play(&mut self) {
        if self.play_scene.is_some() {
            tracing::debug!("play requested while already playing");
            return;
        }
        let scene = self.edit_scene.clone();
        self.engine.set_scene_context(&scene);
        self.engine.begin_frame(&scene, 0, 0.0);
        for entity in scene.scripted_entities() {
            self.engine.on_create_entity(entity);
        }
        tracing::info!(
            scene = %scene.name(),
            instances = self.engine.instance_count(),
            "play started"
        );
        self.play_scene = Some(scene);
        self.frame = 0;
    }

    /// Stop simulating: destroy every instance and discard the runtime copy.
    pub fn stop(&mut self) {
        let Some(scene) = self.play_scene.take() else {
            return;
        };
        self.engine.clear_scene_context();
        tracing::info!(scene = %scene.name(), frames = self.frame, "play stopped");
    }

    // -- Frames --------------------------------------------------------------

    /// Advance one frame.
    pub fn step(&mut self) -> &FrameDiagnostics {
        let start = Instant::now();
        self.engine.process_main_thread_tasks();

        let Some(scene) = self.play_scene.as_mut() else {
            self.last_diagnostics = FrameDiagnostics {
                frame: self.frame,
                update_time: start.elapsed(),
                ..FrameDiagnostics::default()
            };
            return &self.last_diagnostics;
        };

        self.frame += 1;
        let dt = self.config.fixed_dt;
        self.engine.begin_frame(scene, self.frame, dt);

        let scripted: Vec<Uuid> = scene.scripted_entities().map(Entity::uuid).collect();
        for entity in &scripted {
            self.engine.on_update_entity(*entity, dt);
        }
        let commands_applied = scene.apply_commands(self.engine.drain_scene_commands());

        self.last_diagnostics = FrameDiagnostics {
            frame: self.frame,
            scripts_updated: scripted.len(),
            commands_applied,
            update_time: start.elapsed(),
        };
        tracing::trace!(
            frame = self.frame,
            scripts = scripted.len(),
            commands = commands_applied,
            "frame complete"
        );
        &self.last_diagnostics
    }

    /// Advance up to `frames` frames, capped by
    /// [`RuntimeConfig::max_frames`].
    pub fn run(&mut self, frames: u64) -> RunSummary {
        let frames = self.config.max_frames.map_or(frames, |max| frames.min(max));
        let faults_before = self.engine.fault_count();
        for _ in 0..frames {
            self.step();
        }
        RunSummary {
            frames,
            faults: self.engine.fault_count() - faults_before,
            entities: self.active_scene().entity_count(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_script::ScriptEngineConfig;

    fn runtime(config: RuntimeConfig) -> Runtime {
        let mut scene = Scene::new("inert");
        let a = scene.create_entity("A");
        scene.attach_script(a, "Sandbox.Player").unwrap();
        let engine = ScriptEngine::new(ScriptEngineConfig {
            hot_reload: false,
            ..ScriptEngineConfig::default()
        });
        Runtime::new(engine, SceneDocument::new(scene), config)
    }

    #[test]
    fn play_and_stop_switch_modes() {
        let mut runtime = runtime(RuntimeConfig::default());
        assert_eq!(runtime.mode(), RuntimeMode::Edit);

        runtime.play();
        assert_eq!(runtime.mode(), RuntimeMode::Play);
        runtime.step();
        runtime.step();
        assert_eq!(runtime.frame(), 2);

        runtime.stop();
        assert_eq!(runtime.mode(), RuntimeMode::Edit);
    }

    #[test]
    fn edit_mode_frames_do_not_simulate() {
        let mut runtime = runtime(RuntimeConfig::default());
        let diagnostics = runtime.step();
        assert_eq!(diagnostics.frame, 0);
        assert_eq!(diagnostics.scripts_updated, 0);
    }

    #[test]
    fn run_respects_max_frames() {
        let mut runtime = runtime(RuntimeConfig {
            max_frames: Some(3),
            ..RuntimeConfig::default()
        });
        runtime.play();
        let summary = runtime.run(10);
        assert_eq!(summary.frames, 3);
        assert_eq!(runtime.frame(), 3);
        assert_eq!(summary.entities, 1);
    }

    #[test]
    #[should_panic(expected = "fixed_dt must be positive")]
    fn zero_dt_is_rejected() {
        runtime(RuntimeConfig {
            fixed_dt: 0.0,
            ..RuntimeConfig::default()
        });
    }
}
