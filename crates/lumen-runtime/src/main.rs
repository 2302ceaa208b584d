//! `lumen-player` -- plays a Lumen scene headless.
//!
//! ```text
//! lumen-player --project Sandbox.lumenproj --scene Assets/level.scene.json
//!              [--frames 600] [--dt 0.0166] [--core LumenCore.wat]
//! ```
//!
//! Loads the project's user assembly, plays the scene for the requested
//! number of frames, stops, and prints a summary. Set `RUST_LOG` to control
//! log output (default `info`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use lumen_runtime::{Runtime, RuntimeConfig, SceneDocument};
use lumen_script::{AssemblyPaths, ProjectConfig, ScriptEngine, ScriptEngineConfig};

const USAGE: &str = "usage: lumen-player --project <file> --scene <file> \
                     [--frames <n>] [--dt <seconds>] [--core <file>]";

const DEFAULT_FRAMES: u64 = 600;

#[derive(Debug, Clone, PartialEq)]
struct Args {
    project: PathBuf,
    scene: PathBuf,
    frames: u64,
    dt: Option<f32>,
    core: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut project = None;
    let mut scene = None;
    let mut frames = DEFAULT_FRAMES;
    let mut dt = None;
    let mut core = None;

    let mut args = args.into_iter();
    while let Some(flag) = args.next() {
        let mut value = || {
            args.next()
                .with_context(|| format!("{flag} needs a value\n{USAGE}"))
        };
        match flag.as_str() {
            "--project" => project = Some(PathBuf::from(value()?)),
            "--scene" => scene = Some(PathBuf::from(value()?)),
            "--frames" => {
                frames = value()?
                    .parse()
                    .with_context(|| format!("--frames expects a frame count\n{USAGE}"))?;
            }
            "--dt" => {
                dt = Some(
                    value()?
                        .parse()
                        .with_context(|| format!("--dt expects seconds\n{USAGE}"))?,
                );
            }
            "--core" => core = Some(PathBuf::from(value()?)),
            other => bail!("unknown argument `{other}`\n{USAGE}"),
        }
    }

    Ok(Args {
        project: project.with_context(|| format!("--project is required\n{USAGE}"))?,
        scene: scene.with_context(|| format!("--scene is required\n{USAGE}"))?,
        frames,
        dt,
        core,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    let project = ProjectConfig::load(&args.project)?;
    let project_dir = args
        .project
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut engine_config = ScriptEngineConfig {
        hot_reload: false,
        ..ScriptEngineConfig::default()
    };
    if let Some(core) = args.core {
        engine_config.core_assembly_path = core;
    }
    let paths = AssemblyPaths::for_project(&engine_config, &project, project_dir);

    let mut engine = ScriptEngine::new(engine_config);
    engine
        .init(paths)
        .with_context(|| format!("loading scripts for project '{}'", project.name))?;

    let document = SceneDocument::load(&args.scene)?;
    let mut runtime_config = RuntimeConfig::default();
    if let Some(dt) = args.dt {
        runtime_config.fixed_dt = dt;
    }
    if !(runtime_config.fixed_dt > 0.0 && runtime_config.fixed_dt.is_finite()) {
        bail!("--dt must be positive, got {}", runtime_config.fixed_dt);
    }

    let mut runtime = Runtime::new(engine, document, runtime_config);
    runtime.play();
    let summary = runtime.run(args.frames);
    runtime.stop();

    println!(
        "{}: {} frames, {} script faults, {} entities remaining",
        project.name, summary.frames, summary.faults, summary.entities
    );
    Ok(())
}
