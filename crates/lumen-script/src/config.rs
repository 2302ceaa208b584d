//! Script engine and project configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ScriptEngineConfig
// ---------------------------------------------------------------------------

/// Engine-side configuration for the scripting runtime.
///
/// Controls where the core assembly lives and the resource limits applied to
/// every call into script code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptEngineConfig {
    /// Path of the engine-provided core assembly. Relative paths resolve
    /// against the working directory. Default: `resources/scripts/LumenCore.wat`.
    pub core_assembly_path: PathBuf,

    /// Fuel granted to each call into script code (constructor, callback,
    /// allocation). Exhausting it raises an `OutOfFuel` fault. Default:
    /// 1,000,000.
    pub fuel_per_call: u64,

    /// Maximum linear memory of one application domain, in bytes.
    /// Default: 16 MiB (16,777,216 bytes).
    pub memory_limit_bytes: usize,

    /// Watch the user assembly and reload it when it changes. Default: `true`.
    pub hot_reload: bool,
}

impl Default for ScriptEngineConfig {
    fn default() -> Self {
        Self {
            core_assembly_path: PathBuf::from("resources/scripts/LumenCore.wat"),
            fuel_per_call: 1_000_000,
            memory_limit_bytes: 16 * 1024 * 1024, // 16 MiB
            hot_reload: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

/// File extension of project files.
pub const PROJECT_FILE_EXTENSION: &str = "lumenproj";

/// Per-project settings, stored as JSON next to the project's assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Display name of the project.
    pub name: String,

    /// User script assembly, relative to the project directory.
    pub script_module_path: PathBuf,

    /// Asset directory, relative to the project directory.
    #[serde(default = "default_asset_directory")]
    pub asset_directory: PathBuf,

    /// Command that builds the user assembly, run in the project directory
    /// when the assembly is missing. First element is the program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<Vec<String>>,
}

fn default_asset_directory() -> PathBuf {
    PathBuf::from("Assets")
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, script_module_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script_module_path: script_module_path.into(),
            asset_directory: default_asset_directory(),
            build_command: None,
        }
    }

    /// Load a project file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading project file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing project file {}", path.display()))
    }

    /// Write the project file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self).context("serializing project")?;
        std::fs::write(path, text)
            .with_context(|| format!("writing project file {}", path.display()))
    }

    /// Absolute location of the user assembly for a project rooted at
    /// `project_dir`.
    pub fn app_assembly_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.script_module_path)
    }

    pub fn asset_directory(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.asset_directory)
    }
}

// ---------------------------------------------------------------------------
// AssemblyPaths
// ---------------------------------------------------------------------------

/// Everything [`ScriptEngine::init`](crate::engine::ScriptEngine::init) needs
/// to locate and, if necessary, build the assemblies.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyPaths {
    /// Engine-provided core assembly.
    pub core: PathBuf,
    /// User project assembly.
    pub app: PathBuf,
    /// Directory the build command runs in.
    pub project_dir: Option<PathBuf>,
    /// External build step for a missing user assembly.
    pub build_command: Option<Vec<String>>,
}

impl AssemblyPaths {
    pub fn new(core: impl Into<PathBuf>, app: impl Into<PathBuf>) -> Self {
        Self {
            core: core.into(),
            app: app.into(),
            project_dir: None,
            build_command: None,
        }
    }

    /// Resolve the paths for a project rooted at `project_dir`.
    pub fn for_project(
        config: &ScriptEngineConfig,
        project: &ProjectConfig,
        project_dir: &Path,
    ) -> Self {
        Self {
            core: config.core_assembly_path.clone(),
            app: project.app_assembly_path(project_dir),
            project_dir: Some(project_dir.to_path_buf()),
            build_command: project.build_command.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = ScriptEngineConfig::default();
        assert_eq!(config.fuel_per_call, 1_000_000);
        assert_eq!(config.memory_limit_bytes, 16 * 1024 * 1024);
        assert!(config.hot_reload);
    }

    #[test]
    fn engine_config_fills_missing_keys() {
        let config: ScriptEngineConfig =
            serde_json::from_str(r#"{ "fuel_per_call": 5 }"#).unwrap();
        assert_eq!(config.fuel_per_call, 5);
        assert!(config.hot_reload);
    }

    #[test]
    fn project_resolves_assembly_against_project_dir() {
        let project = ProjectConfig::new("Sandbox", "Binaries/Sandbox.wat");
        let dir = Path::new("/projects/sandbox");
        assert_eq!(
            project.app_assembly_path(dir),
            PathBuf::from("/projects/sandbox/Binaries/Sandbox.wat")
        );
        assert_eq!(
            project.asset_directory(dir),
            PathBuf::from("/projects/sandbox/Assets")
        );
    }

    #[test]
    fn project_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("Sandbox.{PROJECT_FILE_EXTENSION}"));
        let mut project = ProjectConfig::new("Sandbox", "Binaries/Sandbox.wat");
        project.build_command = Some(vec!["./build.sh".to_owned()]);
        project.save(&path).unwrap();
        assert_eq!(ProjectConfig::load(&path).unwrap(), project);
    }

    #[test]
    fn missing_project_file_reports_path() {
        let err = ProjectConfig::load(Path::new("/nonexistent/x.lumenproj")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/x.lumenproj"));
    }
}
