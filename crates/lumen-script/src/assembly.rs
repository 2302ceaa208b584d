//! Assembly loading and the application domain.
//!
//! The root domain is one fuel-metered [`wasmtime::Engine`] that lives as long
//! as the [`AssemblyManager`]. Script code runs in an [`AppDomain`]: a
//! [`Store`] plus [`Linker`] holding the core assembly, the native callback
//! table, and the user assembly. A domain is never patched in place; a reload
//! builds a complete new domain with the next [`Generation`] and swaps it in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use wasmtime::{Engine, Func, Instance, Linker, Memory, Module, Store, StoreLimitsBuilder, Val};

use crate::config::{AssemblyPaths, ScriptEngineConfig};
use crate::fault::ScriptFault;
use crate::handle::{Generation, MethodHandle, ObjectHandle};
use crate::host_api::{register_host_api, HostState};
use crate::reflect::ScriptClass;
use crate::ScriptError;

/// Module name the core assembly is registered under; user assemblies import
/// `memory` and `alloc` from it.
pub const CORE_MODULE_NAME: &str = "Lumen.Core";

// ---------------------------------------------------------------------------
// LoadedAssembly
// ---------------------------------------------------------------------------

/// One compiled and instantiated assembly.
#[derive(Debug)]
pub struct LoadedAssembly {
    pub path: PathBuf,
    pub module: Module,
    pub instance: Instance,
    /// BLAKE3 hash of the file contents.
    pub fingerprint: blake3::Hash,
}

/// Read and compile an assembly file. The byte buffer is released when this
/// returns, whether or not compilation succeeded.
fn compile(engine: &Engine, path: &Path) -> Result<(Module, blake3::Hash), ScriptError> {
    let bytes = std::fs::read(path).map_err(|e| ScriptError::AssemblyLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let fingerprint = blake3::hash(&bytes);
    let module = Module::new(engine, &bytes).map_err(|e| ScriptError::AssemblyLoad {
        path: path.to_path_buf(),
        reason: format!("{e:#}"),
    })?;
    Ok((module, fingerprint))
}

// ---------------------------------------------------------------------------
// AppDomain
// ---------------------------------------------------------------------------

/// One load generation of the managed runtime.
pub struct AppDomain {
    generation: Generation,
    store: Store<HostState>,
    linker: Linker<HostState>,
    core: Option<LoadedAssembly>,
    app: Option<LoadedAssembly>,
    memory: Option<Memory>,
    alloc: Option<Func>,
    heap_mark: Option<Func>,
    heap_reset: Option<Func>,
    /// Heap top once the assemblies are loaded; [`reset_heap`](Self::reset_heap)
    /// rewinds to it.
    heap_base: u32,
    /// Base-type wrapper per entity UUID, valid until the next heap reset.
    entity_wrappers: HashMap<u64, ObjectHandle>,
    host_api_registered: bool,
    fuel_per_call: u64,
}

impl AppDomain {
    /// Create an empty domain.
    pub fn new(engine: &Engine, generation: Generation, config: &ScriptEngineConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.memory_limit_bytes)
            .build();
        let mut store = Store::new(engine, HostState::new(limits));
        store.limiter(|state| &mut state.limits);

        Self {
            generation,
            store,
            linker: Linker::new(engine),
            core: None,
            app: None,
            memory: None,
            alloc: None,
            heap_mark: None,
            heap_reset: None,
            heap_base: 0,
            entity_wrappers: HashMap::new(),
            host_api_registered: false,
            fuel_per_call: config.fuel_per_call,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn core(&self) -> Option<&LoadedAssembly> {
        self.core.as_ref()
    }

    pub fn app(&self) -> Option<&LoadedAssembly> {
        self.app.as_ref()
    }

    pub fn host(&self) -> &HostState {
        self.store.data()
    }

    pub fn host_mut(&mut self) -> &mut HostState {
        self.store.data_mut()
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    /// Fuel left over from the most recent call.
    pub fn fuel_remaining(&self) -> u64 {
        self.store.get_fuel().unwrap_or(0)
    }

    /// Load the core assembly into this domain and expose it to later modules
    /// under [`CORE_MODULE_NAME`].
    ///
    /// # Errors
    ///
    /// [`ScriptError::AssemblyLoad`] if the file is missing or malformed, does
    /// not export `memory`, `alloc`, `heap_mark` and `heap_reset`, or a core
    /// assembly is already loaded.
    pub fn load_core(&mut self, path: &Path) -> Result<(), ScriptError> {
        let load_error = |reason: String| ScriptError::AssemblyLoad {
            path: path.to_path_buf(),
            reason,
        };
        if self.core.is_some() {
            return Err(load_error(format!("{} already has a core assembly", self.generation)));
        }

        let (module, fingerprint) = compile(self.store.engine(), path)?;
        self.refuel()?;
        let instance = self
            .linker
            .instantiate(&mut self.store, &module)
            .map_err(|e| load_error(format!("{e:#}")))?;

        let memory = instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| load_error("core assembly must export 'memory'".to_owned()))?;
        let alloc = instance
            .get_func(&mut self.store, "alloc")
            .ok_or_else(|| load_error("core assembly must export 'alloc'".to_owned()))?;
        let heap_mark = instance
            .get_func(&mut self.store, "heap_mark")
            .ok_or_else(|| load_error("core assembly must export 'heap_mark'".to_owned()))?;
        let heap_reset = instance
            .get_func(&mut self.store, "heap_reset")
            .ok_or_else(|| load_error("core assembly must export 'heap_reset'".to_owned()))?;
        self.linker
            .instance(&mut self.store, CORE_MODULE_NAME, instance)
            .map_err(|e| load_error(format!("{e:#}")))?;

        self.store.data_mut().memory = Some(memory);
        self.memory = Some(memory);
        self.alloc = Some(alloc);
        self.heap_mark = Some(heap_mark);
        self.heap_reset = Some(heap_reset);
        self.heap_base = self.heap_top().map_err(|f| load_error(f.to_string()))?;
        self.core = Some(LoadedAssembly {
            path: path.to_path_buf(),
            module,
            instance,
            fingerprint,
        });

        tracing::debug!(
            generation = %self.generation,
            path = %path.display(),
            "core assembly loaded"
        );
        Ok(())
    }

    /// Register the native callbacks and load the user assembly.
    ///
    /// # Errors
    ///
    /// - [`ScriptError::UserAssemblyMissing`] if the file does not exist.
    /// - [`ScriptError::AssemblyLoad`] if the core assembly is not loaded yet,
    ///   a user assembly is already loaded, or the file fails to compile or
    ///   instantiate.
    pub fn load_app(&mut self, path: &Path) -> Result<(), ScriptError> {
        let load_error = |reason: String| ScriptError::AssemblyLoad {
            path: path.to_path_buf(),
            reason,
        };
        if self.core.is_none() {
            return Err(load_error("the core assembly must be loaded first".to_owned()));
        }
        if self.app.is_some() {
            return Err(load_error(format!("{} already has a user assembly", self.generation)));
        }
        if !path.exists() {
            return Err(ScriptError::UserAssemblyMissing {
                path: path.to_path_buf(),
            });
        }

        let (module, fingerprint) = compile(self.store.engine(), path)?;
        if !self.host_api_registered {
            register_host_api(&mut self.linker).map_err(|e| load_error(format!("{e:#}")))?;
            self.host_api_registered = true;
        }
        self.refuel()?;
        let instance = self
            .linker
            .instantiate(&mut self.store, &module)
            .map_err(|e| load_error(format!("{e:#}")))?;
        self.heap_base = self.heap_top().map_err(|f| load_error(f.to_string()))?;

        self.app = Some(LoadedAssembly {
            path: path.to_path_buf(),
            module,
            instance,
            fingerprint,
        });

        tracing::debug!(
            generation = %self.generation,
            path = %path.display(),
            "user assembly loaded"
        );
        Ok(())
    }

    fn refuel(&mut self) -> Result<(), ScriptError> {
        self.store
            .set_fuel(self.fuel_per_call)
            .map_err(|e| ScriptError::Runtime(format!("failed to set fuel: {e}")))
    }

    // -- Calls ---------------------------------------------------------------

    /// Call `func` with a fresh fuel budget.
    fn call(&mut self, name: &str, func: Func, params: &[Val]) -> Result<Vec<Val>, ScriptFault> {
        self.store
            .set_fuel(self.fuel_per_call)
            .map_err(|e| ScriptFault::runtime(name, format!("failed to set fuel: {e}")))?;

        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];
        func.call(&mut self.store, params, &mut results)
            .map_err(|e| ScriptFault::from_call_error(name, e, self.fuel_per_call))?;
        Ok(results)
    }

    /// Allocate an object of `class` and run its field initialisers (the
    /// most-derived parameterless `.ctor`, if any).
    pub fn instantiate(&mut self, class: &ScriptClass) -> Result<ObjectHandle, ScriptFault> {
        let method = format!("{}::<alloc>", class.full_name());
        let found = class.handle().generation;
        if found != self.generation {
            return Err(ScriptFault::stale(method, found, self.generation));
        }
        let alloc = self
            .alloc
            .ok_or_else(|| ScriptFault::runtime(&method, "no core assembly is loaded"))?;

        let results = self.call(&method, alloc, &[Val::I32(class.instance_size() as i32)])?;
        let address = results.first().and_then(Val::i32).unwrap_or(0);
        if address == 0 {
            return Err(ScriptFault::runtime(
                &method,
                format!("allocation of {} bytes failed", class.instance_size()),
            ));
        }

        let object = ObjectHandle {
            generation: self.generation,
            address: address as u32,
        };
        if let Some(init) = class.method(".ctor", 0) {
            self.invoke(init, object, &[])?;
        }
        Ok(object)
    }

    /// Current top of the managed heap.
    pub fn heap_top(&mut self) -> Result<u32, ScriptFault> {
        let method = "Lumen.Core::heap_mark";
        let heap_mark = self
            .heap_mark
            .ok_or_else(|| ScriptFault::runtime(method, "no core assembly is loaded"))?;
        let results = self.call(method, heap_mark, &[])?;
        Ok(results.first().and_then(Val::i32).unwrap_or(0) as u32)
    }

    /// Release every object allocated since the assemblies were loaded and
    /// return the number of bytes reclaimed. Handles to those objects must not
    /// be used afterwards.
    pub fn reset_heap(&mut self) -> Result<u32, ScriptFault> {
        let method = "Lumen.Core::heap_reset";
        let heap_reset = self
            .heap_reset
            .ok_or_else(|| ScriptFault::runtime(method, "no core assembly is loaded"))?;
        let top = self.heap_top()?;
        let base = self.heap_base;
        self.entity_wrappers.clear();
        self.call(method, heap_reset, &[Val::I32(base as i32)])?;
        Ok(top.saturating_sub(base))
    }

    pub(crate) fn cached_entity_wrapper(&self, uuid: u64) -> Option<ObjectHandle> {
        self.entity_wrappers.get(&uuid).copied()
    }

    pub(crate) fn cache_entity_wrapper(&mut self, uuid: u64, wrapper: ObjectHandle) {
        self.entity_wrappers.insert(uuid, wrapper);
    }

    /// Invoke `method` on `object`. `args` excludes the object itself.
    pub fn invoke(
        &mut self,
        method: &MethodHandle,
        object: ObjectHandle,
        args: &[Val],
    ) -> Result<Vec<Val>, ScriptFault> {
        for found in [method.generation, object.generation] {
            if found != self.generation {
                return Err(ScriptFault::stale(&method.name, found, self.generation));
            }
        }
        if args.len() != method.param_count {
            return Err(ScriptFault::runtime(
                &method.name,
                format!("expected {} arguments, got {}", method.param_count, args.len()),
            ));
        }

        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Val::I32(object.address as i32));
        params.extend_from_slice(args);
        self.call(&method.name, method.func, &params)
    }

    // -- Memory --------------------------------------------------------------

    fn check_object(&self, object: ObjectHandle) -> Result<Memory, ScriptError> {
        if object.generation != self.generation {
            return Err(ScriptError::StaleHandle {
                expected: self.generation,
                found: object.generation,
            });
        }
        self.memory.ok_or(ScriptError::NotInitialized)
    }

    /// Copy `out.len()` bytes starting `offset` bytes into `object`.
    pub fn read_bytes(
        &self,
        object: ObjectHandle,
        offset: u32,
        out: &mut [u8],
    ) -> Result<(), ScriptError> {
        let memory = self.check_object(object)?;
        let address = u64::from(object.address) + u64::from(offset);
        memory
            .read(&self.store, address as usize, out)
            .map_err(|_| ScriptError::MemoryAccess {
                address,
                len: out.len(),
            })
    }

    /// Write `bytes` starting `offset` bytes into `object`.
    pub fn write_bytes(
        &mut self,
        object: ObjectHandle,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), ScriptError> {
        let memory = self.check_object(object)?;
        let address = u64::from(object.address) + u64::from(offset);
        memory
            .write(&mut self.store, address as usize, bytes)
            .map_err(|_| ScriptError::MemoryAccess {
                address,
                len: bytes.len(),
            })
    }
}

impl std::fmt::Debug for AppDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppDomain")
            .field("generation", &self.generation)
            .field("core", &self.core.as_ref().map(|a| &a.path))
            .field("app", &self.app.as_ref().map(|a| &a.path))
            .field("fuel_per_call", &self.fuel_per_call)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// AssemblyManager
// ---------------------------------------------------------------------------

/// Owns the root domain and the current application domain.
pub struct AssemblyManager {
    root: Engine,
    config: ScriptEngineConfig,
    current: Option<AppDomain>,
    last_generation: Generation,
}

impl AssemblyManager {
    /// Create the root domain.
    ///
    /// # Errors
    ///
    /// [`ScriptError::Runtime`] if Wasmtime rejects the engine configuration.
    pub fn new(config: ScriptEngineConfig) -> Result<Self, ScriptError> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);
        let root = Engine::new(&engine_config)
            .map_err(|e| ScriptError::Runtime(format!("failed to create Wasmtime engine: {e}")))?;

        Ok(Self {
            root,
            config,
            current: None,
            last_generation: Generation::default(),
        })
    }

    pub fn config(&self) -> &ScriptEngineConfig {
        &self.config
    }

    pub fn current(&self) -> Option<&AppDomain> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut AppDomain> {
        self.current.as_mut()
    }

    pub fn generation(&self) -> Option<Generation> {
        self.current.as_ref().map(AppDomain::generation)
    }

    fn fresh_domain(&mut self) -> AppDomain {
        self.last_generation = self.last_generation.next();
        AppDomain::new(&self.root, self.last_generation, &self.config)
    }

    /// Create a fresh domain, load the core assembly into it, and make it
    /// current. The previous domain is kept if loading fails.
    pub fn load_core(&mut self, path: &Path) -> Result<Generation, ScriptError> {
        let mut domain = self.fresh_domain();
        domain.load_core(path)?;
        let generation = domain.generation();
        self.current = Some(domain);
        Ok(generation)
    }

    /// Load the user assembly into the current domain.
    pub fn load_app(&mut self, path: &Path) -> Result<(), ScriptError> {
        self.current
            .as_mut()
            .ok_or(ScriptError::NotInitialized)?
            .load_app(path)
    }

    /// Build a complete domain for `core` and `app` without touching the
    /// current one.
    pub fn stage(&mut self, core: &Path, app: &Path) -> Result<AppDomain, ScriptError> {
        let mut domain = self.fresh_domain();
        domain.load_core(core)?;
        domain.load_app(app)?;
        Ok(domain)
    }

    /// Make a staged domain current, discarding the previous one.
    pub fn commit(&mut self, domain: AppDomain) {
        if let Some(old) = self.current.replace(domain) {
            tracing::debug!(generation = %old.generation(), "application domain discarded");
        }
    }

    /// Rebuild the domain from the paths of the currently loaded assemblies.
    ///
    /// Every handle obtained from the previous domain becomes stale. On
    /// failure the previous domain stays current.
    pub fn reload(&mut self) -> Result<Generation, ScriptError> {
        let current = self.current.as_ref().ok_or(ScriptError::NotInitialized)?;
        let core = current
            .core()
            .map(|a| a.path.clone())
            .ok_or(ScriptError::NotInitialized)?;
        let app = current
            .app()
            .map(|a| a.path.clone())
            .ok_or(ScriptError::NotInitialized)?;

        let staged = self.stage(&core, &app)?;
        let generation = staged.generation();
        self.commit(staged);
        Ok(generation)
    }

    /// Drop the current domain.
    pub fn unload(&mut self) {
        self.current = None;
    }
}

impl std::fmt::Debug for AssemblyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyManager")
            .field("current", &self.current)
            .field("last_generation", &self.last_generation)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// External build step
// ---------------------------------------------------------------------------

/// Run the project's build command to produce a missing user assembly.
pub fn run_build_command(paths: &AssemblyPaths) -> Result<(), ScriptError> {
    let Some((program, args)) = paths.build_command.as_deref().and_then(<[String]>::split_first)
    else {
        return Err(ScriptError::BuildFailed {
            command: String::new(),
            reason: "no build command configured".to_owned(),
        });
    };
    let command_line = paths
        .build_command
        .as_deref()
        .unwrap_or_default()
        .join(" ");

    let mut command = std::process::Command::new(program);
    command.args(args);
    if let Some(dir) = &paths.project_dir {
        command.current_dir(dir);
    }

    tracing::info!(command = %command_line, "building user assembly");
    let status = command.status().map_err(|e| ScriptError::BuildFailed {
        command: command_line.clone(),
        reason: e.to_string(),
    })?;
    if !status.success() {
        return Err(ScriptError::BuildFailed {
            command: command_line,
            reason: format!("exited with {status}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn core_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/LumenCore.wat")
    }

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn load_core_makes_new_generation_current() {
        let mut manager = AssemblyManager::new(ScriptEngineConfig::default()).unwrap();
        assert!(manager.current().is_none());

        let first = manager.load_core(&core_path()).unwrap();
        let second = manager.load_core(&core_path()).unwrap();
        assert!(second > first);
        assert_eq!(manager.generation(), Some(second));
    }

    #[test]
    fn missing_core_is_a_load_error() {
        let mut manager = AssemblyManager::new(ScriptEngineConfig::default()).unwrap();
        let err = manager.load_core(Path::new("/nonexistent/core.wat")).unwrap_err();
        assert!(matches!(err, ScriptError::AssemblyLoad { .. }), "got {err:?}");
        assert!(manager.current().is_none());
    }

    #[test]
    fn malformed_assembly_is_a_load_error() {
        let mut manager = AssemblyManager::new(ScriptEngineConfig::default()).unwrap();
        manager.load_core(&core_path()).unwrap();
        let err = manager.load_app(&fixture("broken.wat")).unwrap_err();
        assert!(matches!(err, ScriptError::AssemblyLoad { .. }), "got {err:?}");
    }

    #[test]
    fn missing_user_assembly_is_reported_distinctly() {
        let mut manager = AssemblyManager::new(ScriptEngineConfig::default()).unwrap();
        manager.load_core(&core_path()).unwrap();
        let err = manager.load_app(Path::new("/nonexistent/app.wat")).unwrap_err();
        assert!(matches!(err, ScriptError::UserAssemblyMissing { .. }), "got {err:?}");
    }

    #[test]
    fn user_assembly_needs_core_first() {
        let config = ScriptEngineConfig::default();
        let mut manager = AssemblyManager::new(config.clone()).unwrap();
        assert!(matches!(
            manager.load_app(&fixture("sandbox.wat")),
            Err(ScriptError::NotInitialized)
        ));

        let mut domain = AppDomain::new(&manager.root, Generation(9), &config);
        assert!(matches!(
            domain.load_app(&fixture("sandbox.wat")),
            Err(ScriptError::AssemblyLoad { .. })
        ));
    }

    #[test]
    fn reload_advances_generation_and_keeps_fingerprint() {
        let mut manager = AssemblyManager::new(ScriptEngineConfig::default()).unwrap();
        let first = manager.load_core(&core_path()).unwrap();
        manager.load_app(&fixture("sandbox.wat")).unwrap();
        let before = manager.current().and_then(|d| d.app()).map(|a| a.fingerprint);

        let second = manager.reload().unwrap();
        assert!(second > first);
        let after = manager.current().and_then(|d| d.app()).map(|a| a.fingerprint);
        assert_eq!(before, after);
    }

    #[test]
    fn failed_stage_keeps_current_domain() {
        let mut manager = AssemblyManager::new(ScriptEngineConfig::default()).unwrap();
        let generation = manager.load_core(&core_path()).unwrap();
        manager.load_app(&fixture("sandbox.wat")).unwrap();

        assert!(manager.stage(&core_path(), &fixture("broken.wat")).is_err());
        assert_eq!(manager.generation(), Some(generation));
    }

    #[test]
    fn build_command_without_program_fails() {
        let paths = AssemblyPaths::new("core.wat", "app.wat");
        assert!(matches!(
            run_build_command(&paths),
            Err(ScriptError::BuildFailed { .. })
        ));
    }
}
