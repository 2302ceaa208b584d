//! Native callbacks exposed to script code.
//!
//! Defines the [`HostState`] that lives inside every domain's Wasmtime
//! [`Store`](wasmtime::Store) and [`register_host_api`], which registers the
//! native callback table under the `"lumen"` import namespace.
//!
//! - **Reads are immediate:** scripts query a scene snapshot taken at the start
//!   of the frame by [`HostState::begin_frame`].
//! - **Writes are deferred:** scene mutations are queued as
//!   [`SceneCommand`]s and drained by the owner of the scene after the update
//!   pass.
//!
//! # Host Functions (registered under `"lumen"`)
//!
//! - `log(level: i32, msg_ptr: i32, msg_len: i32)`
//! - `entity_exists(id: i64) -> i32`
//! - `find_entity_by_name(name_ptr: i32, name_len: i32) -> i64` (0 if none)
//! - `destroy_entity(id: i64)`
//! - `frame_number() -> i64`
//! - `delta_time() -> f32`
//! - `is_key_down(key: i32) -> i32`

use std::collections::{HashMap, HashSet};

use lumen_scene::{Scene, SceneCommand, Uuid};
use wasmtime::{Caller, Linker, Memory, StoreLimits};

/// Import namespace of the native callback table.
pub const HOST_MODULE_NAME: &str = "lumen";

// ---------------------------------------------------------------------------
// HostState
// ---------------------------------------------------------------------------

/// State held inside a domain's store for native callback dispatch.
pub struct HostState {
    /// Resource limits enforced by the store's limiter.
    pub limits: StoreLimits,

    /// The linear memory exported by the core assembly. Set once the core
    /// assembly is instantiated.
    pub memory: Option<Memory>,

    /// Scene snapshot: raw entity UUID -> tag.
    pub entities: HashMap<u64, String>,

    /// Keys held down this frame.
    pub pressed_keys: HashSet<i32>,

    /// Current frame number, set by [`begin_frame`](Self::begin_frame).
    pub frame: u64,

    /// Seconds elapsed since the previous frame.
    pub delta_time: f32,

    /// Scene mutations queued by scripts, drained via
    /// [`drain_commands`](Self::drain_commands).
    pub commands: Vec<SceneCommand>,

    /// Native callbacks made since the last [`begin_frame`](Self::begin_frame).
    pub host_call_count: u32,
}

impl HostState {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            memory: None,
            entities: HashMap::new(),
            pressed_keys: HashSet::new(),
            frame: 0,
            delta_time: 0.0,
            commands: Vec::new(),
            host_call_count: 0,
        }
    }

    /// Prepare for a new frame: refresh the scene snapshot and the frame
    /// metadata, and reset the call counter.
    ///
    /// Queued commands are not cleared; drain them after every update pass.
    pub fn begin_frame(&mut self, scene: &Scene, frame: u64, delta_time: f32) {
        self.snapshot_scene(scene);
        self.frame = frame;
        self.delta_time = delta_time;
        self.host_call_count = 0;
    }

    /// Replace the scene snapshot.
    pub fn snapshot_scene(&mut self, scene: &Scene) {
        self.entities = scene
            .entities()
            .map(|e| (e.uuid().to_raw(), e.tag().to_owned()))
            .collect();
    }

    /// Take all queued scene commands, leaving the queue empty.
    pub fn drain_commands(&mut self) -> Vec<SceneCommand> {
        std::mem::take(&mut self.commands)
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("frame", &self.frame)
            .field("delta_time", &self.delta_time)
            .field("entity_count", &self.entities.len())
            .field("host_call_count", &self.host_call_count)
            .field("pending_commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register the native callback table under [`HOST_MODULE_NAME`].
///
/// Must run once per domain, after the core assembly is instantiated and
/// before the user assembly is.
///
/// # Errors
///
/// Returns an error if a name is already defined in the linker.
pub fn register_host_api(linker: &mut Linker<HostState>) -> Result<(), anyhow::Error> {
    linker.func_wrap(HOST_MODULE_NAME, "log", host_log)?;
    linker.func_wrap(HOST_MODULE_NAME, "entity_exists", host_entity_exists)?;
    linker.func_wrap(HOST_MODULE_NAME, "find_entity_by_name", host_find_entity_by_name)?;
    linker.func_wrap(HOST_MODULE_NAME, "destroy_entity", host_destroy_entity)?;
    linker.func_wrap(HOST_MODULE_NAME, "frame_number", host_frame_number)?;
    linker.func_wrap(HOST_MODULE_NAME, "delta_time", host_delta_time)?;
    linker.func_wrap(HOST_MODULE_NAME, "is_key_down", host_is_key_down)?;
    Ok(())
}

/// Read a UTF-8 string from the domain's linear memory.
fn read_script_string(
    caller: &Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> Result<String, String> {
    let memory = caller
        .data()
        .memory
        .ok_or_else(|| "no linear memory is bound to this domain".to_owned())?;

    let data = memory.data(caller);
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            format!(
                "string read out of bounds: ptr={ptr}, len={len}, memory_size={}",
                data.len()
            )
        })?;

    String::from_utf8(data[start..end].to_vec())
        .map_err(|e| format!("string at ptr={ptr} len={len} is not valid UTF-8: {e}"))
}

// ---------------------------------------------------------------------------
// Host functions
// ---------------------------------------------------------------------------

/// `log(level, msg_ptr, msg_len)`: 0 = trace .. 4 = error.
fn host_log(mut caller: Caller<'_, HostState>, level: i32, msg_ptr: i32, msg_len: i32) {
    caller.data_mut().host_call_count += 1;

    let msg = match read_script_string(&caller, msg_ptr, msg_len) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "log: failed to read message");
            return;
        }
    };

    match level {
        0 => tracing::trace!(source = "script", "{msg}"),
        1 => tracing::debug!(source = "script", "{msg}"),
        2 => tracing::info!(source = "script", "{msg}"),
        3 => tracing::warn!(source = "script", "{msg}"),
        4 => tracing::error!(source = "script", "{msg}"),
        _ => tracing::info!(source = "script", level, "{msg}"),
    }
}

fn host_entity_exists(mut caller: Caller<'_, HostState>, id: i64) -> i32 {
    caller.data_mut().host_call_count += 1;
    i32::from(caller.data().entities.contains_key(&(id as u64)))
}

fn host_find_entity_by_name(
    mut caller: Caller<'_, HostState>,
    name_ptr: i32,
    name_len: i32,
) -> i64 {
    caller.data_mut().host_call_count += 1;

    let name = match read_script_string(&caller, name_ptr, name_len) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "find_entity_by_name: failed to read name");
            return 0;
        }
    };

    // Smallest UUID wins so the answer does not depend on map order.
    caller
        .data()
        .entities
        .iter()
        .filter(|(_, tag)| **tag == name)
        .map(|(id, _)| *id)
        .min()
        .map_or(0, |id| id as i64)
}

fn host_destroy_entity(mut caller: Caller<'_, HostState>, id: i64) {
    caller.data_mut().host_call_count += 1;

    let Some(entity) = Uuid::from_raw(id as u64) else {
        tracing::warn!("destroy_entity: called with the null entity");
        return;
    };
    caller
        .data_mut()
        .commands
        .push(SceneCommand::DestroyEntity { entity });
}

fn host_frame_number(mut caller: Caller<'_, HostState>) -> i64 {
    caller.data_mut().host_call_count += 1;
    caller.data().frame as i64
}

fn host_delta_time(mut caller: Caller<'_, HostState>) -> f32 {
    caller.data_mut().host_call_count += 1;
    caller.data().delta_time
}

fn host_is_key_down(mut caller: Caller<'_, HostState>, key: i32) -> i32 {
    caller.data_mut().host_call_count += 1;
    i32::from(caller.data().pressed_keys.contains(&key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_frame_snapshots_scene() {
        let mut scene = Scene::new("test");
        let a = scene.create_entity("A");
        scene.create_entity("B");

        let mut state = HostState::default();
        state.host_call_count = 7;
        state.begin_frame(&scene, 3, 0.5);

        assert_eq!(state.frame, 3);
        assert_eq!(state.delta_time, 0.5);
        assert_eq!(state.host_call_count, 0);
        assert_eq!(state.entities.len(), 2);
        assert_eq!(state.entities.get(&a.to_raw()).map(String::as_str), Some("A"));
    }

    #[test]
    fn drain_leaves_queue_empty() {
        let mut state = HostState::default();
        let id = Uuid::from_raw(4).unwrap();
        state.commands.push(SceneCommand::DestroyEntity { entity: id });

        let drained = state.drain_commands();
        assert_eq!(drained, vec![SceneCommand::DestroyEntity { entity: id }]);
        assert!(state.commands.is_empty());
    }

    #[test]
    fn registration_is_once_per_linker() {
        let engine = wasmtime::Engine::default();
        let mut linker = Linker::new(&engine);
        register_host_api(&mut linker).unwrap();
        assert!(register_host_api(&mut linker).is_err());
    }
}
