//! Hot-reload watcher for the user assembly.
//!
//! The watcher and the main thread share a [`ReloadTrigger`], a three-state
//! latch:
//!
//! ```text
//! Idle --modified--> PendingReload --begin_reload--> Reloading --finish--> Idle
//! ```
//!
//! Only the `Idle -> PendingReload` transition fires the reload callback, so
//! a burst of writes from a build tool yields exactly one queued reload.
//! Events that arrive in any other state are dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::ScriptError;

// ---------------------------------------------------------------------------
// ReloadTrigger
// ---------------------------------------------------------------------------

/// Hot-reload state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    /// A modification was seen and a reload is queued.
    PendingReload,
    /// The queued reload is running.
    Reloading,
}

impl WatchState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WatchState::PendingReload,
            2 => WatchState::Reloading,
            _ => WatchState::Idle,
        }
    }
}

/// Shared hot-reload latch. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ReloadTrigger {
    state: Arc<AtomicU8>,
}

impl ReloadTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WatchState {
        WatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: WatchState, to: WatchState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a modification. Returns `true` only for the event that moved
    /// the latch out of `Idle`; the caller queues the reload then.
    pub fn notify_modified(&self) -> bool {
        self.transition(WatchState::Idle, WatchState::PendingReload)
    }

    /// Mark the queued reload as running. Returns `false` if none was queued.
    pub fn begin_reload(&self) -> bool {
        self.transition(WatchState::PendingReload, WatchState::Reloading)
    }

    /// Return to `Idle` once the reload is done and a new watcher is
    /// installed.
    pub fn finish(&self) {
        self.state.store(WatchState::Idle as u8, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// HotReloadWatcher
// ---------------------------------------------------------------------------

/// Watches one assembly file and fires a callback when it is rewritten.
///
/// The parent directory is watched rather than the file, since build tools
/// often replace the file and some platforms drop watches on replaced files.
/// Dropping the watcher stops the background thread.
pub struct HotReloadWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl HotReloadWatcher {
    /// Start watching `path`. `on_trigger` runs on the watcher thread once per
    /// burst of modifications (see [`ReloadTrigger::notify_modified`]).
    ///
    /// # Errors
    ///
    /// [`ScriptError::Watch`] if the path has no parent directory or the
    /// platform watcher cannot be created.
    pub fn install<F>(
        path: &Path,
        trigger: ReloadTrigger,
        on_trigger: F,
    ) -> Result<Self, ScriptError>
    where
        F: Fn() + Send + 'static,
    {
        let file_name = path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ScriptError::Watch(format!("{} is not a file path", path.display())))?;
        let directory = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let relevant = is_relevant(&event.kind)
                    && event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()));
                if relevant && trigger.notify_modified() {
                    tracing::info!("user assembly modified, reload queued");
                    on_trigger();
                }
            }
            Err(err) => tracing::warn!(error = %err, "assembly watcher error"),
        })
        .map_err(|e| ScriptError::Watch(e.to_string()))?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|e| ScriptError::Watch(format!("{}: {e}", directory.display())))?;

        tracing::debug!(path = %path.display(), "assembly watcher installed");
        Ok(Self {
            path: path.to_path_buf(),
            _watcher: watcher,
        })
    }

    /// The watched assembly file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for HotReloadWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadWatcher")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
