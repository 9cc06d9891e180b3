//! Process-wide scripting runtime.
//!
//! Owns everything that outlives a single script: the tick scheduler, the
//! detached-callback queue, the frame-callback driver and the source
//! directory. The host drives [`ScriptRuntime::tick`] once per frame and
//! [`ScriptRuntime::drive_frame`] once per rendered frame.

use crate::callbacks::ScriptCallback;
use crate::error::ScriptError;
use crate::script::ScriptHandle;
use crate::tick::TickScheduler;
use parking_lot::Mutex;
use scenecast_events::{FrameCallbacks, SignalSource, SourceDirectory};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File extensions this runtime can load.
const SUPPORTED_FORMATS: &[&str] = &["lua"];

/// Host-tunable runtime configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Directories appended to every interpreter's module search path, so
    /// scripts can `require` shared dependency modules.
    pub script_search_dirs: Vec<PathBuf>,
    /// Memory budget per interpreter instance, in bytes. `None` leaves the
    /// interpreter unbounded.
    pub memory_limit_bytes: Option<usize>,
}

pub(crate) struct RuntimeInner {
    pub(crate) settings: RuntimeSettings,
    /// Precomputed `package.path` suffix built from the search dirs.
    pub(crate) module_path_suffix: String,
    pub(crate) tick: TickScheduler,
    /// Registrations removed while a dispatch might still be in flight.
    /// Emptied entry-by-entry as dispatchers observe removal marks, and in
    /// one batch at shutdown.
    pub(crate) detached: Mutex<Vec<Arc<ScriptCallback>>>,
    pub(crate) frames: FrameCallbacks,
    pub(crate) directory: SourceDirectory,
}

/// Handle to the scripting runtime. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ScriptRuntime {
    inner: Arc<RuntimeInner>,
}

impl ScriptRuntime {
    pub fn new(settings: RuntimeSettings) -> Self {
        let module_path_suffix = settings
            .script_search_dirs
            .iter()
            .map(|dir| format!("{}/?.lua", dir.display()))
            .collect::<Vec<_>>()
            .join(";");

        Self {
            inner: Arc::new(RuntimeInner {
                settings,
                module_path_suffix,
                tick: TickScheduler::new(),
                detached: Mutex::new(Vec::new()),
                frames: FrameCallbacks::new(),
                directory: SourceDirectory::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn supported_formats() -> &'static [&'static str] {
        SUPPORTED_FORMATS
    }

    /// Registers a host signal source so scripts can resolve it by name.
    pub fn register_source(&self, source: Arc<SignalSource>) {
        self.inner.directory.register(source);
    }

    pub fn directory(&self) -> &SourceDirectory {
        &self.inner.directory
    }

    /// Creates a handle for `path` and attempts the initial load. The
    /// handle is returned even when the load fails; the failure is logged
    /// and the handle stays unloaded. Only an unsupported file extension is
    /// an error.
    pub fn create_script(&self, path: &Path) -> Result<ScriptHandle, ScriptError> {
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SUPPORTED_FORMATS.contains(&ext));
        if !supported {
            let err = ScriptError::UnsupportedFormat {
                path: path.to_path_buf(),
            };
            log::warn!("{err}");
            return Err(err);
        }

        let handle = ScriptHandle::new(&self.inner, path);
        let _ = handle.load();
        Ok(handle)
    }

    /// Walks every tick-subscribed script with the elapsed seconds.
    pub fn tick(&self, seconds: f32) {
        self.inner.tick.walk(seconds);
    }

    /// Drives the per-frame render callbacks with the output dimensions.
    pub fn drive_frame(&self, width: u32, height: u32) {
        self.inner.frames.drive(width, height);
    }

    pub fn tick_subscriber_count(&self) -> usize {
        self.inner.tick.len()
    }

    pub fn frame_callback_count(&self) -> usize {
        self.inner.frames.len()
    }

    /// Number of removed registrations awaiting reclamation.
    pub fn detached_count(&self) -> usize {
        self.inner.detached.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn detached_snapshot(&self) -> Vec<Arc<ScriptCallback>> {
        self.inner.detached.lock().clone()
    }

    /// Tears down runtime-wide state: batch-frees the detached queue and
    /// clears the tick list. Scripts still loaded keep working; this is the
    /// last step of a host shutdown, after every script has been unloaded.
    pub fn shutdown(&self) {
        self.inner.detached.lock().clear();
        self.inner.tick.clear();
    }
}
