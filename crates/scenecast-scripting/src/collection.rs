//! Ordered collection of open scripts with flat persistence.
//!
//! The UI-facing manager keeps an ordered list of script paths; this is the
//! non-UI core of it. Persistence is a flat JSON array of path entries:
//! round-tripping preserves order, and restoring continues past paths that
//! fail to load so one broken script cannot take the rest of the list down.

use crate::error::ScriptError;
use crate::runtime::ScriptRuntime;
use crate::script::ScriptHandle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize)]
struct SavedScript {
    path: String,
}

pub struct ScriptCollection {
    runtime: ScriptRuntime,
    scripts: Vec<ScriptHandle>,
}

impl ScriptCollection {
    pub fn new(runtime: ScriptRuntime) -> Self {
        Self {
            runtime,
            scripts: Vec::new(),
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.scripts.iter().any(|script| script.path() == path)
    }

    pub fn handle(&self, path: &Path) -> Option<&ScriptHandle> {
        self.scripts.iter().find(|script| script.path() == path)
    }

    /// Opens a script, keeping the handle even when the load itself fails.
    /// Returns whether the script ended up loaded. Opening an already open
    /// path is a no-op reporting its current state.
    pub fn open(&mut self, path: &Path) -> Result<bool, ScriptError> {
        if let Some(existing) = self.handle(path) {
            return Ok(existing.loaded());
        }
        let handle = self.runtime.create_script(path)?;
        let loaded = handle.loaded();
        self.scripts.push(handle);
        Ok(loaded)
    }

    /// Unloads and drops a script. Returns whether the path was open.
    pub fn remove(&mut self, path: &Path) -> bool {
        let Some(pos) = self.scripts.iter().position(|script| script.path() == path) else {
            return false;
        };
        if self.scripts[pos].pinned() {
            log::warn!(
                "removing script '{}' which registered permanent hooks",
                path.display()
            );
        }
        let handle = self.scripts.remove(pos);
        handle.unload();
        handle.destroy();
        true
    }

    /// Reloads an open script, returning its new loaded state.
    pub fn reload(&self, path: &Path) -> Option<bool> {
        self.handle(path).map(ScriptHandle::reload)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Open paths, in insertion order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.scripts
            .iter()
            .map(|script| script.path().to_path_buf())
            .collect()
    }

    /// Serializes the open path list, preserving order.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let entries: Vec<SavedScript> = self
            .scripts
            .iter()
            .map(|script| SavedScript {
                path: script.path().to_string_lossy().into_owned(),
            })
            .collect();
        serde_json::to_string(&entries)
    }

    /// Replaces the open set with the serialized list, opening each path in
    /// order. Paths that fail to load stay in the list unloaded; only a
    /// malformed document is an error. Returns how many scripts loaded.
    pub fn restore(&mut self, json: &str) -> serde_json::Result<usize> {
        let entries: Vec<SavedScript> = serde_json::from_str(json)?;
        self.close_all();

        let mut loaded = 0;
        for entry in entries {
            match self.open(Path::new(&entry.path)) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(err) => log::warn!("skipping script from saved list: {err}"),
            }
        }
        Ok(loaded)
    }

    /// Unloads and drops every open script.
    pub fn close_all(&mut self) {
        for handle in self.scripts.drain(..) {
            handle.unload();
            handle.destroy();
        }
    }
}
