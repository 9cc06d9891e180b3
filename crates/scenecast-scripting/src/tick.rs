//! Per-frame update scheduling.
//!
//! Scripts that define a `script_tick` hook are linked into a single
//! runtime-wide list the host walks once per frame. The scheduler lock is
//! only ever held for list surgery, never across a call into a script, so
//! a script may unload itself or any other script from inside its own tick
//! without deadlocking the walk.

use crate::script::ScriptCore;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Default)]
pub(crate) struct TickScheduler {
    scripts: Mutex<Vec<Weak<ScriptCore>>>,
}

impl TickScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Links a script at the head of the tick list.
    pub(crate) fn link(&self, script: &Arc<ScriptCore>) {
        self.scripts.lock().insert(0, Arc::downgrade(script));
    }

    pub(crate) fn unlink(&self, script: &ScriptCore) {
        self.scripts
            .lock()
            .retain(|entry| !std::ptr::eq(entry.as_ptr(), script));
    }

    pub(crate) fn contains(&self, script: &ScriptCore) -> bool {
        self.scripts
            .lock()
            .iter()
            .any(|entry| std::ptr::eq(entry.as_ptr(), script))
    }

    pub(crate) fn len(&self) -> usize {
        self.scripts.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.scripts.lock().clear();
    }

    /// Walks every subscribed script, invoking its tick hook with the
    /// elapsed seconds. Membership is re-checked right before each call so a
    /// script unlinked earlier in the same walk is skipped, not revisited.
    pub(crate) fn walk(&self, seconds: f32) {
        let snapshot: Vec<Weak<ScriptCore>> = self.scripts.lock().clone();

        for entry in snapshot {
            let Some(script) = entry.upgrade() else {
                continue;
            };
            if !self.contains(&script) {
                continue;
            }
            script.call_tick(seconds);
        }
    }
}
