//! Callback registrations and their reclamation.
//!
//! Every script function bound to a host event source is tracked as a
//! [`ScriptCallback`]. A registration lives in exactly one place at a time:
//! its owner's active list while connected, or the runtime's detached queue
//! once marked for removal. A dispatcher that is mid-call when a
//! registration is marked still holds a strong reference, so the object
//! outlives the in-flight delivery no matter which thread marked it; the
//! dispatcher that observes the mark reclaims the queue entry, and anything
//! left over is dropped in one batch when the runtime shuts down.

use crate::runtime::RuntimeInner;
use crate::script::ScriptCore;
use mlua::{Function, Lua, RegistryKey, Value};
use parking_lot::Mutex;
use scenecast_events::EventData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One registration of a script function against a host event source.
pub struct ScriptCallback {
    pub(crate) script: Weak<ScriptCore>,
    pub(crate) runtime: Weak<RuntimeInner>,
    /// Retained function inside the interpreter's registry. Cleared when the
    /// registration is marked, so the function becomes collectible.
    key: Mutex<Option<RegistryKey>>,
    removed: AtomicBool,
    /// Auxiliary bag: which source/signal this registration targets.
    pub(crate) extra: Mutex<EventData>,
}

impl ScriptCallback {
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Fetches the retained function. `None` once marked, or if the key no
    /// longer resolves (interpreter already torn down).
    pub(crate) fn function<'lua>(&self, lua: &'lua Lua) -> Option<Function<'lua>> {
        let guard = self.key.lock();
        let key = guard.as_ref()?;
        lua.registry_value::<Function>(key).ok()
    }
}

/// Creates a registration and links it at the head of the owner's list.
///
/// `permanent` pins the owning script: it now carries a hook that cannot be
/// silently dropped, and force-unloading it is worth a warning.
pub(crate) fn register<'lua>(
    script: &Arc<ScriptCore>,
    lua: &'lua Lua,
    function: Function<'lua>,
    permanent: bool,
) -> mlua::Result<Arc<ScriptCallback>> {
    let key = lua.create_registry_value(function)?;
    let callback = Arc::new(ScriptCallback {
        script: Arc::downgrade(script),
        runtime: script.runtime.clone(),
        key: Mutex::new(Some(key)),
        removed: AtomicBool::new(false),
        extra: Mutex::new(EventData::new()),
    });

    if permanent {
        script.pinned.store(true, Ordering::SeqCst);
    }
    script.callbacks.lock().insert(0, Arc::clone(&callback));
    Ok(callback)
}

/// Finds the newest active registration whose retained function is raw-equal
/// to `function`.
pub(crate) fn find<'lua>(
    script: &ScriptCore,
    lua: &'lua Lua,
    function: &Function<'lua>,
) -> Option<Arc<ScriptCallback>> {
    find_next(script, lua, None, function)
}

/// Continues an identity scan after `after`, newest-first.
pub(crate) fn find_next<'lua>(
    script: &ScriptCore,
    lua: &'lua Lua,
    after: Option<&Arc<ScriptCallback>>,
    function: &Function<'lua>,
) -> Option<Arc<ScriptCallback>> {
    let list = script.callbacks.lock();
    let start = match after {
        Some(prev) => {
            let pos = list.iter().position(|cb| Arc::ptr_eq(cb, prev))?;
            pos + 1
        }
        None => 0,
    };

    list[start..]
        .iter()
        .find(|cb| {
            cb.function(lua)
                .is_some_and(|stored| Value::Function(stored) == Value::Function(function.clone()))
        })
        .cloned()
}

/// Marks a registration for removal: releases the retained function, unlinks
/// it from the owner's active list and relinks it into the runtime's
/// detached queue. Safe to call for the registration currently being
/// dispatched; the dispatcher checks the flag after the call returns and
/// never touches the retained-function slot again.
///
/// Lock order is owner list, then queue; neither is held past the relink.
pub(crate) fn mark_removed(callback: &Arc<ScriptCallback>) {
    if callback.removed.swap(true, Ordering::SeqCst) {
        return;
    }

    *callback.key.lock() = None;

    if let Some(script) = callback.script.upgrade() {
        let mut list = script.callbacks.lock();
        if let Some(pos) = list.iter().position(|cb| Arc::ptr_eq(cb, callback)) {
            list.remove(pos);
        }
    }

    if let Some(runtime) = callback.runtime.upgrade() {
        runtime.detached.lock().push(Arc::clone(callback));
    }
}

/// Drops a marked registration out of the detached queue. Called by the
/// dispatcher that observed the mark, once no delivery can still need it.
pub(crate) fn reclaim(callback: &Arc<ScriptCallback>) {
    if let Some(runtime) = callback.runtime.upgrade() {
        let mut queue = runtime.detached.lock();
        if let Some(pos) = queue.iter().position(|cb| Arc::ptr_eq(cb, callback)) {
            queue.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeSettings, ScriptRuntime};
    use crate::script::ScriptHandle;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn runtime() -> ScriptRuntime {
        ScriptRuntime::new(RuntimeSettings::default())
    }

    fn empty_script(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("empty.lua");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "-- nothing to do at load time").unwrap();
        path
    }

    fn loaded_handle(runtime: &ScriptRuntime, dir: &std::path::Path) -> ScriptHandle {
        let handle = runtime.create_script(&empty_script(dir)).unwrap();
        assert!(handle.loaded());
        handle
    }

    fn make_callback(handle: &ScriptHandle, permanent: bool) -> Arc<ScriptCallback> {
        handle
            .core()
            .with_vm(|vm| {
                let function = vm.lua.create_function(|_, ()| Ok(())).unwrap();
                register(handle.core(), &vm.lua, function, permanent).unwrap()
            })
            .expect("interpreter alive")
    }

    #[test]
    fn register_links_newest_first() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());

        let first = make_callback(&handle, false);
        let second = make_callback(&handle, false);

        let list = handle.core().callbacks.lock();
        assert_eq!(list.len(), 2);
        assert!(Arc::ptr_eq(&list[0], &second));
        assert!(Arc::ptr_eq(&list[1], &first));
    }

    #[test]
    fn permanent_registration_pins_the_script() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());

        assert!(!handle.pinned());
        let _cb = make_callback(&handle, true);
        assert!(handle.pinned());
    }

    #[test]
    fn find_matches_by_function_identity() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());
        let core = handle.core();

        core.with_vm(|vm| {
            let f: Function = vm.lua.load("return function() end").eval().unwrap();
            let g: Function = vm.lua.load("return function() end").eval().unwrap();
            let cb = register(core, &vm.lua, f.clone(), false).unwrap();

            let found = find(core, &vm.lua, &f).expect("registered function");
            assert!(Arc::ptr_eq(&found, &cb));
            assert!(find(core, &vm.lua, &g).is_none());
        })
        .unwrap();
    }

    #[test]
    fn find_next_enumerates_duplicates() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());
        let core = handle.core();

        core.with_vm(|vm| {
            let f: Function = vm.lua.load("return function() end").eval().unwrap();
            let older = register(core, &vm.lua, f.clone(), false).unwrap();
            let newer = register(core, &vm.lua, f.clone(), false).unwrap();

            let first = find(core, &vm.lua, &f).unwrap();
            assert!(Arc::ptr_eq(&first, &newer));
            let second = find_next(core, &vm.lua, Some(&first), &f).unwrap();
            assert!(Arc::ptr_eq(&second, &older));
            assert!(find_next(core, &vm.lua, Some(&second), &f).is_none());
        })
        .unwrap();
    }

    #[test]
    fn mark_removed_moves_registration_to_detached_queue() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());

        let cb = make_callback(&handle, false);
        assert_eq!(handle.core().callbacks.lock().len(), 1);

        mark_removed(&cb);
        assert!(cb.is_removed());
        assert!(handle.core().callbacks.lock().is_empty());
        assert_eq!(runtime.detached_count(), 1);

        // Second mark is a no-op, not a double unlink.
        mark_removed(&cb);
        assert_eq!(runtime.detached_count(), 1);
    }

    #[test]
    fn reclaim_drops_queue_entry() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());

        let cb = make_callback(&handle, false);
        mark_removed(&cb);
        reclaim(&cb);
        assert_eq!(runtime.detached_count(), 0);

        // Reclaiming an already reclaimed registration is harmless.
        reclaim(&cb);
        assert_eq!(runtime.detached_count(), 0);
    }

    #[test]
    fn marked_registration_releases_retained_function() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let handle = loaded_handle(&runtime, dir.path());
        let core = handle.core();

        core.with_vm(|vm| {
            let f: Function = vm.lua.load("return function() end").eval().unwrap();
            let cb = register(core, &vm.lua, f.clone(), false).unwrap();
            assert!(cb.function(&vm.lua).is_some());
            mark_removed(&cb);
            assert!(cb.function(&vm.lua).is_none());
            assert!(find(core, &vm.lua, &f).is_none());
        })
        .unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Active list and detached queue stay disjoint, and together they
        /// account for every registration not yet reclaimed.
        #[test]
        fn active_and_detached_partition_all_registrations(ops in prop::collection::vec(any::<u8>(), 1..60)) {
            let runtime = runtime();
            let dir = tempfile::tempdir().unwrap();
            let handle = loaded_handle(&runtime, dir.path());

            let mut created: Vec<Arc<ScriptCallback>> = Vec::new();
            let mut marked: HashSet<usize> = HashSet::new();

            for code in ops {
                if code % 2 == 0 || created.len() == marked.len() {
                    created.push(make_callback(&handle, false));
                } else {
                    let unmarked: Vec<usize> = (0..created.len())
                        .filter(|idx| !marked.contains(idx))
                        .collect();
                    let idx = unmarked[usize::from(code) % unmarked.len()];
                    mark_removed(&created[idx]);
                    marked.insert(idx);
                }

                let active: Vec<Arc<ScriptCallback>> =
                    handle.core().callbacks.lock().clone();
                let detached = runtime.detached_snapshot();

                for cb in &active {
                    prop_assert!(!detached.iter().any(|d| Arc::ptr_eq(d, cb)));
                }
                prop_assert_eq!(active.len() + detached.len(), created.len());
                for (idx, cb) in created.iter().enumerate() {
                    let in_active = active.iter().any(|a| Arc::ptr_eq(a, cb));
                    let in_detached = detached.iter().any(|d| Arc::ptr_eq(d, cb));
                    prop_assert!(in_active != in_detached);
                    prop_assert_eq!(in_detached, marked.contains(&idx));
                }
            }
        }
    }
}
