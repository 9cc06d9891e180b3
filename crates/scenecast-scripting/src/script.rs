//! One loaded script file and its interpreter.
//!
//! Every handle owns a single Lua instance guarded by a reentrant lock: any
//! call into the interpreter (top-level load, unload hook, tick, or signal
//! callback) holds that lock for the full duration of the call, and a
//! callback that synchronously triggers another event on the same script
//! re-enters it on the same thread without deadlocking.

use crate::bridge;
use crate::callbacks::{self, ScriptCallback};
use crate::error::ScriptError;
use crate::runtime::RuntimeInner;
use mlua::{Function, IntoLuaMulti, Lua, MultiValue, RegistryKey, Table, Value};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Clears any module cache left over from a previous interpreter so a
/// reloaded script starts from a clean slate.
const BOOTSTRAP: &str = r"
for name in pairs(package.preload) do
    package.preload[name] = nil
end
";

/// Live interpreter state. Registry keys come before the interpreter so
/// they are released first on teardown.
pub(crate) struct Vm {
    pub(crate) tick_key: Option<RegistryKey>,
    pub(crate) unload_key: Option<RegistryKey>,
    pub(crate) lua: Lua,
}

/// Interior of the interpreter lock. `call_depth` counts reentrant calls on
/// the owning thread; an unload that arrives mid-call defers the interpreter
/// teardown until the outermost call returns.
pub(crate) struct VmSlot {
    vm: RefCell<Option<Vm>>,
    call_depth: Cell<u32>,
    pending_unload: Cell<bool>,
}

pub(crate) struct ScriptCore {
    pub(crate) runtime: Weak<RuntimeInner>,
    pub(crate) path: PathBuf,
    pub(crate) file_name: String,
    /// Script directory with a trailing separator, as handed to
    /// `get_script_path()`.
    pub(crate) script_dir: String,
    loaded: AtomicBool,
    pub(crate) pinned: AtomicBool,
    vm: ReentrantMutex<VmSlot>,
    /// Active callback registrations, newest first.
    pub(crate) callbacks: Mutex<Vec<Arc<ScriptCallback>>>,
}

impl ScriptCore {
    /// Runs `f` against the live interpreter under the script's lock,
    /// tracking reentrancy depth. Returns `None` when the interpreter is
    /// gone. Completes a deferred unload once the outermost call returns.
    pub(crate) fn with_vm<R>(&self, f: impl FnOnce(&Vm) -> R) -> Option<R> {
        let slot = self.vm.lock();
        let result = {
            let vm_ref = slot.vm.borrow();
            match vm_ref.as_ref() {
                Some(vm) => {
                    slot.call_depth.set(slot.call_depth.get() + 1);
                    let value = f(vm);
                    slot.call_depth.set(slot.call_depth.get() - 1);
                    Some(value)
                }
                None => None,
            }
        };
        if slot.call_depth.get() == 0 && slot.pending_unload.get() {
            slot.pending_unload.set(false);
            drop(slot.vm.borrow_mut().take());
        }
        result
    }

    /// Invokes the retained tick hook, swallowing failures so one broken
    /// script cannot halt the walk.
    pub(crate) fn call_tick(&self, seconds: f32) {
        self.with_vm(|vm| {
            if let Some(key) = &vm.tick_key {
                call_registered(&vm.lua, key, seconds, "script_tick", &self.path);
            }
        });
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }
}

/// Calls a function retained in the interpreter registry, logging failures.
pub(crate) fn call_registered<'lua, A>(
    lua: &'lua Lua,
    key: &RegistryKey,
    args: A,
    what: &str,
    path: &Path,
) -> bool
where
    A: IntoLuaMulti<'lua>,
{
    let function: Function = match lua.registry_value(key) {
        Ok(function) => function,
        Err(err) => {
            log::warn!("failed to resolve {what} for '{}': {err}", path.display());
            return false;
        }
    };
    call_function(&function, args, what, path)
}

/// Calls a script function, converting any interpreter error into a logged
/// warning.
pub(crate) fn call_function<'lua, A>(
    function: &Function<'lua>,
    args: A,
    what: &str,
    path: &Path,
) -> bool
where
    A: IntoLuaMulti<'lua>,
{
    match function.call::<_, ()>(args) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("failed to call {what} for '{}': {err}", path.display());
            false
        }
    }
}

/// Handle to one script file. Dropping the handle unloads the script if the
/// caller has not done so already.
pub struct ScriptHandle {
    core: Arc<ScriptCore>,
}

impl std::fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("path", &self.core.path)
            .finish()
    }
}

impl ScriptHandle {
    pub(crate) fn new(runtime: &Arc<RuntimeInner>, path: &Path) -> Self {
        let path = path.to_path_buf();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let script_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                format!("{}{}", dir.display(), std::path::MAIN_SEPARATOR)
            }
            _ => String::new(),
        };

        Self {
            core: Arc::new(ScriptCore {
                runtime: Arc::downgrade(runtime),
                path,
                file_name,
                script_dir,
                loaded: AtomicBool::new(false),
                pinned: AtomicBool::new(false),
                vm: ReentrantMutex::new(VmSlot {
                    vm: RefCell::new(None),
                    call_depth: Cell::new(0),
                    pending_unload: Cell::new(false),
                }),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ScriptCore> {
        &self.core
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn loaded(&self) -> bool {
        self.core.is_loaded()
    }

    /// Whether the script registered a hook that cannot be silently dropped.
    pub fn pinned(&self) -> bool {
        self.core.pinned.load(Ordering::SeqCst)
    }

    /// Loads the script if it is not loaded yet. Failures are logged with
    /// the offending path and the interpreter's error text, and leave the
    /// handle unloaded with no retained interpreter.
    pub fn load(&self) -> Result<(), ScriptError> {
        if self.loaded() {
            return Ok(());
        }
        match load_core(&self.core) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("{err}");
                Err(err)
            }
        }
    }

    /// Unloads the script: unhooks the tick subscription, runs the script's
    /// unload hook, detaches every outstanding callback registration and
    /// closes the interpreter. Calling it twice is a no-op.
    pub fn unload(&self) {
        unload_core(&self.core);
    }

    /// Unload followed by a fresh load of the same path. Returns the new
    /// loaded state.
    pub fn reload(&self) -> bool {
        self.unload();
        let _ = self.load();
        self.loaded()
    }

    /// Consumes the handle. The script must already be unloaded; in release
    /// builds a still-loaded script is unloaded on a best-effort basis.
    pub fn destroy(self) {
        debug_assert!(!self.loaded(), "destroy called on a loaded script");
    }
}

impl Drop for ScriptHandle {
    fn drop(&mut self) {
        if self.loaded() {
            log::warn!(
                "script '{}' dropped while loaded; unloading",
                self.core.path.display()
            );
            unload_core(&self.core);
        }
    }
}

fn unload_core(core: &Arc<ScriptCore>) {
    if !core.loaded.swap(false, Ordering::SeqCst) {
        return;
    }

    // Unhook the tick subscription before anything else so the walk cannot
    // revisit this script.
    if let Some(runtime) = core.runtime.upgrade() {
        runtime.tick.unlink(core);
    }

    // Run the script's own cleanup hook, then detach every outstanding
    // registration. Hook failures are logged, never propagated: unload is
    // unconditionally forward-progressing.
    core.with_vm(|vm| {
        if let Some(key) = &vm.unload_key {
            call_registered(&vm.lua, key, (), "script_unload", &core.path);
        }
        let outstanding: Vec<Arc<ScriptCallback>> = core.callbacks.lock().clone();
        for callback in outstanding {
            callbacks::mark_removed(&callback);
        }
    });

    // Close the interpreter. If this thread is inside a call into it, the
    // teardown waits for the outermost call to return.
    let slot = core.vm.lock();
    if slot.call_depth.get() > 0 {
        slot.pending_unload.set(true);
    } else {
        drop(slot.vm.borrow_mut().take());
    }
}

fn load_core(core: &Arc<ScriptCore>) -> Result<(), ScriptError> {
    let Some(runtime) = core.runtime.upgrade() else {
        return Err(ScriptError::AllocationFailure {
            path: core.path.clone(),
            text: "script runtime already shut down".to_string(),
        });
    };

    let lua = Lua::new();
    if let Some(limit) = runtime.settings.memory_limit_bytes {
        lua.set_memory_limit(limit)
            .map_err(|err| ScriptError::AllocationFailure {
                path: core.path.clone(),
                text: err.to_string(),
            })?;
    }

    let slot = core.vm.lock();
    *slot.vm.borrow_mut() = Some(Vm {
        tick_key: None,
        unload_key: None,
        lua,
    });

    let outcome = {
        let vm_ref = slot.vm.borrow();
        let vm = vm_ref.as_ref().expect("interpreter just installed");
        bootstrap(&vm.lua, core, &runtime).and_then(|()| run_body(&vm.lua, core))
    };

    match outcome {
        Ok(()) => {
            let has_tick = {
                let mut vm_mut = slot.vm.borrow_mut();
                let vm = vm_mut.as_mut().expect("interpreter just installed");
                let Vm {
                    tick_key,
                    unload_key,
                    lua,
                } = vm;
                *tick_key = retain_global(lua, "script_tick");
                *unload_key = retain_global(lua, "script_unload");
                tick_key.is_some()
            };
            if has_tick {
                runtime.tick.link(core);
            }
            core.loaded.store(true, Ordering::SeqCst);
            Ok(())
        }
        Err(err) => {
            // Detach anything the failed body managed to register, then
            // release the interpreter.
            let outstanding: Vec<Arc<ScriptCallback>> = core.callbacks.lock().clone();
            for callback in outstanding {
                callbacks::mark_removed(&callback);
            }
            drop(slot.vm.borrow_mut().take());
            Err(err)
        }
    }
}

/// Runs the generated startup snippet, extends the module search path with
/// the runtime's dependency directories and installs the host bridge.
fn bootstrap(lua: &Lua, core: &Arc<ScriptCore>, runtime: &Arc<RuntimeInner>) -> Result<(), ScriptError> {
    let fail = |err: mlua::Error| ScriptError::CompileFailure {
        path: core.path.clone(),
        text: err.to_string(),
    };

    lua.load(BOOTSTRAP).set_name("=bootstrap").exec().map_err(fail)?;

    if !runtime.module_path_suffix.is_empty() {
        let package: Table = lua.globals().get("package").map_err(fail)?;
        let path: String = package.get("path").map_err(fail)?;
        package
            .set("path", format!("{path};{}", runtime.module_path_suffix))
            .map_err(fail)?;
    }

    bridge::install(lua, core).map_err(fail)
}

/// Compiles and executes the script file's top-level body. A single `false`
/// return declines the load.
fn run_body(lua: &Lua, core: &ScriptCore) -> Result<(), ScriptError> {
    let source = std::fs::read_to_string(&core.path).map_err(|err| ScriptError::CompileFailure {
        path: core.path.clone(),
        text: err.to_string(),
    })?;

    let returned: MultiValue = lua
        .load(&source)
        .set_name(core.path.to_string_lossy())
        .eval()
        .map_err(|err| match err {
            mlua::Error::SyntaxError { message, .. } => ScriptError::CompileFailure {
                path: core.path.clone(),
                text: message,
            },
            other => ScriptError::RuntimeFailure {
                path: core.path.clone(),
                text: other.to_string(),
            },
        })?;

    let returned = returned.into_vec();
    if returned.len() == 1 && matches!(returned.first(), Some(Value::Boolean(false))) {
        return Err(ScriptError::LoadRejected {
            path: core.path.clone(),
        });
    }

    Ok(())
}

/// Retains a global function in the registry by identity, so a later rename
/// inside the script cannot break the binding.
fn retain_global(lua: &Lua, name: &str) -> Option<RegistryKey> {
    let function: Function = lua.globals().get(name).ok()?;
    lua.create_registry_value(function).ok()
}
