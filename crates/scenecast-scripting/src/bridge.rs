//! The host-function bridge installed into every interpreter.
//!
//! Scripts see a global `scenecast` table with the connect/disconnect
//! surface, payload accessors and a few host lookups, plus a bare
//! `get_script_path()` global. Every shim validates its own arguments; a
//! mismatch is logged and the shim returns no results rather than raising
//! into the interpreter.
//!
//! The dispatchers at the bottom are the native functions handed to the
//! event layer. They are identity-keyed by the registration `Arc` they
//! receive as context, and they implement the removal protocol: a marked
//! registration is never invoked again, and a handler that disconnects
//! itself mid-call still finishes observing the event that triggered the
//! disconnect.

use crate::callbacks::{self, ScriptCallback};
use crate::script::{self, ScriptCore};
use mlua::{Function, Lua, UserData, Value, Variadic};
use scenecast_events::{
    EventData, FieldValue, HostObject, NativeCtx, ObjectRef, SignalRelay, SignalSource,
};
use std::cell::RefCell;
use std::sync::{Arc, Weak};

/// Interpreter-side wrapper around an opaque host object.
pub(crate) struct LuaHostObject {
    pub(crate) object: ObjectRef,
}

impl UserData for LuaHostObject {
    fn add_methods<'lua, M: mlua::UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(mlua::MetaMethod::ToString, |_, this, ()| {
            Ok(match this.object.get() {
                Some(object) => format!("<host object: {}>", object.kind()),
                None => "<released host object>".to_string(),
            })
        });
    }
}

/// Interpreter-side view of an event payload, valid only while the emitting
/// delivery is still on the stack.
pub(crate) struct LuaEventPayload {
    pub(crate) data: std::sync::Weak<EventData>,
}

impl UserData for LuaEventPayload {}

// --- argument checking -------------------------------------------------

fn expect_arg_count(name: &str, args: &[Value], expected: usize) -> bool {
    if args.len() == expected {
        true
    } else {
        log::warn!("wrong number of arguments for {name}");
        false
    }
}

fn object_arg(name: &str, args: &[Value], index: usize) -> Option<Arc<dyn HostObject>> {
    let Some(Value::UserData(ud)) = args.get(index) else {
        log::warn!("wrong type for parameter {} of {name}", index + 1);
        return None;
    };
    let Ok(wrapper) = ud.borrow::<LuaHostObject>() else {
        log::warn!("wrong type for parameter {} of {name}", index + 1);
        return None;
    };
    match wrapper.object.get() {
        Some(object) => Some(object),
        None => {
            log::warn!("released host object passed to {name}");
            None
        }
    }
}

fn source_arg(name: &str, args: &[Value], index: usize) -> Option<Arc<SignalSource>> {
    let object = object_arg(name, args, index)?;
    match object.as_any_arc().downcast::<SignalSource>() {
        Ok(source) => Some(source),
        Err(_) => {
            log::warn!("wrong object type for parameter {} of {name}", index + 1);
            None
        }
    }
}

fn string_arg(name: &str, args: &[Value], index: usize) -> Option<String> {
    match args.get(index) {
        Some(Value::String(value)) => match value.to_str() {
            Ok(value) => Some(value.to_string()),
            Err(_) => {
                log::warn!("wrong type for parameter {} of {name}", index + 1);
                None
            }
        },
        _ => {
            log::warn!("wrong type for parameter {} of {name}", index + 1);
            None
        }
    }
}

fn function_arg<'lua>(name: &str, args: &[Value<'lua>], index: usize) -> Option<Function<'lua>> {
    match args.get(index) {
        Some(Value::Function(function)) => Some(function.clone()),
        _ => {
            log::warn!("wrong type for parameter {} of {name}", index + 1);
            None
        }
    }
}

fn payload_arg(name: &str, args: &[Value], index: usize) -> Option<Arc<EventData>> {
    let Some(Value::UserData(ud)) = args.get(index) else {
        log::warn!("wrong type for parameter {} of {name}", index + 1);
        return None;
    };
    let Ok(payload) = ud.borrow::<LuaEventPayload>() else {
        log::warn!("wrong type for parameter {} of {name}", index + 1);
        return None;
    };
    match payload.data.upgrade() {
        Some(data) => Some(data),
        None => {
            log::warn!("event payload passed to {name} is no longer valid");
            None
        }
    }
}

/// Wraps a host object for the interpreter. `transfer` hands ownership to
/// the interpreter; otherwise the script holds a borrow that dies with the
/// host-side reference.
fn push_object<'lua>(
    lua: &'lua Lua,
    object: &Arc<dyn HostObject>,
    transfer: bool,
) -> mlua::Result<Value<'lua>> {
    let wrapper = LuaHostObject {
        object: ObjectRef::new(object, transfer),
    };
    Ok(Value::UserData(lua.create_userdata(wrapper)?))
}

// --- script-callable surface -------------------------------------------

/// Installs the `scenecast` bridge table and the `get_script_path` global
/// into a freshly created interpreter.
pub(crate) fn install(lua: &Lua, core: &Arc<ScriptCore>) -> mlua::Result<()> {
    let bridge = lua.create_table()?;

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "connect_signal",
            lua.create_function(move |lua, args: Variadic<Value>| {
                connect_signal(lua, &script, &args);
                Ok(())
            })?,
        )?;
    }

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "disconnect_signal",
            lua.create_function(move |lua, args: Variadic<Value>| {
                disconnect_signal(lua, &script, &args);
                Ok(())
            })?,
        )?;
    }

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "connect_global_signal",
            lua.create_function(move |lua, args: Variadic<Value>| {
                connect_global_signal(lua, &script, &args);
                Ok(())
            })?,
        )?;
    }

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "disconnect_global_signal",
            lua.create_function(move |lua, args: Variadic<Value>| {
                disconnect_global_signal(lua, &script, &args);
                Ok(())
            })?,
        )?;
    }

    bridge.set(
        "remove_current_signal_callback",
        lua.create_function(|_, ()| {
            if let Some(callback) = current_callback() {
                callbacks::mark_removed(&callback);
            }
            Ok(())
        })?,
    )?;

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "add_frame_render_callback",
            lua.create_function(move |lua, args: Variadic<Value>| {
                add_frame_render_callback(lua, &script, &args);
                Ok(())
            })?,
        )?;
    }

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "remove_frame_render_callback",
            lua.create_function(move |lua, args: Variadic<Value>| {
                if !expect_arg_count("remove_frame_render_callback", &args, 1) {
                    return Ok(());
                }
                let Some(script) = script.upgrade() else {
                    return Ok(());
                };
                let Some(function) = function_arg("remove_frame_render_callback", &args, 0)
                else {
                    return Ok(());
                };
                if let Some(callback) = callbacks::find(&script, lua, &function) {
                    callbacks::mark_removed(&callback);
                }
                Ok(())
            })?,
        )?;
    }

    bridge.set(
        "get_event_field",
        lua.create_function(|lua, args: Variadic<Value>| {
            let mut results = Variadic::new();
            if !expect_arg_count("get_event_field", &args, 2) {
                return Ok(results);
            }
            let (Some(data), Some(field)) = (
                payload_arg("get_event_field", &args, 0),
                string_arg("get_event_field", &args, 1),
            ) else {
                return Ok(results);
            };
            if let Some(object) = data.object(&field) {
                results.push(push_object(lua, &object, false)?);
            }
            Ok(results)
        })?,
    )?;

    bridge.set(
        "get_event_value",
        lua.create_function(|lua, args: Variadic<Value>| {
            let mut results = Variadic::new();
            if !expect_arg_count("get_event_value", &args, 2) {
                return Ok(results);
            }
            let (Some(data), Some(field)) = (
                payload_arg("get_event_value", &args, 0),
                string_arg("get_event_value", &args, 1),
            ) else {
                return Ok(results);
            };
            match data.get(&field) {
                Some(FieldValue::Bool(value)) => results.push(Value::Boolean(*value)),
                Some(FieldValue::Int(value)) => results.push(Value::Integer(*value)),
                Some(FieldValue::Float(value)) => results.push(Value::Number(*value)),
                Some(FieldValue::Str(value)) => {
                    results.push(Value::String(lua.create_string(value)?));
                }
                Some(FieldValue::Object(_)) | None => {}
            }
            Ok(results)
        })?,
    )?;

    bridge.set(
        "emit_signal",
        lua.create_function(|_, args: Variadic<Value>| {
            emit_signal(&args);
            Ok(())
        })?,
    )?;

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "get_source",
            lua.create_function(move |lua, args: Variadic<Value>| {
                let mut results = Variadic::new();
                if !expect_arg_count("get_source", &args, 1) {
                    return Ok(results);
                }
                let Some(name) = string_arg("get_source", &args, 0) else {
                    return Ok(results);
                };
                let source = script
                    .upgrade()
                    .and_then(|script| script.runtime.upgrade())
                    .and_then(|runtime| runtime.directory.get(&name));
                if let Some(source) = source {
                    let object: Arc<dyn HostObject> = source;
                    results.push(push_object(lua, &object, true)?);
                }
                Ok(results)
            })?,
        )?;
    }

    {
        let script = Arc::downgrade(core);
        bridge.set(
            "script_log",
            lua.create_function(move |_, args: Variadic<Value>| {
                if !expect_arg_count("script_log", &args, 2) {
                    return Ok(());
                }
                let (Some(level), Some(message)) = (
                    string_arg("script_log", &args, 0),
                    string_arg("script_log", &args, 1),
                ) else {
                    return Ok(());
                };
                let level = match level.as_str() {
                    "debug" => log::Level::Debug,
                    "warn" | "warning" => log::Level::Warn,
                    "error" => log::Level::Error,
                    _ => log::Level::Info,
                };
                let name = script
                    .upgrade()
                    .map(|script| script.file_name.clone())
                    .unwrap_or_default();
                log::log!(level, "[{name}] {message}");
                Ok(())
            })?,
        )?;
    }

    lua.globals().set("scenecast", bridge)?;

    let dir = core.script_dir.clone();
    lua.globals().set(
        "get_script_path",
        lua.create_function(move |_, ()| Ok(dir.clone()))?,
    )?;

    Ok(())
}

fn connect_signal<'lua>(lua: &'lua Lua, script: &Weak<ScriptCore>, args: &[Value<'lua>]) {
    if !expect_arg_count("connect_signal", args, 3) {
        return;
    }
    let Some(script) = script.upgrade() else {
        return;
    };
    let (Some(source), Some(signal), Some(function)) = (
        source_arg("connect_signal", args, 0),
        string_arg("connect_signal", args, 1),
        function_arg("connect_signal", args, 2),
    ) else {
        return;
    };

    let callback = match callbacks::register(&script, lua, function, false) {
        Ok(callback) => callback,
        Err(err) => {
            log::warn!("failed to retain signal handler: {err}");
            return;
        }
    };
    {
        let mut extra = callback.extra.lock();
        let object: Arc<dyn HostObject> = source.clone();
        extra.set_object("source", ObjectRef::new(&object, true));
        extra.set_string("signal", &signal);
    }
    let ctx: NativeCtx = callback;
    source.connect(&signal, signal_dispatch, ctx);
}

fn disconnect_signal<'lua>(lua: &'lua Lua, script: &Weak<ScriptCore>, args: &[Value<'lua>]) {
    if !expect_arg_count("disconnect_signal", args, 3) {
        return;
    }
    let Some(script) = script.upgrade() else {
        return;
    };
    let (Some(source), Some(signal), Some(function)) = (
        source_arg("disconnect_signal", args, 0),
        string_arg("disconnect_signal", args, 1),
        function_arg("disconnect_signal", args, 2),
    ) else {
        return;
    };

    let target: Arc<dyn HostObject> = source;
    let mut cursor = callbacks::find(&script, lua, &function);
    while let Some(callback) = cursor {
        let matched = {
            let extra = callback.extra.lock();
            extra.string("signal") == Some(signal.as_str())
                && match extra.get("source") {
                    Some(FieldValue::Object(reference)) => reference.same_object(&target),
                    _ => false,
                }
        };
        if matched {
            callbacks::mark_removed(&callback);
            return;
        }
        cursor = callbacks::find_next(&script, lua, Some(&callback), &function);
    }
}

fn connect_global_signal<'lua>(lua: &'lua Lua, script: &Weak<ScriptCore>, args: &[Value<'lua>]) {
    if !expect_arg_count("connect_global_signal", args, 2) {
        return;
    }
    let Some(script) = script.upgrade() else {
        return;
    };
    let (Some(source), Some(function)) = (
        source_arg("connect_global_signal", args, 0),
        function_arg("connect_global_signal", args, 1),
    ) else {
        return;
    };

    let callback = match callbacks::register(&script, lua, function, false) {
        Ok(callback) => callback,
        Err(err) => {
            log::warn!("failed to retain global signal handler: {err}");
            return;
        }
    };
    let ctx: NativeCtx = callback;
    source.connect_global(global_signal_dispatch, ctx);
}

fn disconnect_global_signal<'lua>(lua: &'lua Lua, script: &Weak<ScriptCore>, args: &[Value<'lua>]) {
    if !expect_arg_count("disconnect_global_signal", args, 1) {
        return;
    }
    let Some(script) = script.upgrade() else {
        return;
    };
    let Some(function) = function_arg("disconnect_global_signal", args, 0) else {
        return;
    };
    if let Some(callback) = callbacks::find(&script, lua, &function) {
        callbacks::mark_removed(&callback);
    }
}

fn add_frame_render_callback<'lua>(lua: &'lua Lua, script: &Weak<ScriptCore>, args: &[Value<'lua>]) {
    if !expect_arg_count("add_frame_render_callback", args, 1) {
        return;
    }
    let Some(script) = script.upgrade() else {
        return;
    };
    let Some(function) = function_arg("add_frame_render_callback", args, 0) else {
        return;
    };
    let Some(runtime) = script.runtime.upgrade() else {
        return;
    };

    let callback = match callbacks::register(&script, lua, function, false) {
        Ok(callback) => callback,
        Err(err) => {
            log::warn!("failed to retain render callback: {err}");
            return;
        }
    };
    let ctx: NativeCtx = callback;
    runtime.frames.add(frame_render_dispatch, ctx);
}

fn emit_signal(args: &[Value]) {
    if args.len() != 2 && args.len() != 3 {
        log::warn!("wrong number of arguments for emit_signal");
        return;
    }
    let (Some(source), Some(signal)) = (
        source_arg("emit_signal", args, 0),
        string_arg("emit_signal", args, 1),
    ) else {
        return;
    };

    let mut data = EventData::new();
    if let Some(value) = args.get(2) {
        let Value::Table(table) = value else {
            log::warn!("wrong type for parameter 3 of emit_signal");
            return;
        };
        for pair in table.clone().pairs::<String, Value>() {
            let Ok((key, value)) = pair else {
                continue;
            };
            match value {
                Value::Boolean(value) => data.set_bool(&key, value),
                Value::Integer(value) => data.set_int(&key, value),
                Value::Number(value) => data.set_float(&key, value),
                Value::String(value) => {
                    if let Ok(value) = value.to_str() {
                        data.set_string(&key, value);
                    }
                }
                Value::UserData(ud) => {
                    if let Ok(wrapper) = ud.borrow::<LuaHostObject>() {
                        if let Some(object) = wrapper.object.get() {
                            data.set_object(&key, ObjectRef::new(&object, true));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    source.emit(&signal, data);
}

// --- dispatchers -------------------------------------------------------

thread_local! {
    /// Registration currently being dispatched on this thread, so a script
    /// can unsubscribe itself without knowing its own identity.
    static CURRENT_CALLBACK: RefCell<Option<Arc<ScriptCallback>>> = const { RefCell::new(None) };
}

pub(crate) fn current_callback() -> Option<Arc<ScriptCallback>> {
    CURRENT_CALLBACK.with(|current| current.borrow().clone())
}

fn callback_from_ctx(ctx: &NativeCtx) -> Option<Arc<ScriptCallback>> {
    Arc::clone(ctx).downcast::<ScriptCallback>().ok()
}

/// Invokes a registration's retained function under its owner's lock,
/// tracking the thread-local current slot. Returns whether the call marked
/// its own registration for removal.
fn invoke_tracked(
    callback: &Arc<ScriptCallback>,
    signal: Option<&str>,
    data: &Arc<EventData>,
) -> bool {
    let Some(script) = callback.script.upgrade() else {
        return false;
    };

    let previous =
        CURRENT_CALLBACK.with(|current| current.borrow_mut().replace(Arc::clone(callback)));

    let marked_inside = script
        .with_vm(|vm| {
            if callback.is_removed() {
                callbacks::reclaim(callback);
                return false;
            }
            let Some(function) = callback.function(&vm.lua) else {
                return false;
            };
            let payload = LuaEventPayload {
                data: Arc::downgrade(data),
            };
            match signal {
                Some(name) => script::call_function(
                    &function,
                    (name.to_string(), payload),
                    "signal handler",
                    &script.path,
                ),
                None => {
                    script::call_function(&function, (payload,), "signal handler", &script.path)
                }
            };
            callback.is_removed()
        })
        .unwrap_or(false);

    CURRENT_CALLBACK.with(|current| *current.borrow_mut() = previous);
    marked_inside
}

/// Native dispatcher for per-source signal connections.
pub(crate) fn signal_dispatch(ctx: &NativeCtx, relay: &mut SignalRelay<'_>) {
    let Some(callback) = callback_from_ctx(ctx) else {
        return;
    };
    if callback.is_removed() {
        relay.remove_current();
        callbacks::reclaim(&callback);
        return;
    }
    if invoke_tracked(&callback, None, relay.data()) {
        // The handler disconnected itself mid-call. Replay once so the
        // removal branch runs against this same delivery; the host-level
        // disconnect takes effect strictly after the in-flight delivery
        // completes.
        signal_dispatch(ctx, relay);
    }
}

/// Native dispatcher for global connections; forwards the signal name.
pub(crate) fn global_signal_dispatch(ctx: &NativeCtx, relay: &mut SignalRelay<'_>) {
    let Some(callback) = callback_from_ctx(ctx) else {
        return;
    };
    if callback.is_removed() {
        relay.remove_current();
        callbacks::reclaim(&callback);
        return;
    }
    if invoke_tracked(&callback, Some(relay.signal()), relay.data()) {
        global_signal_dispatch(ctx, relay);
    }
}

/// Native dispatcher for per-frame render callbacks. A registration marked
/// mid-frame is dropped from the frame list on the next drive.
pub(crate) fn frame_render_dispatch(ctx: &NativeCtx, width: u32, height: u32) {
    let Some(callback) = callback_from_ctx(ctx) else {
        return;
    };
    if callback.is_removed() {
        if let Some(runtime) = callback.runtime.upgrade() {
            runtime.frames.remove(frame_render_dispatch, ctx);
        }
        callbacks::reclaim(&callback);
        return;
    }
    let Some(script) = callback.script.upgrade() else {
        return;
    };
    script.with_vm(|vm| {
        if callback.is_removed() {
            callbacks::reclaim(&callback);
            return;
        }
        if let Some(function) = callback.function(&vm.lua) {
            script::call_function(&function, (width, height), "render callback", &script.path);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct Prop;

    impl HostObject for Prop {
        fn kind(&self) -> &'static str {
            "prop"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn push_and_read_back_owned_object() {
        let lua = Lua::new();
        let object: Arc<dyn HostObject> = Arc::new(Prop);
        let value = push_object(&lua, &object, true).unwrap();
        drop(object);

        let args = [value];
        let read = object_arg("test", &args, 0).expect("owned object survives");
        assert_eq!(read.kind(), "prop");
    }

    #[test]
    fn borrowed_object_expires_with_host_reference() {
        let lua = Lua::new();
        let object: Arc<dyn HostObject> = Arc::new(Prop);
        let value = push_object(&lua, &object, false).unwrap();
        drop(object);

        let args = [value];
        assert!(object_arg("test", &args, 0).is_none());
    }

    #[test]
    fn source_arg_rejects_other_object_kinds() {
        let lua = Lua::new();
        let object: Arc<dyn HostObject> = Arc::new(Prop);
        let value = push_object(&lua, &object, true).unwrap();

        let args = [value];
        assert!(source_arg("test", &args, 0).is_none());
    }

    #[test]
    fn source_arg_accepts_signal_sources() {
        let lua = Lua::new();
        let source = SignalSource::new("deck");
        let object: Arc<dyn HostObject> = source.clone();
        let value = push_object(&lua, &object, true).unwrap();

        let args = [value];
        let read = source_arg("test", &args, 0).expect("source round-trips");
        assert!(Arc::ptr_eq(&read, &source));
    }

    #[test]
    fn scalar_args_reject_wrong_types() {
        let lua = Lua::new();
        let args = [Value::Integer(7), Value::Nil];
        assert!(string_arg("test", &args, 0).is_none());
        assert!(function_arg("test", &args, 1).is_none());
        assert!(payload_arg("test", &args, 0).is_none());
        assert!(!expect_arg_count("test", &args, 3));
        let _ = lua;
    }

    #[test]
    fn stale_payload_is_rejected() {
        let lua = Lua::new();
        let data = Arc::new(EventData::new());
        let payload = LuaEventPayload {
            data: Arc::downgrade(&data),
        };
        let value = Value::UserData(lua.create_userdata(payload).unwrap());
        drop(data);

        let args = [value];
        assert!(payload_arg("test", &args, 0).is_none());
    }

    #[test]
    fn host_object_tostring_names_the_kind() {
        let lua = Lua::new();
        let object: Arc<dyn HostObject> = Arc::new(Prop);
        let value = push_object(&lua, &object, true).unwrap();
        lua.globals().set("prop", value).unwrap();
        let text: String = lua.load("return tostring(prop)").eval().unwrap();
        assert!(text.contains("prop"));
    }
}
