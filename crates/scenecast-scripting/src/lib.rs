//! Embedded Lua script runtime for Scenecast.
//!
//! Loads untrusted script files into isolated interpreter instances, exposes
//! the host object system to them, and tracks every host-invoked callback a
//! script registers so that removal is safe even when a callback removes
//! itself, or another callback, while it is executing.
//!
//! The host creates a [`ScriptRuntime`], registers its signal sources, and
//! opens scripts through a [`ScriptCollection`] or directly via
//! [`ScriptRuntime::create_script`]. Per frame, the host calls
//! [`ScriptRuntime::tick`] for `script_tick` hooks and
//! [`ScriptRuntime::drive_frame`] for render callbacks; events reach scripts
//! through the signal sources they connected to.

mod bridge;
mod callbacks;
mod collection;
mod error;
mod runtime;
mod script;
mod tick;

pub use callbacks::ScriptCallback;
pub use collection::ScriptCollection;
pub use error::ScriptError;
pub use runtime::{RuntimeSettings, ScriptRuntime};
pub use script::ScriptHandle;

pub use scenecast_events as events;
