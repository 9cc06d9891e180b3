//! Host-side object and event layer for the Scenecast runtime.
//!
//! This crate defines the opaque handles and signal plumbing that the
//! scripting layer consumes: [`HostObject`] references with explicit
//! ownership, the [`EventData`] payload bag carried by every signal,
//! per-source signal routing via [`SignalSource`], and the per-frame
//! [`FrameCallbacks`] driver.

mod data;
mod directory;
mod frame;
mod object;
mod signal;

pub use data::{EventData, FieldValue};
pub use directory::SourceDirectory;
pub use frame::{FrameCallbacks, NativeFrameFn};
pub use object::{HostObject, ObjectRef};
pub use signal::{NativeCtx, NativeSignalFn, SignalRelay, SignalSource};
