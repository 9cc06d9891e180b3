//! Per-frame native callback driver.

use crate::signal::NativeCtx;
use parking_lot::Mutex;
use std::sync::Arc;

/// Native callback invoked once per frame with the output dimensions.
pub type NativeFrameFn = fn(&NativeCtx, u32, u32);

/// Process-wide list of per-frame callbacks, identity-keyed like signal
/// connections. The host drives it once per rendered frame.
#[derive(Default)]
pub struct FrameCallbacks {
    entries: Mutex<Vec<(NativeFrameFn, NativeCtx)>>,
}

impl FrameCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, func: NativeFrameFn, ctx: NativeCtx) {
        self.entries.lock().push((func, ctx));
    }

    /// Removes the first entry matching the `(func, ctx)` pair.
    pub fn remove(&self, func: NativeFrameFn, ctx: &NativeCtx) -> bool {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries
            .iter()
            .position(|(f, c)| std::ptr::fn_addr_eq(*f, func) && Arc::ptr_eq(c, ctx))
        {
            entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invokes every callback registered at the start of the drive. Entries
    /// added or removed by a callback take effect on the next drive.
    pub fn drive(&self, width: u32, height: u32) {
        let snapshot: Vec<(NativeFrameFn, NativeCtx)> = self
            .entries
            .lock()
            .iter()
            .map(|(func, ctx)| (*func, Arc::clone(ctx)))
            .collect();

        for (func, ctx) in snapshot {
            func(&ctx, width, height);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count(ctx: &NativeCtx, _width: u32, _height: u32) {
        let hits = ctx.downcast_ref::<AtomicUsize>().expect("counter ctx");
        hits.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn drive_invokes_each_entry() {
        let frames = FrameCallbacks::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        frames.add(count, a.clone());
        frames.add(count, b.clone());

        frames.drive(1920, 1080);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_is_identity_keyed() {
        let frames = FrameCallbacks::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        frames.add(count, a.clone());

        let a_ctx: NativeCtx = a.clone();
        let b_ctx: NativeCtx = b;
        assert!(!frames.remove(count, &b_ctx));
        assert!(frames.remove(count, &a_ctx));
        assert!(frames.is_empty());

        frames.drive(640, 480);
        assert_eq!(a.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removal_during_drive_applies_next_frame() {
        struct SelfRemove {
            frames: Arc<FrameCallbacks>,
            hits: AtomicUsize,
        }

        fn remove_self(ctx: &NativeCtx, _width: u32, _height: u32) {
            let state = ctx.downcast_ref::<SelfRemove>().expect("state ctx");
            state.hits.fetch_add(1, Ordering::SeqCst);
            state.frames.remove(remove_self, ctx);
        }

        let frames = Arc::new(FrameCallbacks::new());
        let state = Arc::new(SelfRemove {
            frames: frames.clone(),
            hits: AtomicUsize::new(0),
        });
        frames.add(remove_self, state.clone());

        frames.drive(1, 1);
        frames.drive(1, 1);

        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
        assert!(frames.is_empty());
    }
}
