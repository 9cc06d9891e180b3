//! Opaque host-object handles with explicit ownership.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// An object owned by the host and handed across the scripting boundary.
///
/// Implementors are identified to scripts only by their [`kind`](Self::kind)
/// string; everything else stays opaque until the host side downcasts.
pub trait HostObject: Send + Sync + 'static {
    /// Short type discriminator, e.g. `"signal_source"`.
    fn kind(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Reference to a [`HostObject`] with an ownership flag baked in.
///
/// `Owned` means the holder keeps the object alive until it lets go of the
/// reference. `Borrowed` means the host manages the lifetime, as with
/// event payload objects, which are only valid while the callback that
/// received them is running. A dead borrow simply resolves to `None`.
#[derive(Clone)]
pub enum ObjectRef {
    Owned(Arc<dyn HostObject>),
    Borrowed(Weak<dyn HostObject>),
}

impl ObjectRef {
    /// Wraps an object, transferring ownership to the holder when
    /// `transfer` is true.
    pub fn new(object: &Arc<dyn HostObject>, transfer: bool) -> Self {
        if transfer {
            Self::Owned(Arc::clone(object))
        } else {
            Self::Borrowed(Arc::downgrade(object))
        }
    }

    /// Resolves the reference, if the object is still alive.
    pub fn get(&self) -> Option<Arc<dyn HostObject>> {
        match self {
            Self::Owned(object) => Some(Arc::clone(object)),
            Self::Borrowed(weak) => weak.upgrade(),
        }
    }

    /// Whether two references point at the same host object.
    pub fn same_object(&self, other: &Arc<dyn HostObject>) -> bool {
        self.get()
            .is_some_and(|object| ptr_eq(&object, other))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(object) => write!(f, "ObjectRef({})", object.kind()),
            None => write!(f, "ObjectRef(<dead>)"),
        }
    }
}

/// Identity comparison for host objects (data pointer, not vtable).
pub(crate) fn ptr_eq(a: &Arc<dyn HostObject>, b: &Arc<dyn HostObject>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<u8>(),
        Arc::as_ptr(b).cast::<u8>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    impl HostObject for Dummy {
        fn kind(&self) -> &'static str {
            "dummy"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn owned_reference_keeps_object_alive() {
        let object: Arc<dyn HostObject> = Arc::new(Dummy);
        let reference = ObjectRef::new(&object, true);
        drop(object);
        assert!(reference.get().is_some());
    }

    #[test]
    fn borrowed_reference_dies_with_host() {
        let object: Arc<dyn HostObject> = Arc::new(Dummy);
        let reference = ObjectRef::new(&object, false);
        assert!(reference.get().is_some());
        drop(object);
        assert!(reference.get().is_none());
    }

    #[test]
    fn same_object_compares_identity() {
        let a: Arc<dyn HostObject> = Arc::new(Dummy);
        let b: Arc<dyn HostObject> = Arc::new(Dummy);
        let reference = ObjectRef::new(&a, true);
        assert!(reference.same_object(&a));
        assert!(!reference.same_object(&b));
    }

    #[test]
    fn dead_borrow_never_matches() {
        let a: Arc<dyn HostObject> = Arc::new(Dummy);
        let reference = ObjectRef::new(&a, false);
        drop(a);
        let b: Arc<dyn HostObject> = Arc::new(Dummy);
        assert!(!reference.same_object(&b));
    }

    #[test]
    fn downcast_through_as_any_arc() {
        let object: Arc<dyn HostObject> = Arc::new(Dummy);
        let any = object.as_any_arc();
        assert!(any.downcast::<Dummy>().is_ok());
    }
}
