//! Host-side registry of named signal sources.

use crate::signal::SignalSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Lookup table the host fills so scripts can resolve sources by name.
#[derive(Default)]
pub struct SourceDirectory {
    sources: Mutex<HashMap<String, Arc<SignalSource>>>,
}

impl SourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source under its own name, replacing any previous entry.
    pub fn register(&self, source: Arc<SignalSource>) {
        self.sources
            .lock()
            .insert(source.name().to_string(), source);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<SignalSource>> {
        self.sources.lock().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SignalSource>> {
        self.sources.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let directory = SourceDirectory::new();
        directory.register(SignalSource::new("camera"));

        let found = directory.get("camera").expect("registered source");
        assert_eq!(found.name(), "camera");
        assert!(directory.get("missing").is_none());
    }

    #[test]
    fn register_replaces_same_name() {
        let directory = SourceDirectory::new();
        let first = SignalSource::new("mic");
        let second = SignalSource::new("mic");
        directory.register(first.clone());
        directory.register(second.clone());

        let found = directory.get("mic").expect("registered source");
        assert!(Arc::ptr_eq(&found, &second));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn unregister_removes_entry() {
        let directory = SourceDirectory::new();
        directory.register(SignalSource::new("mic"));
        assert!(directory.unregister("mic").is_some());
        assert!(directory.is_empty());
        assert!(directory.unregister("mic").is_none());
    }
}
