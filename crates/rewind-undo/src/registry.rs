//! Per-document manager registry.
//!
//! Maps a document to its (single) undo manager with a reference count, so
//! independent components can share one manager per document without
//! coordinating. The create-on-first-connect and destroy-on-last-disconnect
//! transitions are serialized under one lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rewind_core::{DocumentId, DocumentRef};

use crate::config::HistoryConfig;
use crate::history::OperationHistory;
use crate::manager::{ClientId, DocumentUndoManager};

struct RegistryEntry {
    manager: Arc<DocumentUndoManager>,
    refcount: usize,
}

/// Registry of undo managers, one per connected document.
pub struct UndoManagerRegistry {
    history: Arc<OperationHistory>,
    config: HistoryConfig,
    /// The registry connects managers as a single client of its own.
    client: ClientId,
    entries: Mutex<HashMap<DocumentId, RegistryEntry>>,
}

impl UndoManagerRegistry {
    /// Creates a registry filing all managers in the given shared history.
    pub fn new(history: Arc<OperationHistory>, config: HistoryConfig) -> Self {
        Self {
            history,
            config,
            client: ClientId::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Connects a document, creating and connecting its manager on first
    /// use and bumping the reference count otherwise.
    pub fn connect(&self, document: &DocumentRef) -> Arc<DocumentUndoManager> {
        let id = document.lock().unwrap().id();
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            entry.refcount += 1;
            return entry.manager.clone();
        }
        let manager =
            DocumentUndoManager::new(document.clone(), self.history.clone(), &self.config);
        manager.connect(self.client);
        entries.insert(
            id,
            RegistryEntry {
                manager: manager.clone(),
                refcount: 1,
            },
        );
        manager
    }

    /// Releases one connection. The last release disconnects the manager,
    /// discarding the document's history. Unknown documents are ignored.
    pub fn disconnect(&self, document: &DocumentRef) {
        let id = document.lock().unwrap().id();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) if entry.refcount > 1 => entry.refcount -= 1,
            Some(_) => {
                let entry = entries.remove(&id).expect("entry present");
                entry.manager.disconnect(self.client);
            }
            None => tracing::warn!("disconnect for a document that was never connected"),
        }
    }

    /// Looks up the manager for a connected document.
    pub fn undo_manager(&self, document: &DocumentRef) -> Option<Arc<DocumentUndoManager>> {
        let id = document.lock().unwrap().id();
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .map(|entry| entry.manager.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::Document;

    fn registry() -> UndoManagerRegistry {
        UndoManagerRegistry::new(
            Arc::new(OperationHistory::new()),
            HistoryConfig::default(),
        )
    }

    #[test]
    fn test_connect_creates_one_manager_per_document() {
        let registry = registry();
        let document = Document::new_ref("");
        let first = registry.connect(&document);
        let second = registry.connect(&document);
        assert!(Arc::ptr_eq(&first, &second));

        let other = Document::new_ref("");
        let third = registry.connect(&other);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_lookup() {
        let registry = registry();
        let document = Document::new_ref("");
        assert!(registry.undo_manager(&document).is_none());

        let manager = registry.connect(&document);
        let found = registry.undo_manager(&document).expect("registered");
        assert!(Arc::ptr_eq(&manager, &found));
    }

    #[test]
    fn test_refcounted_teardown() {
        let registry = registry();
        let document = Document::new_ref("");
        let manager = registry.connect(&document);
        registry.connect(&document);

        document.lock().unwrap().replace(0, 0, "x").unwrap();
        manager.commit();
        assert!(manager.undoable());

        registry.disconnect(&document);
        // one connection left: history preserved
        assert!(manager.is_connected());
        assert!(manager.undoable());

        registry.disconnect(&document);
        assert!(!manager.is_connected());
        assert!(!manager.undoable());
        assert!(registry.undo_manager(&document).is_none());
    }

    #[test]
    fn test_unknown_disconnect_is_ignored() {
        let registry = registry();
        let document = Document::new_ref("");
        registry.disconnect(&document);
        assert!(registry.undo_manager(&document).is_none());
    }

    #[test]
    fn test_registered_manager_records_edits() {
        let registry = registry();
        let document = Document::new_ref("");
        let manager = registry.connect(&document);

        document.lock().unwrap().replace(0, 0, "a").unwrap();
        document.lock().unwrap().replace(1, 0, "b").unwrap();
        manager.commit();

        assert!(manager.undo());
        assert_eq!(document.lock().unwrap().text(), "");
    }
}
