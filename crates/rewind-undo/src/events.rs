//! Undo/redo notifications fanned out to registered listeners.

use std::sync::{Arc, Mutex};

use rewind_core::DocumentId;

/// Which phase of which operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoEventKind {
    /// An undo is about to replay against the document.
    AboutToUndo,
    /// A redo is about to replay against the document.
    AboutToRedo,
    /// An undo finished replaying.
    Undone,
    /// A redo finished replaying.
    Redone,
}

impl UndoEventKind {
    /// True for the two pre-replay phases.
    pub fn is_before(&self) -> bool {
        matches!(self, Self::AboutToUndo | Self::AboutToRedo)
    }

    /// True for undo events, false for redo events.
    pub fn is_undo(&self) -> bool {
        matches!(self, Self::AboutToUndo | Self::Undone)
    }
}

/// Payload delivered to [`DocumentUndoListener`]s around each replay.
///
/// `text` is what the replay inserts and `replaced` what it removes, so an
/// undo event carries the record's preserved text as `text`.
#[derive(Debug, Clone)]
pub struct DocumentUndoEvent {
    /// The document the replay targets.
    pub document: DocumentId,
    /// Char offset of the replayed range.
    pub offset: usize,
    /// Text the replay inserts.
    pub text: String,
    /// Text the replay removes.
    pub replaced: String,
    /// Phase and direction.
    pub kind: UndoEventKind,
    /// True when the replayed entry is a compound change.
    pub compound: bool,
    /// Opaque token passed by the caller that triggered the replay, if any.
    pub source: Option<u64>,
}

/// Observer of undo/redo replays.
///
/// Callbacks run synchronously inside the undo/redo call path and may be
/// invoked from whatever thread drives the shared history; they must be
/// non-blocking.
pub trait DocumentUndoListener: Send + Sync {
    /// Called before and after each undo/redo replay.
    fn document_undo(&self, event: &DocumentUndoEvent);
}

/// Listener registry with registration-order dispatch and set semantics.
#[derive(Default)]
pub(crate) struct Notifier {
    listeners: Mutex<Vec<Arc<dyn DocumentUndoListener>>>,
}

impl Notifier {
    pub(crate) fn add(&self, listener: Arc<dyn DocumentUndoListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn DocumentUndoListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Dispatches in registration order. The list is snapshotted first so
    /// listeners may add or remove listeners from inside the callback.
    pub(crate) fn fire(&self, event: &DocumentUndoEvent) {
        let snapshot = self.listeners.lock().unwrap().clone();
        for listener in &snapshot {
            listener.document_undo(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagger {
        tag: u32,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl DocumentUndoListener for Tagger {
        fn document_undo(&self, _event: &DocumentUndoEvent) {
            self.seen.lock().unwrap().push(self.tag);
        }
    }

    fn sample_event() -> DocumentUndoEvent {
        let doc = rewind_core::Document::new();
        DocumentUndoEvent {
            document: doc.id(),
            offset: 0,
            text: String::new(),
            replaced: String::new(),
            kind: UndoEventKind::Undone,
            compound: false,
            source: None,
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::default();
        for tag in [3, 1, 2] {
            notifier.add(Arc::new(Tagger {
                tag,
                seen: seen.clone(),
            }));
        }
        notifier.fire(&sample_event());
        assert_eq!(*seen.lock().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_add_is_idempotent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::default();
        let listener: Arc<dyn DocumentUndoListener> = Arc::new(Tagger {
            tag: 1,
            seen: seen.clone(),
        });
        notifier.add(listener.clone());
        notifier.add(listener.clone());
        notifier.fire(&sample_event());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_unregisters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::default();
        let listener: Arc<dyn DocumentUndoListener> = Arc::new(Tagger {
            tag: 1,
            seen: seen.clone(),
        });
        notifier.add(listener.clone());
        notifier.remove(&listener);
        notifier.fire(&sample_event());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_kind_predicates() {
        assert!(UndoEventKind::AboutToUndo.is_before());
        assert!(UndoEventKind::AboutToUndo.is_undo());
        assert!(!UndoEventKind::Redone.is_before());
        assert!(!UndoEventKind::Redone.is_undo());
        assert!(UndoEventKind::AboutToRedo.is_before());
        assert!(UndoEventKind::Undone.is_undo());
    }
}
