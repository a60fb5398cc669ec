//! Coalescing undo/redo engine for text documents.
//!
//! The engine observes a document's fine-grained replacement events and
//! folds them into logical history entries: a run of keystrokes becomes one
//! undo step, while pastes, selection deletes, and disjoint edits stay
//! separate. Entries are filed per document in a shared
//! [`OperationHistory`], validated against the document's modification
//! stamps before replaying, and replayed directly against the document with
//! the manager's own listener suppressed for the duration.
//!
//! Typical wiring goes through the [`UndoManagerRegistry`]:
//!
//! ```
//! use std::sync::Arc;
//! use rewind_core::Document;
//! use rewind_undo::{HistoryConfig, OperationHistory, UndoManagerRegistry};
//!
//! let registry = UndoManagerRegistry::new(
//!     Arc::new(OperationHistory::new()),
//!     HistoryConfig::default(),
//! );
//! let document = Document::new_ref("");
//! let manager = registry.connect(&document);
//!
//! for (i, ch) in "hello".chars().enumerate() {
//!     document.lock().unwrap().replace(i, 0, &ch.to_string()).unwrap();
//! }
//! manager.commit();
//!
//! assert!(manager.undo());
//! assert_eq!(document.lock().unwrap().text(), "");
//! ```

pub mod config;
pub mod events;
pub mod history;
pub mod manager;
mod record;
pub mod registry;

pub use config::HistoryConfig;
pub use events::{DocumentUndoEvent, DocumentUndoListener, UndoEventKind};
pub use history::{
    ContextId, HistoryEvent, HistoryEventKind, HistoryListener, Operation, OperationHistory,
    OperationStatus,
};
pub use manager::{ClientId, DocumentUndoManager};
pub use registry::UndoManagerRegistry;
