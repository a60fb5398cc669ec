//! Document model for the rewind undo engine.
//!
//! Provides the rope-backed [`TextBuffer`], and the [`Document`] type the
//! engine observes: char-indexed `replace` primitives, per-mutation
//! modification stamps, and two-phase edit notifications.

pub mod buffer;
pub mod document;

pub use buffer::TextBuffer;
pub use document::{
    Document, DocumentEvent, DocumentId, DocumentListener, DocumentRef, ModificationStamp,
};
