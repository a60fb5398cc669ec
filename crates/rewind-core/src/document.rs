//! Document model combining text storage, modification stamps, and edit
//! notifications.
//!
//! A `Document` wraps a [`TextBuffer`] and assigns a fresh modification
//! stamp to every mutation. Registered [`DocumentListener`]s are told about
//! each edit twice: `about_to_change` before the buffer is touched (the
//! only point where the replaced text and the pre-edit stamp are available
//! together) and `changed` after, carrying the post-edit stamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::buffer::TextBuffer;

/// Opaque modification stamp handed out by a document per mutation.
///
/// Stamps change monotonically and are only ever compared for equality;
/// the `UNKNOWN` value means "no stamp recorded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModificationStamp(Option<u64>);

impl ModificationStamp {
    /// The absent stamp.
    pub const UNKNOWN: Self = Self(None);

    /// Creates a known stamp with the given value.
    pub fn known(value: u64) -> Self {
        Self(Some(value))
    }

    /// Returns true if this is the absent stamp.
    pub fn is_unknown(&self) -> bool {
        self.0.is_none()
    }
}

/// Counter backing stamp allocation. Process-wide so values never recur,
/// even across documents exchanging history.
static NEXT_STAMP: AtomicU64 = AtomicU64::new(0);

fn fresh_stamp() -> ModificationStamp {
    ModificationStamp::known(NEXT_STAMP.fetch_add(1, Ordering::Relaxed))
}

/// Identity of a document, stable for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(u64);

/// Counter backing [`DocumentId`] generation.
static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(0);

impl DocumentId {
    fn next() -> Self {
        Self(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Payload delivered to [`DocumentListener`]s for one edit.
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    /// The document being edited.
    pub document: DocumentId,
    /// Char offset of the replaced range.
    pub offset: usize,
    /// Char length of the replaced range (before the edit).
    pub length: usize,
    /// Text being inserted (empty for pure deletions).
    pub text: String,
    /// Text being replaced (empty for pure insertions).
    pub replaced: String,
    /// Pre-edit stamp in `about_to_change`, post-edit stamp in `changed`.
    pub stamp: ModificationStamp,
}

/// Observer of document mutations.
///
/// Callbacks run synchronously inside `replace` while the caller holds the
/// document; implementations must not call back into the same document.
pub trait DocumentListener: Send + Sync {
    /// Fired before the buffer is mutated.
    fn about_to_change(&self, event: &DocumentEvent);
    /// Fired after the buffer is mutated and restamped.
    fn changed(&self, event: &DocumentEvent);
}

/// Shared handle under which documents are passed around.
pub type DocumentRef = Arc<Mutex<Document>>;

/// A text document with modification stamps and edit notifications.
pub struct Document {
    id: DocumentId,
    buffer: TextBuffer,
    stamp: ModificationStamp,
    listeners: Vec<Arc<dyn DocumentListener>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Document {
    fn from(text: &str) -> Self {
        let mut doc = Self::new();
        doc.buffer = TextBuffer::from(text);
        doc
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("len_chars", &self.buffer.len_chars())
            .field("stamp", &self.stamp)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Document {
    /// Creates a new empty document.
    pub fn new() -> Self {
        Self {
            id: DocumentId::next(),
            buffer: TextBuffer::new(),
            stamp: fresh_stamp(),
            listeners: Vec::new(),
        }
    }

    /// Creates a new document wrapped in the shared handle type.
    pub fn new_ref(text: &str) -> DocumentRef {
        Arc::new(Mutex::new(Document::from(text)))
    }

    /// Returns this document's identity.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Returns the current modification stamp.
    pub fn modification_stamp(&self) -> ModificationStamp {
        self.stamp
    }

    /// Returns the total number of characters.
    pub fn len_chars(&self) -> usize {
        self.buffer.len_chars()
    }

    /// Returns the whole document content.
    pub fn text(&self) -> String {
        self.buffer.to_string()
    }

    /// Returns the text in the given char range.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    pub fn slice(&self, start: usize, end: usize) -> Result<String> {
        Ok(self.buffer.slice(start, end)?.to_string())
    }

    /// Legal line delimiters, longest first so that `\r\n` wins prefix
    /// matches over `\r`.
    pub fn line_delimiters() -> &'static [&'static str] {
        &["\r\n", "\r", "\n"]
    }

    /// Replaces `length` chars at `offset` with `text`, assigning a fresh
    /// modification stamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds; listeners are not
    /// notified in that case.
    pub fn replace(&mut self, offset: usize, length: usize, text: &str) -> Result<()> {
        self.replace_internal(offset, length, text, None)
    }

    /// Replaces `length` chars at `offset` with `text`, setting the given
    /// stamp instead of a fresh one. Used by undo/redo replay to restore
    /// recorded stamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    pub fn replace_with_stamp(
        &mut self,
        offset: usize,
        length: usize,
        text: &str,
        stamp: ModificationStamp,
    ) -> Result<()> {
        self.replace_internal(offset, length, text, Some(stamp))
    }

    fn replace_internal(
        &mut self,
        offset: usize,
        length: usize,
        text: &str,
        stamp: Option<ModificationStamp>,
    ) -> Result<()> {
        let end = offset + length;
        // Also validates the range before any listener hears about the edit.
        let replaced = self.buffer.slice(offset, end)?.to_string();

        let mut event = DocumentEvent {
            document: self.id,
            offset,
            length,
            text: text.to_string(),
            replaced,
            stamp: self.stamp,
        };

        let listeners = self.listeners.clone();
        for listener in &listeners {
            listener.about_to_change(&event);
        }

        self.buffer.replace(offset, end, text)?;
        self.stamp = match stamp {
            Some(given) => given,
            None => fresh_stamp(),
        };

        event.stamp = self.stamp;
        for listener in &listeners {
            listener.changed(&event);
        }
        Ok(())
    }

    /// Registers an edit listener. Adding the same listener twice is a
    /// no-op.
    pub fn add_listener(&mut self, listener: Arc<dyn DocumentListener>) {
        if !self.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            self.listeners.push(listener);
        }
    }

    /// Removes a previously registered edit listener. Unknown listeners are
    /// ignored.
    pub fn remove_listener(&mut self, listener: &Arc<dyn DocumentListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }
}
