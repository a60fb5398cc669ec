//! Change records: the entries the engine files in the shared history.
//!
//! A record is one coalesced edit (or a compound group of them) expressed
//! as a span replacement: undoing puts the preserved text back, redoing
//! re-applies the inserted text, both through the document's stamp-aware
//! replace so the modification stamp travels with the content.
//!
//! The history owns committed records as `Arc<dyn Operation>`; a record
//! holds only a weak back-reference to the manager that produced it (plus
//! its context tags), so dropping a manager strands its records harmlessly.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use rewind_core::{Document, ModificationStamp};

use crate::events::UndoEventKind;
use crate::history::{ContextId, Operation, OperationStatus};
use crate::manager::DocumentUndoManager;

/// Char span a record covers, in pre-change coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// The payload of one coalesced change.
///
/// `text`/`preserved` stay `None` while the record is open; commit freezes
/// them from the manager's pending buffers. A record is structurally valid
/// once it has a span and frozen text.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeData {
    pub span: Option<Span>,
    pub text: Option<String>,
    pub preserved: Option<String>,
    pub undo_stamp: ModificationStamp,
    pub redo_stamp: ModificationStamp,
}

impl ChangeData {
    pub fn is_valid(&self) -> bool {
        self.span.is_some() && self.text.is_some()
    }

    pub fn reinitialize(&mut self) {
        *self = Self::default();
    }

    /// Puts the preserved text back, restoring the pre-change stamp.
    fn undo_apply(&self, document: &mut Document) -> Result<()> {
        let span = self.span.context("record has no span")?;
        let text = self.text.as_deref().context("record has no frozen text")?;
        let preserved = self
            .preserved
            .as_deref()
            .context("record has no preserved text")?;
        document.replace_with_stamp(
            span.start,
            text.chars().count(),
            preserved,
            self.undo_stamp,
        )
    }

    /// Re-applies the inserted text, restoring the post-change stamp.
    fn redo_apply(&self, document: &mut Document) -> Result<()> {
        let span = self.span.context("record has no span")?;
        let text = self.text.as_deref().context("record has no frozen text")?;
        document.replace_with_stamp(span.start, span.len(), text, self.redo_stamp)
    }
}

/// A record is either one coalesced edit or an ordered group of them
/// undone and redone as a unit.
#[derive(Debug)]
pub(crate) enum Shape {
    Plain,
    Compound(Vec<ChangeData>),
}

#[derive(Debug)]
pub(crate) struct Inner {
    pub data: ChangeData,
    pub shape: Shape,
}

/// One history entry produced by a [`DocumentUndoManager`].
pub(crate) struct TextChangeOp {
    manager: Mutex<Weak<DocumentUndoManager>>,
    contexts: Mutex<Vec<ContextId>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for TextChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("TextChangeOp")
            .field("data", &inner.data)
            .field("compound", &matches!(inner.shape, Shape::Compound(_)))
            .finish()
    }
}

impl TextChangeOp {
    pub fn new_plain(manager: Weak<DocumentUndoManager>, context: ContextId) -> Arc<Self> {
        Self::with_shape(manager, context, Shape::Plain)
    }

    pub fn new_compound(manager: Weak<DocumentUndoManager>, context: ContextId) -> Arc<Self> {
        Self::with_shape(manager, context, Shape::Compound(Vec::new()))
    }

    fn with_shape(
        manager: Weak<DocumentUndoManager>,
        context: ContextId,
        shape: Shape,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: Mutex::new(manager),
            contexts: Mutex::new(vec![context]),
            inner: Mutex::new(Inner {
                data: ChangeData::default(),
                shape,
            }),
        })
    }

    pub fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn manager(&self) -> Option<Arc<DocumentUndoManager>> {
        self.manager.lock().unwrap().upgrade()
    }

    /// Re-parents the record onto another manager (history transfer).
    pub fn set_manager(&self, manager: Weak<DocumentUndoManager>) {
        *self.manager.lock().unwrap() = manager;
    }

    pub fn is_managed_by(&self, manager: &DocumentUndoManager) -> bool {
        std::ptr::eq(
            Weak::as_ptr(&self.manager.lock().unwrap()),
            manager as *const _,
        )
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.inner.lock().unwrap().shape, Shape::Compound(_))
    }

    /// Structural validity over the shape: a plain record needs a span and
    /// frozen text, a compound counts committed children as content.
    pub fn is_valid(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.shape {
            Shape::Plain => inner.data.is_valid(),
            Shape::Compound(children) => inner.data.span.is_some() || !children.is_empty(),
        }
    }

    /// Copies the pending buffers into the frozen fields without clearing
    /// anything, so validity can be judged before an actual commit.
    pub fn pretend_commit(&self, text_buffer: &str, preserved_buffer: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.data.span.is_some() {
            inner.data.text = Some(text_buffer.to_string());
            inner.data.preserved = Some(preserved_buffer.to_string());
        }
    }

    /// Freezes a plain record from the pending buffers, draining them.
    /// Returns false (leaving the buffers alone) when there is nothing to
    /// freeze.
    pub fn freeze(&self, text_buffer: &mut String, preserved_buffer: &mut String) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.data.span.is_none() {
            return false;
        }
        inner.data.text = Some(std::mem::take(text_buffer));
        inner.data.preserved = Some(std::mem::take(preserved_buffer));
        true
    }

    /// Moves a compound's pending data into a new child, draining the
    /// buffers and reopening the trailing slot. No-op without pending data.
    pub fn commit_compound(&self, text_buffer: &mut String, preserved_buffer: &mut String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.data.span.is_none() {
            return;
        }
        let child = ChangeData {
            span: inner.data.span,
            text: Some(std::mem::take(text_buffer)),
            preserved: Some(std::mem::take(preserved_buffer)),
            undo_stamp: inner.data.undo_stamp,
            redo_stamp: inner.data.redo_stamp,
        };
        inner.data.reinitialize();
        if let Shape::Compound(children) = &mut inner.shape {
            children.push(child);
        }
    }

    /// The stamp an undo of this record restores: own stamp while data is
    /// pending, otherwise the first child's for a compound.
    pub fn undo_modification_stamp(&self) -> ModificationStamp {
        let inner = self.inner.lock().unwrap();
        if inner.data.span.is_some() {
            return inner.data.undo_stamp;
        }
        match &inner.shape {
            Shape::Plain => inner.data.undo_stamp,
            Shape::Compound(children) => children
                .first()
                .map(|c| c.undo_stamp)
                .unwrap_or(inner.data.undo_stamp),
        }
    }

    /// The stamp a redo of this record restores: own stamp while data is
    /// pending, otherwise the last child's for a compound.
    pub fn redo_modification_stamp(&self) -> ModificationStamp {
        let inner = self.inner.lock().unwrap();
        if inner.data.span.is_some() {
            return inner.data.redo_stamp;
        }
        match &inner.shape {
            Shape::Plain => inner.data.redo_stamp,
            Shape::Compound(children) => children
                .last()
                .map(|c| c.redo_stamp)
                .unwrap_or(inner.data.redo_stamp),
        }
    }

    /// Applies one child/payload replay, swallowing document errors: the
    /// range was recorded by stamp, not content-addressed, so a rejected
    /// replay degrades the document instead of failing the operation.
    fn replay(manager: &Arc<DocumentUndoManager>, data: &ChangeData, backwards: bool) {
        let mut document = manager.document().lock().unwrap();
        let result = if backwards {
            data.undo_apply(&mut document)
        } else {
            data.redo_apply(&mut document)
        };
        if let Err(error) = result {
            tracing::warn!(%error, "replay rejected by document; leaving content as is");
        }
    }

    /// Runs the full undo or redo replay including the before/after
    /// notifications.
    fn run(&self, backwards: bool) -> OperationStatus {
        let Some(manager) = self.manager() else {
            return OperationStatus::Invalid;
        };

        enum Parts {
            Plain(ChangeData),
            Compound(Vec<ChangeData>),
        }
        let parts = {
            let inner = self.inner.lock().unwrap();
            match &inner.shape {
                Shape::Plain => {
                    if !inner.data.is_valid() {
                        return OperationStatus::Invalid;
                    }
                    Parts::Plain(inner.data.clone())
                }
                Shape::Compound(children) => Parts::Compound(children.clone()),
            }
        };

        let (before_kind, after_kind) = if backwards {
            (UndoEventKind::AboutToUndo, UndoEventKind::Undone)
        } else {
            (UndoEventKind::AboutToRedo, UndoEventKind::Redone)
        };

        match parts {
            Parts::Plain(data) => {
                fire(&manager, &data, backwards, before_kind, false);
                Self::replay(&manager, &data, backwards);
                manager.reset_process_change_state();
                fire(&manager, &data, backwards, after_kind, false);
            }
            Parts::Compound(children) => {
                if children.is_empty() {
                    return OperationStatus::Ok;
                }
                // The announced child is the one replayed first/last: the
                // tail for undo, the head for redo.
                let (announce_before, announce_after) = if backwards {
                    (children.last().unwrap(), children.first().unwrap())
                } else {
                    (children.first().unwrap(), children.last().unwrap())
                };
                fire(&manager, announce_before, backwards, before_kind, true);
                if backwards {
                    for child in children.iter().rev() {
                        Self::replay(&manager, child, true);
                    }
                } else {
                    for child in children.iter() {
                        Self::replay(&manager, child, false);
                    }
                }
                manager.reset_process_change_state();
                fire(&manager, announce_after, backwards, after_kind, true);
            }
        }
        OperationStatus::Ok
    }
}

/// Fires a replay notification; an undo inserts the preserved text, a redo
/// the recorded text.
fn fire(
    manager: &Arc<DocumentUndoManager>,
    data: &ChangeData,
    backwards: bool,
    kind: UndoEventKind,
    compound: bool,
) {
    let text = data.text.as_deref().unwrap_or("");
    let preserved = data.preserved.as_deref().unwrap_or("");
    let offset = data.span.map(|s| s.start).unwrap_or(0);
    let (inserted, removed) = if backwards {
        (preserved, text)
    } else {
        (text, preserved)
    };
    manager.fire_replay_event(offset, inserted, removed, kind, compound);
}

impl Operation for TextChangeOp {
    fn contexts(&self) -> Vec<ContextId> {
        self.contexts.lock().unwrap().clone()
    }

    fn has_context(&self, context: ContextId) -> bool {
        self.contexts.lock().unwrap().contains(&context)
    }

    fn add_context(&self, context: ContextId) {
        let mut contexts = self.contexts.lock().unwrap();
        if !contexts.contains(&context) {
            contexts.push(context);
        }
    }

    fn remove_context(&self, context: ContextId) {
        self.contexts.lock().unwrap().retain(|c| *c != context);
    }

    fn can_undo(&self) -> bool {
        let Some(manager) = self.manager() else {
            return false;
        };
        if !self.is_valid() {
            return false;
        }
        let doc_stamp = manager.document_stamp();
        if doc_stamp.is_unknown() || doc_stamp == self.redo_modification_stamp() {
            return true;
        }

        // Documented exceptions for a trailing no-op edit (stamp advanced,
        // nothing recorded), both anchored at top-of-history identity.
        let Some(top) = manager.history().undo_operation(manager.context()) else {
            return false;
        };
        if Arc::as_ptr(&top) as *const () != self as *const Self as *const () {
            return false;
        }
        let Some(current) = manager.current_record() else {
            return false;
        };
        let self_is_current = std::ptr::eq(Arc::as_ptr(&current), self);
        if !self_is_current {
            // The empty open record soaked up the no-op's stamp.
            let cur = current.inner.lock().unwrap();
            cur.data.span.is_none()
                && !cur.data.redo_stamp.is_unknown()
                && cur.data.redo_stamp == doc_stamp
        } else if self.is_compound() {
            // Same exception when the open compound itself tops the history.
            let inner = self.inner.lock().unwrap();
            inner.data.span.is_none()
                && !inner.data.redo_stamp.is_unknown()
                && inner.data.redo_stamp == doc_stamp
        } else {
            false
        }
    }

    fn can_redo(&self) -> bool {
        let Some(manager) = self.manager() else {
            return false;
        };
        if !self.is_valid() {
            return false;
        }
        let doc_stamp = manager.document_stamp();
        doc_stamp.is_unknown() || doc_stamp == self.undo_modification_stamp()
    }

    fn undo(&self) -> OperationStatus {
        self.run(true)
    }

    fn redo(&self) -> OperationStatus {
        self.run(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
