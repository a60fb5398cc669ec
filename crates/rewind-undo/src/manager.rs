//! Per-document undo manager.
//!
//! The manager listens to its document's edit notifications, runs the
//! coalescing state machine that folds keystroke streams into logical
//! records, and files closed records in the shared [`OperationHistory`]
//! under its own context. While the manager drives one of its own records
//! through undo/redo it stops interpreting edit notifications, so the
//! replay's `replace` calls cannot re-enter the coalescer.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rewind_core::{
    Document, DocumentEvent, DocumentId, DocumentListener, DocumentRef, ModificationStamp,
};

use crate::config::HistoryConfig;
use crate::events::{DocumentUndoEvent, DocumentUndoListener, Notifier, UndoEventKind};
use crate::history::{
    ContextId, HistoryEvent, HistoryEventKind, HistoryListener, Operation, OperationHistory,
    OperationStatus,
};
use crate::record::{Span, TextChangeOp};

/// Opaque identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// Counter backing [`ClientId`] generation.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

impl ClientId {
    /// Allocates a fresh client identity.
    pub fn new() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether edit notifications are currently interpreted or ignored.
enum ReplayState {
    /// Normal operation: edits feed the coalescer.
    Recording,
    /// One of our own operations is replaying; its edits are ignored until
    /// the history reports completion or failure for exactly this entry.
    Replaying(Arc<dyn Operation>),
}

/// Coalescer state, alive while the manager is connected.
struct EngineState {
    /// The open record edits accumulate into.
    current: Arc<TextChangeOp>,
    /// The entry most recently pushed to the history, so a record is never
    /// pushed twice.
    last_added: Option<Arc<TextChangeOp>>,
    /// Pending inserted text, frozen into the record at commit.
    text_buffer: String,
    /// Pending replaced text, frozen into the record at commit.
    preserved_buffer: String,
    /// Inside a run of single-char insertions.
    inserting: bool,
    /// Inside a run of single-char overwrites.
    overwriting: bool,
    /// Inside a compound bracket (flat, non-nesting).
    folding: bool,
    /// Range of the previous single-char deletion, for detecting
    /// Delete/Backspace runs.
    previous_delete: Option<Span>,
    /// Pre-edit stamp stashed between `about_to_change` and `changed`.
    pending_before_stamp: Option<ModificationStamp>,
}

impl EngineState {
    /// Where the open record's buffered insertion currently ends.
    fn current_insert_end(&self) -> Option<usize> {
        let span = self.current.inner().data.span?;
        Some(span.start + self.text_buffer.chars().count())
    }
}

/// Listeners installed while connected, kept for removal.
struct Monitors {
    edit: Arc<dyn DocumentListener>,
    history: Arc<dyn HistoryListener>,
}

/// Undo/redo manager for one document.
pub struct DocumentUndoManager {
    weak_self: Weak<DocumentUndoManager>,
    context: ContextId,
    document: DocumentRef,
    document_id: DocumentId,
    history: Arc<OperationHistory>,
    max_undo_level: Mutex<usize>,
    clients: Mutex<HashSet<ClientId>>,
    state: Mutex<Option<EngineState>>,
    replay: Mutex<ReplayState>,
    notifier: Notifier,
    active_source: Mutex<Option<u64>>,
    monitors: Mutex<Option<Monitors>>,
}

impl fmt::Debug for DocumentUndoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentUndoManager")
            .field("context", &self.context)
            .field("document", &self.document_id)
            .field("clients", &self.clients.lock().unwrap().len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl DocumentUndoManager {
    /// Creates a manager for the document, filing its records in the given
    /// shared history. The manager stays inert until the first `connect`.
    pub fn new(
        document: DocumentRef,
        history: Arc<OperationHistory>,
        config: &HistoryConfig,
    ) -> Arc<Self> {
        let document_id = document.lock().unwrap().id();
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            context: ContextId::new(),
            document,
            document_id,
            history,
            max_undo_level: Mutex::new(config.max_undo_level),
            clients: Mutex::new(HashSet::new()),
            state: Mutex::new(None),
            replay: Mutex::new(ReplayState::Recording),
            notifier: Notifier::default(),
            active_source: Mutex::new(None),
            monitors: Mutex::new(None),
        })
    }

    /// The context this manager's records are filed under.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The document this manager observes and replays against.
    pub fn document(&self) -> &DocumentRef {
        &self.document
    }

    /// The shared history this manager files records in.
    pub fn history(&self) -> &Arc<OperationHistory> {
        &self.history
    }

    /// True while at least one client is connected.
    pub fn is_connected(&self) -> bool {
        !self.clients.lock().unwrap().is_empty()
    }

    /// Registers a client. The first client initializes fresh state and
    /// starts listening; connecting an already-connected client is a no-op.
    pub fn connect(&self, client: ClientId) {
        let first = {
            let mut clients = self.clients.lock().unwrap();
            if !clients.insert(client) {
                return;
            }
            clients.len() == 1
        };
        if first {
            self.initialize();
        }
    }

    /// Unregisters a client. The last client's departure stops listening
    /// and discards this context's history; unknown clients are ignored.
    pub fn disconnect(&self, client: ClientId) {
        let last = {
            let mut clients = self.clients.lock().unwrap();
            if !clients.remove(&client) {
                return;
            }
            clients.is_empty()
        };
        if last {
            self.teardown();
        }
    }

    fn initialize(&self) {
        self.history.flush_context(self.context);
        self.history
            .set_limit(self.context, *self.max_undo_level.lock().unwrap());
        // built before taking the state lock: it reads the document stamp
        let fresh = self.fresh_state();
        *self.state.lock().unwrap() = Some(fresh);
        *self.replay.lock().unwrap() = ReplayState::Recording;

        let edit: Arc<dyn DocumentListener> = Arc::new(EditMonitor {
            manager: self.weak_self.clone(),
        });
        self.document.lock().unwrap().add_listener(edit.clone());
        let history: Arc<dyn HistoryListener> = Arc::new(HistoryMonitor {
            manager: self.weak_self.clone(),
        });
        self.history.add_listener(history.clone());
        *self.monitors.lock().unwrap() = Some(Monitors { edit, history });
    }

    fn teardown(&self) {
        if let Some(monitors) = self.monitors.lock().unwrap().take() {
            self.document.lock().unwrap().remove_listener(&monitors.edit);
            self.history.remove_listener(&monitors.history);
        }
        *self.state.lock().unwrap() = None;
        *self.replay.lock().unwrap() = ReplayState::Recording;
        self.history.dispose_context(self.context);
    }

    fn fresh_state(&self) -> EngineState {
        let current = TextChangeOp::new_plain(self.weak_self.clone(), self.context);
        // seed so undoing the first record restores the starting stamp
        current.inner().data.undo_stamp = self.document_stamp();
        EngineState {
            current,
            last_added: None,
            text_buffer: String::new(),
            preserved_buffer: String::new(),
            inserting: false,
            overwriting: false,
            folding: false,
            previous_delete: None,
            pending_before_stamp: None,
        }
    }

    /// Force-closes the open record (or compound) into the history. No-op
    /// while disconnected or when nothing is pending.
    pub fn commit(&self) {
        let mut guard = self.state.lock().unwrap();
        if let Some(state) = guard.as_mut() {
            self.commit_locked(state);
        }
    }

    /// Starts folding subsequent edits into one compound history entry.
    /// The bracket is flat: an inner begin collapses into the outer one.
    pub fn begin_compound_change(&self) {
        let mut guard = self.state.lock().unwrap();
        if let Some(state) = guard.as_mut() {
            state.folding = true;
            self.commit_locked(state);
        }
    }

    /// Closes the compound bracket. Unmatched calls just force a commit.
    pub fn end_compound_change(&self) {
        let mut guard = self.state.lock().unwrap();
        if let Some(state) = guard.as_mut() {
            state.folding = false;
            self.commit_locked(state);
        }
    }

    /// Whether an undo is available for this document.
    pub fn undoable(&self) -> bool {
        self.history.can_undo(self.context)
    }

    /// Whether a redo is available for this document.
    pub fn redoable(&self) -> bool {
        self.history.can_redo(self.context)
    }

    /// Undoes the most recent history entry. Returns false when nothing
    /// was undone (not connected, nothing undoable, or refused).
    pub fn undo(&self) -> bool {
        self.run_history(true, None)
    }

    /// Like [`undo`](Self::undo), attaching an opaque source token to the
    /// fired events.
    pub fn undo_with_source(&self, source: u64) -> bool {
        self.run_history(true, Some(source))
    }

    /// Redoes the most recently undone entry. Returns false when nothing
    /// was redone.
    pub fn redo(&self) -> bool {
        self.run_history(false, None)
    }

    /// Like [`redo`](Self::redo), attaching an opaque source token to the
    /// fired events.
    pub fn redo_with_source(&self, source: u64) -> bool {
        self.run_history(false, Some(source))
    }

    fn run_history(&self, backwards: bool, source: Option<u64>) -> bool {
        if !self.is_connected() {
            return false;
        }
        *self.active_source.lock().unwrap() = source;
        let status = if backwards {
            self.history.undo(self.context)
        } else {
            self.history.redo(self.context)
        };
        *self.active_source.lock().unwrap() = None;
        status == OperationStatus::Ok
    }

    /// Bounds this document's history depth.
    pub fn set_max_undo_level(&self, level: usize) {
        *self.max_undo_level.lock().unwrap() = level;
        if self.is_connected() {
            self.history.set_limit(self.context, level);
        }
    }

    /// Discards this document's history and reopens fresh coalescer state.
    /// No-op while disconnected.
    pub fn reset(&self) {
        if !self.is_connected() {
            return;
        }
        self.history.flush_context(self.context);
        // built before taking the state lock: it reads the document stamp
        let fresh = self.fresh_state();
        let mut guard = self.state.lock().unwrap();
        if guard.is_some() {
            *guard = Some(fresh);
        }
        drop(guard);
        *self.replay.lock().unwrap() = ReplayState::Recording;
    }

    /// Re-parents every history entry of `source` onto this document, then
    /// appends a zero-length marker carrying the current document stamp so
    /// the borrowed history continues correctly.
    ///
    /// The caller must ensure both documents had identical content when the
    /// source's latest record was captured; this is not checked.
    pub fn transfer_undo_history(&self, source: &DocumentUndoManager) {
        let operations = self.history.undo_history(source.context);
        for operation in &operations {
            operation.add_context(self.context);
            operation.remove_context(source.context);
            if let Some(record) = operation.as_any().downcast_ref::<TextChangeOp>() {
                record.set_manager(self.weak_self.clone());
            }
        }

        // only text records can continue a borrowed history
        let top_stamp = match self.history.undo_operation(self.context) {
            Some(top) => match top.as_any().downcast_ref::<TextChangeOp>() {
                Some(record) => Some(record.redo_modification_stamp()),
                None => return,
            },
            None => None,
        };

        let marker = TextChangeOp::new_plain(self.weak_self.clone(), self.context);
        {
            let mut inner = marker.inner();
            inner.data.span = Some(Span { start: 0, end: 0 });
            inner.data.text = Some(String::new());
            inner.data.preserved = Some(String::new());
            inner.data.redo_stamp = self.document_stamp();
            inner.data.undo_stamp = top_stamp.unwrap_or(ModificationStamp::UNKNOWN);
        }
        self.history.add(marker.clone());
        if let Some(state) = self.state.lock().unwrap().as_mut() {
            state.last_added = Some(marker);
        }
    }

    /// Registers an undo/redo listener. Adding the same listener twice is
    /// a no-op.
    pub fn add_undo_listener(&self, listener: Arc<dyn DocumentUndoListener>) {
        self.notifier.add(listener);
    }

    /// Removes a previously registered undo/redo listener.
    pub fn remove_undo_listener(&self, listener: &Arc<dyn DocumentUndoListener>) {
        self.notifier.remove(listener);
    }

    // ── Record support ───────────────────────────────────────────────

    pub(crate) fn document_stamp(&self) -> ModificationStamp {
        self.document.lock().unwrap().modification_stamp()
    }

    pub(crate) fn current_record(&self) -> Option<Arc<TextChangeOp>> {
        self.state.lock().unwrap().as_ref().map(|s| s.current.clone())
    }

    pub(crate) fn fire_replay_event(
        &self,
        offset: usize,
        text: &str,
        replaced: &str,
        kind: UndoEventKind,
        compound: bool,
    ) {
        let event = DocumentUndoEvent {
            document: self.document_id,
            offset,
            text: text.to_string(),
            replaced: replaced.to_string(),
            kind,
            compound,
            source: *self.active_source.lock().unwrap(),
        };
        self.notifier.fire(&event);
    }

    pub(crate) fn reset_process_change_state(&self) {
        if let Some(state) = self.state.lock().unwrap().as_mut() {
            state.inserting = false;
            state.overwriting = false;
            state.previous_delete = None;
        }
    }

    // ── Commit machinery ─────────────────────────────────────────────

    /// Full commit: push the open record if it has never been filed and is
    /// valid, then freeze it and open the next one.
    fn commit_locked(&self, state: &mut EngineState) {
        let current = state.current.clone();
        let already_added = state
            .last_added
            .as_ref()
            .is_some_and(|op| Arc::ptr_eq(op, &current));
        if !already_added {
            current.pretend_commit(&state.text_buffer, &state.preserved_buffer);
            if current.is_valid() {
                self.history.add(current.clone());
                state.last_added = Some(current.clone());
            }
        }
        self.finish_current(state);
    }

    /// Freezes the open record and opens its successor; run-tracking state
    /// is reset either way.
    fn finish_current(&self, state: &mut EngineState) {
        let current = state.current.clone();
        if current.is_compound() {
            current.commit_compound(&mut state.text_buffer, &mut state.preserved_buffer);
            if !state.folding {
                state.current = TextChangeOp::new_plain(self.weak_self.clone(), self.context);
            }
        } else if current.freeze(&mut state.text_buffer, &mut state.preserved_buffer) {
            state.current = self.open_record(state.folding);
        } else if state.folding {
            state.current = TextChangeOp::new_compound(self.weak_self.clone(), self.context);
        } else {
            current.inner().data.reinitialize();
        }
        state.inserting = false;
        state.overwriting = false;
        state.previous_delete = None;
    }

    fn open_record(&self, folding: bool) -> Arc<TextChangeOp> {
        if folding {
            TextChangeOp::new_compound(self.weak_self.clone(), self.context)
        } else {
            TextChangeOp::new_plain(self.weak_self.clone(), self.context)
        }
    }

    /// Boundary commit inside the coalescer: the closing record's redo
    /// target becomes the stamp just before this edit, and if a commit
    /// actually happened the freshly opened record starts from it too.
    fn boundary_commit(&self, state: &mut EngineState, before: ModificationStamp) {
        state.current.inner().data.redo_stamp = before;
        state
            .current
            .pretend_commit(&state.text_buffer, &state.preserved_buffer);
        if state.current.is_valid() {
            self.commit_locked(state);
            state.current.inner().data.undo_stamp = before;
        }
    }

    // ── Coalescer ────────────────────────────────────────────────────

    /// Decides, per incoming raw edit, whether to extend the open record
    /// or close it and start a new one.
    fn process_change(
        &self,
        state: &mut EngineState,
        mut start: usize,
        mut end: usize,
        inserted: &str,
        replaced: &str,
        before: ModificationStamp,
        after: ModificationStamp,
    ) {
        if end < start {
            std::mem::swap(&mut start, &mut end);
        }
        let inserted_len = inserted.chars().count();
        let mut trailing_commit = false;

        if start == end {
            if inserted_len == 1 || is_whitespace_text(inserted) {
                // typing, or auto-indent style whitespace insertion
                let contiguous = state.current_insert_end() == Some(start);
                if !state.inserting || !contiguous {
                    self.boundary_commit(state, before);
                    state.inserting = true;
                }
                let current = state.current.clone();
                let mut inner = current.inner();
                if inner.data.span.is_none() {
                    inner.data.span = Some(Span { start, end: start });
                }
                drop(inner);
                state.text_buffer.push_str(inserted);
            } else if inserted_len > 0 {
                // paste or programmatic insertion: never merges
                self.boundary_commit(state, before);
                state.current.inner().data.span = Some(Span { start, end: start });
                state.text_buffer.push_str(inserted);
                trailing_commit = true;
            }
        } else if inserted_len == 0 {
            // deletion
            let replaced_len = replaced.chars().count();
            if replaced_len == 1 || is_line_delimiter(replaced) {
                let previous = state.previous_delete;
                if previous == Some(Span { start, end }) {
                    // repeated Delete: extend the span, append removed text
                    state.preserved_buffer.push_str(replaced);
                    if let Some(span) = state.current.inner().data.span.as_mut() {
                        span.end += replaced_len;
                    }
                } else if previous.map(|p| p.start) == Some(end) {
                    // repeated Backspace: prepend removed text, move start
                    state.preserved_buffer.insert_str(0, replaced);
                    if let Some(span) = state.current.inner().data.span.as_mut() {
                        span.start = start;
                    }
                } else {
                    // first delete; direction unknown, assume Backspace
                    self.boundary_commit(state, before);
                    state.preserved_buffer.push_str(replaced);
                    state.current.inner().data.span = Some(Span { start, end });
                }
                state.previous_delete = Some(Span { start, end });
            } else if replaced_len > 0 {
                // selection delete: single-shot
                self.boundary_commit(state, before);
                state.current.inner().data.span = Some(Span { start, end });
                state.preserved_buffer.push_str(replaced);
            }
        } else {
            // replacement
            let overwrite =
                inserted_len == 1 && (replaced.chars().count() == 1 || is_line_delimiter(replaced));
            if overwrite {
                let contiguous = state.current_insert_end() == Some(start);
                if !state.overwriting || !contiguous {
                    self.boundary_commit(state, before);
                    state.overwriting = true;
                }
                let current = state.current.clone();
                let mut inner = current.inner();
                match inner.data.span.as_mut() {
                    Some(span) => span.end = end,
                    None => inner.data.span = Some(Span { start, end }),
                }
                drop(inner);
                state.text_buffer.push_str(inserted);
                state.preserved_buffer.push_str(replaced);
            } else {
                // replacement of a non-empty selection: single-shot
                self.boundary_commit(state, before);
                state.current.inner().data.span = Some(Span { start, end });
                state.text_buffer.push_str(inserted);
                state.preserved_buffer.push_str(replaced);
            }
        }

        // the latest edit always defines the open record's stamps, even
        // when the branches above recorded nothing (no-op edits)
        {
            let current = state.current.clone();
            let mut inner = current.inner();
            inner.data.redo_stamp = after;
            if inner.data.undo_stamp.is_unknown() {
                inner.data.undo_stamp = before;
            }
        }
        if trailing_commit {
            self.boundary_commit(state, after);
        }
    }

    // ── Listener plumbing ────────────────────────────────────────────

    fn is_replaying(&self) -> bool {
        matches!(*self.replay.lock().unwrap(), ReplayState::Replaying(_))
    }

    fn on_about_to_change(&self, event: &DocumentEvent) {
        if self.is_replaying() {
            return;
        }
        if let Some(state) = self.state.lock().unwrap().as_mut() {
            state.pending_before_stamp = Some(event.stamp);
        }
    }

    fn on_changed(&self, event: &DocumentEvent) {
        if self.is_replaying() {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        if let Some(state) = guard.as_mut() {
            let before = state
                .pending_before_stamp
                .take()
                .unwrap_or(ModificationStamp::UNKNOWN);
            self.process_change(
                state,
                event.offset,
                event.offset + event.length,
                &event.text,
                &event.replaced,
                before,
                event.stamp,
            );
        }
    }

    fn on_history_event(&self, event: &HistoryEvent) {
        match event.kind {
            HistoryEventKind::AboutToUndo | HistoryEventKind::AboutToRedo => {
                if !event.operation.has_context(self.context) {
                    return;
                }
                let ours = event
                    .operation
                    .as_any()
                    .downcast_ref::<TextChangeOp>()
                    .is_some_and(|record| record.is_managed_by(self));
                if ours {
                    if event.kind == HistoryEventKind::AboutToUndo {
                        // undo must never reach into a still-open group
                        let mut guard = self.state.lock().unwrap();
                        if let Some(state) = guard.as_mut() {
                            if state.folding {
                                state.folding = false;
                                self.commit_locked(state);
                            }
                        }
                    }
                    *self.replay.lock().unwrap() =
                        ReplayState::Replaying(event.operation.clone());
                } else {
                    // a foreign operation runs under our context: it will
                    // not follow our coalescing patterns, so re-sync and
                    // keep listening to its document changes
                    self.commit();
                    if let Some(state) = self.state.lock().unwrap().as_mut() {
                        state.last_added = None;
                    }
                }
            }
            HistoryEventKind::Undone
            | HistoryEventKind::Redone
            | HistoryEventKind::OperationNotOk => {
                let mut replay = self.replay.lock().unwrap();
                if let ReplayState::Replaying(active) = &*replay {
                    let same = Arc::as_ptr(active) as *const ()
                        == Arc::as_ptr(&event.operation) as *const ();
                    if same {
                        *replay = ReplayState::Recording;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Forwards document notifications into the manager.
struct EditMonitor {
    manager: Weak<DocumentUndoManager>,
}

impl DocumentListener for EditMonitor {
    fn about_to_change(&self, event: &DocumentEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_about_to_change(event);
        }
    }

    fn changed(&self, event: &DocumentEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_changed(event);
        }
    }
}

/// Forwards history lifecycle notifications into the manager.
struct HistoryMonitor {
    manager: Weak<DocumentUndoManager>,
}

impl HistoryListener for HistoryMonitor {
    fn history_notification(&self, event: &HistoryEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_history_event(event);
        }
    }
}

/// True when the text starts with a legal line delimiter followed only by
/// spaces and tabs (auto-indent insertions count as typing).
fn is_whitespace_text(text: &str) -> bool {
    let Some(delimiter) = Document::line_delimiters()
        .iter()
        .find(|d| text.starts_with(**d))
    else {
        return false;
    };
    text[delimiter.len()..].chars().all(|c| c == ' ' || c == '\t')
}

/// True when the text is exactly one legal line delimiter.
fn is_line_delimiter(text: &str) -> bool {
    Document::line_delimiters().contains(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_with(text: &str) -> (DocumentRef, Arc<OperationHistory>, Arc<DocumentUndoManager>) {
        let document = Document::new_ref(text);
        let history = Arc::new(OperationHistory::new());
        let manager =
            DocumentUndoManager::new(document.clone(), history.clone(), &HistoryConfig::default());
        manager.connect(ClientId::new());
        (document, history, manager)
    }

    fn setup() -> (DocumentRef, Arc<OperationHistory>, Arc<DocumentUndoManager>) {
        setup_with("")
    }

    fn type_text(document: &DocumentRef, offset: usize, text: &str) {
        for (i, ch) in text.chars().enumerate() {
            document
                .lock()
                .unwrap()
                .replace(offset + i, 0, &ch.to_string())
                .unwrap();
        }
    }

    fn content(document: &DocumentRef) -> String {
        document.lock().unwrap().text()
    }

    fn depth(history: &OperationHistory, manager: &DocumentUndoManager) -> usize {
        history.undo_history(manager.context()).len()
    }

    // ── Coalescing ───────────────────────────────────────────────────

    #[test]
    fn test_typing_coalesces_into_one_record() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "hello");
        manager.commit();

        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    #[test]
    fn test_two_typing_runs_make_two_records() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "hello");
        manager.commit();
        type_text(&document, 5, " world");
        manager.commit();

        assert_eq!(depth(&history, &manager), 2);
        assert!(manager.undo());
        assert_eq!(content(&document), "hello");
        assert!(manager.undo());
        assert_eq!(content(&document), "");
        assert!(manager.redo());
        assert_eq!(content(&document), "hello");
    }

    #[test]
    fn test_disjoint_insertions_split_records() {
        let (document, history, manager) = setup_with("0123456789");
        document.lock().unwrap().replace(0, 0, "a").unwrap();
        document.lock().unwrap().replace(5, 0, "b").unwrap();
        manager.commit();

        assert_eq!(depth(&history, &manager), 2);
    }

    #[test]
    fn test_paste_is_never_merged() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "ab");
        // pasting right at the typing position still breaks the run
        document.lock().unwrap().replace(2, 0, "cdef").unwrap();

        // the paste record commits itself, closing the typing record too
        assert_eq!(depth(&history, &manager), 2);
        assert!(manager.undo());
        assert_eq!(content(&document), "ab");
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    #[test]
    fn test_whitespace_after_newline_counts_as_typing() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "a");
        // auto-indent style insertion: newline plus indentation
        document.lock().unwrap().replace(1, 0, "\n    ").unwrap();
        manager.commit();

        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    #[test]
    fn test_delete_run_coalesces() {
        let (document, history, manager) = setup_with("hello");
        // repeated Delete at one boundary
        for _ in 0..5 {
            document.lock().unwrap().replace(0, 1, "").unwrap();
        }
        manager.commit();

        assert_eq!(depth(&history, &manager), 1);
        assert_eq!(content(&document), "");
        assert!(manager.undo());
        assert_eq!(content(&document), "hello");
        assert!(manager.redo());
        assert_eq!(content(&document), "");
    }

    #[test]
    fn test_backspace_run_coalesces() {
        let (document, history, manager) = setup_with("hello");
        for i in (0..5).rev() {
            document.lock().unwrap().replace(i, 1, "").unwrap();
        }
        manager.commit();

        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undo());
        assert_eq!(content(&document), "hello");
    }

    #[test]
    fn test_selection_delete_is_single_shot() {
        let (document, history, manager) = setup_with("hello world");
        document.lock().unwrap().replace(5, 6, "").unwrap();
        document.lock().unwrap().replace(0, 1, "").unwrap();
        manager.commit();

        assert_eq!(depth(&history, &manager), 2);
        assert!(manager.undo());
        assert_eq!(content(&document), "hello");
        assert!(manager.undo());
        assert_eq!(content(&document), "hello world");
    }

    #[test]
    fn test_overwrite_run_coalesces() {
        let (document, history, manager) = setup_with("abcdef");
        for (i, ch) in "xyz".chars().enumerate() {
            document
                .lock()
                .unwrap()
                .replace(i, 1, &ch.to_string())
                .unwrap();
        }
        manager.commit();

        assert_eq!(content(&document), "xyzdef");
        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undo());
        assert_eq!(content(&document), "abcdef");
        assert!(manager.redo());
        assert_eq!(content(&document), "xyzdef");
    }

    #[test]
    fn test_typing_interrupted_by_delete_splits() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "abc");
        document.lock().unwrap().replace(2, 1, "").unwrap();
        manager.commit();

        assert_eq!(depth(&history, &manager), 2);
        assert!(manager.undo());
        assert_eq!(content(&document), "abc");
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    // ── Round trips ──────────────────────────────────────────────────

    #[test]
    fn test_undo_all_redo_all_round_trip() {
        let (document, history, manager) = setup_with("base\n");
        let _ = history;
        type_text(&document, 5, "first");
        manager.commit();
        document.lock().unwrap().replace(0, 4, "BASE").unwrap();
        manager.commit();
        type_text(&document, 10, "!!");
        manager.commit();
        let final_text = content(&document);

        while manager.undoable() {
            assert!(manager.undo());
        }
        assert_eq!(content(&document), "base\n");
        while manager.redoable() {
            assert!(manager.redo());
        }
        assert_eq!(content(&document), final_text);
    }

    // ── Compound changes ─────────────────────────────────────────────

    #[test]
    fn test_compound_undoes_as_one_unit() {
        let (document, history, manager) = setup_with("hello");
        manager.begin_compound_change();
        document.lock().unwrap().replace(0, 0, "A").unwrap();
        document.lock().unwrap().replace(4, 0, "B").unwrap();
        manager.end_compound_change();

        assert_eq!(content(&document), "AhelBlo");
        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undo());
        assert_eq!(content(&document), "hello");
        assert!(manager.redo());
        assert_eq!(content(&document), "AhelBlo");
    }

    #[test]
    fn test_inner_compound_collapses_into_outer() {
        let (document, history, manager) = setup();
        manager.begin_compound_change();
        type_text(&document, 0, "a");
        manager.begin_compound_change();
        type_text(&document, 1, "b");
        manager.end_compound_change();
        manager.end_compound_change();

        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    #[test]
    fn test_unterminated_bracket_commits_via_commit() {
        let (document, history, manager) = setup();
        manager.begin_compound_change();
        type_text(&document, 0, "ab");
        manager.commit();

        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undoable());
    }

    #[test]
    fn test_undo_closes_open_bracket_first() {
        let (document, history, manager) = setup_with("hello");
        manager.begin_compound_change();
        document.lock().unwrap().replace(0, 0, "A").unwrap();
        // the disjoint edit files the still-open compound in the history
        document.lock().unwrap().replace(4, 0, "B").unwrap();

        // no end_compound_change: undo must not reach into the open group
        assert!(manager.undo());
        assert_eq!(content(&document), "hello");
        assert_eq!(depth(&history, &manager), 0);
    }

    // ── Stamp validity ───────────────────────────────────────────────

    #[test]
    fn test_pending_edit_blocks_undo_of_top_record() {
        let (document, _history, manager) = setup();
        type_text(&document, 0, "x");
        manager.commit();
        assert!(manager.undoable());

        type_text(&document, 1, "y");
        // the document moved past the top record's redo stamp
        assert!(!manager.undoable());
        assert!(!manager.undo());
        assert_eq!(content(&document), "xy");

        manager.commit();
        assert!(manager.undoable());
        assert!(manager.undo());
        assert_eq!(content(&document), "x");
    }

    #[test]
    fn test_noop_edit_keeps_top_record_undoable() {
        let (document, _history, manager) = setup();
        type_text(&document, 0, "x");
        manager.commit();

        // a zero-length change advances the stamp but records nothing
        document.lock().unwrap().replace(0, 0, "").unwrap();
        assert!(manager.undoable());
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    #[test]
    fn test_noop_edit_inside_bracket_keeps_compound_undoable() {
        let (document, _history, manager) = setup();
        manager.begin_compound_change();
        type_text(&document, 0, "ab");
        // the pending run becomes a child, the bracket stays open
        manager.commit();
        // a zero-length change advances the stamp but records nothing
        document.lock().unwrap().replace(0, 0, "").unwrap();

        assert!(manager.undoable());
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    #[test]
    fn test_reference_counted_disconnect() {
        let (document, _history, manager) = setup();
        let (second, third) = (ClientId::new(), ClientId::new());
        manager.connect(second);
        manager.connect(third);

        type_text(&document, 0, "x");
        manager.commit();

        manager.disconnect(second);
        manager.disconnect(third);
        assert!(manager.is_connected());
        assert!(manager.undoable());
    }

    #[test]
    fn test_last_disconnect_discards_history() {
        let (document, history, manager) = setup();
        let extra = ClientId::new();
        manager.connect(extra);
        type_text(&document, 0, "x");
        manager.commit();

        // the setup client and the extra one
        let clients: Vec<ClientId> = manager.clients.lock().unwrap().iter().copied().collect();
        for client in clients {
            manager.disconnect(client);
        }
        assert!(!manager.is_connected());
        assert!(!manager.undoable());
        assert_eq!(depth(&history, &manager), 0);

        // edits while disconnected are not recorded
        type_text(&document, 1, "y");
        assert!(!manager.undoable());
    }

    #[test]
    fn test_double_connect_is_idempotent() {
        let (_document, _history, manager) = setup();
        let client = ClientId::new();
        manager.connect(client);
        manager.connect(client);
        manager.disconnect(client);
        // the setup client still holds the connection
        assert!(manager.is_connected());
    }

    #[test]
    fn test_unknown_disconnect_is_ignored() {
        let (_document, _history, manager) = setup();
        manager.disconnect(ClientId::new());
        assert!(manager.is_connected());
    }

    #[test]
    fn test_reset_discards_history() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "abc");
        manager.commit();
        assert!(manager.undoable());

        manager.reset();
        assert!(!manager.undoable());
        assert_eq!(depth(&history, &manager), 0);

        // still recording after the reset
        type_text(&document, 3, "d");
        manager.commit();
        assert!(manager.undoable());
    }

    #[test]
    fn test_max_undo_level_bounds_depth() {
        let (document, history, manager) = setup();
        manager.set_max_undo_level(2);
        for i in 0..4 {
            type_text(&document, i, "x");
            manager.commit();
        }
        assert_eq!(depth(&history, &manager), 2);
    }

    // ── History transfer ─────────────────────────────────────────────

    #[test]
    fn test_transfer_undo_history() {
        let (source_doc, history, source) = setup();
        type_text(&source_doc, 0, "hi");
        source.commit();

        // destination starts with identical content
        let dest_doc = Document::new_ref("hi");
        let dest =
            DocumentUndoManager::new(dest_doc.clone(), history.clone(), &HistoryConfig::default());
        dest.connect(ClientId::new());

        dest.transfer_undo_history(&source);
        assert!(dest.undoable());
        assert!(!source.undoable());

        // the marker replays as a no-op, then the borrowed record applies
        assert!(dest.undo());
        assert!(dest.undo());
        assert_eq!(dest_doc.lock().unwrap().text(), "");
        // the source document is untouched
        assert_eq!(source_doc.lock().unwrap().text(), "hi");
    }

    // ── Foreign operations ───────────────────────────────────────────

    /// Operation pushed by another component under the manager's context.
    struct ForeignOp(Mutex<Vec<ContextId>>);

    impl Operation for ForeignOp {
        fn contexts(&self) -> Vec<ContextId> {
            self.0.lock().unwrap().clone()
        }
        fn has_context(&self, context: ContextId) -> bool {
            self.0.lock().unwrap().contains(&context)
        }
        fn add_context(&self, context: ContextId) {
            self.0.lock().unwrap().push(context);
        }
        fn remove_context(&self, context: ContextId) {
            self.0.lock().unwrap().retain(|c| *c != context);
        }
        fn can_undo(&self) -> bool {
            true
        }
        fn can_redo(&self) -> bool {
            true
        }
        fn undo(&self) -> OperationStatus {
            OperationStatus::Ok
        }
        fn redo(&self) -> OperationStatus {
            OperationStatus::Ok
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_foreign_operation_forces_resync() {
        let (document, history, manager) = setup();
        type_text(&document, 0, "x");
        // pending "x" is not yet in the history
        assert_eq!(depth(&history, &manager), 0);

        history.add(Arc::new(ForeignOp(Mutex::new(vec![manager.context()]))));
        assert_eq!(history.undo(manager.context()), OperationStatus::Ok);

        // the about-to-undo notification committed our pending record
        assert_eq!(depth(&history, &manager), 1);
        assert!(manager.undoable());
        assert!(manager.undo());
        assert_eq!(content(&document), "");
    }

    // ── Events ───────────────────────────────────────────────────────

    struct EventLog(Mutex<Vec<DocumentUndoEvent>>);

    impl DocumentUndoListener for EventLog {
        fn document_undo(&self, event: &DocumentUndoEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_undo_redo_event_sequence() {
        let (document, _history, manager) = setup();
        let log = Arc::new(EventLog(Mutex::new(Vec::new())));
        manager.add_undo_listener(log.clone());

        type_text(&document, 0, "hi");
        manager.commit();
        assert!(manager.undo());
        assert!(manager.redo());

        let events = log.0.lock().unwrap();
        let kinds: Vec<UndoEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                UndoEventKind::AboutToUndo,
                UndoEventKind::Undone,
                UndoEventKind::AboutToRedo,
                UndoEventKind::Redone,
            ]
        );
        // an undo inserts the preserved (empty) text and removes "hi"
        assert_eq!(events[0].text, "");
        assert_eq!(events[0].replaced, "hi");
        assert_eq!(events[2].text, "hi");
        assert!(!events[0].compound);
    }

    #[test]
    fn test_compound_events_carry_flag() {
        let (document, _history, manager) = setup();
        let log = Arc::new(EventLog(Mutex::new(Vec::new())));
        manager.add_undo_listener(log.clone());

        manager.begin_compound_change();
        type_text(&document, 0, "a");
        document.lock().unwrap().replace(1, 0, "bb").unwrap();
        manager.end_compound_change();
        assert!(manager.undo());

        let events = log.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.compound));
    }

    #[test]
    fn test_source_token_travels_into_events() {
        let (document, _history, manager) = setup();
        let log = Arc::new(EventLog(Mutex::new(Vec::new())));
        manager.add_undo_listener(log.clone());

        type_text(&document, 0, "x");
        manager.commit();
        assert!(manager.undo_with_source(42));
        assert!(manager.redo());

        let events = log.0.lock().unwrap();
        assert_eq!(events[0].source, Some(42));
        assert_eq!(events[1].source, Some(42));
        assert_eq!(events[2].source, None);
    }

    // ── Classification helpers ───────────────────────────────────────

    #[test]
    fn test_whitespace_text_classification() {
        assert!(is_whitespace_text("\n"));
        assert!(is_whitespace_text("\r\n  \t"));
        assert!(is_whitespace_text("\n    "));
        assert!(!is_whitespace_text("  \n"));
        assert!(!is_whitespace_text("\n x"));
        assert!(!is_whitespace_text("ab"));
        assert!(!is_whitespace_text(""));
    }

    #[test]
    fn test_line_delimiter_classification() {
        assert!(is_line_delimiter("\n"));
        assert!(is_line_delimiter("\r\n"));
        assert!(!is_line_delimiter("\n\n"));
        assert!(!is_line_delimiter("a"));
    }
}
