//! Shared multi-context operation history.
//!
//! A linear undo model: the most recently added operation is the undo
//! candidate, the most recently undone one the redo candidate. Operations
//! carry one or more context tags; every query and execution is scoped to a
//! context, so one history instance serves any number of documents.
//!
//! Lifecycle listeners are notified around undo/redo and on stack changes.
//! The history never invokes operation methods that reach into documents or
//! managers, nor listener callbacks, while holding its own lock, so
//! listeners may push new operations re-entrantly (a manager force-closing
//! an open compound from `AboutToUndo` does exactly that).

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identity under which operations are grouped, one per document here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

/// Counter backing [`ContextId`] generation.
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

impl ContextId {
    /// Allocates a fresh context identity.
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of an undo/redo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// The operation replayed.
    Ok,
    /// The operation refused (structurally invalid or stamp mismatch);
    /// nothing was executed or moved.
    Invalid,
    /// No operation is available for the context.
    Nothing,
}

/// One entry in the history.
///
/// `undo`/`redo` execute the entry; `can_undo`/`can_redo` answer the
/// enablement queries and may consult documents and managers, so the
/// history only calls them outside its own lock.
pub trait Operation: Send + Sync {
    /// Context tags this operation is filed under.
    fn contexts(&self) -> Vec<ContextId>;
    /// True if the operation carries the given context tag.
    fn has_context(&self, context: ContextId) -> bool;
    /// Adds a context tag (no-op if already present).
    fn add_context(&self, context: ContextId);
    /// Removes a context tag (no-op if absent).
    fn remove_context(&self, context: ContextId);
    /// Whether the operation can currently be undone.
    fn can_undo(&self) -> bool;
    /// Whether the operation can currently be redone.
    fn can_redo(&self) -> bool;
    /// Replays the operation backwards.
    fn undo(&self) -> OperationStatus;
    /// Replays the operation forwards.
    fn redo(&self) -> OperationStatus;
    /// Called when the history drops the operation for good.
    fn dispose(&self) {}
    /// Downcast support for owners recognizing their own entries.
    fn as_any(&self) -> &dyn Any;
}

/// What happened to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEventKind {
    /// Pushed onto the undo stack.
    OperationAdded,
    /// Dropped from the history (limit eviction, redo flush, disposal).
    OperationRemoved,
    /// About to replay backwards.
    AboutToUndo,
    /// About to replay forwards.
    AboutToRedo,
    /// Replayed backwards.
    Undone,
    /// Replayed forwards.
    Redone,
    /// Refused to replay.
    OperationNotOk,
}

/// Notification payload for [`HistoryListener`]s.
#[derive(Clone)]
pub struct HistoryEvent {
    /// What happened.
    pub kind: HistoryEventKind,
    /// The operation it happened to.
    pub operation: Arc<dyn Operation>,
}

/// Observer of history lifecycle events.
pub trait HistoryListener: Send + Sync {
    /// Called for every [`HistoryEvent`]; may run on whatever thread drives
    /// the history.
    fn history_notification(&self, event: &HistoryEvent);
}

/// Per-context depth applied when no explicit limit was set.
const DEFAULT_CONTEXT_LIMIT: usize = 20;

#[derive(Default)]
struct HistoryState {
    /// Undo candidates, oldest first.
    undo: Vec<Arc<dyn Operation>>,
    /// Redo candidates, most recently undone last.
    redo: Vec<Arc<dyn Operation>>,
    limits: HashMap<ContextId, usize>,
}

impl HistoryState {
    fn limit(&self, context: ContextId) -> usize {
        self.limits
            .get(&context)
            .copied()
            .unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }
}

/// Identity comparison for history entries; content is never compared.
fn same_entry(a: &Arc<dyn Operation>, b: &Arc<dyn Operation>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// The shared multi-context operation stack.
#[derive(Default)]
pub struct OperationHistory {
    state: Mutex<HistoryState>,
    listeners: Mutex<Vec<Arc<dyn HistoryListener>>>,
}

impl OperationHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an operation onto the undo stack, enforcing the depth limit
    /// of every context it carries and flushing those contexts' redo
    /// entries. Refused (silently) when any carried context has a zero
    /// limit.
    pub fn add(&self, operation: Arc<dyn Operation>) {
        let contexts = operation.contexts();
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if contexts.iter().any(|ctx| state.limit(*ctx) == 0) {
                return;
            }
            for ctx in &contexts {
                let limit = state.limit(*ctx);
                evict_over_limit(&mut state.undo, *ctx, limit - 1, &mut removed);
            }
            state.undo.push(operation.clone());
            for ctx in &contexts {
                drop_context(&mut state.redo, *ctx, &mut removed);
            }
        }
        self.drop_entries(removed);
        tracing::debug!(contexts = contexts.len(), "operation added to history");
        self.notify(HistoryEventKind::OperationAdded, operation);
    }

    /// Whether the context's undo candidate exists and accepts an undo.
    pub fn can_undo(&self, context: ContextId) -> bool {
        self.undo_operation(context)
            .is_some_and(|op| op.can_undo())
    }

    /// Whether the context's redo candidate exists and accepts a redo.
    pub fn can_redo(&self, context: ContextId) -> bool {
        self.redo_operation(context)
            .is_some_and(|op| op.can_redo())
    }

    /// Undoes the context's most recent operation.
    ///
    /// On success the entry moves to the redo stack (only if it reports
    /// itself redoable). A refusal leaves the history untouched.
    pub fn undo(&self, context: ContextId) -> OperationStatus {
        let Some(operation) = self.undo_operation(context) else {
            return OperationStatus::Nothing;
        };
        if !operation.can_undo() {
            return OperationStatus::Invalid;
        }
        self.notify(HistoryEventKind::AboutToUndo, operation.clone());
        let status = operation.undo();
        if status == OperationStatus::Ok {
            let redoable = operation.can_redo();
            let mut removed = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                state.undo.retain(|op| !same_entry(op, &operation));
                if redoable {
                    let contexts = operation.contexts();
                    if contexts.iter().all(|ctx| state.limit(*ctx) > 0) {
                        for ctx in &contexts {
                            let limit = state.limit(*ctx);
                            evict_over_limit(&mut state.redo, *ctx, limit - 1, &mut removed);
                        }
                        state.redo.push(operation.clone());
                    }
                }
            }
            self.drop_entries(removed);
            self.notify(HistoryEventKind::Undone, operation);
        } else {
            self.notify(HistoryEventKind::OperationNotOk, operation);
        }
        status
    }

    /// Redoes the context's most recently undone operation.
    pub fn redo(&self, context: ContextId) -> OperationStatus {
        let Some(operation) = self.redo_operation(context) else {
            return OperationStatus::Nothing;
        };
        if !operation.can_redo() {
            return OperationStatus::Invalid;
        }
        self.notify(HistoryEventKind::AboutToRedo, operation.clone());
        let status = operation.redo();
        if status == OperationStatus::Ok {
            let undoable = operation.can_undo();
            let mut removed = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                state.redo.retain(|op| !same_entry(op, &operation));
                if undoable {
                    let contexts = operation.contexts();
                    if contexts.iter().all(|ctx| state.limit(*ctx) > 0) {
                        for ctx in &contexts {
                            let limit = state.limit(*ctx);
                            evict_over_limit(&mut state.undo, *ctx, limit - 1, &mut removed);
                        }
                        state.undo.push(operation.clone());
                    }
                }
            }
            self.drop_entries(removed);
            self.notify(HistoryEventKind::Redone, operation);
        } else {
            self.notify(HistoryEventKind::OperationNotOk, operation);
        }
        status
    }

    /// The context's current undo candidate.
    pub fn undo_operation(&self, context: ContextId) -> Option<Arc<dyn Operation>> {
        let state = self.state.lock().unwrap();
        state
            .undo
            .iter()
            .rev()
            .find(|op| op.has_context(context))
            .cloned()
    }

    /// The context's current redo candidate.
    pub fn redo_operation(&self, context: ContextId) -> Option<Arc<dyn Operation>> {
        let state = self.state.lock().unwrap();
        state
            .redo
            .iter()
            .rev()
            .find(|op| op.has_context(context))
            .cloned()
    }

    /// All undo entries for the context, oldest first.
    pub fn undo_history(&self, context: ContextId) -> Vec<Arc<dyn Operation>> {
        let state = self.state.lock().unwrap();
        state
            .undo
            .iter()
            .filter(|op| op.has_context(context))
            .cloned()
            .collect()
    }

    /// All redo entries for the context, most recently undone last.
    pub fn redo_history(&self, context: ContextId) -> Vec<Arc<dyn Operation>> {
        let state = self.state.lock().unwrap();
        state
            .redo
            .iter()
            .filter(|op| op.has_context(context))
            .cloned()
            .collect()
    }

    /// Bounds the context's history depth, evicting oldest entries
    /// immediately if needed.
    pub fn set_limit(&self, context: ContextId, limit: usize) {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.limits.insert(context, limit);
            evict_over_limit(&mut state.undo, context, limit, &mut removed);
            evict_over_limit(&mut state.redo, context, limit, &mut removed);
        }
        self.drop_entries(removed);
    }

    /// Flushes the context's undo and redo entries, keeping its limit.
    pub fn flush_context(&self, context: ContextId) {
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            drop_context(&mut state.undo, context, &mut removed);
            drop_context(&mut state.redo, context, &mut removed);
        }
        self.drop_entries(removed);
    }

    /// Flushes the context's entries and forgets its limit; the context is
    /// not expected to be used again.
    pub fn dispose_context(&self, context: ContextId) {
        self.flush_context(context);
        self.state.lock().unwrap().limits.remove(&context);
        tracing::debug!("undo context disposed");
    }

    /// Registers a lifecycle listener. Adding the same listener twice is a
    /// no-op.
    pub fn add_listener(&self, listener: Arc<dyn HistoryListener>) {
        let mut listeners = self.listeners.lock().unwrap();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes a previously registered lifecycle listener.
    pub fn remove_listener(&self, listener: &Arc<dyn HistoryListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn notify(&self, kind: HistoryEventKind, operation: Arc<dyn Operation>) {
        let snapshot = self.listeners.lock().unwrap().clone();
        let event = HistoryEvent { kind, operation };
        for listener in &snapshot {
            listener.history_notification(&event);
        }
    }

    /// Disposes entries that fell out of the history and announces them.
    fn drop_entries(&self, removed: Vec<Arc<dyn Operation>>) {
        for operation in removed {
            operation.dispose();
            self.notify(HistoryEventKind::OperationRemoved, operation);
        }
    }
}

/// Evicts oldest entries tagged with `context` until at most `limit`
/// remain. An evicted entry only leaves the list once it carries no other
/// context.
fn evict_over_limit(
    list: &mut Vec<Arc<dyn Operation>>,
    context: ContextId,
    limit: usize,
    removed: &mut Vec<Arc<dyn Operation>>,
) {
    loop {
        let count = list.iter().filter(|op| op.has_context(context)).count();
        if count <= limit {
            return;
        }
        let Some(idx) = list.iter().position(|op| op.has_context(context)) else {
            return;
        };
        let operation = list[idx].clone();
        operation.remove_context(context);
        if operation.contexts().is_empty() {
            list.remove(idx);
            removed.push(operation);
        }
    }
}

/// Removes the context tag from every entry in the list; entries left with
/// no contexts fall out entirely.
fn drop_context(
    list: &mut Vec<Arc<dyn Operation>>,
    context: ContextId,
    removed: &mut Vec<Arc<dyn Operation>>,
) {
    let mut idx = 0;
    while idx < list.len() {
        if list[idx].has_context(context) {
            let operation = list[idx].clone();
            operation.remove_context(context);
            if operation.contexts().is_empty() {
                list.remove(idx);
                removed.push(operation);
                continue;
            }
        }
        idx += 1;
    }
}
