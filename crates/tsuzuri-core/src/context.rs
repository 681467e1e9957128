//! Per-run execution context shared by every step of a run.

use crate::event::{EventSink, NoopSink, WorkflowEvent};
use crate::signal::AbortSignal;
use crate::step::StepId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// Type-safe store key wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    /// Creates a new StoreKey.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StoreKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for StoreKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Key/value storage shared by all steps of one run.
///
/// Stores any `Send + Sync` type, retrieved by downcasting. Cloning a `Store`
/// yields another handle to the same storage. Each operation is atomic on
/// its own; steps running concurrently inside a for-each that need a
/// read-modify-write must use [`Store::update`].
///
/// # Examples
///
/// ```
/// use tsuzuri_core::Store;
///
/// let store = Store::new();
///
/// store.insert("user_id", 123u64);
/// store.insert("name", "Alice".to_string());
///
/// assert_eq!(store.get::<u64>("user_id"), Some(123));
/// assert_eq!(store.get::<String>("name").as_deref(), Some("Alice"));
///
/// // Wrong type returns None
/// assert_eq!(store.get::<String>("user_id"), None);
/// ```
#[derive(Clone, Default)]
pub struct Store {
    data: Arc<RwLock<HashMap<StoreKey, Slot>>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Store")
            .field("keys", &data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Store {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value with the given key.
    ///
    /// If the key already exists, the previous value is replaced.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<StoreKey>, value: T) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    /// Returns a clone of the value for the given key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Replaces the value for `key` with `f(current)` while holding the
    /// store's lock, and returns the new value.
    ///
    /// `current` is `None` if the key is missing or holds another type.
    pub fn update<T, F>(&self, key: impl Into<StoreKey>, f: F) -> T
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce(Option<&T>) -> T,
    {
        let key = key.into();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let next = f(data.get(&key).and_then(|v| v.downcast_ref::<T>()));
        data.insert(key, Arc::new(next.clone()));
        next
    }

    /// Removes a value by key and returns it.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match; in
    /// the latter case the value stays in place.
    pub fn remove<T: Any + Clone>(&self, key: &str) -> Option<T> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let value = data.get(key)?.downcast_ref::<T>()?.clone();
        data.remove(key);
        Some(value)
    }

    /// Returns `true` if the store contains a value for the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Returns all keys currently in the store.
    pub fn keys(&self) -> Vec<StoreKey> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Returns the number of entries in the store.
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if the store contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run metadata.
///
/// Values are never changed in place: every change produces a new
/// `Metadata`, and a clone is fully independent of its original.
///
/// ```
/// use tsuzuri_core::Metadata;
/// use serde_json::json;
///
/// let original = Metadata::new().with("attempt", json!(1));
/// let updated = original.with("attempt", json!(2));
///
/// assert_eq!(original.get("attempt"), Some(&json!(1)));
/// assert_eq!(updated.get("attempt"), Some(&json!(2)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a copy with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = self.0.clone();
        next.insert(key.into(), value);
        Self(next)
    }

    /// Returns a copy without `key`.
    #[must_use]
    pub fn without(&self, key: &str) -> Self {
        let mut next = self.0.clone();
        next.remove(key);
        Self(next)
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Metadata> for Value {
    fn from(metadata: Metadata) -> Self {
        Value::Object(metadata.0)
    }
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started.
    Pending,
    /// Executing steps.
    Running,
    /// Finished successfully.
    Completed,
    /// Stopped by an unrecovered error.
    Failed,
    /// Stopped by its cancellation signal.
    Aborted,
    /// Parked, waiting for external input.
    Suspended,
}

impl RunStatus {
    /// Returns `true` for Completed, Failed and Aborted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Execution context handed to every step of a run.
///
/// Cloning is cheap; clones share the store, metadata, signal and sink.
#[derive(Clone)]
pub struct RunContext {
    workflow_id: Arc<str>,
    run_id: Arc<str>,
    initial_input: Arc<Value>,
    store: Store,
    metadata: Arc<RwLock<Metadata>>,
    signal: AbortSignal,
    sink: Arc<dyn EventSink>,
    started_at: Instant,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("store", &self.store)
            .field("signal", &self.signal)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl RunContext {
    /// Creates a context for one run.
    pub fn new(
        workflow_id: impl Into<Arc<str>>,
        run_id: impl Into<Arc<str>>,
        initial_input: Value,
        store: Store,
        metadata: Metadata,
        signal: AbortSignal,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            initial_input: Arc::new(initial_input),
            store,
            metadata: Arc::new(RwLock::new(metadata)),
            signal,
            sink,
            started_at: Instant::now(),
        }
    }

    /// Creates a context outside any run, for driving a step directly.
    pub fn detached(workflow_id: impl Into<Arc<str>>, initial_input: Value) -> Self {
        Self::new(
            workflow_id,
            "detached",
            initial_input,
            Store::new(),
            Metadata::new(),
            AbortSignal::new(),
            Arc::new(NoopSink),
        )
    }

    /// Returns a copy of this context observing a different signal.
    pub fn with_signal(&self, signal: AbortSignal) -> Self {
        Self {
            signal,
            ..self.clone()
        }
    }

    /// Returns the workflow id.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Returns the run id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns the input the run was started with.
    pub fn initial_input(&self) -> &Value {
        &self.initial_input
    }

    /// Returns the run's store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the run's cancellation signal.
    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Returns a snapshot of the current metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the metadata with `f(current)`.
    ///
    /// `f` receives the old state and returns the new one; the old value is
    /// never modified. Returns the new metadata.
    pub fn update_metadata<F>(&self, f: F) -> Metadata
    where
        F: FnOnce(&Metadata) -> Metadata,
    {
        let mut guard = self.metadata.write().unwrap_or_else(PoisonError::into_inner);
        let next = f(&guard);
        *guard = next.clone();
        next
    }

    /// Emits a custom progress event attributed to `step_id`.
    pub fn emit(&self, step_id: &StepId, payload: Value) {
        self.emit_event(WorkflowEvent::Custom {
            run_id: self.run_id.to_string(),
            step_id: step_id.clone(),
            payload,
        });
    }

    /// Emits an engine event.
    pub fn emit_event(&self, event: WorkflowEvent) {
        self.sink.notify(event);
    }

    /// Returns the time elapsed since the context was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
