// Copyright 2020 Joyent, Inc.

//! Bookkeeping shared between the peer's callers and its dispatch task.
//!
//! Each registry guards its map with its own lock. Callbacks are always
//! cloned or removed out of the map first and invoked after the lock is
//! released, so a callback may freely call back into the peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use slog::{debug, Logger};
use tokio::task::JoinHandle;

use crate::error::JetError;
use crate::message::{self, JsonRpcError};

/// Completion of a request: `true` with the daemon's response, or `false`
/// with a locally synthesized error response.
pub type ResponseCallback = Box<dyn FnOnce(bool, Value) + Send + 'static>;

/// Receives the event of every notification for a fetch.
pub type FetchCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

/// Authorizes a `set` on an owned state. `Ok(None)` accepts the proposed
/// value, `Ok(Some(v))` accepts `v` instead, `Err` refuses.
pub type SetCallback =
    Arc<dyn Fn(&str, Value) -> Result<Option<Value>, JsonRpcError> + Send + Sync + 'static>;

/// Serves a `call` on an owned method and returns its result.
pub type CallCallback =
    Arc<dyn Fn(&str, Value) -> Result<Value, JsonRpcError> + Send + Sync + 'static>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingRequest {
    callback: ResponseCallback,
    timer: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

/// Requests waiting for a response, keyed by correlation id.
pub struct RequestRegistry {
    pending: PendingMap,
    log: Logger,
}

impl RequestRegistry {
    pub fn new(log: Logger) -> RequestRegistry {
        RequestRegistry {
            pending: Arc::new(Mutex::new(HashMap::new())),
            log,
        }
    }

    /// Store `callback` under `id` and arm its timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        id: u64,
        callback: ResponseCallback,
        timeout: Duration,
    ) -> Result<(), JetError> {
        if timeout == Duration::from_secs(0) {
            return Err(JetError::InvalidTimeout);
        }

        let pending = Arc::clone(&self.pending);
        let log = self.log.clone();
        let mut requests = lock(&self.pending);
        // The timer cannot take the lock before the entry is inserted.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&pending, id, &log);
        });
        if let Some(replaced) = requests.insert(id, PendingRequest { callback, timer }) {
            replaced.timer.abort();
        }
        Ok(())
    }

    /// Complete the request `id` with `response`.
    ///
    /// Returns false when no such request is outstanding, e.g. because it
    /// already timed out.
    pub fn resolve(&self, id: u64, response: Value) -> bool {
        let entry = lock(&self.pending).remove(&id);
        match entry {
            Some(request) => {
                request.timer.abort();
                (request.callback)(true, response);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without completing it.
    pub fn discard(&self, id: u64) {
        let entry = lock(&self.pending).remove(&id);
        if let Some(request) = entry {
            request.timer.abort();
        }
    }

    /// Fail every outstanding request, returning how many there were.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(u64, PendingRequest)> =
            lock(&self.pending).drain().collect();
        let count = drained.len();
        let error = JsonRpcError::internal_error("peer disconnected");
        for (id, request) in drained {
            request.timer.abort();
            (request.callback)(false, message::error_response(&Value::from(id), &error));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expire(pending: &Mutex<HashMap<u64, PendingRequest>>, id: u64, log: &Logger) {
    let entry = lock(pending).remove(&id);
    if let Some(request) = entry {
        debug!(log, "request timed out"; "id" => id);
        let response = message::error_response(&Value::from(id), &JsonRpcError::timeout());
        (request.callback)(false, response);
    }
}

/// Handle of an active fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchId(u64);

impl FetchId {
    pub fn new(id: u64) -> FetchId {
        FetchId(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Active fetches and their notification callbacks.
#[derive(Default)]
pub struct FetchRegistry {
    fetches: Mutex<HashMap<FetchId, FetchCallback>>,
}

impl FetchRegistry {
    pub fn new() -> FetchRegistry {
        FetchRegistry::default()
    }

    pub fn insert(&self, id: FetchId, callback: FetchCallback) {
        lock(&self.fetches).insert(id, callback);
    }

    pub fn remove(&self, id: FetchId) -> bool {
        lock(&self.fetches).remove(&id).is_some()
    }

    pub fn get(&self, id: FetchId) -> Option<FetchCallback> {
        lock(&self.fetches).get(&id).cloned()
    }

    /// Remove every fetch, returning their ids in ascending order.
    pub fn drain(&self) -> Vec<FetchId> {
        let mut ids: Vec<FetchId> = lock(&self.fetches).drain().map(|(id, _)| id).collect();
        ids.sort_by_key(|id| id.id());
        ids
    }

    pub fn ids(&self) -> Vec<FetchId> {
        let mut ids: Vec<FetchId> = lock(&self.fetches).keys().copied().collect();
        ids.sort_by_key(|id| id.id());
        ids
    }

    pub fn len(&self) -> usize {
        lock(&self.fetches).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Paths owned by this peer, each with the entry serving it.
pub struct PathRegistry<T> {
    paths: Mutex<HashMap<String, T>>,
}

impl<T: Clone> PathRegistry<T> {
    pub fn new() -> PathRegistry<T> {
        PathRegistry {
            paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, path: &str, entry: T) -> Result<(), JetError> {
        let mut paths = lock(&self.paths);
        if paths.contains_key(path) {
            return Err(JetError::AlreadyRegistered(path.to_string()));
        }
        paths.insert(path.to_string(), entry);
        Ok(())
    }

    pub fn remove(&self, path: &str) -> bool {
        lock(&self.paths).remove(path).is_some()
    }

    pub fn get(&self, path: &str) -> Option<T> {
        lock(&self.paths).get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.paths).contains_key(path)
    }

    /// Remove every path, returning them sorted.
    pub fn drain(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.paths).drain().map(|(p, _)| p).collect();
        paths.sort();
        paths
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.paths).keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl<T: Clone> Default for PathRegistry<T> {
    fn default() -> Self {
        PathRegistry::new()
    }
}
