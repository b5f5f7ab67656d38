// Copyright 2020 Joyent, Inc.

//! The Jet peer: public operations, dispatch of incoming messages and the
//! connection lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::error::JetError;
use crate::matcher::Matcher;
use crate::message::{self, Incoming, JsonRpcError};
use crate::registry::{
    lock, CallCallback, FetchCallback, FetchId, FetchRegistry, PathRegistry,
    RequestRegistry, ResponseCallback, SetCallback,
};
use crate::transport::{CloseHandler, ConnectCallback, JetConnection};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeerState {
    Closed,
    Connecting,
    Connected,
    Closing,
}

/// What a peer currently owns and waits for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub states: Vec<String>,
    pub methods: Vec<String>,
    pub fetches: Vec<FetchId>,
    pub pending_requests: usize,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
            && self.methods.is_empty()
            && self.fetches.is_empty()
            && self.pending_requests == 0
    }
}

/// One participant in the Jet network, bound to one connection.
///
/// Operations never wait for the daemon. An operation given a response
/// callback completes it exactly once: with `true` and the daemon's response,
/// or with `false` and a synthesized error response when the timeout elapses
/// or the peer disconnects. Operations given no callback are sent
/// fire-and-forget and ignore their timeout.
///
/// A peer must be created and used inside a tokio runtime. Clones share the
/// same state, so callbacks may capture a clone to issue follow-up requests.
#[derive(Clone)]
pub struct JetPeer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    connection: Arc<dyn JetConnection>,
    state: Mutex<PeerState>,
    request_ids: AtomicU64,
    fetch_ids: AtomicU64,
    requests: RequestRegistry,
    fetches: FetchRegistry,
    states: PathRegistry<Option<SetCallback>>,
    methods: PathRegistry<CallCallback>,
    log: Logger,
}

fn check_path(path: &str) -> Result<(), JetError> {
    if path.is_empty() {
        Err(JetError::EmptyPath)
    } else {
        Ok(())
    }
}

fn check_timeout(
    response: &Option<ResponseCallback>,
    timeout: Duration,
) -> Result<(), JetError> {
    if response.is_some() && timeout == Duration::from_secs(0) {
        Err(JetError::InvalidTimeout)
    } else {
        Ok(())
    }
}

fn path_params(path: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("path".to_string(), Value::from(path));
    params
}

// Routing timeouts on the wire are in seconds; zero means "daemon default".
fn insert_timeout(params: &mut Map<String, Value>, timeout: Duration) {
    if timeout > Duration::from_secs(0) {
        params.insert("timeout".to_string(), Value::from(timeout.as_secs_f64()));
    }
}

impl JetPeer {
    pub fn new(connection: Arc<dyn JetConnection>, log: Option<&Logger>) -> JetPeer {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let inner = Arc::new(PeerInner {
            connection,
            state: Mutex::new(PeerState::Closed),
            request_ids: AtomicU64::new(0),
            fetch_ids: AtomicU64::new(0),
            requests: RequestRegistry::new(log.clone()),
            fetches: FetchRegistry::new(),
            states: PathRegistry::new(),
            methods: PathRegistry::new(),
            log,
        });

        let weak = Arc::downgrade(&inner);
        let on_close: CloseHandler = match inner.connection.take_incoming() {
            Some(incoming) => {
                let (closed_tx, closed_rx) = mpsc::unbounded_channel();
                tokio::spawn(dispatch(weak, incoming, closed_rx));
                Arc::new(move || {
                    let _ = closed_tx.send(());
                })
            }
            None => {
                warn!(
                    inner.log,
                    "connection offers no incoming channel, \
                     messages must be passed to handle_incoming_json"
                );
                Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.connection_lost();
                    }
                })
            }
        };
        inner.connection.set_close_handler(on_close);

        JetPeer { inner }
    }

    pub fn state(&self) -> PeerState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Connect the underlying transport. `completed` learns the outcome.
    pub fn connect(
        &self,
        completed: ConnectCallback,
        timeout: Duration,
    ) -> Result<(), JetError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != PeerState::Closed {
                return Err(JetError::AlreadyConnected);
            }
            *state = PeerState::Connecting;
        }

        let weak = Arc::downgrade(&self.inner);
        let on_connect: ConnectCallback = Box::new(move |mut connected| {
            if let Some(inner) = weak.upgrade() {
                // The link may already have been lost again.
                connected = connected && inner.connection.is_connected();
                {
                    let mut state = lock(&inner.state);
                    if *state == PeerState::Connecting {
                        *state = if connected {
                            PeerState::Connected
                        } else {
                            PeerState::Closed
                        };
                    }
                }
                if connected {
                    info!(inner.log, "connected to Jet daemon");
                } else {
                    warn!(inner.log, "connecting to Jet daemon failed");
                }
            }
            completed(connected);
        });

        if let Err(e) = self.inner.connection.connect(on_connect, timeout) {
            *lock(&self.inner.state) = PeerState::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Withdraw everything this peer owns and close the transport.
    ///
    /// A fire-and-forget `remove` is sent for every owned state and method
    /// and an `unfetch` for every fetch before the transport is told to
    /// close. Outstanding requests complete with a failure and any response
    /// arriving later is dropped.
    pub fn disconnect(&self) -> Result<(), JetError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != PeerState::Connected {
                return Err(JetError::NotConnected);
            }
            *state = PeerState::Closing;
        }

        let inner = &self.inner;
        for path in inner.states.drain() {
            inner.send_fire_and_forget(message::REMOVE, path_params(&path));
        }
        for path in inner.methods.drain() {
            inner.send_fire_and_forget(message::REMOVE, path_params(&path));
        }
        for fetch_id in inner.fetches.drain() {
            let mut params = Map::new();
            params.insert("id".to_string(), Value::from(fetch_id.id()));
            inner.send_fire_and_forget(message::UNFETCH, params);
        }
        let cancelled = inner.requests.cancel_all();

        let result = inner.connection.disconnect();
        *lock(&inner.state) = PeerState::Closed;
        info!(inner.log, "disconnected from Jet daemon";
            "cancelled_requests" => cancelled);
        result
    }

    pub fn info(
        &self,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_timeout(&response, timeout)?;
        self.inner.execute(message::INFO, None, response, timeout)
    }

    pub fn authenticate(
        &self,
        user: &str,
        password: &str,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_timeout(&response, timeout)?;
        let params = json!({"user": user, "password": password});
        self.inner
            .execute(message::AUTHENTICATE, Some(params), response, timeout)
    }

    /// Announce the name under which this peer appears to the daemon.
    pub fn config(
        &self,
        name: &str,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_timeout(&response, timeout)?;
        let params = json!({ "name": name });
        self.inner.execute(message::CONFIG, Some(params), response, timeout)
    }

    pub fn passwd(
        &self,
        user: &str,
        password: &str,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_timeout(&response, timeout)?;
        let params = json!({"user": user, "password": password});
        self.inner.execute(message::PASSWD, Some(params), response, timeout)
    }

    /// Add a state under `path` owned by this peer.
    ///
    /// `on_set` authorizes `set` requests other peers send for the state.
    /// Without it the state is registered fetch-only and the daemon refuses
    /// every `set`. `set_timeout` bounds how long the daemon waits for
    /// `on_set`'s answer.
    ///
    /// The path is registered locally before the `add` goes out, so a `set`
    /// racing the daemon's acknowledgement already finds its callback.
    pub fn add_state(
        &self,
        path: &str,
        value: Value,
        on_set: Option<SetCallback>,
        response: Option<ResponseCallback>,
        response_timeout: Duration,
        set_timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, response_timeout)?;

        let mut params = path_params(path);
        params.insert("value".to_string(), value);
        insert_timeout(&mut params, set_timeout);
        if on_set.is_none() {
            params.insert("fetchOnly".to_string(), Value::Bool(true));
        }

        // Claim first, then look at the other registry, so a concurrent
        // add_method of the same path cannot also succeed.
        self.inner.states.insert(path, on_set)?;
        if self.inner.methods.contains(path) {
            self.inner.states.remove(path);
            return Err(JetError::AlreadyRegistered(path.to_string()));
        }
        let sent = self.inner.execute(
            message::ADD,
            Some(Value::Object(params)),
            response,
            response_timeout,
        );
        if sent.is_err() {
            self.inner.states.remove(path);
        }
        sent
    }

    /// Add a method under `path` served by `on_call`.
    pub fn add_method(
        &self,
        path: &str,
        on_call: CallCallback,
        response: Option<ResponseCallback>,
        response_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, response_timeout)?;

        let mut params = path_params(path);
        insert_timeout(&mut params, call_timeout);

        self.inner.methods.insert(path, on_call)?;
        if self.inner.states.contains(path) {
            self.inner.methods.remove(path);
            return Err(JetError::AlreadyRegistered(path.to_string()));
        }
        let sent = self.inner.execute(
            message::ADD,
            Some(Value::Object(params)),
            response,
            response_timeout,
        );
        if sent.is_err() {
            self.inner.methods.remove(path);
        }
        sent
    }

    pub fn remove_state(
        &self,
        path: &str,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, timeout)?;
        if !self.inner.states.remove(path) {
            debug!(self.inner.log, "removing a state this peer does not own";
                "path" => path);
        }
        let params = Value::Object(path_params(path));
        self.inner.execute(message::REMOVE, Some(params), response, timeout)
    }

    pub fn remove_method(
        &self,
        path: &str,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, timeout)?;
        if !self.inner.methods.remove(path) {
            debug!(self.inner.log, "removing a method this peer does not own";
                "path" => path);
        }
        let params = Value::Object(path_params(path));
        self.inner.execute(message::REMOVE, Some(params), response, timeout)
    }

    /// Ask the owner of the state at `path` to take `value`.
    ///
    /// States owned by this peer must be updated with `change` instead.
    pub fn set(
        &self,
        path: &str,
        value: Value,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, timeout)?;
        if self.inner.states.contains(path) {
            return Err(JetError::OwnedState(path.to_string()));
        }

        let mut params = path_params(path);
        params.insert("value".to_string(), value);
        insert_timeout(&mut params, timeout);
        self.inner
            .execute(message::SET, Some(Value::Object(params)), response, timeout)
    }

    /// Announce a new value of a state owned by this peer.
    ///
    /// The local set callback is not involved.
    pub fn change(
        &self,
        path: &str,
        value: Value,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, timeout)?;
        if !self.inner.states.contains(path) {
            return Err(JetError::NotOwned(path.to_string()));
        }

        let mut params = path_params(path);
        params.insert("value".to_string(), value);
        self.inner
            .execute(message::CHANGE, Some(Value::Object(params)), response, timeout)
    }

    pub fn call(
        &self,
        path: &str,
        args: Option<Value>,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_path(path)?;
        check_timeout(&response, timeout)?;

        let mut params = path_params(path);
        match args {
            Some(Value::Null) | None => (),
            Some(args) => {
                params.insert("args".to_string(), args);
            }
        }
        insert_timeout(&mut params, timeout);
        self.inner
            .execute(message::CALL, Some(Value::Object(params)), response, timeout)
    }

    /// Subscribe to every path `matcher` selects.
    ///
    /// `on_match` receives the event of each notification the daemon pushes
    /// for the returned fetch until it is unfetched.
    pub fn fetch(
        &self,
        matcher: &Matcher,
        on_match: FetchCallback,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<FetchId, JetError> {
        check_timeout(&response, timeout)?;

        let fetch_id = FetchId::new(self.inner.fetch_ids.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.fetches.insert(fetch_id, on_match);
        let params = matcher.fetch_params(fetch_id.id());
        if let Err(e) = self.inner.execute(message::FETCH, Some(params), response, timeout) {
            self.inner.fetches.remove(fetch_id);
            return Err(e);
        }
        Ok(fetch_id)
    }

    /// Stop a fetch. Notifications still in flight for it are ignored.
    pub fn unfetch(
        &self,
        fetch_id: FetchId,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        check_timeout(&response, timeout)?;
        if !self.inner.fetches.remove(fetch_id) {
            debug!(self.inner.log, "unfetching an inactive fetch";
                "fetch_id" => fetch_id.id());
        }
        let params = json!({ "id": fetch_id.id() });
        self.inner.execute(message::UNFETCH, Some(params), response, timeout)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            states: self.inner.states.paths(),
            methods: self.inner.methods.paths(),
            fetches: self.inner.fetches.ids(),
            pending_requests: self.inner.requests.len(),
        }
    }

    /// Dispatch one incoming message text.
    ///
    /// The dispatch task calls this for every message of the connection's
    /// incoming channel; transports without such a channel call it directly.
    pub fn handle_incoming_json(&self, text: &str) {
        self.inner.handle_incoming_json(text);
    }
}

async fn dispatch(
    peer: Weak<PeerInner>,
    mut incoming: UnboundedReceiver<String>,
    mut closed: UnboundedReceiver<()>,
) {
    loop {
        // Messages that arrived before the link was lost are handled first.
        tokio::select! {
            biased;
            msg = incoming.recv() => match (msg, peer.upgrade()) {
                (Some(msg), Some(inner)) => inner.handle_incoming_json(&msg),
                _ => break,
            },
            signal = closed.recv() => match (signal, peer.upgrade()) {
                (Some(()), Some(inner)) => inner.connection_lost(),
                _ => break,
            },
        }
    }
}

impl PeerInner {
    /// The transport went away on its own. Nothing can be withdrawn from the
    /// daemon anymore, so local registrations are just dropped.
    fn connection_lost(&self) {
        {
            let mut state = lock(&self.state);
            if *state != PeerState::Connected {
                return;
            }
            *state = PeerState::Closing;
        }

        let states = self.states.drain().len();
        let methods = self.methods.drain().len();
        let fetches = self.fetches.drain().len();
        let cancelled = self.requests.cancel_all();
        *lock(&self.state) = PeerState::Closed;
        warn!(self.log, "connection to Jet daemon lost";
            "states" => states,
            "methods" => methods,
            "fetches" => fetches,
            "cancelled_requests" => cancelled);
    }

    fn execute(
        &self,
        method: &str,
        params: Option<Value>,
        response: Option<ResponseCallback>,
        timeout: Duration,
    ) -> Result<Value, JetError> {
        let id = match response {
            Some(callback) => {
                let id = self.request_ids.fetch_add(1, Ordering::SeqCst) + 1;
                self.requests.register(id, callback, timeout)?;
                Some(id)
            }
            None => None,
        };

        let request = message::request(method, params, id);
        if let Err(e) = self.connection.send_message(request.to_string()) {
            if let Some(id) = id {
                self.requests.discard(id);
            }
            return Err(e);
        }
        Ok(request)
    }

    fn send_fire_and_forget(&self, method: &str, params: Map<String, Value>) {
        let sent = self.execute(
            method,
            Some(Value::Object(params)),
            None,
            Duration::from_secs(0),
        );
        if let Err(e) = sent {
            warn!(self.log, "failed to send request";
                "method" => method, "error" => %e);
        }
    }

    fn handle_incoming_json(&self, text: &str) {
        let json: Value = match serde_json::from_str(text) {
            Ok(json) => json,
            Err(e) => {
                warn!(self.log, "dropping message that is not JSON"; "error" => %e);
                return;
            }
        };

        match &json {
            Value::Object(_) => self.handle_message(&json),
            Value::Array(items) => {
                for item in items.iter().filter(|item| item.is_object()) {
                    self.handle_message(item);
                }
            }
            _ => warn!(self.log, "dropping message that is neither object nor array"),
        }
    }

    fn handle_message(&self, msg: &Value) {
        match message::classify(msg) {
            Incoming::FetchEvent { fetch_id, params } => {
                self.handle_fetch(fetch_id, params)
            }
            Incoming::Response { id } => self.handle_response(id, msg),
            Incoming::Invocation { path, params } => {
                self.handle_invocation(path, params, msg)
            }
        }
    }

    fn handle_fetch(&self, fetch_id: Option<u64>, params: Option<&Value>) {
        let callback = fetch_id.and_then(|id| self.fetches.get(FetchId::new(id)));
        match (callback, params) {
            (Some(callback), Some(event)) if !event.is_null() => callback(event.clone()),
            (Some(_), _) => {
                warn!(self.log, "fetch notification without params";
                    "fetch_id" => ?fetch_id)
            }
            (None, _) => {
                debug!(self.log, "dropping notification of inactive fetch";
                    "fetch_id" => ?fetch_id)
            }
        }
    }

    fn handle_response(&self, id: Option<u64>, msg: &Value) {
        match id {
            Some(id) => {
                if !self.requests.resolve(id, msg.clone()) {
                    debug!(self.log, "dropping response to no pending request";
                        "id" => id);
                }
            }
            None => debug!(self.log, "dropping response without a usable id"),
        }
    }

    fn handle_invocation(&self, path: &str, params: Option<&Value>, msg: &Value) {
        let outcome = self.invoke(path, params);

        let id = match message::response_id(msg) {
            Some(id) => id,
            None => {
                if let Err(e) = outcome {
                    debug!(self.log, "refused notification";
                        "path" => path, "error" => %e);
                }
                return;
            }
        };

        let response = match outcome {
            Ok(result) => message::result_response(id, result),
            Err(e) => {
                debug!(self.log, "refusing request"; "path" => path, "error" => %e);
                message::error_response(id, &e)
            }
        };
        if let Err(e) = self.connection.send_message(response.to_string()) {
            warn!(self.log, "failed to send response";
                "path" => path, "error" => %e);
        }
    }

    fn invoke(&self, path: &str, params: Option<&Value>) -> Result<Value, JsonRpcError> {
        if path.is_empty() {
            return Err(JsonRpcError::method_not_found("method is empty"));
        }

        if let Some(entry) = self.states.get(path) {
            let on_set =
                entry.ok_or_else(|| JsonRpcError::invalid_request("state is read-only"))?;
            let value = params
                .and_then(|p| p.get("value"))
                .cloned()
                .ok_or_else(|| JsonRpcError::invalid_params("no value in params"))?;

            let accepted = on_set(path, value.clone())?.unwrap_or(value);
            // Observers must learn the new value before the requester does.
            let mut change = path_params(path);
            change.insert("value".to_string(), accepted);
            let announced = self.execute(
                message::CHANGE,
                Some(Value::Object(change)),
                None,
                Duration::from_secs(0),
            );
            if let Err(e) = announced {
                warn!(self.log, "failed to announce accepted value";
                    "path" => path, "error" => %e);
                return Err(JsonRpcError::internal_error(
                    "accepted value could not be announced",
                ));
            }
            return Ok(Value::Bool(true));
        }

        if let Some(on_call) = self.methods.get(path) {
            let args = params.cloned().unwrap_or(Value::Null);
            return on_call(path, args);
        }

        Err(JsonRpcError::method_not_found(format!(
            "{} is neither a state nor a method of this peer",
            path
        )))
    }
}
