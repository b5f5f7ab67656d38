// Copyright 2020 Joyent, Inc.

//! JSON-RPC 2.0 message construction and classification for Jet.

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const INFO: &str = "info";
pub const AUTHENTICATE: &str = "authenticate";
pub const CONFIG: &str = "config";
pub const PASSWD: &str = "passwd";
pub const SET: &str = "set";
pub const CHANGE: &str = "change";
pub const ADD: &str = "add";
pub const REMOVE: &str = "remove";
pub const CALL: &str = "call";
pub const FETCH: &str = "fetch";
pub const UNFETCH: &str = "unfetch";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Synthesized locally when no response arrived in time.
pub const REQUEST_TIMEOUT: i64 = -32100;

/// The `error` member of a JSON-RPC response.
///
/// State and method callbacks return this to refuse an incoming request; the
/// peer sends it back to the daemon as the error response.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("JSON-RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> JsonRpcError {
        JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> JsonRpcError {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> JsonRpcError {
        JsonRpcError::new(PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> JsonRpcError {
        JsonRpcError::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> JsonRpcError {
        JsonRpcError::new(METHOD_NOT_FOUND, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> JsonRpcError {
        JsonRpcError::new(INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> JsonRpcError {
        JsonRpcError::new(INTERNAL_ERROR, message)
    }

    pub fn timeout() -> JsonRpcError {
        JsonRpcError::new(REQUEST_TIMEOUT, "request timed out")
    }

    /// Extract the error member of a response, if it has one.
    pub fn from_response(response: &Value) -> Option<JsonRpcError> {
        response
            .get("error")
            .and_then(|e| serde_json::from_value(e.clone()).ok())
    }

    pub fn to_value(&self) -> Value {
        let mut error = Map::new();
        error.insert("code".to_string(), Value::from(self.code));
        error.insert("message".to_string(), Value::from(self.message.clone()));
        if let Some(data) = &self.data {
            error.insert("data".to_string(), data.clone());
        }
        Value::Object(error)
    }
}

/// Build a request. Fire-and-forget requests pass no `id`.
pub fn request(method: &str, params: Option<Value>, id: Option<u64>) -> Value {
    let mut msg = Map::new();
    msg.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
    msg.insert("method".to_string(), Value::from(method));
    if let Some(id) = id {
        msg.insert("id".to_string(), Value::from(id));
    }
    if let Some(params) = params {
        msg.insert("params".to_string(), params);
    }
    Value::Object(msg)
}

pub fn result_response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: &Value, error: &JsonRpcError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error.to_value(),
    })
}

/// The id a response to `msg` must echo, if `msg` may be answered at all.
///
/// Only string and integer ids are reflected; anything else marks a
/// notification that gets no response.
pub fn response_id(msg: &Value) -> Option<&Value> {
    let id = msg.get("id")?;
    match id {
        Value::String(_) => Some(id),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(id),
        _ => None,
    }
}

/// What an incoming message is, judged by its `method` member.
#[derive(Debug, PartialEq)]
pub enum Incoming<'a> {
    /// `method` is an integer: a notification for the fetch with that id.
    /// Negative ids can never match a fetch and are carried as `None`.
    FetchEvent {
        fetch_id: Option<u64>,
        params: Option<&'a Value>,
    },
    /// No string `method`: the answer to one of our requests.
    Response { id: Option<u64> },
    /// The daemon routes a `set` or `call` on one of our paths to us.
    Invocation {
        path: &'a str,
        params: Option<&'a Value>,
    },
}

pub fn classify(msg: &Value) -> Incoming<'_> {
    match msg.get("method") {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => {
            Incoming::FetchEvent {
                fetch_id: n.as_u64(),
                params: msg.get("params"),
            }
        }
        Some(Value::String(path)) => Incoming::Invocation {
            path: path.as_str(),
            params: msg.get("params"),
        },
        _ => Incoming::Response {
            id: msg.get("id").and_then(Value::as_u64),
        },
    }
}
