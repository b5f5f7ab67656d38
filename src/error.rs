// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

use crate::protocol::FrameError;

/// Errors raised synchronously by peer operations and transports.
///
/// Protocol faults reported by the daemon are not `JetError`s; they arrive as
/// JSON-RPC error responses through the response callback.
#[derive(Debug, Error)]
pub enum JetError {
    #[error("path must not be empty")]
    EmptyPath,

    #[error("a response callback requires a non-zero timeout")]
    InvalidTimeout,

    #[error("state {0} is owned by this peer, use change instead of set")]
    OwnedState(String),

    #[error("state {0} is not owned by this peer")]
    NotOwned(String),

    #[error("path {0} is already registered by this peer")]
    AlreadyRegistered(String),

    #[error("connection already established")]
    AlreadyConnected,

    #[error("connection is not established")]
    NotConnected,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl JetError {
    /// True for caller mistakes that are detected before anything is sent.
    pub fn is_argument_error(&self) -> bool {
        match self {
            JetError::EmptyPath
            | JetError::InvalidTimeout
            | JetError::OwnedState(_)
            | JetError::NotOwned(_)
            | JetError::AlreadyRegistered(_) => true,
            _ => false,
        }
    }
}
