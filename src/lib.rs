// Copyright 2020 Joyent, Inc.

//! Jet: a client peer for the Jet publish/subscribe protocol
//!
//! Jet is a JSON-RPC 2.0 based protocol in which a central daemon routes
//! messages between peers. A peer may own *states* (named values it announces
//! and may let others set) and *methods* (named procedures others may call),
//! and may *fetch* paths of other peers to be notified of their changes.
//!
//! Protocol definition
//!
//! On a raw socket every message is framed as:
//!
//! * LEN0...LEN3        4-byte big-endian unsigned integer giving the number
//!                     of bytes of payload that follow
//!
//! * DATA0...DATAN      Payload. A UTF-8 encoded JSON-RPC 2.0 object, or an
//!                     array of such objects.
//!
//! Messages flowing from the daemon to a peer are told apart by their
//! `method` member:
//!
//! * an integer is a notification for the fetch with that id
//!
//! * a string is a `set` or `call` on a path this peer owns, the string being
//!   that path
//!
//! * anything else is the response to one of this peer's requests
//!
//! Request ids are scoped to a peer and allocated sequentially. Requests
//! sent without an id are fire-and-forget and never see a response.

#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod matcher;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use crate::config::ConnectionConfig;
pub use crate::error::JetError;
pub use crate::matcher::Matcher;
pub use crate::message::JsonRpcError;
pub use crate::peer::{JetPeer, PeerState, RegistrySnapshot};
pub use crate::registry::{
    CallCallback, FetchCallback, FetchId, ResponseCallback, SetCallback,
};
pub use crate::transport::{
    CloseHandler, ConnectCallback, JetConnection, SocketJetConnection,
};
