// Copyright 2020 Joyent, Inc.

//! Transports carrying Jet messages between a peer and the daemon.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use crate::config::ConnectionConfig;
use crate::error::JetError;
use crate::protocol::{read_messages, FrameReader, JetCodec, DEFAULT_RECEIVE_BUFFER_SZ};
use crate::registry::lock;

/// Reports whether a connection attempt succeeded.
pub type ConnectCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Told when an established connection ends without `disconnect` having been
/// called, e.g. because the remote closed the stream or framing failed.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// A bidirectional message channel to a Jet daemon.
///
/// Implementations deliver every complete incoming message, in order, on the
/// channel returned by `take_incoming`. A WebSocket transport plugs in here
/// the same way the raw socket does.
pub trait JetConnection: Send + Sync {
    /// Start connecting and report the outcome through `completed`.
    ///
    /// Fails with `AlreadyConnected` if a connection is established or in
    /// progress.
    fn connect(&self, completed: ConnectCallback, timeout: Duration) -> Result<(), JetError>;

    /// Close the connection after messages already accepted by
    /// `send_message` have been written. Fails with `NotConnected` when there
    /// is nothing to close.
    fn disconnect(&self) -> Result<(), JetError>;

    fn send_message(&self, json: String) -> Result<(), JetError>;

    fn is_connected(&self) -> bool;

    /// Hand out the receiving end of the incoming message channel. Only the
    /// first call returns it.
    fn take_incoming(&self) -> Option<UnboundedReceiver<String>>;

    /// Install the handler run when the connection is lost. Messages received
    /// before the loss are on the incoming channel by the time it runs.
    fn set_close_handler(&self, handler: CloseHandler);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Closing,
}

struct Link {
    state: ConnectionState,
    // Bumped on every connect so tasks of an old connection leave a newer
    // one alone.
    generation: u64,
    outgoing: Option<UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    on_close: Option<CloseHandler>,
}

impl Link {
    /// Mark a live link closed after the stream failed underneath it. The
    /// returned handler must be run after the lock is released.
    fn lose(&mut self, generation: u64, abort_reader: bool) -> Option<CloseHandler> {
        if self.generation != generation || self.state != ConnectionState::Connected {
            return None;
        }
        self.state = ConnectionState::Closed;
        self.outgoing = None;
        if let Some(reader) = self.reader.take() {
            if abort_reader {
                reader.abort();
            }
        }
        self.on_close.clone()
    }
}

/// Jet over a plain TCP socket using length-prefixed framing.
pub struct SocketJetConnection {
    addr: SocketAddr,
    receive_buffer_size: usize,
    link: Arc<Mutex<Link>>,
    incoming_tx: UnboundedSender<String>,
    incoming_rx: Mutex<Option<UnboundedReceiver<String>>>,
    log: Logger,
}

impl SocketJetConnection {
    pub fn new(addr: SocketAddr, log: Option<&Logger>) -> SocketJetConnection {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        SocketJetConnection {
            addr,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SZ,
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Closed,
                generation: 0,
                outgoing: None,
                reader: None,
                on_close: None,
            })),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            log: log.new(o!("address" => addr)),
        }
    }

    pub fn from_config(
        config: &ConnectionConfig,
        log: Option<&Logger>,
    ) -> Result<SocketJetConnection, JetError> {
        config.validate()?;
        let addr = config.socket_addr()?;
        Ok(SocketJetConnection::new(addr, log)
            .with_receive_buffer_size(config.receive_buffer_size))
    }

    /// Messages longer than `size` minus the 4-byte length prefix are
    /// treated as a fatal framing error.
    pub fn with_receive_buffer_size(mut self, size: usize) -> SocketJetConnection {
        self.receive_buffer_size = size;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }
}

impl JetConnection for SocketJetConnection {
    fn connect(&self, completed: ConnectCallback, timeout: Duration) -> Result<(), JetError> {
        let generation = {
            let mut link = lock(&self.link);
            match link.state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    return Err(JetError::AlreadyConnected)
                }
                ConnectionState::Closed | ConnectionState::Closing => (),
            }
            link.state = ConnectionState::Connecting;
            link.generation += 1;
            link.generation
        };

        let addr = self.addr;
        let link = Arc::clone(&self.link);
        let incoming = self.incoming_tx.clone();
        let capacity = self.receive_buffer_size;
        let log = self.log.clone();

        debug!(log, "connecting"; "timeout_ms" => timeout.as_millis() as u64);
        tokio::spawn(async move {
            let connected = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    establish(stream, &link, generation, incoming, capacity, &log)
                }
                Ok(Err(e)) => {
                    warn!(log, "failed to connect"; "error" => %e);
                    false
                }
                Err(_) => {
                    warn!(log, "connect timed out");
                    false
                }
            };

            if !connected {
                let mut link = lock(&link);
                if link.generation == generation {
                    link.state = ConnectionState::Closed;
                }
            }
            completed(connected);
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), JetError> {
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Connected {
            return Err(JetError::NotConnected);
        }

        info!(self.log, "disconnecting");
        link.state = ConnectionState::Closing;
        // The writer drains what is already queued, then closes its half.
        link.outgoing = None;
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        Ok(())
    }

    fn send_message(&self, json: String) -> Result<(), JetError> {
        let link = lock(&self.link);
        match (link.state, &link.outgoing) {
            (ConnectionState::Connected, Some(outgoing)) => {
                outgoing.send(json).map_err(|_| JetError::NotConnected)
            }
            _ => Err(JetError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.link).state == ConnectionState::Connected
    }

    fn take_incoming(&self) -> Option<UnboundedReceiver<String>> {
        lock(&self.incoming_rx).take()
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        lock(&self.link).on_close = Some(handler);
    }
}

fn establish(
    stream: TcpStream,
    link: &Arc<Mutex<Link>>,
    generation: u64,
    incoming: UnboundedSender<String>,
    capacity: usize,
    log: &Logger,
) -> bool {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(log, "unable to disable Nagle's algorithm"; "error" => %e);
    }
    let (read_half, write_half) = stream.into_split();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

    let mut current = lock(link);
    if current.generation != generation {
        return false;
    }

    tokio::spawn(write_messages(
        write_half,
        outgoing_rx,
        Arc::clone(link),
        generation,
        log.clone(),
    ));

    // Spawned under the lock so an immediate end of stream cannot be
    // observed before the link is marked connected.
    let reader_link = Arc::clone(link);
    let reader_log = log.clone();
    let reader = tokio::spawn(async move {
        let mut frames = FrameReader::with_capacity(capacity);
        match read_messages(read_half, &mut frames, &incoming, &reader_log).await {
            Ok(()) => info!(reader_log, "connection closed by remote"),
            Err(e) => error!(reader_log, "closing connection"; "error" => %e),
        }

        let on_close = lock(&reader_link).lose(generation, false);
        if let Some(on_close) = on_close {
            on_close();
        }
    });

    current.state = ConnectionState::Connected;
    current.outgoing = Some(outgoing_tx);
    current.reader = Some(reader);
    info!(log, "connected");
    true
}

async fn write_messages(
    write_half: OwnedWriteHalf,
    mut outgoing: UnboundedReceiver<String>,
    link: Arc<Mutex<Link>>,
    generation: u64,
    log: Logger,
) {
    let mut sink = FramedWrite::new(write_half, JetCodec);
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = sink.send(msg).await {
            error!(log, "failed to write message"; "error" => %e);
            break;
        }
    }
    drop(sink);

    let on_close = {
        let mut link = lock(&link);
        if link.generation == generation && link.state == ConnectionState::Closing {
            link.state = ConnectionState::Closed;
        }
        link.lose(generation, true)
    };
    debug!(log, "writer finished");
    if let Some(on_close) = on_close {
        on_close();
    }
}
