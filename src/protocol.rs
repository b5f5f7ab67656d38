// Copyright 2020 Joyent, Inc.

//! Length-prefixed framing of Jet messages.
//!
//! Every message on the wire is a 4-byte big-endian length followed by that
//! many bytes of UTF-8 encoded JSON. The receive side reassembles messages in
//! a single fixed-capacity buffer; the send side is a `tokio_util` encoder.

use std::io::{Error, ErrorKind};
use std::{cmp, io};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use slog::{debug, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::codec::Encoder;

use crate::error::JetError;

pub const JET_LENGTH_SZ: usize = 4;

/// Receive buffer capacity used when none is configured.
pub const DEFAULT_RECEIVE_BUFFER_SZ: usize = 20000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error(
        "message of {length} bytes does not fit the receive buffer \
         of {capacity} bytes"
    )]
    MessageTooLarge { length: usize, capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    ReadLength,
    ReadMessage(usize),
}

/// Reassembles complete messages from arbitrarily fragmented reads.
///
/// Bytes are received directly into `spare_mut()` and committed with
/// `advance()`. `next_message()` then yields each complete message exactly
/// once, in order. Unread bytes are moved to the front of the buffer whenever
/// no further message can be extracted, so the writable tail is never empty
/// between reads.
pub struct FrameReader {
    buf: Box<[u8]>,
    read_idx: usize,
    write_idx: usize,
    state: ReadState,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader::with_capacity(DEFAULT_RECEIVE_BUFFER_SZ)
    }

    /// `capacity` must leave room for the length prefix and at least one
    /// payload byte.
    pub fn with_capacity(capacity: usize) -> FrameReader {
        let capacity = cmp::max(capacity, JET_LENGTH_SZ + 1);
        FrameReader {
            buf: vec![0; capacity].into_boxed_slice(),
            read_idx: 0,
            write_idx: 0,
            state: ReadState::ReadLength,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of received bytes not yet consumed as messages.
    pub fn buffered(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// The writable tail of the buffer, where the next read should land.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_idx..]
    }

    /// Commit `count` bytes written into `spare_mut()`.
    pub fn advance(&mut self, count: usize) {
        self.write_idx = cmp::min(self.write_idx + count, self.buf.len());
    }

    /// Drop all buffered bytes, e.g. before reusing the reader for a new
    /// connection.
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
        self.state = ReadState::ReadLength;
    }

    pub fn next_message(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            match self.state {
                ReadState::ReadLength if self.buffered() >= JET_LENGTH_SZ => {
                    let start = self.read_idx;
                    let length = BigEndian::read_u32(
                        &self.buf[start..start + JET_LENGTH_SZ],
                    ) as usize;
                    if length + JET_LENGTH_SZ > self.buf.len() {
                        return Err(FrameError::MessageTooLarge {
                            length,
                            capacity: self.buf.len(),
                        });
                    }
                    self.read_idx += JET_LENGTH_SZ;
                    self.state = ReadState::ReadMessage(length);
                }
                ReadState::ReadMessage(length) if self.buffered() >= length => {
                    let start = self.read_idx;
                    let msg = String::from_utf8_lossy(
                        &self.buf[start..start + length],
                    )
                    .into_owned();
                    self.read_idx += length;
                    self.state = ReadState::ReadLength;
                    return Ok(Some(msg));
                }
                _ => {
                    self.compact();
                    return Ok(None);
                }
            }
        }
    }

    fn compact(&mut self) {
        let remaining = self.buffered();
        if remaining > 0 && self.read_idx > 0 {
            self.buf.copy_within(self.read_idx..self.write_idx, 0);
        }
        self.read_idx = 0;
        self.write_idx = remaining;
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        FrameReader::new()
    }
}

/// Drive `frames` from `reader` until the stream ends, forwarding every
/// complete message to `incoming`.
///
/// Returns `Ok(())` on end of stream or when nobody listens on `incoming`
/// anymore. A framing fault or read error is returned and the caller is
/// expected to close the connection.
pub async fn read_messages<R>(
    mut reader: R,
    frames: &mut FrameReader,
    incoming: &UnboundedSender<String>,
    log: &Logger,
) -> Result<(), JetError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let byte_count = reader.read(frames.spare_mut()).await?;
        if byte_count == 0 {
            debug!(log, "end of stream");
            return Ok(());
        }
        frames.advance(byte_count);

        while let Some(msg) = frames.next_message()? {
            if incoming.send(msg).is_err() {
                debug!(log, "incoming message receiver closed");
                return Ok(());
            }
        }
    }
}

/// Encoder for outgoing Jet messages.
pub struct JetCodec;

impl Encoder<String> for JetCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, buf: &mut BytesMut) -> Result<(), io::Error> {
        encode_msg(&item, buf)
    }
}

pub fn encode_msg(msg: &str, buf: &mut BytesMut) -> Result<(), io::Error> {
    if msg.len() > u32::max_value() as usize {
        let msg = "Message exceeds the maximum frame length";
        return Err(Error::new(ErrorKind::InvalidInput, msg));
    }
    buf.reserve(JET_LENGTH_SZ + msg.len());
    buf.put_u32(msg.len() as u32);
    buf.put_slice(msg.as_bytes());
    Ok(())
}
