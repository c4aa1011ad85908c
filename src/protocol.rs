// Copyright (c) 2024 The CoGe Project.
// Part of yerba, released under the BSD 3-Clause License.

//! Length-prefixed JSON framing for the request socket.
//!
//! Each frame is a 4-byte big-endian payload length followed by a JSON
//! document. Connections are non-blocking: partial frames accumulate in a
//! per-connection buffer until complete.

use log::trace;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::Error;

/// Frames larger than this are rejected.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;
const READ_CHUNK: usize = 4096;

/// Encode a message as a length-prefixed frame.
///
/// # Errors
/// Returns `Err(yerba::Error)` when the message cannot be serialized or is
/// too large.
///
pub fn encode(message: &Value) -> Result<Vec<u8>, Error> {
    let payload = serde_json::to_vec(message)?;

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Remove one complete frame from the head of `buffer`, if present.
///
/// # Errors
/// Returns `Err(yerba::Error::MessageTooLarge)` when the frame header
/// announces an oversized payload.
///
pub(crate) fn extract_frame(buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>, Error> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(length));
    }

    if buffer.len() < LENGTH_PREFIX + length {
        return Ok(None);
    }

    let frame = buffer[LENGTH_PREFIX..LENGTH_PREFIX + length].to_vec();
    buffer.drain(..LENGTH_PREFIX + length);

    Ok(Some(frame))
}

/// One accepted client connection.
pub struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl Connection {
    /// Wrap an accepted stream, switching it to non-blocking mode.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error)` when the stream cannot be configured.
    ///
    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;

        Ok(Self {
            stream,
            buffer: Vec::new(),
        })
    }

    /// Poll for one complete request without blocking.
    ///
    /// Returns `Ok(None)` when no complete frame has arrived yet.
    ///
    /// # Errors
    /// * `Error::ConnectionClosed` when the peer hung up.
    /// * `Error::JSONParse` when a frame is not valid JSON.
    /// * Any I/O error other than "would block".
    ///
    pub fn poll_message(&mut self) -> Result<Option<Value>, Error> {
        let mut chunk = [0_u8; READ_CHUNK];
        let mut closed = false;

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(count) => self.buffer.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }

        // Serve frames already buffered before reporting the hangup.
        match extract_frame(&mut self.buffer)? {
            Some(frame) => {
                trace!("Received a {} byte frame.", frame.len());
                let message = serde_json::from_slice(&frame)?;
                Ok(Some(message))
            }
            None if closed => Err(Error::ConnectionClosed()),
            None => Ok(None),
        }
    }

    /// Send a response frame without blocking.
    ///
    /// # Errors
    /// Returns `Err(yerba::Error::ResponseBlocked)` when the socket buffer
    /// is full; the caller logs the drop and closes the connection, as a
    /// partial frame would corrupt the stream.
    ///
    pub fn send(&mut self, message: &Value) -> Result<(), Error> {
        let frame = encode(message)?;
        let mut written = 0;

        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed()),
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Err(Error::ResponseBlocked());
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }
}
