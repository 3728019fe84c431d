//! Scripted transport for testing the link layer without an instrument.
//!
//! Inbound data is queued as chunks; each `receive` call returns at most one
//! chunk (or the part of it that fits the caller's buffer), so tests control
//! exactly how responses fragment across socket reads. Outbound bytes are
//! recorded for verification. When the script runs dry the transport reports an
//! orderly close.

use super::Transport;
use crate::protocol::frame::{encode_frame, ControlFlags, FrameHeader};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ScriptState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    receive_calls: usize,
    send_calls: usize,
    closed: bool,
    max_send: Option<usize>,
}

/// Transport that replays queued chunks; clones share the same script.
///
/// # Example
///
/// ```
/// use vicp_scope::transport::{ScriptedTransport, Transport};
///
/// let script = ScriptedTransport::new();
/// script.push_chunk(b"abc".to_vec());
///
/// let mut transport = script.clone();
/// let mut buf = [0u8; 8];
/// assert_eq!(transport.receive(&mut buf).unwrap(), 3);
/// assert_eq!(script.receive_calls(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    /// Create an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `limit` bytes per `send` call to exercise short writes
    pub fn with_max_send(self, limit: usize) -> Self {
        self.state.lock().max_send = Some(limit.max(1));
        self
    }

    /// Queue one inbound chunk, delivered by a single `receive` call
    pub fn push_chunk(&self, bytes: impl Into<Vec<u8>>) {
        self.state.lock().inbound.push_back(bytes.into());
    }

    /// Queue a frame as two chunks: header, then payload (omitted when empty)
    pub fn push_frame(&self, flags: ControlFlags, payload: &[u8]) {
        let header = FrameHeader::new(flags, 1, payload.len() as u32);
        let mut state = self.state.lock();
        state.inbound.push_back(header.encode().to_vec());
        if !payload.is_empty() {
            state.inbound.push_back(payload.to_vec());
        }
    }

    /// Queue a response frame from the instrument (DATA, plus EOI when `eoi`)
    pub fn push_data(&self, payload: &[u8], eoi: bool) {
        let mut flags = ControlFlags::DATA;
        flags.set(ControlFlags::EOI, eoi);
        self.push_frame(flags, payload);
    }

    /// Queue a complete frame as one chunk
    pub fn push_whole_frame(&self, flags: ControlFlags, payload: &[u8]) {
        if let Ok(frame) = encode_frame(flags, 1, payload) {
            self.push_chunk(frame);
        }
    }

    /// Everything the client has written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Number of `receive` calls made
    pub fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    /// Number of `send` calls made
    pub fn send_calls(&self) -> usize {
        self.state.lock().send_calls
    }

    /// Number of queued inbound bytes not yet delivered
    pub fn remaining(&self) -> usize {
        self.state.lock().inbound.iter().map(Vec::len).sum()
    }

    /// True once `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted transport closed",
            ));
        }
        state.send_calls += 1;
        let n = state.max_send.map_or(data.len(), |m| m.min(data.len()));
        state.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.receive_calls += 1;
        if state.closed || buffer.is_empty() {
            return Ok(0);
        }

        let Some(mut chunk) = state.inbound.pop_front() else {
            return Ok(0);
        };

        let n = chunk.len().min(buffer.len());
        buffer[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            state.inbound.push_front(chunk);
        }
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_delivered_one_per_receive() {
        let script = ScriptedTransport::new();
        script.push_chunk(vec![1, 2, 3]);
        script.push_chunk(vec![4]);

        let mut transport = script.clone();
        let mut buf = [0u8; 16];
        assert_eq!(transport.receive(&mut buf).unwrap(), 3);
        assert_eq!(transport.receive(&mut buf).unwrap(), 1);
        assert_eq!(transport.receive(&mut buf).unwrap(), 0);
        assert_eq!(script.receive_calls(), 3);
    }

    #[test]
    fn oversized_chunk_is_split_by_buffer() {
        let script = ScriptedTransport::new();
        script.push_chunk(vec![9; 10]);

        let mut transport = script.clone();
        let mut buf = [0u8; 4];
        assert_eq!(transport.receive(&mut buf).unwrap(), 4);
        assert_eq!(script.remaining(), 6);
    }

    #[test]
    fn short_writes_are_recorded() {
        let script = ScriptedTransport::new().with_max_send(2);
        let mut transport = script.clone();
        assert_eq!(transport.send(b"abcd").unwrap(), 2);
        assert_eq!(script.written(), b"ab");
    }

    #[test]
    fn closed_transport_rejects_writes() {
        let script = ScriptedTransport::new();
        let mut transport = script.clone();
        transport.close().unwrap();
        assert!(transport.send(b"x").is_err());
        assert!(script.is_closed());
    }
}
