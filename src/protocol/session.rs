//! VICP link session.
//!
//! The session owns the transport and is the single serialisation point for
//! bytes on the wire. VICP is strictly request/response: a second command must
//! never go out while a previous response is still pending, so anything that
//! sends and then reads holds the session lock across both halves.
//!
//! The lock is a `parking_lot::ReentrantMutex`, so a public instrument call can
//! take it once and hand the resulting [`SessionGuard`] to internal helpers, or
//! those helpers can lock again on the same thread without deadlocking.
//!
//! [`LinkSession::close`] does not need that lock. It flags the session
//! closed and shuts the stream down through the transport's
//! [`Interrupt`] handle, which wakes a reader blocked on another thread.
//!
//! # Example
//!
//! ```
//! use vicp_scope::protocol::session::LinkSession;
//! use vicp_scope::transport::ScriptedTransport;
//!
//! let script = ScriptedTransport::new();
//! script.push_data(b"LECROY,WS3024,LCRY001,9.2.0\n", true);
//!
//! let session = LinkSession::new(Box::new(script.clone()), 65536);
//! let reply = session.query("*IDN?")?;
//! assert!(reply.starts_with(b"LECROY"));
//! # Ok::<(), vicp_scope::error::VicpError>(())
//! ```

use super::frame::{self, ControlFlags, FrameHeader, HEADER_LEN};
use crate::config::LinkConfig;
use crate::error::{AppResult, VicpError};
use crate::transport::{Interrupt, Transport};
use bytes::{Bytes, BytesMut};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// One received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header
    pub header: FrameHeader,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// True if this is the last frame of a logical message
    pub fn is_eoi(&self) -> bool {
        self.header.flags.is_eoi()
    }
}

/// Payload bytes requested from the transport per read; bounds allocation ahead of arrival
const READ_CHUNK: usize = 64 * 1024;

/// How long `close` waits for an in-flight exchange to let go of the transport
const CLOSE_WAIT: Duration = Duration::from_secs(2);

struct Link {
    transport: Box<dyn Transport>,
    next_sequence: u8,
    last_rx_sequence: Option<u8>,
    closed: Arc<AtomicBool>,
}

impl Link {
    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VicpError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "link session is closed",
            )));
        }
        Ok(())
    }

    fn write_all(&mut self, mut data: &[u8]) -> AppResult<()> {
        self.ensure_open()?;
        while !data.is_empty() {
            match self.transport.send(data) {
                Ok(0) => {
                    return Err(VicpError::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write, {} bytes not sent", data.len()),
                    )))
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(VicpError::Transport(e)),
            }
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> AppResult<()> {
        self.ensure_open()?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.transport.receive(&mut buf[filled..]) {
                Ok(0) => return Err(VicpError::closed(what)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(VicpError::Transport(e)),
            }
        }
        Ok(())
    }

    /// Read `len` payload bytes, growing the buffer only as data arrives.
    fn read_payload(&mut self, len: usize) -> AppResult<Bytes> {
        let mut payload = BytesMut::with_capacity(len.min(READ_CHUNK));
        while payload.len() < len {
            let start = payload.len();
            let step = (len - start).min(READ_CHUNK);
            payload.resize(start + step, 0);
            self.read_exact(&mut payload[start..], "frame payload")?;
        }
        Ok(payload.freeze())
    }
}

/// Exclusive owner of the transport
pub struct LinkSession {
    link: ReentrantMutex<RefCell<Link>>,
    closed: Arc<AtomicBool>,
    interrupt: Option<Arc<dyn Interrupt>>,
    max_frame_payload: usize,
}

impl LinkSession {
    /// Wrap a connected transport. `max_frame_payload` bounds each outbound frame.
    pub fn new(transport: Box<dyn Transport>, max_frame_payload: usize) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let interrupt = transport.interrupt_handle();
        if interrupt.is_none() {
            debug!("Transport has no interrupt handle; close waits for in-flight reads");
        }
        Self {
            link: ReentrantMutex::new(RefCell::new(Link {
                transport,
                next_sequence: 1,
                last_rx_sequence: None,
                closed: Arc::clone(&closed),
            })),
            closed,
            interrupt,
            max_frame_payload: max_frame_payload.clamp(1, frame::MAX_PAYLOAD),
        }
    }

    /// Wrap a transport using the link section of the configuration
    pub fn with_config(transport: Box<dyn Transport>, config: &LinkConfig) -> Self {
        Self::new(transport, config.max_frame_payload)
    }

    /// Take the transport lock. Blocks while another thread holds it; reentrant on this thread.
    pub fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            link: self.link.lock(),
            max_frame_payload: self.max_frame_payload,
        }
    }

    /// Fire-and-forget command; the lock is released once the bytes are on the wire.
    pub fn send_command(&self, text: &str) -> AppResult<()> {
        self.lock().send_command(text)
    }

    /// Read one logical response.
    pub fn read_response(&self) -> AppResult<Vec<u8>> {
        self.lock().read_response()
    }

    /// Send a command and read its response as one exclusive exchange.
    pub fn query(&self, text: &str) -> AppResult<Vec<u8>> {
        let link = self.lock();
        link.send_command(text)?;
        link.read_response()
    }

    /// Send a device-clear frame.
    pub fn device_clear(&self) -> AppResult<()> {
        self.lock().device_clear()
    }

    /// Close the transport. Subsequent operations fail with a transport error.
    ///
    /// Safe to call from any thread while another thread is blocked in a
    /// read: the stream is shut down through the interrupt handle without
    /// taking the transport lock, which makes the blocked read fail.
    pub fn close(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(interrupt) = &self.interrupt {
            interrupt.interrupt()?;
        }

        match self.link.try_lock_for(CLOSE_WAIT) {
            Some(guard) => match guard.try_borrow_mut() {
                Ok(mut link) => link.transport.close()?,
                // Closed from inside an exchange on this thread; the interrupt already ran
                Err(_) => debug!("Transport busy on this thread, left to the interrupt"),
            },
            None => warn!("Transport still busy after close; it is released when the exchange fails"),
        }
        debug!("Link session closed");
        Ok(())
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Largest payload placed in a single outbound frame
    pub fn max_frame_payload(&self) -> usize {
        self.max_frame_payload
    }
}

/// Proof that the calling thread holds the transport lock.
///
/// Helpers that must run inside an exchange take `&SessionGuard` instead of
/// locking again.
pub struct SessionGuard<'a> {
    link: ReentrantMutexGuard<'a, RefCell<Link>>,
    max_frame_payload: usize,
}

impl SessionGuard<'_> {
    /// Frame and write a command, chunking it so only the final frame carries EOI.
    #[instrument(level = "debug", skip(self), err)]
    pub fn send_command(&self, text: &str) -> AppResult<()> {
        let bytes = text.as_bytes();
        let mut link = self.link.borrow_mut();

        let mut chunks = bytes.chunks(self.max_frame_payload).peekable();
        if chunks.peek().is_none() {
            // Empty command still needs one EOI frame
            let seq = link.next_sequence;
            let wire = frame::encode_command(&[], true, seq)?;
            link.write_all(&wire)?;
            link.next_sequence = frame::next_sequence(seq, true);
            return Ok(());
        }

        while let Some(chunk) = chunks.next() {
            let is_final = chunks.peek().is_none();
            let seq = link.next_sequence;
            let wire = frame::encode_command(chunk, is_final, seq)?;
            trace!(bytes = chunk.len(), sequence = seq, eoi = is_final, "tx frame");
            link.write_all(&wire)?;
            link.next_sequence = frame::next_sequence(seq, is_final);
        }
        Ok(())
    }

    /// Send a zero-length frame with CLEAR set.
    pub fn device_clear(&self) -> AppResult<()> {
        let mut link = self.link.borrow_mut();
        let seq = link.next_sequence;
        let wire = frame::encode_frame(
            ControlFlags::CLEAR | ControlFlags::REMOTE | ControlFlags::EOI,
            seq,
            &[],
        )?;
        link.write_all(&wire)?;
        link.next_sequence = frame::next_sequence(seq, true);
        debug!("Device clear sent");
        Ok(())
    }

    /// Read exactly one frame.
    pub fn read_frame(&self) -> AppResult<Frame> {
        let mut link = self.link.borrow_mut();

        let mut raw = [0u8; HEADER_LEN];
        link.read_exact(&mut raw, "frame header")?;
        let header = FrameHeader::decode(&raw)?;

        let payload = link.read_payload(header.length as usize)?;

        if let Some(previous) = link.last_rx_sequence {
            if header.sequence != previous && header.sequence != frame::next_sequence(previous, true) {
                trace!(previous, got = header.sequence, "rx sequence jump");
            }
        }
        link.last_rx_sequence = Some(header.sequence);

        if header.flags.contains(ControlFlags::SRQ) {
            debug!("Instrument raised a service request");
        }
        trace!(
            bytes = payload.len(),
            sequence = header.sequence,
            eoi = header.flags.is_eoi(),
            "rx frame"
        );

        Ok(Frame { header, payload })
    }

    /// Read frames until one carries EOI, concatenating payloads in arrival order.
    pub fn read_response(&self) -> AppResult<Vec<u8>> {
        let mut response = Vec::new();
        loop {
            let frame = self.read_frame()?;
            ensure_progress(&frame)?;
            response.extend_from_slice(&frame.payload);
            if frame.is_eoi() {
                break;
            }
        }
        debug!(bytes = response.len(), "response complete");
        Ok(response)
    }
}

/// A frame with no payload and no EOI carries nothing and ends nothing.
pub(crate) fn ensure_progress(frame: &Frame) -> AppResult<()> {
    if frame.payload.is_empty() && !frame.is_eoi() {
        warn!("Empty non-final frame from instrument");
        return Err(VicpError::Protocol(
            "instrument sent an empty frame without EOI (stalled peer)".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::decode_flags;
    use crate::transport::ScriptedTransport;

    fn split_frames(mut wire: &[u8]) -> Vec<(ControlFlags, u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while !wire.is_empty() {
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&wire[..HEADER_LEN]);
            let header = FrameHeader::decode(&raw).unwrap();
            let end = HEADER_LEN + header.length as usize;
            frames.push((header.flags, header.sequence, wire[HEADER_LEN..end].to_vec()));
            wire = &wire[end..];
        }
        frames
    }

    #[test]
    fn short_command_is_one_eoi_frame() {
        let script = ScriptedTransport::new();
        let session = LinkSession::new(Box::new(script.clone()), 64);
        session.send_command("TRIG_MODE SINGLE").unwrap();

        let frames = split_frames(&script.written());
        assert_eq!(frames.len(), 1);
        let (flags, seq, payload) = &frames[0];
        assert_eq!(*flags, ControlFlags::DATA | ControlFlags::REMOTE | ControlFlags::EOI);
        assert_eq!(*seq, 1);
        assert_eq!(payload, b"TRIG_MODE SINGLE");
    }

    #[test]
    fn long_command_is_chunked_with_eoi_last() {
        let script = ScriptedTransport::new();
        let session = LinkSession::new(Box::new(script.clone()), 4);
        session.send_command("C1:VOLT_DIV 0.5").unwrap();

        let frames = split_frames(&script.written());
        assert_eq!(frames.len(), 4);
        for (flags, seq, _) in &frames[..3] {
            assert!(!flags.is_eoi());
            assert_eq!(*seq, 1);
        }
        assert!(frames[3].0.is_eoi());
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.2.clone()).collect();
        assert_eq!(joined, b"C1:VOLT_DIV 0.5");

        // Next command moves to the next sequence number
        session.send_command("STOP").unwrap();
        let frames = split_frames(&script.written());
        assert_eq!(frames.last().unwrap().1, 2);
    }

    #[test]
    fn short_writes_are_retried_until_complete() {
        let script = ScriptedTransport::new().with_max_send(3);
        let session = LinkSession::new(Box::new(script.clone()), 64);
        session.send_command("*IDN?").unwrap();
        assert_eq!(script.written().len(), HEADER_LEN + 5);
        assert!(script.send_calls() > 1);
    }

    #[test]
    fn response_concatenates_until_eoi() {
        let script = ScriptedTransport::new();
        script.push_data(b"hello ", false);
        script.push_data(b"world\n", true);
        script.push_data(b"next", true);

        let session = LinkSession::new(Box::new(script.clone()), 64);
        assert_eq!(session.read_response().unwrap(), b"hello world\n");
        assert_eq!(session.read_response().unwrap(), b"next");
    }

    #[test]
    fn empty_non_final_frame_is_a_protocol_error() {
        let script = ScriptedTransport::new();
        script.push_data(b"", false);
        let session = LinkSession::new(Box::new(script), 64);
        assert!(session.read_response().unwrap_err().is_protocol());
    }

    #[test]
    fn close_mid_frame_is_a_transport_error() {
        let script = ScriptedTransport::new();
        let header = FrameHeader::new(ControlFlags::DATA | ControlFlags::EOI, 1, 10);
        script.push_chunk(header.encode().to_vec());
        script.push_chunk(b"abc".to_vec());

        let session = LinkSession::new(Box::new(script), 64);
        assert!(session.read_response().unwrap_err().is_transport());
    }

    #[test]
    fn reentrant_lock_on_same_thread() {
        let script = ScriptedTransport::new();
        script.push_data(b"1\n", true);
        let session = LinkSession::new(Box::new(script), 64);

        let outer = session.lock();
        outer.send_command("INR?").unwrap();
        // Helper re-locks while the outer guard is alive
        let reply = session.read_response().unwrap();
        assert_eq!(reply, b"1\n");
        drop(outer);
    }

    #[test]
    fn device_clear_sets_clear_flag() {
        let script = ScriptedTransport::new();
        let session = LinkSession::new(Box::new(script.clone()), 64);
        session.device_clear().unwrap();
        let written = script.written();
        assert_eq!(written.len(), HEADER_LEN);
        assert!(decode_flags(written[0]).contains(ControlFlags::CLEAR));
    }

    #[test]
    fn closed_session_rejects_commands() {
        let script = ScriptedTransport::new();
        let session = LinkSession::new(Box::new(script.clone()), 64);
        session.close().unwrap();
        assert!(script.is_closed());
        assert!(session.is_closed());
        assert!(session.send_command("STOP").unwrap_err().is_transport());
        assert!(session.read_response().unwrap_err().is_transport());
        // Closing twice is harmless
        session.close().unwrap();
    }

    #[test]
    fn huge_declared_frame_length_fails_without_preallocating() {
        let script = ScriptedTransport::new();
        let header = FrameHeader::new(ControlFlags::DATA | ControlFlags::EOI, 1, u32::MAX);
        script.push_chunk(header.encode().to_vec());
        script.push_chunk(vec![b'x'; 100]);

        let session = LinkSession::new(Box::new(script.clone()), 64);
        let err = session.read_response().unwrap_err();
        assert!(err.is_transport());
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn large_payload_arrives_across_read_chunks() {
        let script = ScriptedTransport::new();
        let body: Vec<u8> = (0..READ_CHUNK * 2 + 17).map(|i| i as u8).collect();
        script.push_data(&body, true);

        let session = LinkSession::new(Box::new(script), 64);
        assert_eq!(session.read_response().unwrap(), body);
    }
}
