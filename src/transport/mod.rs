//! Byte-stream transports underneath the VICP link.
//!
//! The link layer only needs three blocking primitives, so the transport is a
//! small object-safe trait. `TcpTransport` is the production implementation;
//! `ScriptedTransport` replays canned inbound bytes for tests.

use std::io;
use std::sync::Arc;

pub mod scripted;
pub mod tcp;

pub use scripted::ScriptedTransport;
pub use tcp::TcpTransport;

/// Blocking byte-stream collaborator.
///
/// # Contract
/// - `send` may write fewer bytes than offered; callers loop until done.
/// - `receive` returning `Ok(0)` signals an orderly close by the peer.
/// - No timeouts are implied; a blocked `receive` returns only when data
///   arrives, the peer closes, or the stream is shut down through the
///   handle returned by `interrupt_handle`.
pub trait Transport: Send {
    /// Write some prefix of `data`, returning how many bytes were accepted.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read into `buffer`, returning the number of bytes read (0 = closed).
    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Shut the stream down. Further calls on the transport fail or return 0.
    fn close(&mut self) -> io::Result<()>;

    /// Handle that can shut the stream down from another thread while a
    /// `receive` is blocked. Transports that never block return `None`.
    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

/// Out-of-band shutdown for a transport, usable without owning it.
pub trait Interrupt: Send + Sync {
    /// Shut the underlying stream down so blocked reads and writes return.
    fn interrupt(&self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        (**self).receive(buffer)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        (**self).interrupt_handle()
    }
}
