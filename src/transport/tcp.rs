//! TCP transport for VICP instruments
//!
//! Plain blocking `std::net::TcpStream`. Only the connect phase is bounded by a
//! timeout; reads block until the instrument answers or the socket is shut down.

use super::{Interrupt, Transport};
use crate::config::ConnectionConfig;
use crate::error::{AppResult, VicpError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Blocking TCP connection to an instrument
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    /// Connect to `host:port` using the timeout and socket options from `config`.
    ///
    /// Every resolved address is tried in turn; the last failure is returned
    /// if none accepts the connection.
    pub fn open(host: &str, port: u16, config: &ConnectionConfig) -> AppResult<Self> {
        let peer = format!("{}:{}", host, port);
        let addrs = (host, port).to_socket_addrs()?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
                Ok(stream) => {
                    if config.nodelay {
                        // Disable Nagle's algorithm; VICP is strictly request/response
                        stream.set_nodelay(true)?;
                    }
                    info!(%peer, "Connected to VICP instrument");
                    return Ok(Self { stream, peer });
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(VicpError::Transport(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {}", peer),
            )
        })))
    }

    /// Connect with default socket options.
    pub fn connect(host: &str, port: u16) -> AppResult<Self> {
        Self::open(host, port, &ConnectionConfig::default())
    }

    /// Remote address as `host:port`
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Optional read timeout for callers that want responsiveness without a watchdog thread.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

/// Second handle on the socket, used to shut it down from another thread
struct TcpInterrupt {
    stream: TcpStream,
    peer: String,
}

impl Interrupt for TcpInterrupt {
    fn interrupt(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => {
                debug!(peer = %self.peer, "Socket shut down from another thread");
                Ok(())
            }
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buffer)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already disconnected by the peer
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Socket shutdown failed");
                Err(e)
            }
        }
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        match self.stream.try_clone() {
            Ok(stream) => Some(Arc::new(TcpInterrupt {
                stream,
                peer: self.peer.clone(),
            })),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Cannot clone socket for interrupt");
                None
            }
        }
    }
}
