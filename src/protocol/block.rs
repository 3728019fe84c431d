//! Block transfers on top of a locked link session.
//!
//! Waveform data arrives as a definite-length block:
//!
//! ```text
//! [preamble,]#N<N decimal digits><payload>[terminator]
//! ```
//!
//! `N` is a single digit giving the width of the length field. The declared
//! length is authoritative: the reader keeps pulling frames until exactly that
//! many payload bytes have arrived, however the instrument or the network
//! chose to fragment them. EOI only marks where the logical response ends.
//!
//! All readers borrow a [`SessionGuard`], so a block can only be read by the
//! thread that sent the command requesting it.

use super::session::{ensure_progress, Frame, SessionGuard};
use crate::error::{AppResult, VicpError};
use bytes::{Bytes, BytesMut};
use std::cell::Cell;
use tracing::{debug, instrument, trace, warn};

/// Most payload capacity reserved before the bytes arrive
const MAX_PREALLOC: usize = 1 << 20;

/// Where the waveform block parser stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Skipping preamble, looking for `#`
    AwaitingHeader,
    /// Reading the digit count, then the decimal length
    AwaitingLength {
        /// Width of the length field once known
        width: Option<usize>,
        /// Digits consumed so far
        seen: usize,
        /// Length accumulated so far
        value: usize,
    },
    /// Collecting payload bytes
    AwaitingPayload {
        /// Declared payload length
        declared: usize,
    },
    /// Payload complete
    Complete,
}

/// Reader for string and binary blocks
pub struct BlockReader<'s, 'g> {
    link: &'s SessionGuard<'g>,
    state: Cell<BlockState>,
}

impl<'s, 'g> BlockReader<'s, 'g> {
    /// Reader over an already-locked session
    pub fn new(link: &'s SessionGuard<'g>) -> Self {
        Self {
            link,
            state: Cell::new(BlockState::Complete),
        }
    }

    /// State the waveform parser finished in (or is in, after an error)
    pub fn state(&self) -> BlockState {
        self.state.get()
    }

    /// Read one logical text response.
    ///
    /// NULs and anything after them are dropped. When `trim_trailing_newline`
    /// is set one trailing `\n` (with an optional preceding `\r`) is removed.
    /// Fails with `Protocol` if the reply is not UTF-8 or carries data after
    /// its line terminator, which means two responses ran together.
    pub fn read_single_block_string(&self, trim_trailing_newline: bool) -> AppResult<String> {
        let raw = self.link.read_response()?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = std::str::from_utf8(&raw[..end])
            .map_err(|e| VicpError::Protocol(format!("response is not valid text: {e}")))?;

        if let Some(nl) = text.find('\n') {
            if !text[nl..].trim().is_empty() {
                return Err(VicpError::Protocol(format!(
                    "response carries data after its terminator: {:?}",
                    text
                )));
            }
        }

        let mut reply = text.to_string();
        if trim_trailing_newline && reply.ends_with('\n') {
            reply.pop();
            if reply.ends_with('\r') {
                reply.pop();
            }
        }
        trace!(reply = %reply, "string response");
        Ok(reply)
    }

    /// Read a string that the instrument may split over several responses.
    ///
    /// Blocks are concatenated until a later block closes a quoted reply or a
    /// block ends with a newline terminator.
    pub fn read_multi_block_string(&self) -> AppResult<String> {
        let mut out = String::new();
        let mut first = true;
        loop {
            let block = self.read_single_block_string(false)?;
            let done = (!first && block.contains('"')) || block.ends_with('\n');
            out.push_str(&block);
            if done {
                break;
            }
            first = false;
        }
        Ok(out)
    }

    /// Read one definite-length binary block and return its payload.
    ///
    /// Any preamble before `#` is discarded. Trailing bytes after the payload
    /// must be ASCII whitespace, and the rest of the logical response is
    /// drained through its EOI frame so the link stays in step.
    #[instrument(level = "debug", skip(self), err)]
    pub fn read_waveform_block(&self) -> AppResult<Bytes> {
        self.state.set(BlockState::AwaitingHeader);
        let mut payload = BytesMut::new();
        let mut last_eoi = false;

        while self.state.get() != BlockState::Complete {
            let frame = self.link.read_frame()?;
            ensure_progress(&frame)?;
            last_eoi = frame.is_eoi();

            let rest = self.consume(&frame, &mut payload)?;
            if !rest.is_empty() {
                check_trailer(rest)?;
            }

            if last_eoi && self.state.get() != BlockState::Complete {
                if let BlockState::AwaitingPayload { declared } = self.state.get() {
                    // Length governs; some firmware flags EOI on every block fragment
                    trace!(received = payload.len(), declared, "EOI inside block payload");
                    continue;
                }
                return Err(VicpError::Protocol(format!(
                    "response ended before a complete block header ({:?})",
                    self.state.get()
                )));
            }
        }

        if !last_eoi {
            self.drain_trailer()?;
        }

        debug!(bytes = payload.len(), "waveform block complete");
        Ok(payload.freeze())
    }

    /// Run one frame through the parser, returning bytes left over after completion.
    fn consume<'f>(&self, frame: &'f Frame, payload: &mut BytesMut) -> AppResult<&'f [u8]> {
        let mut bytes: &'f [u8] = &frame.payload;

        while !bytes.is_empty() {
            match self.state.get() {
                BlockState::AwaitingHeader => match bytes.iter().position(|&b| b == b'#') {
                    Some(i) => {
                        if i > 0 {
                            trace!(preamble = %String::from_utf8_lossy(&bytes[..i]), "skipping block preamble");
                        }
                        bytes = &bytes[i + 1..];
                        self.state.set(BlockState::AwaitingLength {
                            width: None,
                            seen: 0,
                            value: 0,
                        });
                    }
                    None => bytes = &[],
                },
                BlockState::AwaitingLength { width, seen, value } => {
                    let c = bytes[0];
                    bytes = &bytes[1..];
                    let digit = match c {
                        b'0'..=b'9' => (c - b'0') as usize,
                        other => {
                            return Err(VicpError::Protocol(format!(
                                "malformed block header: unexpected byte {:#04x}",
                                other
                            )))
                        }
                    };

                    match width {
                        None if digit == 0 => {
                            return Err(VicpError::Protocol(
                                "indefinite-length blocks (#0) are not supported".into(),
                            ))
                        }
                        None => self.state.set(BlockState::AwaitingLength {
                            width: Some(digit),
                            seen: 0,
                            value: 0,
                        }),
                        Some(width) => {
                            let value = value
                                .checked_mul(10)
                                .and_then(|v| v.checked_add(digit))
                                .ok_or_else(|| {
                                    VicpError::Protocol("block length overflows".into())
                                })?;
                            let seen = seen + 1;
                            if seen < width {
                                self.state.set(BlockState::AwaitingLength {
                                    width: Some(width),
                                    seen,
                                    value,
                                });
                            } else if value == 0 {
                                self.state.set(BlockState::Complete);
                            } else {
                                payload.reserve(value.min(MAX_PREALLOC));
                                self.state
                                    .set(BlockState::AwaitingPayload { declared: value });
                            }
                        }
                    }
                }
                BlockState::AwaitingPayload { declared } => {
                    let take = bytes.len().min(declared - payload.len());
                    payload.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if payload.len() == declared {
                        self.state.set(BlockState::Complete);
                    }
                }
                BlockState::Complete => return Ok(bytes),
            }
        }
        Ok(bytes)
    }

    fn drain_trailer(&self) -> AppResult<()> {
        loop {
            let frame = self.link.read_frame()?;
            ensure_progress(&frame)?;
            check_trailer(&frame.payload)?;
            if frame.is_eoi() {
                return Ok(());
            }
        }
    }
}

fn check_trailer(bytes: &[u8]) -> AppResult<()> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    warn!(extra = bytes.len(), "block overran its declared length");
    Err(VicpError::Protocol(format!(
        "{} unexpected bytes after block payload",
        bytes.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::session::LinkSession;
    use crate::transport::ScriptedTransport;
    use proptest::prelude::*;

    fn session(script: &ScriptedTransport) -> LinkSession {
        LinkSession::new(Box::new(script.clone()), 1024)
    }

    #[test]
    fn fourteen_byte_block_in_three_payload_frames() {
        let script = ScriptedTransport::new();
        script.push_data(b"DAT1,#214", false);
        script.push_data(b"abcde", false);
        script.push_data(b"fghij", false);
        script.push_data(b"klmn", true);

        let session = session(&script);
        let link = session.lock();
        let reader = BlockReader::new(&link);
        let block = reader.read_waveform_block().unwrap();

        assert_eq!(&block[..], b"abcdefghijklmn");
        assert_eq!(reader.state(), BlockState::Complete);
        // Header and payload chunk per frame
        assert_eq!(script.receive_calls(), 8);
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn truncated_block_is_a_transport_error() {
        let script = ScriptedTransport::new();
        script.push_data(b"#214", false);
        script.push_data(b"abcdef", false);

        let session = session(&script);
        let link = session.lock();
        let err = BlockReader::new(&link).read_waveform_block().unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn huge_declared_block_fails_on_close_without_preallocating() {
        let script = ScriptedTransport::new();
        script.push_data(b"#9999999999", false);
        script.push_data(b"abc", false);

        let session = session(&script);
        let link = session.lock();
        let reader = BlockReader::new(&link);
        let err = reader.read_waveform_block().unwrap_err();
        assert!(err.is_transport());
        assert_eq!(
            reader.state(),
            BlockState::AwaitingPayload {
                declared: 999_999_999
            }
        );
    }

    #[test]
    fn zero_length_block_reads_nothing_more() {
        let script = ScriptedTransport::new();
        script.push_data(b"#10", true);
        script.push_data(b"untouched", true);

        let session = session(&script);
        let link = session.lock();
        let block = BlockReader::new(&link).read_waveform_block().unwrap();
        assert!(block.is_empty());
        assert_eq!(script.remaining(), b"untouched".len() + 8);
    }

    #[test]
    fn trailing_newline_frame_is_drained() {
        let script = ScriptedTransport::new();
        script.push_data(b"C1:WF DESC,#9000000004", false);
        script.push_data(b"WXYZ", false);
        script.push_data(b"\n", true);

        let session = session(&script);
        let link = session.lock();
        let block = BlockReader::new(&link).read_waveform_block().unwrap();
        assert_eq!(&block[..], b"WXYZ");
        assert_eq!(script.remaining(), 0);
    }

    #[test]
    fn excess_payload_is_a_protocol_error() {
        let script = ScriptedTransport::new();
        script.push_data(b"#13abcdef", true);

        let session = session(&script);
        let link = session.lock();
        let err = BlockReader::new(&link).read_waveform_block().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn malformed_length_is_a_protocol_error() {
        let script = ScriptedTransport::new();
        script.push_data(b"#2x4", true);

        let session = session(&script);
        let link = session.lock();
        assert!(BlockReader::new(&link)
            .read_waveform_block()
            .unwrap_err()
            .is_protocol());
    }

    #[test]
    fn missing_header_is_a_protocol_error() {
        let script = ScriptedTransport::new();
        script.push_data(b"no block here\n", true);

        let session = session(&script);
        let link = session.lock();
        let reader = BlockReader::new(&link);
        assert!(reader.read_waveform_block().unwrap_err().is_protocol());
        assert_eq!(reader.state(), BlockState::AwaitingHeader);
    }

    #[test]
    fn single_block_string_trims_one_newline() {
        let script = ScriptedTransport::new();
        script.push_data(b"LECROY,WS3024,", false);
        script.push_data(b"LCRY1234,8.5.0\n", true);
        script.push_data(b"DC\n", true);

        let session = session(&script);
        let link = session.lock();
        let reader = BlockReader::new(&link);
        assert_eq!(
            reader.read_single_block_string(true).unwrap(),
            "LECROY,WS3024,LCRY1234,8.5.0"
        );
        assert_eq!(reader.read_single_block_string(false).unwrap(), "DC\n");
    }

    #[test]
    fn single_block_string_rejects_merged_responses() {
        let script = ScriptedTransport::new();
        script.push_data(b"1.0\n2.0\n", true);

        let session = session(&script);
        let link = session.lock();
        assert!(BlockReader::new(&link)
            .read_single_block_string(true)
            .unwrap_err()
            .is_protocol());
    }

    #[test]
    fn multi_block_string_runs_to_closing_quote() {
        let script = ScriptedTransport::new();
        script.push_data(b"\"first part ", true);
        script.push_data(b"second part", true);
        script.push_data(b" end\"", true);

        let session = session(&script);
        let link = session.lock();
        assert_eq!(
            BlockReader::new(&link).read_multi_block_string().unwrap(),
            "\"first part second part end\""
        );
    }

    #[test]
    fn multi_block_string_stops_at_newline() {
        let script = ScriptedTransport::new();
        script.push_data(b"0.25\n", true);
        script.push_data(b"unread", true);

        let session = session(&script);
        let link = session.lock();
        assert_eq!(
            BlockReader::new(&link).read_multi_block_string().unwrap(),
            "0.25\n"
        );
        assert!(script.remaining() > 0);
    }

    proptest! {
        #[test]
        fn fragmented_blocks_reassemble_exactly(
            payload in proptest::collection::vec(any::<u8>(), 0..600),
            cuts in proptest::collection::vec(1usize..64, 1..40),
        ) {
            let script = ScriptedTransport::new();
            let header = format!("DAT1,#9{:09}", payload.len());
            let mut body = header.into_bytes();
            body.extend_from_slice(&payload);
            body.push(b'\n');

            // Split the whole response into frames at arbitrary points
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < body.len() {
                let step = (*cut.next().unwrap()).min(body.len() - offset);
                let last = offset + step == body.len();
                script.push_data(&body[offset..offset + step], last);
                offset += step;
            }

            let session = session(&script);
            let link = session.lock();
            let block = BlockReader::new(&link).read_waveform_block().unwrap();
            prop_assert_eq!(&block[..], &payload[..]);
            prop_assert_eq!(script.remaining(), 0);
        }
    }
}
