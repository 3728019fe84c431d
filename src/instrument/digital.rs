//! Logic analyzer capture.
//!
//! `Digital1:WF?` answers with a small XML-like document instead of a binary
//! waveform. Four fields are used: `SelectedLines=` (16 characters of `0` or
//! `1`, line 0 first), `<HorPerStep>` (seconds per sample), `<NumSamples>`
//! and `<BinaryData>`. The binary data is base64 and holds one byte per
//! sample for every selected line, lines back to back in line order.

use super::channel::DIGITAL_CHANNEL_COUNT;
use crate::error::{AppResult, VicpError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

/// Query returning the logic analyzer document
pub const DIGITAL_QUERY: &str = "Digital1:WF?";

/// Selected probe lines, line 0 first
pub type LineSelection = [bool; DIGITAL_CHANNEL_COUNT];

/// Parse the `SelectedLines=` field; `None` if the document has none
pub fn parse_selected_lines(text: &str) -> AppResult<Option<LineSelection>> {
    const FIELD: &str = "SelectedLines=";
    let Some(start) = text.find(FIELD) else {
        return Ok(None);
    };
    let mut chars = text[start + FIELD.len()..].trim_start_matches('"').chars();
    let mut lines = [false; DIGITAL_CHANNEL_COUNT];
    for slot in lines.iter_mut() {
        *slot = match chars.next() {
            Some('1') => true,
            Some('0') => false,
            other => {
                return Err(VicpError::Protocol(format!(
                    "bad SelectedLines character {:?}",
                    other
                )))
            }
        };
    }
    Ok(Some(lines))
}

/// Trimmed text between `<tag>` and `</tag>`
fn element<'a>(text: &'a str, tag: &str) -> AppResult<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let missing = || VicpError::Protocol(format!("logic analyzer reply has no <{}>", tag));
    let start = text.find(&open).ok_or_else(missing)? + open.len();
    let len = text[start..].find(&close).ok_or_else(missing)?;
    Ok(text[start..start + len].trim())
}

fn number<T: std::str::FromStr>(text: &str, tag: &str) -> AppResult<T> {
    let value = element(text, tag)?;
    value
        .parse()
        .map_err(|_| VicpError::Protocol(format!("bad <{}> value {:?}", tag, value)))
}

/// A decoded logic analyzer capture
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalCapture {
    /// Lines present in the capture
    pub selected: LineSelection,
    /// Seconds between samples
    pub interval: f64,
    /// Samples per line
    pub num_samples: usize,
    data: Bytes,
}

impl DigitalCapture {
    /// Decode a `Digital1:WF?` block
    pub fn parse(raw: &[u8]) -> AppResult<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| VicpError::Protocol("logic analyzer reply is not text".into()))?;
        let selected = parse_selected_lines(text)?.ok_or_else(|| {
            VicpError::Protocol("logic analyzer reply has no SelectedLines field".into())
        })?;
        let interval: f64 = number(text, "HorPerStep")?;
        let num_samples: usize = number(text, "NumSamples")?;

        // Long payloads may be wrapped
        let encoded: String = element(text, "BinaryData")?.split_whitespace().collect();
        let data = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| VicpError::Protocol(format!("bad logic analyzer data: {}", e)))?;

        let needed = selected.iter().filter(|s| **s).count() * num_samples;
        if data.len() < needed {
            return Err(VicpError::Protocol(format!(
                "logic analyzer data holds {} bytes, selected lines need {}",
                data.len(),
                needed
            )));
        }

        Ok(Self {
            selected,
            interval,
            num_samples,
            data: Bytes::from(data),
        })
    }

    /// Samples of `line`, or `None` if the line was not captured
    pub fn line(&self, line: usize) -> Option<Bytes> {
        if !self.selected.get(line).copied().unwrap_or(false) {
            return None;
        }
        let position = self.selected[..line].iter().filter(|s| **s).count();
        let start = position * self.num_samples;
        Some(self.data.slice(start..start + self.num_samples))
    }
}

/// One logic line's samples
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalWaveform {
    /// Roster index
    pub channel: usize,
    /// Probe line number
    pub line: usize,
    /// Seconds between samples
    pub interval: f64,
    /// One byte per sample, nonzero for high
    pub samples: Bytes,
}

impl DigitalWaveform {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if nothing was captured
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Logic level at sample `index`
    pub fn level(&self, index: usize) -> Option<bool> {
        self.samples.get(index).map(|b| *b != 0)
    }
}
