//! Channel roster.
//!
//! Built once by the connection routine from detected hardware and never
//! resized. Order: analog inputs `C1..Cn`, the external trigger `EX`, then the
//! optional digital lines `D0..D15`. Every capability surface refers to
//! channels by their index in this list.

use crate::error::{AppResult, VicpError};
use std::fmt;

/// Number of lines on the mixed-signal probe
pub const DIGITAL_CHANNEL_COUNT: usize = 16;

/// What kind of input a roster entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Analog input
    Analog,
    /// Logic analyzer line
    Digital,
    /// External trigger input
    ExternalTrigger,
}

/// Input coupling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingType {
    /// AC, 1 MOhm
    Ac1M,
    /// DC, 1 MOhm
    Dc1M,
    /// DC, 50 Ohm
    Dc50,
    /// Input grounded
    Ground,
    /// Fixed by the input type (digital lines, external trigger)
    Synthetic,
}

impl CouplingType {
    /// Instrument spelling, `None` for synthetic inputs
    pub fn code(self) -> Option<&'static str> {
        match self {
            CouplingType::Ac1M => Some("A1M"),
            CouplingType::Dc1M => Some("D1M"),
            CouplingType::Dc50 => Some("D50"),
            CouplingType::Ground => Some("GND"),
            CouplingType::Synthetic => None,
        }
    }

    /// Parse the instrument spelling
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "A1M" => Some(CouplingType::Ac1M),
            "D1M" => Some(CouplingType::Dc1M),
            "D50" => Some(CouplingType::Dc50),
            "GND" => Some(CouplingType::Ground),
            _ => None,
        }
    }
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Position in the roster
    pub index: usize,
    /// Name used in commands (`C1`, `EX`, `D3`)
    pub hw_name: String,
    /// Input kind
    pub kind: ChannelKind,
}

impl Channel {
    /// True for analog inputs
    pub fn is_analog(&self) -> bool {
        self.kind == ChannelKind::Analog
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hw_name)
    }
}

/// Fixed list of detected channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRoster {
    channels: Vec<Channel>,
    analog_count: usize,
    digital_count: usize,
}

impl ChannelRoster {
    /// `analog` inputs, the external trigger, and `digital` logic lines
    pub fn new(analog: usize, digital: usize) -> Self {
        let mut channels = Vec::with_capacity(analog + 1 + digital);
        for i in 0..analog {
            channels.push(Channel {
                index: i,
                hw_name: format!("C{}", i + 1),
                kind: ChannelKind::Analog,
            });
        }
        channels.push(Channel {
            index: analog,
            hw_name: "EX".to_string(),
            kind: ChannelKind::ExternalTrigger,
        });
        for i in 0..digital {
            channels.push(Channel {
                index: analog + 1 + i,
                hw_name: format!("D{}", i),
                kind: ChannelKind::Digital,
            });
        }
        Self {
            channels,
            analog_count: analog,
            digital_count: digital,
        }
    }

    /// Total number of roster entries
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false; the external trigger is always present
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of analog inputs
    pub fn analog_count(&self) -> usize {
        self.analog_count
    }

    /// Number of digital lines
    pub fn digital_count(&self) -> usize {
        self.digital_count
    }

    /// Roster index of the external trigger input
    pub fn external_trigger_index(&self) -> usize {
        self.analog_count
    }

    /// Entry at `index`
    pub fn get(&self, index: usize) -> AppResult<&Channel> {
        self.channels
            .get(index)
            .ok_or(VicpError::InvalidChannel(index))
    }

    /// Entry at `index`, which must be an analog input
    pub fn analog(&self, index: usize) -> AppResult<&Channel> {
        let channel = self.get(index)?;
        if channel.is_analog() {
            Ok(channel)
        } else {
            Err(VicpError::Unsupported(format!(
                "{} is not an analog input",
                channel.hw_name
            )))
        }
    }

    /// Look a channel up by its command name
    pub fn by_hw_name(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.hw_name == name)
    }

    /// All analog inputs in order
    pub fn analog_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_analog())
    }

    /// All digital lines in line order
    pub fn digital_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(|c| c.kind == ChannelKind::Digital)
    }

    /// Probe line number of the digital channel at `index`
    pub fn digital_line(&self, index: usize) -> Option<usize> {
        match self.channels.get(index)?.kind {
            ChannelKind::Digital => Some(index - self.analog_count - 1),
            _ => None,
        }
    }

    /// All entries in order
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_orders_analog_trigger_digital() {
        let roster = ChannelRoster::new(4, DIGITAL_CHANNEL_COUNT);
        assert_eq!(roster.len(), 21);
        assert_eq!(roster.get(0).unwrap().hw_name, "C1");
        assert_eq!(roster.get(3).unwrap().hw_name, "C4");
        assert_eq!(roster.external_trigger_index(), 4);
        assert_eq!(roster.get(4).unwrap().kind, ChannelKind::ExternalTrigger);
        assert_eq!(roster.get(5).unwrap().hw_name, "D0");
        assert_eq!(roster.get(20).unwrap().hw_name, "D15");
        assert!(matches!(roster.get(21), Err(VicpError::InvalidChannel(21))));

        assert_eq!(roster.digital_channels().count(), 16);
        assert_eq!(roster.digital_line(5), Some(0));
        assert_eq!(roster.digital_line(20), Some(15));
        assert_eq!(roster.digital_line(4), None);
        assert_eq!(roster.digital_line(21), None);
    }

    #[test]
    fn analog_lookup_rejects_other_kinds() {
        let roster = ChannelRoster::new(2, 0);
        assert!(roster.analog(1).is_ok());
        assert!(matches!(roster.analog(2), Err(VicpError::Unsupported(_))));
        assert_eq!(roster.by_hw_name("EX").unwrap().index, 2);
        assert_eq!(roster.analog_channels().count(), 2);
    }

    #[test]
    fn coupling_codes() {
        assert_eq!(CouplingType::from_code("D50\n"), Some(CouplingType::Dc50));
        assert_eq!(CouplingType::Ground.code(), Some("GND"));
        assert_eq!(CouplingType::Synthetic.code(), None);
        assert_eq!(CouplingType::from_code("XYZ"), None);
    }
}
