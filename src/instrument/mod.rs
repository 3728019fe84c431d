//! The oscilloscope driver and its parts.
//!
//! - [`scope`]: [`VicpOscilloscope`], connection setup and channel control
//! - [`acquisition`]: trigger state machine and waveform download
//! - [`digital`]: logic analyzer document decoding
//! - [`meter`] / [`generator`]: optional voltmeter and function generator
//! - [`identity`] / [`channel`]: what was detected at connection time
//! - [`simulated`]: an in-process instrument for tests and demos

pub mod acquisition;
pub mod channel;
pub mod digital;
pub mod generator;
pub mod identity;
pub mod meter;
pub mod scope;
pub mod simulated;

pub use acquisition::{
    Acquired, DescriptorTimestamp, PendingWaveforms, WaveDescriptor, Waveform, WaveformSet,
};
pub use channel::{Channel, ChannelKind, ChannelRoster, CouplingType};
pub use digital::{DigitalCapture, DigitalWaveform};
pub use identity::{InstrumentIdentity, InstrumentOptions, InstrumentTypes, MeasurementTypes, ModelSeries};
pub use scope::VicpOscilloscope;
pub use simulated::SimulatedScope;
