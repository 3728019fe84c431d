//! Instrument Capability Surfaces
//!
//! One physical instrument exposes several roles over the same VICP link.
//! Instead of a single monolithic interface, each role is a small trait and
//! the instrument implements the set it actually supports:
//!
//! - [`ChannelControl`]: per-channel vertical settings, served from the configuration cache
//! - [`Acquisition`]: trigger arming, trigger settings and waveform download
//! - [`Metering`]: the built-in digital voltmeter
//! - [`Generation`]: the built-in function generator
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is blocking; every call returns once the full exchange completed or failed
//! - Is thread-safe (requires Send + Sync) and takes `&self`
//! - Uses [`AppResult`] for errors
//!
//! Calls on different surfaces may come from different threads. They never
//! interleave on the wire because every exchange holds the link session lock.
//!
//! # Example
//!
//! ```no_run
//! use vicp_scope::capabilities::{Acquisition, ChannelControl, TriggerState};
//! use vicp_scope::error::AppResult;
//!
//! fn arm_and_wait<S: Acquisition + ChannelControl>(scope: &S) -> AppResult<()> {
//!     scope.set_voltage_range(0, 2.0)?;
//!     scope.start_single_trigger()?;
//!     while scope.poll_trigger()? != TriggerState::Triggered {
//!         std::thread::sleep(std::time::Duration::from_millis(10));
//!     }
//!     scope.acquire_data(false)?;
//!     Ok(())
//! }
//! ```

use crate::error::AppResult;
use crate::instrument::acquisition::Acquired;
use crate::instrument::channel::CouplingType;
use std::fmt;

/// Trigger state machine: `Idle -> Armed -> Triggered -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerState {
    /// Not acquiring
    #[default]
    Idle,
    /// Waiting for a trigger event
    Armed,
    /// A waveform is ready for download
    Triggered,
}

/// Edge trigger slope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    /// Rising edge
    Rising,
    /// Falling edge
    Falling,
    /// Either edge
    Change,
    /// Slope not reported by the instrument
    DontCare,
}

/// What the voltmeter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterMode {
    /// DC voltage
    DcVoltage,
    /// DC RMS amplitude
    DcRmsAmplitude,
    /// AC RMS amplitude
    AcRmsAmplitude,
    /// Frequency
    Frequency,
    /// DC current (reported, never selectable on this hardware)
    DcCurrent,
    /// AC current (reported, never selectable on this hardware)
    AcCurrent,
    /// Temperature (reported, never selectable on this hardware)
    Temperature,
}

impl MeterMode {
    /// Instrument spelling, if the voltmeter supports the mode
    pub fn vbs_name(self) -> Option<&'static str> {
        match self {
            MeterMode::DcVoltage => Some("DC"),
            MeterMode::DcRmsAmplitude => Some("DC RMS"),
            MeterMode::AcRmsAmplitude => Some("ACRMS"),
            MeterMode::Frequency => Some("Frequency"),
            _ => None,
        }
    }

    /// Parse the instrument spelling
    pub fn from_vbs_name(name: &str) -> Option<Self> {
        match name.trim() {
            "DC" => Some(MeterMode::DcVoltage),
            "DC RMS" => Some(MeterMode::DcRmsAmplitude),
            "ACRMS" => Some(MeterMode::AcRmsAmplitude),
            "Frequency" => Some(MeterMode::Frequency),
            _ => None,
        }
    }
}

/// Function generator output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveShape {
    /// Sine
    Sine,
    /// Square
    Square,
    /// Triangle
    Triangle,
    /// Pulse
    Pulse,
    /// Constant level
    Dc,
    /// Noise
    Noise,
    /// Arbitrary waveform memory
    Arbitrary,
}

impl WaveShape {
    /// Instrument spelling
    pub fn vbs_name(self) -> &'static str {
        match self {
            WaveShape::Sine => "Sine",
            WaveShape::Square => "Square",
            WaveShape::Triangle => "Triangle",
            WaveShape::Pulse => "Pulse",
            WaveShape::Dc => "DC",
            WaveShape::Noise => "Noise",
            WaveShape::Arbitrary => "Arbitrary",
        }
    }

    /// Parse the instrument spelling
    pub fn from_vbs_name(name: &str) -> Option<Self> {
        [
            WaveShape::Sine,
            WaveShape::Square,
            WaveShape::Triangle,
            WaveShape::Pulse,
            WaveShape::Dc,
            WaveShape::Noise,
            WaveShape::Arbitrary,
        ]
        .into_iter()
        .find(|s| s.vbs_name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for WaveShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.vbs_name())
    }
}

/// Capability: Channel Configuration
///
/// Vertical settings of the analog inputs. Getters are answered from the
/// configuration cache when the field is valid and query the instrument
/// otherwise; setters write the instrument and then cache the value sent.
///
/// # Contract
/// - Channel indices refer to the detected channel roster
/// - Voltage range is full scale (volts per division times the division count)
/// - Bandwidth limit is in MHz, 0 meaning no limit
pub trait ChannelControl: Send + Sync {
    /// Number of channels in the roster (analog, external trigger, digital)
    fn channel_count(&self) -> usize;

    /// Whether the channel is acquired
    fn is_channel_enabled(&self, channel: usize) -> AppResult<bool>;

    /// Turn a channel on
    fn enable_channel(&self, channel: usize) -> AppResult<()>;

    /// Turn a channel off
    fn disable_channel(&self, channel: usize) -> AppResult<()>;

    /// Input coupling
    fn channel_coupling(&self, channel: usize) -> AppResult<CouplingType>;

    /// Set input coupling
    fn set_channel_coupling(&self, channel: usize, coupling: CouplingType) -> AppResult<()>;

    /// Probe attenuation factor
    fn channel_attenuation(&self, channel: usize) -> AppResult<f64>;

    /// Set probe attenuation factor
    fn set_channel_attenuation(&self, channel: usize, attenuation: f64) -> AppResult<()>;

    /// Bandwidth limit in MHz (0 = off)
    fn channel_bandwidth_limit(&self, channel: usize) -> AppResult<usize>;

    /// Set bandwidth limit in MHz (0 = off)
    fn set_channel_bandwidth_limit(&self, channel: usize, limit_mhz: usize) -> AppResult<()>;

    /// Full-scale voltage range
    fn voltage_range(&self, channel: usize) -> AppResult<f64>;

    /// Set full-scale voltage range
    fn set_voltage_range(&self, channel: usize, range: f64) -> AppResult<()>;

    /// Vertical offset in volts
    fn channel_offset(&self, channel: usize) -> AppResult<f64>;

    /// Set vertical offset in volts
    fn set_channel_offset(&self, channel: usize, offset: f64) -> AppResult<()>;

    /// Mark every cached setting stale. The next getter of each field queries the instrument.
    fn flush_config_cache(&self);
}

/// Capability: Acquisition and Trigger
///
/// # Contract
/// - `start` arms continuously: after each download the trigger is re-armed
/// - `start_single_trigger` arms once: after the download the state returns to `Idle`
/// - `poll_trigger` performs one status exchange and never waits for an event
/// - `acquire_data` downloads every enabled analog channel of the last capture
///
/// # Thread Safety
/// - Trigger state lives behind interior mutability
/// - A download holds the link for its whole duration
pub trait Acquisition: Send + Sync {
    /// Arm continuously
    fn start(&self) -> AppResult<()>;

    /// Arm for one capture
    fn start_single_trigger(&self) -> AppResult<()>;

    /// Disarm and discard queued waveforms
    fn stop(&self) -> AppResult<()>;

    /// Refresh and return the trigger state
    fn poll_trigger(&self) -> AppResult<TriggerState>;

    /// True while armed and waiting for an event (no I/O)
    fn is_trigger_armed(&self) -> bool;

    /// Download the last capture.
    ///
    /// With `to_queue` every waveform set goes to the pending queue; otherwise
    /// the first set is returned and further segments are queued.
    fn acquire_data(&self, to_queue: bool) -> AppResult<Acquired>;

    /// Trigger source channel index
    fn trigger_channel(&self) -> AppResult<usize>;

    /// Select the trigger source channel
    fn set_trigger_channel(&self, channel: usize) -> AppResult<()>;

    /// Trigger level in volts
    fn trigger_level(&self) -> AppResult<f64>;

    /// Set trigger level in volts
    fn set_trigger_level(&self, level: f64) -> AppResult<()>;

    /// Trigger slope
    fn trigger_type(&self) -> AppResult<TriggerType>;

    /// Set trigger slope
    fn set_trigger_type(&self, kind: TriggerType) -> AppResult<()>;
}

/// Capability: Digital Voltmeter
///
/// The voltmeter runs independently of the trigger state. Starting and
/// stopping it is an explicit mode change.
///
/// # Contract
/// - Meter channel indices are analog channel indices
/// - Unsupported quantities fail with `Unsupported` rather than returning a placeholder
pub trait Metering: Send + Sync {
    /// Number of inputs the meter can measure
    fn meter_channel_count(&self) -> usize;

    /// Display name of a meter input
    fn meter_channel_name(&self, channel: usize) -> AppResult<String>;

    /// Input currently feeding the meter
    fn current_meter_channel(&self) -> AppResult<usize>;

    /// Select the input feeding the meter
    fn set_current_meter_channel(&self, channel: usize) -> AppResult<()>;

    /// Enable the meter
    fn start_meter(&self) -> AppResult<()>;

    /// Disable the meter
    fn stop_meter(&self) -> AppResult<()>;

    /// Whether the meter was started by this client
    fn is_meter_running(&self) -> bool;

    /// Auto-ranging state
    fn meter_autorange(&self) -> AppResult<bool>;

    /// Enable or disable auto-ranging
    fn set_meter_autorange(&self, enable: bool) -> AppResult<()>;

    /// Measurement mode
    fn meter_mode(&self) -> AppResult<MeterMode>;

    /// Select the measurement mode
    fn set_meter_mode(&self, mode: MeterMode) -> AppResult<()>;

    /// Voltage reading
    fn voltage(&self) -> AppResult<f64>;

    /// Peak-to-peak amplitude reading
    fn peak_to_peak(&self) -> AppResult<f64>;

    /// Frequency reading in Hz
    fn frequency(&self) -> AppResult<f64>;

    /// Current reading
    fn current(&self) -> AppResult<f64>;

    /// Temperature reading
    fn temperature(&self) -> AppResult<f64>;
}

/// Capability: Function Generator
///
/// Setters write straight to the instrument; nothing is cached.
pub trait Generation: Send + Sync {
    /// Number of generator outputs
    fn generator_channel_count(&self) -> usize;

    /// Name of a generator output
    fn generator_channel_name(&self, channel: usize) -> AppResult<String>;

    /// Output enabled
    fn generator_active(&self, channel: usize) -> AppResult<bool>;

    /// Enable or disable the output
    fn set_generator_active(&self, channel: usize, on: bool) -> AppResult<()>;

    /// Output shape
    fn generator_shape(&self, channel: usize) -> AppResult<WaveShape>;

    /// Set output shape
    fn set_generator_shape(&self, channel: usize, shape: WaveShape) -> AppResult<()>;

    /// Amplitude in volts
    fn generator_amplitude(&self, channel: usize) -> AppResult<f64>;

    /// Set amplitude in volts
    fn set_generator_amplitude(&self, channel: usize, amplitude: f64) -> AppResult<()>;

    /// Offset in volts
    fn generator_offset(&self, channel: usize) -> AppResult<f64>;

    /// Set offset in volts
    fn set_generator_offset(&self, channel: usize, offset: f64) -> AppResult<()>;

    /// Duty cycle as a fraction (0..=1)
    fn generator_duty_cycle(&self, channel: usize) -> AppResult<f64>;

    /// Set duty cycle as a fraction (0..=1)
    fn set_generator_duty_cycle(&self, channel: usize, duty: f64) -> AppResult<()>;

    /// Frequency in Hz
    fn generator_frequency(&self, channel: usize) -> AppResult<f64>;

    /// Set frequency in Hz
    fn set_generator_frequency(&self, channel: usize, hz: f64) -> AppResult<()>;

    /// Rise time in seconds
    fn generator_rise_time(&self, channel: usize) -> AppResult<f64>;

    /// Set rise time in seconds
    fn set_generator_rise_time(&self, channel: usize, seconds: f64) -> AppResult<()>;

    /// Fall time in seconds
    fn generator_fall_time(&self, channel: usize) -> AppResult<f64>;

    /// Set fall time in seconds
    fn set_generator_fall_time(&self, channel: usize, seconds: f64) -> AppResult<()>;
}
