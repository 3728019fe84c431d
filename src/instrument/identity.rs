//! Instrument identity and installed options.
//!
//! Populated once while connecting, from `*IDN?` and `*OPT?`, and never
//! changed afterwards.

use crate::error::{AppResult, VicpError};
use bitflags::bitflags;
use std::fmt;

/// Coarse product family. Only the series matters, not the exact SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSeries {
    /// WaveSurfer 3000 (`WS3...`)
    WaveSurfer3000,
    /// WaveRunner 8000 (`WAVERUNNER8...`)
    WaveRunner8000,
    /// Anything else speaking VICP
    Unknown,
}

impl ModelSeries {
    /// Classify a model string
    pub fn from_model(model: &str) -> Self {
        if model.starts_with("WS3") {
            ModelSeries::WaveSurfer3000
        } else if model.starts_with("WAVERUNNER8") {
            ModelSeries::WaveRunner8000
        } else {
            ModelSeries::Unknown
        }
    }
}

bitflags! {
    /// Roles the instrument can play
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstrumentTypes: u8 {
        /// Waveform acquisition
        const OSCILLOSCOPE = 0x01;
        /// Digital voltmeter option
        const METER = 0x02;
        /// Function generator option
        const FUNCTION_GENERATOR = 0x04;
    }
}

bitflags! {
    /// Quantities the built-in meter can report
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MeasurementTypes: u8 {
        /// DC voltage
        const DC_VOLTAGE = 0x01;
        /// DC RMS amplitude
        const DC_RMS_AMPLITUDE = 0x02;
        /// AC RMS amplitude
        const AC_RMS_AMPLITUDE = 0x04;
        /// Frequency
        const FREQUENCY = 0x08;
    }
}

/// Installed hardware options relevant to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstrumentOptions {
    /// `MSXX` mixed-signal option with an active logic probe
    pub logic_analyzer: bool,
    /// `DVM` digital voltmeter
    pub dvm: bool,
    /// `AFG` arbitrary function generator
    pub function_generator: bool,
}

impl InstrumentOptions {
    /// Interpret a `*OPT?` reply. Option codes the client does not use are ignored.
    ///
    /// `logic_analyzer` only reports that the option is licensed; whether a
    /// probe is attached is checked separately while connecting.
    pub fn from_reply(reply: &str) -> Self {
        let mut options = Self::default();
        for code in parse_option_codes(reply) {
            match code.as_str() {
                "MSXX" => options.logic_analyzer = true,
                "DVM" => options.dvm = true,
                "AFG" => options.function_generator = true,
                _ => {}
            }
        }
        options
    }
}

/// Split a `*OPT?` reply into option codes, stopping at a NUL and skipping `0` (no options).
pub fn parse_option_codes(reply: &str) -> Vec<String> {
    let reply = reply.split('\0').next().unwrap_or_default();
    reply
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty() && *code != "0")
        .map(str::to_string)
        .collect()
}

/// Who we are talking to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentIdentity {
    /// Manufacturer field
    pub vendor: String,
    /// Model field
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware version
    pub firmware: String,
    /// Product family
    pub series: ModelSeries,
    /// More than 8 bits per sample (model name contains `HD`)
    pub high_definition: bool,
    /// Installed options
    pub options: InstrumentOptions,
}

impl InstrumentIdentity {
    /// Parse `vendor,model,serial,firmware`
    pub fn from_idn(reply: &str) -> AppResult<Self> {
        let fields: Vec<&str> = reply.trim().splitn(4, ',').map(str::trim).collect();
        if fields.len() != 4 || fields.iter().any(|f| f.is_empty()) {
            return Err(VicpError::Protocol(format!("bad *IDN? response {:?}", reply)));
        }

        let model = fields[1].to_string();
        Ok(Self {
            vendor: fields[0].to_string(),
            series: ModelSeries::from_model(&model),
            high_definition: model.contains("HD"),
            serial: fields[2].to_string(),
            firmware: fields[3].to_string(),
            model,
            options: InstrumentOptions::default(),
        })
    }

    /// Number of analog inputs, encoded as the last digit of the model name
    pub fn analog_channel_count(&self) -> AppResult<usize> {
        self.model
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .filter(|&n| n > 0)
            .map(|n| n as usize)
            .ok_or_else(|| {
                VicpError::Protocol(format!(
                    "cannot derive analog channel count from model {:?}",
                    self.model
                ))
            })
    }

    /// Roles this instrument can play
    pub fn instrument_types(&self) -> InstrumentTypes {
        let mut types = InstrumentTypes::OSCILLOSCOPE;
        types.set(InstrumentTypes::METER, self.options.dvm);
        types.set(InstrumentTypes::FUNCTION_GENERATOR, self.options.function_generator);
        types
    }

    /// Quantities the meter can report (empty without the DVM option)
    pub fn measurement_types(&self) -> MeasurementTypes {
        if self.options.dvm {
            MeasurementTypes::all()
        } else {
            MeasurementTypes::empty()
        }
    }

    /// Waveform transfer format: 16-bit words for high-definition models, bytes otherwise
    pub fn comm_format_command(&self) -> &'static str {
        if self.high_definition {
            "COMM_FORMAT DEF9,WORD,BIN"
        } else {
            "COMM_FORMAT DEF9,BYTE,BIN"
        }
    }

    /// Bytes per raw sample in waveform blocks
    pub fn bytes_per_sample(&self) -> usize {
        if self.high_definition {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (serial {}, firmware {})",
            self.vendor, self.model, self.serial, self.firmware
        )
    }
}
