//! Function generator surface (`AFG` option).
//!
//! The generator has one output, `FUNC`. Setters are plain writes and
//! getters always ask the instrument.

use super::scope::{parse_number, VicpOscilloscope};
use crate::capabilities::{Generation, WaveShape};
use crate::error::{AppResult, VicpError};

const WAVESOURCE: &str = "app.wavesource";

/// Name of the single generator output
pub const GENERATOR_CHANNEL_NAME: &str = "FUNC";

impl VicpOscilloscope {
    fn require_generator(&self, channel: usize) -> AppResult<()> {
        if !self.identity.options.function_generator {
            return Err(VicpError::CapabilityMissing("AFG"));
        }
        if channel != 0 {
            return Err(VicpError::InvalidChannel(channel));
        }
        Ok(())
    }

    fn wavesource_query(&self, channel: usize, property: &str) -> AppResult<String> {
        self.require_generator(channel)?;
        self.query_string(&format!("VBS? 'return = {}.{}'", WAVESOURCE, property))
    }

    fn wavesource_number(&self, channel: usize, property: &str) -> AppResult<f64> {
        parse_number(&self.wavesource_query(channel, property)?)
    }

    fn wavesource_set(&self, channel: usize, property: &str, value: &str) -> AppResult<()> {
        self.require_generator(channel)?;
        self.session
            .send_command(&format!("VBS '{}.{} = {}'", WAVESOURCE, property, value))
    }
}

impl Generation for VicpOscilloscope {
    fn generator_channel_count(&self) -> usize {
        usize::from(self.identity.options.function_generator)
    }

    fn generator_channel_name(&self, channel: usize) -> AppResult<String> {
        self.require_generator(channel)?;
        Ok(GENERATOR_CHANNEL_NAME.to_string())
    }

    fn generator_active(&self, channel: usize) -> AppResult<bool> {
        let reply = self.wavesource_query(channel, "enable")?;
        match reply.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "true" | "-1" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(VicpError::Protocol(format!(
                "unexpected generator enable state {:?}",
                reply
            ))),
        }
    }

    fn set_generator_active(&self, channel: usize, on: bool) -> AppResult<()> {
        self.wavesource_set(channel, "enable", if on { "True" } else { "False" })
    }

    fn generator_shape(&self, channel: usize) -> AppResult<WaveShape> {
        let reply = self.wavesource_query(channel, "shape")?;
        WaveShape::from_vbs_name(reply.trim().trim_matches('"'))
            .ok_or_else(|| VicpError::Protocol(format!("unknown generator shape {:?}", reply)))
    }

    fn set_generator_shape(&self, channel: usize, shape: WaveShape) -> AppResult<()> {
        self.wavesource_set(channel, "shape", &format!("\"{}\"", shape))
    }

    fn generator_amplitude(&self, channel: usize) -> AppResult<f64> {
        self.wavesource_number(channel, "amplitude")
    }

    fn set_generator_amplitude(&self, channel: usize, amplitude: f64) -> AppResult<()> {
        self.wavesource_set(channel, "amplitude", &format!("{:.6}", amplitude))
    }

    fn generator_offset(&self, channel: usize) -> AppResult<f64> {
        self.wavesource_number(channel, "offset")
    }

    fn set_generator_offset(&self, channel: usize, offset: f64) -> AppResult<()> {
        self.wavesource_set(channel, "offset", &format!("{:.6}", offset))
    }

    fn generator_duty_cycle(&self, channel: usize) -> AppResult<f64> {
        // Instrument works in percent
        Ok(self.wavesource_number(channel, "dutycycle")? / 100.0)
    }

    fn set_generator_duty_cycle(&self, channel: usize, duty: f64) -> AppResult<()> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(VicpError::Unsupported(format!(
                "duty cycle {} outside 0..=1",
                duty
            )));
        }
        self.wavesource_set(channel, "dutycycle", &format!("{:.6}", duty * 100.0))
    }

    fn generator_frequency(&self, channel: usize) -> AppResult<f64> {
        self.wavesource_number(channel, "frequency")
    }

    fn set_generator_frequency(&self, channel: usize, hz: f64) -> AppResult<()> {
        self.wavesource_set(channel, "frequency", &format!("{:.6}", hz))
    }

    fn generator_rise_time(&self, channel: usize) -> AppResult<f64> {
        self.wavesource_number(channel, "risetime")
    }

    fn set_generator_rise_time(&self, channel: usize, seconds: f64) -> AppResult<()> {
        self.wavesource_set(channel, "risetime", &format!("{:e}", seconds))
    }

    fn generator_fall_time(&self, channel: usize) -> AppResult<f64> {
        self.wavesource_number(channel, "falltime")
    }

    fn set_generator_fall_time(&self, channel: usize, seconds: f64) -> AppResult<()> {
        self.wavesource_set(channel, "falltime", &format!("{:e}", seconds))
    }
}
