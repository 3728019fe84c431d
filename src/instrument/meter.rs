//! Digital voltmeter surface (`DVM` option).
//!
//! Everything goes through the instrument's automation interface
//! (`VBS` / `VBS?`). Readings are never cached.

use super::scope::{parse_number, VicpOscilloscope};
use crate::capabilities::{MeterMode, Metering};
use crate::error::{AppResult, VicpError};
use std::sync::atomic::Ordering;
use tracing::debug;

const DVM: &str = "app.acquisition.DVM";

impl VicpOscilloscope {
    fn require_dvm(&self) -> AppResult<()> {
        if self.identity.options.dvm {
            Ok(())
        } else {
            Err(VicpError::CapabilityMissing("DVM"))
        }
    }

    fn dvm_query(&self, property: &str) -> AppResult<String> {
        self.require_dvm()?;
        self.query_string(&format!("VBS? 'return = {}.{}'", DVM, property))
    }

    fn dvm_set(&self, property: &str, value: &str) -> AppResult<()> {
        self.require_dvm()?;
        self.session
            .send_command(&format!("VBS '{}.{} = {}'", DVM, property, value))
    }

    fn dvm_reading(&self, property: &str) -> AppResult<f64> {
        parse_number(&self.dvm_query(property)?)
    }
}

impl Metering for VicpOscilloscope {
    fn meter_channel_count(&self) -> usize {
        if self.identity.options.dvm {
            self.roster.analog_count()
        } else {
            0
        }
    }

    fn meter_channel_name(&self, channel: usize) -> AppResult<String> {
        self.require_dvm()?;
        Ok(self.roster.analog(channel)?.hw_name.clone())
    }

    fn current_meter_channel(&self) -> AppResult<usize> {
        let reply = self.dvm_query("DvmSource")?;
        let name = reply.trim().trim_matches('"');
        // Inputs are numbered from 1 on the instrument
        name.strip_prefix('C')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|&n| n >= 1 && n <= self.roster.analog_count())
            .map(|n| n - 1)
            .ok_or_else(|| VicpError::Protocol(format!("unknown meter source {:?}", reply)))
    }

    fn set_current_meter_channel(&self, channel: usize) -> AppResult<()> {
        self.require_dvm()?;
        let hw_name = self.roster.analog(channel)?.hw_name.clone();
        self.dvm_set("DvmSource", &format!("\"{}\"", hw_name))
    }

    fn start_meter(&self) -> AppResult<()> {
        self.dvm_set("DvmEnable", "1")?;
        self.meter_running.store(true, Ordering::SeqCst);
        debug!("Meter started");
        Ok(())
    }

    fn stop_meter(&self) -> AppResult<()> {
        self.dvm_set("DvmEnable", "0")?;
        self.meter_running.store(false, Ordering::SeqCst);
        debug!("Meter stopped");
        Ok(())
    }

    fn is_meter_running(&self) -> bool {
        self.meter_running.load(Ordering::SeqCst)
    }

    fn meter_autorange(&self) -> AppResult<bool> {
        Ok(self.dvm_reading("AutoRange")? != 0.0)
    }

    fn set_meter_autorange(&self, enable: bool) -> AppResult<()> {
        self.dvm_set("AutoRange", if enable { "1" } else { "0" })
    }

    fn meter_mode(&self) -> AppResult<MeterMode> {
        let reply = self.dvm_query("DvmMode")?;
        MeterMode::from_vbs_name(reply.trim().trim_matches('"'))
            .ok_or_else(|| VicpError::Protocol(format!("unknown meter mode {:?}", reply)))
    }

    fn set_meter_mode(&self, mode: MeterMode) -> AppResult<()> {
        let name = mode.vbs_name().ok_or_else(|| {
            VicpError::Unsupported(format!("meter mode {:?} is not available", mode))
        })?;
        self.dvm_set("DvmMode", &format!("\"{}\"", name))
    }

    fn voltage(&self) -> AppResult<f64> {
        self.dvm_reading("Voltage")
    }

    fn peak_to_peak(&self) -> AppResult<f64> {
        self.dvm_reading("Amplitude")
    }

    fn frequency(&self) -> AppResult<f64> {
        self.dvm_reading("Frequency")
    }

    fn current(&self) -> AppResult<f64> {
        self.require_dvm()?;
        Err(VicpError::Unsupported(
            "the voltmeter cannot measure current".into(),
        ))
    }

    fn temperature(&self) -> AppResult<f64> {
        self.require_dvm()?;
        Err(VicpError::Unsupported(
            "the voltmeter cannot measure temperature".into(),
        ))
    }
}
