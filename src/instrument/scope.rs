//! The instrument object.
//!
//! [`VicpOscilloscope`] owns one link session, the configuration cache and
//! the channel roster for the lifetime of a connection, and implements every
//! capability surface on top of them. It is `Send + Sync`; share it between
//! threads with an `Arc`.
//!
//! # Lock order
//!
//! The transport lock (inside [`LinkSession`]) is always taken before the
//! cache lock, and the cache lock is only held to read or store a value.
//! A cache miss and a setter both hold the transport lock from the
//! instrument exchange until the cache is updated, so a query and a write
//! of the same setting are never interleaved. A valid cache entry is
//! answered without touching the transport lock at all.
//! Trigger state has a third small lock that is only taken while the
//! transport lock is already held.

use super::acquisition::{PendingWaveforms, TriggerControl};
use super::channel::{ChannelKind, ChannelRoster, CouplingType, DIGITAL_CHANNEL_COUNT};
use super::digital::{parse_selected_lines, LineSelection, DIGITAL_QUERY};
use super::identity::{InstrumentIdentity, InstrumentOptions, InstrumentTypes, MeasurementTypes};
use crate::cache::{CacheKey, CachedValue, ChannelField, ConfigCache};
use crate::capabilities::{Acquisition, ChannelControl};
use crate::config::VicpConfig;
use crate::error::{AppResult, VicpError};
use crate::protocol::{BlockReader, LinkSession, SessionGuard};
use crate::transport::{TcpTransport, Transport};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use tracing::{debug, info, warn};

/// Screen height in vertical divisions on every supported model
pub const VERTICAL_DIVISIONS: f64 = 8.0;

/// Oscilloscope with optional voltmeter and function generator, over VICP
pub struct VicpOscilloscope {
    pub(crate) session: LinkSession,
    pub(crate) cache: ConfigCache,
    pub(crate) identity: InstrumentIdentity,
    pub(crate) roster: ChannelRoster,
    pub(crate) trigger: Mutex<TriggerControl>,
    pub(crate) pending: PendingWaveforms,
    pub(crate) meter_running: AtomicBool,
}

impl VicpOscilloscope {
    /// Connect over TCP to the instrument named in `config.connection`
    pub fn connect(config: &VicpConfig) -> AppResult<Self> {
        let transport = TcpTransport::open(
            &config.connection.host,
            config.connection.port,
            &config.connection,
        )?;
        Self::from_transport(Box::new(transport), config)
    }

    /// Run connection setup over an already-open transport.
    ///
    /// Turns off response headers, identifies the instrument, detects
    /// channels and options, selects the waveform transfer format and clears
    /// the trigger state register.
    pub fn from_transport(transport: Box<dyn Transport>, config: &VicpConfig) -> AppResult<Self> {
        let session = LinkSession::with_config(transport, &config.link);
        let (identity, roster, selection) = detect(&session)?;

        let scope = Self {
            session,
            cache: ConfigCache::new(roster.len()),
            identity,
            roster,
            trigger: Mutex::new(TriggerControl::default()),
            pending: PendingWaveforms::new(config.acquisition.queue_capacity),
            meter_running: AtomicBool::new(false),
        };

        scope.flush_config_cache();
        if let Some(lines) = selection {
            scope.store_digital_selection(&lines)?;
        }
        scope.poll_trigger()?;

        info!(
            instrument = %scope.identity,
            analog = scope.roster.analog_count(),
            digital = scope.roster.digital_count(),
            "Instrument ready"
        );
        Ok(scope)
    }

    /// Identity read at connection time
    pub fn identity(&self) -> &InstrumentIdentity {
        &self.identity
    }

    /// Detected channels
    pub fn roster(&self) -> &ChannelRoster {
        &self.roster
    }

    /// Configuration cache, for inspection
    pub fn cache(&self) -> &ConfigCache {
        &self.cache
    }

    /// The link session, for commands outside the capability surfaces
    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    /// Roles this instrument can play
    pub fn instrument_types(&self) -> InstrumentTypes {
        self.identity.instrument_types()
    }

    /// Quantities the voltmeter can report
    pub fn measurement_types(&self) -> MeasurementTypes {
        self.identity.measurement_types()
    }

    /// Close the connection
    pub fn close(&self) -> AppResult<()> {
        self.session.close()
    }

    /// Send a query and read its reply as trimmed text
    pub(crate) fn query_string(&self, command: &str) -> AppResult<String> {
        let link = self.session.lock();
        link.send_command(command)?;
        BlockReader::new(&link).read_single_block_string(true)
    }

    /// Send a query and parse a numeric reply
    pub(crate) fn query_f64(&self, command: &str) -> AppResult<f64> {
        let reply = self.query_string(command)?;
        parse_number(&reply)
    }

    /// Refresh the enabled flag of every analog channel not already cached.
    ///
    /// All `TRACE?` queries are sent before the first reply is read, so N
    /// channels cost one round trip instead of N. Results are stored under a
    /// single cache lock acquisition.
    pub fn bulk_check_channel_enable_state(&self) -> AppResult<()> {
        let uncached: Vec<_> = self
            .roster
            .analog_channels()
            .filter(|c| {
                self.cache
                    .get_valid(CacheKey::Channel(c.index, ChannelField::Enabled))
                    .is_none()
            })
            .collect();
        if uncached.is_empty() {
            return Ok(());
        }

        let link = self.session.lock();
        for channel in &uncached {
            link.send_command(&format!("{}:TRACE?", channel.hw_name))?;
        }
        let reader = BlockReader::new(&link);
        let mut states = Vec::with_capacity(uncached.len());
        for channel in &uncached {
            let reply = reader.read_single_block_string(true)?;
            states.push((
                CacheKey::Channel(channel.index, ChannelField::Enabled),
                CachedValue::Flag(reply.trim() != "OFF"),
            ));
        }
        debug!(channels = states.len(), "Channel enable states refreshed");
        self.cache.put_many(states)
    }

    /// Cache the enabled flag of every digital line
    pub(crate) fn store_digital_selection(&self, lines: &LineSelection) -> AppResult<()> {
        self.cache.put_many(self.roster.digital_channels().zip(lines).map(|(channel, on)| {
            (
                CacheKey::Channel(channel.index, ChannelField::Enabled),
                CachedValue::Flag(*on),
            )
        }))
    }

    /// Ask the logic analyzer which lines are selected and cache the answer
    fn refresh_digital_selection(&self) -> AppResult<LineSelection> {
        let link = self.session.lock();
        link.send_command(DIGITAL_QUERY)?;
        let data = BlockReader::new(&link).read_waveform_block()?;
        let lines = parse_selected_lines(&String::from_utf8_lossy(&data))?.ok_or_else(|| {
            VicpError::Protocol("logic analyzer reply has no SelectedLines field".into())
        })?;
        self.store_digital_selection(&lines)?;
        debug!(
            selected = lines.iter().filter(|l| **l).count(),
            "Logic analyzer selection refreshed"
        );
        Ok(lines)
    }

    /// Cached value of `key`, asking the instrument through `fetch` on a miss.
    ///
    /// The link is held from the query until the reply is stored.
    pub(crate) fn read_cached<F>(&self, key: CacheKey, fetch: F) -> AppResult<CachedValue>
    where
        F: FnOnce() -> AppResult<CachedValue>,
    {
        if let Some(value) = self.cache.get_valid(key) {
            return Ok(value);
        }
        let _link = self.session.lock();
        self.cache.read_through(key, fetch)
    }

    /// Send `command` and cache `value` for `key` once it was written
    pub(crate) fn write_cached(
        &self,
        key: CacheKey,
        value: CachedValue,
        command: &str,
    ) -> AppResult<()> {
        let link = self.session.lock();
        self.cache.write_through(key, value, || link.send_command(command))
    }

    fn cached_real<F>(&self, channel: usize, field: ChannelField, fetch: F) -> AppResult<f64>
    where
        F: FnOnce(&str) -> AppResult<f64>,
    {
        let hw_name = self.roster.analog(channel)?.hw_name.as_str();
        let value = self.read_cached(CacheKey::Channel(channel, field), || {
            Ok(CachedValue::Real(fetch(hw_name)?))
        })?;
        value
            .as_real()
            .ok_or_else(|| VicpError::Protocol(format!("cached {:?} has wrong type", field)))
    }

    fn write_channel(
        &self,
        channel: usize,
        field: ChannelField,
        value: CachedValue,
        command: String,
    ) -> AppResult<()> {
        self.roster.analog(channel)?;
        self.write_cached(CacheKey::Channel(channel, field), value, &command)
    }
}

/// Format a setting for the instrument without losing precision.
///
/// Returns the text to send and the value the instrument will parse from it,
/// which is what gets cached.
pub(crate) fn format_setting(value: f64) -> AppResult<(String, f64)> {
    let text = format!("{:E}", value);
    let sent = parse_number(&text)?;
    Ok((text, sent))
}

/// Parse a numeric reply, tolerating surrounding whitespace and quotes
pub(crate) fn parse_number(reply: &str) -> AppResult<f64> {
    let text = reply.trim().trim_matches('"').trim();
    text.parse()
        .map_err(|_| VicpError::Protocol(format!("expected a number, got {:?}", reply)))
}

/// Bandwidth limit token (`OFF`, `ON`, `200MHZ`, `1GHZ`) in MHz
fn parse_bandwidth(token: &str) -> Option<usize> {
    let token = token.trim().to_ascii_uppercase();
    match token.as_str() {
        "OFF" => Some(0),
        // ON selects the lowest limit
        "ON" => Some(20),
        _ => {
            if let Some(mhz) = token.strip_suffix("MHZ") {
                mhz.parse().ok()
            } else if let Some(ghz) = token.strip_suffix("GHZ") {
                ghz.parse::<usize>().ok().map(|g| g * 1000)
            } else {
                None
            }
        }
    }
}

/// Connection-time detection. Runs entirely under one session lock.
fn detect(
    session: &LinkSession,
) -> AppResult<(InstrumentIdentity, ChannelRoster, Option<LineSelection>)> {
    let link = session.lock();
    let reader = BlockReader::new(&link);

    link.send_command("CHDR OFF")?;
    link.send_command("*IDN?")?;
    let mut identity = InstrumentIdentity::from_idn(&reader.read_single_block_string(true)?)?;
    let analog = identity.analog_channel_count()?;
    debug!(model = %identity.model, analog, "Identified instrument");

    link.send_command("*OPT?")?;
    let reply = reader.read_single_block_string(true)?;
    identity.options = InstrumentOptions::from_reply(&reply);
    for code in super::identity::parse_option_codes(&reply) {
        debug!(option = %code, "Installed option");
    }

    let selection = if identity.options.logic_analyzer {
        probe_digital_channels(&link)?
    } else {
        None
    };

    if identity.options.dvm {
        link.send_command("VBS 'app.acquisition.DVM.AutoRange = 0'")?;
    }

    link.send_command(identity.comm_format_command())?;

    let digital = if selection.is_some() {
        DIGITAL_CHANNEL_COUNT
    } else {
        0
    };
    Ok((identity, ChannelRoster::new(analog, digital), selection))
}

/// Selected logic lines, or `None` when there is no probe or no line is selected
fn probe_digital_channels(link: &SessionGuard<'_>) -> AppResult<Option<LineSelection>> {
    link.send_command("WAVEFORM_SETUP SP,0,NP,0,FP,0,SN,0")?;
    link.send_command(DIGITAL_QUERY)?;
    let data = BlockReader::new(link).read_waveform_block()?;
    if data.is_empty() {
        debug!("No logic analyzer probe connected");
        return Ok(None);
    }

    let lines = match parse_selected_lines(&String::from_utf8_lossy(&data))? {
        Some(lines) => lines,
        None => {
            warn!("Logic analyzer reply has no SelectedLines field");
            return Ok(None);
        }
    };
    if !lines.contains(&true) {
        debug!("No digital channels enabled");
        return Ok(None);
    }
    Ok(Some(lines))
}

impl ChannelControl for VicpOscilloscope {
    fn channel_count(&self) -> usize {
        self.roster.len()
    }

    fn is_channel_enabled(&self, channel: usize) -> AppResult<bool> {
        match self.roster.get(channel)?.kind {
            ChannelKind::ExternalTrigger => return Ok(false),
            ChannelKind::Digital => {
                let key = CacheKey::Channel(channel, ChannelField::Enabled);
                if let Some(on) = self.cache.get_valid(key).and_then(|v| v.as_flag()) {
                    return Ok(on);
                }
                // One query answers for all sixteen lines
                let lines = self.refresh_digital_selection()?;
                let line = self.roster.digital_line(channel).unwrap_or_default();
                return Ok(lines.get(line).copied().unwrap_or(false));
            }
            ChannelKind::Analog => {}
        }
        let hw_name = self.roster.get(channel)?.hw_name.as_str();
        let value = self.read_cached(CacheKey::Channel(channel, ChannelField::Enabled), || {
            let reply = self.query_string(&format!("{}:TRACE?", hw_name))?;
            Ok(CachedValue::Flag(reply.trim() != "OFF"))
        })?;
        value
            .as_flag()
            .ok_or_else(|| VicpError::Protocol("cached enable flag has wrong type".into()))
    }

    fn enable_channel(&self, channel: usize) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        self.write_channel(
            channel,
            ChannelField::Enabled,
            CachedValue::Flag(true),
            format!("{}:TRACE ON", hw_name),
        )
    }

    fn disable_channel(&self, channel: usize) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        self.write_channel(
            channel,
            ChannelField::Enabled,
            CachedValue::Flag(false),
            format!("{}:TRACE OFF", hw_name),
        )
    }

    fn channel_coupling(&self, channel: usize) -> AppResult<CouplingType> {
        let entry = self.roster.get(channel)?;
        if !entry.is_analog() {
            return Ok(CouplingType::Synthetic);
        }
        let value = self.read_cached(CacheKey::Channel(channel, ChannelField::Coupling), || {
            let reply = self.query_string(&format!("{}:COUPLING?", entry.hw_name))?;
            CouplingType::from_code(&reply)
                .map(CachedValue::Coupling)
                .ok_or_else(|| VicpError::Protocol(format!("unknown coupling {:?}", reply)))
        })?;
        value
            .as_coupling()
            .ok_or_else(|| VicpError::Protocol("cached coupling has wrong type".into()))
    }

    fn set_channel_coupling(&self, channel: usize, coupling: CouplingType) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        let code = coupling.code().ok_or_else(|| {
            VicpError::Unsupported("synthetic coupling cannot be selected".into())
        })?;
        self.write_channel(
            channel,
            ChannelField::Coupling,
            CachedValue::Coupling(coupling),
            format!("{}:COUPLING {}", hw_name, code),
        )
    }

    fn channel_attenuation(&self, channel: usize) -> AppResult<f64> {
        if !self.roster.get(channel)?.is_analog() {
            return Ok(1.0);
        }
        self.cached_real(channel, ChannelField::Attenuation, |hw| {
            self.query_f64(&format!("{}:ATTENUATION?", hw))
        })
    }

    fn set_channel_attenuation(&self, channel: usize, attenuation: f64) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        let (text, sent) = format_setting(attenuation)?;
        self.write_channel(
            channel,
            ChannelField::Attenuation,
            CachedValue::Real(sent),
            format!("{}:ATTENUATION {}", hw_name, text),
        )
    }

    fn channel_bandwidth_limit(&self, channel: usize) -> AppResult<usize> {
        let entry = self.roster.get(channel)?;
        if !entry.is_analog() {
            return Ok(0);
        }
        let value = self.read_cached(
            CacheKey::Channel(channel, ChannelField::BandwidthLimit),
            || {
                // Reply lists every channel: C1,OFF,C2,200MHZ,...
                let reply = self.query_string("BANDWIDTH_LIMIT?")?;
                let mut fields = reply.split(',').map(str::trim);
                let token = fields
                    .by_ref()
                    .find(|f| *f == entry.hw_name)
                    .and_then(|_| fields.next())
                    .ok_or_else(|| {
                        VicpError::Protocol(format!(
                            "{} missing from bandwidth reply {:?}",
                            entry.hw_name, reply
                        ))
                    })?;
                parse_bandwidth(token).map(CachedValue::Count).ok_or_else(|| {
                    VicpError::Protocol(format!("unknown bandwidth limit {:?}", token))
                })
            },
        )?;
        value
            .as_count()
            .ok_or_else(|| VicpError::Protocol("cached bandwidth has wrong type".into()))
    }

    fn set_channel_bandwidth_limit(&self, channel: usize, limit_mhz: usize) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        let command = if limit_mhz == 0 {
            format!("BANDWIDTH_LIMIT {},OFF", hw_name)
        } else {
            format!("BANDWIDTH_LIMIT {},{}MHZ", hw_name, limit_mhz)
        };
        self.write_channel(
            channel,
            ChannelField::BandwidthLimit,
            CachedValue::Count(limit_mhz),
            command,
        )
    }

    fn voltage_range(&self, channel: usize) -> AppResult<f64> {
        self.cached_real(channel, ChannelField::VoltageRange, |hw| {
            Ok(self.query_f64(&format!("{}:VOLT_DIV?", hw))? * VERTICAL_DIVISIONS)
        })
    }

    fn set_voltage_range(&self, channel: usize, range: f64) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        let (text, volts_per_div) = format_setting(range / VERTICAL_DIVISIONS)?;
        self.write_channel(
            channel,
            ChannelField::VoltageRange,
            CachedValue::Real(volts_per_div * VERTICAL_DIVISIONS),
            format!("{}:VOLT_DIV {}", hw_name, text),
        )
    }

    fn channel_offset(&self, channel: usize) -> AppResult<f64> {
        self.cached_real(channel, ChannelField::Offset, |hw| {
            self.query_f64(&format!("{}:OFFSET?", hw))
        })
    }

    fn set_channel_offset(&self, channel: usize, offset: f64) -> AppResult<()> {
        let hw_name = &self.roster.analog(channel)?.hw_name;
        let (text, sent) = format_setting(offset)?;
        self.write_channel(
            channel,
            ChannelField::Offset,
            CachedValue::Real(sent),
            format!("{}:OFFSET {}", hw_name, text),
        )
    }

    fn flush_config_cache(&self) {
        self.cache.invalidate_all();
        debug!("Configuration cache flushed");
    }
}
