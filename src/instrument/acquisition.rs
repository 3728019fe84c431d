//! Trigger control and waveform download.
//!
//! The instrument is always run in single-capture mode. Continuous
//! acquisition is emulated by re-arming after each download, which keeps the
//! descriptor and the data of one capture consistent.
//!
//! A download is pipelined: every `WF? DESC` request is sent before the first
//! descriptor is read, then every `WF? DAT1` request before the first data
//! block is read. The session lock is held throughout so nothing else can
//! interleave on the link. Logic analyzer lines, when any is selected, are
//! fetched last in the same exchange.

use super::channel::Channel;
use super::digital::{DigitalCapture, DigitalWaveform, DIGITAL_QUERY};
use super::identity::ModelSeries;
use super::scope::{format_setting, VicpOscilloscope};
use crate::capabilities::{Acquisition, ChannelControl, TriggerState, TriggerType};
use crate::cache::{CacheKey, CachedValue, TriggerField};
use crate::error::{AppResult, VicpError};
use crate::protocol::{BlockReader, SessionGuard};
use bytes::{Buf, Bytes};
use crossbeam_queue::ArrayQueue;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Size of the fixed part of a waveform descriptor we rely on
pub const WAVEDESC_MIN_LEN: usize = 310;

/// `INR?` bit: a new waveform has been acquired
pub const INR_NEW_WAVEFORM: u32 = 0x0001;

/// `INR?` bit: the trigger is armed
pub const INR_TRIGGER_READY: u32 = 0x2000;

/// Capture time stamp from the descriptor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorTimestamp {
    /// Seconds including the fractional part
    pub seconds: f64,
    /// Minutes
    pub minutes: u8,
    /// Hours
    pub hours: u8,
    /// Day of month
    pub day: u8,
    /// Month
    pub month: u8,
    /// Year
    pub year: u16,
}

/// Metadata of one channel's capture, decoded from a `WF? DESC` block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveDescriptor {
    /// Length of the descriptor itself
    pub wavedesc_len: u32,
    /// Length of the user text block
    pub usertext_len: u32,
    /// Length of the trigger time array (16 bytes per segment)
    pub trigtime_len: u32,
    /// Volts per code
    pub vertical_gain: f32,
    /// Volts subtracted after scaling
    pub vertical_offset: f32,
    /// Seconds between samples
    pub horizontal_interval: f32,
    /// Seconds from the first sample to the trigger
    pub horizontal_offset: f64,
    /// Capture time
    pub timestamp: DescriptorTimestamp,
}

impl WaveDescriptor {
    /// Decode a little-endian descriptor block
    pub fn parse(raw: &[u8]) -> AppResult<Self> {
        if raw.len() < WAVEDESC_MIN_LEN {
            return Err(VicpError::Protocol(format!(
                "waveform descriptor too short: {} bytes",
                raw.len()
            )));
        }

        let at = |offset: usize| &raw[offset..];
        Ok(Self {
            wavedesc_len: at(36).get_u32_le(),
            usertext_len: at(40).get_u32_le(),
            trigtime_len: at(48).get_u32_le(),
            vertical_gain: at(156).get_f32_le(),
            vertical_offset: at(160).get_f32_le(),
            horizontal_interval: at(176).get_f32_le(),
            horizontal_offset: at(180).get_f64_le(),
            timestamp: DescriptorTimestamp {
                seconds: at(296).get_f64_le(),
                minutes: raw[304],
                hours: raw[305],
                day: raw[306],
                month: raw[307],
                year: at(308).get_u16_le(),
            },
        })
    }

    /// Number of segments in the capture (1 unless sequence mode was used)
    pub fn num_sequences(&self) -> usize {
        if self.trigtime_len > 0 {
            (self.trigtime_len / 16).max(1) as usize
        } else {
            1
        }
    }
}

/// One channel's samples for one segment
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Roster index
    pub channel: usize,
    /// Segment number within the capture
    pub segment: usize,
    /// Descriptor of the capture
    pub descriptor: WaveDescriptor,
    /// Trigger time of this segment relative to the first, for sequence captures
    pub trigger_delta: Option<f64>,
    /// Raw sample codes, `bytes_per_sample` each
    pub samples: Bytes,
    /// 1 for byte transfers, 2 for word transfers
    pub bytes_per_sample: usize,
}

impl Waveform {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len() / self.bytes_per_sample.max(1)
    }

    /// True if no samples were transferred
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Waveforms captured together, keyed by roster index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveformSet {
    waveforms: BTreeMap<usize, Waveform>,
    digital: BTreeMap<usize, DigitalWaveform>,
}

impl WaveformSet {
    /// Add a channel's waveform
    pub fn insert(&mut self, waveform: Waveform) {
        self.waveforms.insert(waveform.channel, waveform);
    }

    /// Add a logic line's samples
    pub fn insert_digital(&mut self, waveform: DigitalWaveform) {
        self.digital.insert(waveform.channel, waveform);
    }

    /// Analog waveform of a channel, if it was enabled
    pub fn get(&self, channel: usize) -> Option<&Waveform> {
        self.waveforms.get(&channel)
    }

    /// Samples of a digital channel, if it was captured
    pub fn digital(&self, channel: usize) -> Option<&DigitalWaveform> {
        self.digital.get(&channel)
    }

    /// Number of channels in the set, analog and digital
    pub fn len(&self) -> usize {
        self.waveforms.len() + self.digital.len()
    }

    /// True if the set holds no channels
    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty() && self.digital.is_empty()
    }

    /// Analog waveforms in channel order
    pub fn iter(&self) -> impl Iterator<Item = &Waveform> {
        self.waveforms.values()
    }

    /// Digital lines in channel order
    pub fn digital_iter(&self) -> impl Iterator<Item = &DigitalWaveform> {
        self.digital.values()
    }
}

/// Outcome of [`Acquisition::acquire_data`]
#[derive(Debug, Clone, PartialEq)]
pub enum Acquired {
    /// First waveform set, returned directly. Further segments were queued.
    Returned(WaveformSet),
    /// Every set went to the pending queue
    Queued {
        /// How many sets were queued
        sets: usize,
    },
    /// No channel is enabled; nothing was downloaded
    NoEnabledChannels,
}

/// Bounded FIFO of downloaded waveform sets. When full the oldest set is dropped.
pub struct PendingWaveforms {
    queue: ArrayQueue<WaveformSet>,
}

impl PendingWaveforms {
    /// Queue holding at most `capacity` sets
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Append a set, evicting the oldest if the queue is full
    pub fn push(&self, set: WaveformSet) {
        if let Some(dropped) = self.queue.force_push(set) {
            warn!(
                channels = dropped.len(),
                capacity = self.queue.capacity(),
                "Waveform queue full, dropped oldest set"
            );
        }
    }

    /// Oldest set, if any
    pub fn pop(&self) -> Option<WaveformSet> {
        self.queue.pop()
    }

    /// Remove and return every queued set, oldest first
    pub fn drain(&self) -> Vec<WaveformSet> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    /// Discard everything
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Number of queued sets
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of sets held
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Trigger state plus whether the current arm is one-shot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerControl {
    /// Current state
    pub state: TriggerState,
    /// Return to idle after the next download instead of re-arming
    pub one_shot: bool,
}

impl Default for TriggerControl {
    fn default() -> Self {
        Self {
            state: TriggerState::Idle,
            one_shot: true,
        }
    }
}

impl TriggerControl {
    /// Apply an `INR?` register value
    pub fn apply_inr(&mut self, inr: u32) -> TriggerState {
        if inr & INR_NEW_WAVEFORM != 0 {
            self.state = TriggerState::Triggered;
        } else if inr & INR_TRIGGER_READY != 0 && self.state != TriggerState::Triggered {
            self.state = TriggerState::Armed;
        }
        self.state
    }
}

/// Sample rates in samples per second
pub fn sample_rates(series: ModelSeries, interleaved: bool) -> Vec<u64> {
    const K: u64 = 1_000;
    const M: u64 = K * K;
    const G: u64 = K * M;

    let mut rates = Vec::new();
    if series == ModelSeries::WaveRunner8000 {
        rates.push(K);
    }
    rates.extend_from_slice(&[
        2 * K,
        5 * K,
        10 * K,
        20 * K,
        50 * K,
        100 * K,
        200 * K,
        500 * K,
        M,
        2 * M,
        5 * M,
        10 * M,
        20 * M,
        50 * M,
        100 * M,
        200 * M,
        500 * M,
        G,
        2 * G,
    ]);
    if series == ModelSeries::WaveRunner8000 {
        rates.extend_from_slice(&[5 * G, 10 * G]);
    }
    if interleaved {
        if let Some(&fastest) = rates.last() {
            rates.push(fastest * 2);
        }
    }
    rates
}

/// Memory depths in samples
pub fn sample_depths(series: ModelSeries, interleaved: bool) -> Vec<u64> {
    const K: u64 = 1_000;
    const M: u64 = K * K;

    let mut depths = vec![K, 5 * K, 10 * K, 50 * K, 100 * K, 500 * K, M, 5 * M, 10 * M];
    if series == ModelSeries::WaveRunner8000 {
        depths.push(16 * M);
        if interleaved {
            depths.push(32 * M);
        }
    }
    depths
}

/// Channel pairs that cannot both be in use while interleaving.
///
/// A pair of one channel with itself means any use of that channel rules
/// interleaving out.
pub fn interleave_conflicts(series: ModelSeries, analog_count: usize) -> Vec<(usize, usize)> {
    let mut conflicts = Vec::new();
    if analog_count >= 2 {
        conflicts.push((0, 1));
    }
    if analog_count > 3 {
        conflicts.push((2, 3));
    }
    if series == ModelSeries::WaveRunner8000 && analog_count > 3 {
        conflicts.push((0, 0));
        conflicts.push((3, 3));
    }
    conflicts
}

fn parse_trigger_type(reply: &str) -> TriggerType {
    match reply.trim() {
        "POS" => TriggerType::Rising,
        "NEG" => TriggerType::Falling,
        "EIT" => TriggerType::Change,
        _ => TriggerType::DontCare,
    }
}

fn slope_code(kind: TriggerType) -> Option<&'static str> {
    match kind {
        TriggerType::Rising => Some("POS"),
        TriggerType::Falling => Some("NEG"),
        TriggerType::Change => Some("EIT"),
        TriggerType::DontCare => None,
    }
}

fn split_segments(
    channel: usize,
    descriptor: WaveDescriptor,
    data: Bytes,
    bytes_per_sample: usize,
    trigger_deltas: &[f64],
) -> Vec<Waveform> {
    let num_sequences = descriptor.num_sequences();
    let per_segment = data.len() / bytes_per_sample / num_sequences * bytes_per_sample;
    (0..num_sequences)
        .map(|j| Waveform {
            channel,
            segment: j,
            descriptor,
            trigger_delta: trigger_deltas.get(j).copied(),
            samples: data.slice(j * per_segment..(j + 1) * per_segment),
            bytes_per_sample,
        })
        .collect()
}

/// Trigger delta of every segment from a `WF? TIME` block (16 bytes per segment)
fn parse_trigger_times(raw: &[u8], num_sequences: usize) -> AppResult<Vec<f64>> {
    if raw.len() < num_sequences * 16 {
        return Err(VicpError::Protocol(format!(
            "trigger time array holds {} bytes, {} segments need {}",
            raw.len(),
            num_sequences,
            num_sequences * 16
        )));
    }
    Ok(raw
        .chunks_exact(16)
        .take(num_sequences)
        .map(|mut pair| pair.get_f64_le())
        .collect())
}

impl VicpOscilloscope {
    /// Sample rates available in the current interleave mode
    pub fn sample_rates(&self, interleaved: bool) -> Vec<u64> {
        sample_rates(self.identity.series, interleaved)
    }

    /// Memory depths available in the current interleave mode
    pub fn sample_depths(&self, interleaved: bool) -> Vec<u64> {
        sample_depths(self.identity.series, interleaved)
    }

    /// Channel pairs that prevent interleaving
    pub fn interleave_conflicts(&self) -> Vec<(usize, usize)> {
        interleave_conflicts(self.identity.series, self.roster.analog_count())
    }

    /// Current trigger state without talking to the instrument
    pub fn trigger_state(&self) -> TriggerState {
        self.trigger.lock().state
    }

    /// Oldest queued waveform set
    pub fn pop_pending_waveform(&self) -> Option<WaveformSet> {
        self.pending.pop()
    }

    /// Every queued waveform set, oldest first
    pub fn pop_pending_waveforms(&self) -> Vec<WaveformSet> {
        self.pending.drain()
    }

    /// Number of queued waveform sets
    pub fn pending_waveform_count(&self) -> usize {
        self.pending.len()
    }

    fn arm(&self, one_shot: bool) -> AppResult<()> {
        let link = self.session.lock();
        link.send_command("TRIG_MODE SINGLE")?;
        let mut trigger = self.trigger.lock();
        trigger.state = TriggerState::Armed;
        trigger.one_shot = one_shot;
        debug!(one_shot, "Trigger armed");
        Ok(())
    }

    /// Leave the trigger idle after a one-shot capture, or re-arm it.
    ///
    /// Runs with the link held so no capture is missed in continuous mode.
    fn finish_capture(&self, link: &SessionGuard<'_>) -> AppResult<()> {
        let mut trigger = self.trigger.lock();
        if trigger.one_shot {
            trigger.state = TriggerState::Idle;
        } else {
            link.send_command("TRIG_MODE SINGLE")?;
            trigger.state = TriggerState::Armed;
        }
        Ok(())
    }

    /// Pipelined descriptor and data download, one set per segment
    fn download_analog(
        &self,
        link: &SessionGuard<'_>,
        enabled: &[&Channel],
    ) -> AppResult<Vec<WaveformSet>> {
        let reader = BlockReader::new(link);

        for channel in enabled {
            link.send_command(&format!("{}:WF? DESC", channel.hw_name))?;
        }
        let mut descriptors = Vec::with_capacity(enabled.len());
        for _ in enabled {
            let raw = reader.read_waveform_block()?;
            descriptors.push(WaveDescriptor::parse(&raw)?);
        }

        let num_sequences = descriptors[0].num_sequences();
        if num_sequences > 1 {
            link.send_command(&format!("{}:WF? TIME", enabled[0].hw_name))?;
        }
        for channel in enabled {
            link.send_command(&format!("{}:WF? DAT1", channel.hw_name))?;
        }

        let trigger_deltas = if num_sequences > 1 {
            parse_trigger_times(&reader.read_waveform_block()?, num_sequences)?
        } else {
            Vec::new()
        };

        let bytes_per_sample = self.identity.bytes_per_sample();
        let mut sets: Vec<WaveformSet> =
            (0..num_sequences).map(|_| WaveformSet::default()).collect();
        for (channel, descriptor) in enabled.iter().zip(&descriptors) {
            let data = reader.read_waveform_block()?;
            for waveform in split_segments(
                channel.index,
                *descriptor,
                data,
                bytes_per_sample,
                &trigger_deltas,
            ) {
                if let Some(set) = sets.get_mut(waveform.segment) {
                    set.insert(waveform);
                }
            }
        }
        Ok(sets)
    }

    /// Fetch every selected logic line into `set`
    fn download_digital(&self, link: &SessionGuard<'_>, set: &mut WaveformSet) -> AppResult<()> {
        link.send_command(DIGITAL_QUERY)?;
        let capture = DigitalCapture::parse(&BlockReader::new(link).read_waveform_block()?)?;
        self.store_digital_selection(&capture.selected)?;

        for (line, channel) in self.roster.digital_channels().enumerate() {
            if let Some(samples) = capture.line(line) {
                set.insert_digital(DigitalWaveform {
                    channel: channel.index,
                    line,
                    interval: capture.interval,
                    samples,
                });
            }
        }
        Ok(())
    }
}

impl Acquisition for VicpOscilloscope {
    fn start(&self) -> AppResult<()> {
        self.arm(false)
    }

    fn start_single_trigger(&self) -> AppResult<()> {
        self.arm(true)
    }

    fn stop(&self) -> AppResult<()> {
        {
            let link = self.session.lock();
            link.send_command("TRIG_MODE STOP")?;
            let mut trigger = self.trigger.lock();
            trigger.state = TriggerState::Idle;
            trigger.one_shot = true;
        }
        self.pending.clear();
        debug!("Trigger stopped");
        Ok(())
    }

    fn poll_trigger(&self) -> AppResult<TriggerState> {
        let link = self.session.lock();
        link.send_command("INR?")?;
        let reply = BlockReader::new(&link).read_single_block_string(true)?;
        let inr: u32 = reply.trim().parse().map_err(|_| {
            VicpError::Protocol(format!("bad INR? response {:?}", reply))
        })?;
        let state = self.trigger.lock().apply_inr(inr);
        Ok(state)
    }

    fn is_trigger_armed(&self) -> bool {
        self.trigger.lock().state == TriggerState::Armed
    }

    #[instrument(level = "debug", skip(self), err)]
    fn acquire_data(&self, to_queue: bool) -> AppResult<Acquired> {
        let started = Instant::now();
        let link = self.session.lock();

        self.bulk_check_channel_enable_state()?;
        let mut enabled = Vec::new();
        for channel in self.roster.analog_channels() {
            if self.is_channel_enabled(channel.index)? {
                enabled.push(channel);
            }
        }
        let mut digital = 0;
        for channel in self.roster.digital_channels() {
            if self.is_channel_enabled(channel.index)? {
                digital += 1;
            }
        }
        if enabled.is_empty() && digital == 0 {
            warn!("No channel enabled, nothing to download");
            self.finish_capture(&link)?;
            return Ok(Acquired::NoEnabledChannels);
        }

        let mut sets = if enabled.is_empty() {
            vec![WaveformSet::default()]
        } else {
            self.download_analog(&link, &enabled)?
        };
        let num_sequences = sets.len();

        if digital > 0 {
            match sets.as_mut_slice() {
                [set] => self.download_digital(&link, set)?,
                _ => debug!(
                    segments = num_sequences,
                    "Logic analyzer has no sequence mode, digital lines skipped"
                ),
            }
        }

        self.finish_capture(&link)?;
        drop(link);

        info!(
            channels = enabled.len(),
            digital,
            segments = num_sequences,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Waveform download complete"
        );

        let mut sets = sets.into_iter();
        if to_queue {
            let count = sets.len();
            sets.for_each(|set| self.pending.push(set));
            return Ok(Acquired::Queued { sets: count });
        }

        let first = sets.next().unwrap_or_default();
        sets.for_each(|set| self.pending.push(set));
        Ok(Acquired::Returned(first))
    }

    fn trigger_channel(&self) -> AppResult<usize> {
        let value = self.read_cached(CacheKey::Trigger(TriggerField::Channel), || {
            let reply = self.query_string("TRIG_SELECT?")?;
            let source = reply.split(',').nth(2).map(str::trim).unwrap_or_default();
            match self.roster.by_hw_name(source) {
                Some(channel) => Ok(CachedValue::Count(channel.index)),
                None => Err(VicpError::Protocol(format!(
                    "unknown trigger source {:?} in {:?}",
                    source, reply
                ))),
            }
        })?;
        value
            .as_count()
            .ok_or_else(|| VicpError::Protocol("cached trigger channel has wrong type".into()))
    }

    fn set_trigger_channel(&self, channel: usize) -> AppResult<()> {
        let hw_name = &self.roster.get(channel)?.hw_name;
        self.write_cached(
            CacheKey::Trigger(TriggerField::Channel),
            CachedValue::Count(channel),
            &format!("TRIG_SELECT EDGE,SR,{}", hw_name),
        )
    }

    fn trigger_level(&self) -> AppResult<f64> {
        let value = self.read_cached(CacheKey::Trigger(TriggerField::Level), || {
            Ok(CachedValue::Real(self.query_f64("TRLV?")?))
        })?;
        value
            .as_real()
            .ok_or_else(|| VicpError::Protocol("cached trigger level has wrong type".into()))
    }

    fn set_trigger_level(&self, level: f64) -> AppResult<()> {
        // Source lookup and write must see the same trigger channel
        let _link = self.session.lock();
        let source = self.trigger_channel()?;
        let hw_name = &self.roster.get(source)?.hw_name;
        let (text, sent) = format_setting(level)?;
        self.write_cached(
            CacheKey::Trigger(TriggerField::Level),
            CachedValue::Real(sent),
            &format!("{}:TRLV {} V", hw_name, text),
        )
    }

    fn trigger_type(&self) -> AppResult<TriggerType> {
        let value = self.read_cached(CacheKey::Trigger(TriggerField::Type), || {
            let reply = self.query_string("TRIG_SLOPE?")?;
            Ok(CachedValue::Trigger(parse_trigger_type(&reply)))
        })?;
        value
            .as_trigger()
            .ok_or_else(|| VicpError::Protocol("cached trigger type has wrong type".into()))
    }

    fn set_trigger_type(&self, kind: TriggerType) -> AppResult<()> {
        let code = slope_code(kind).ok_or_else(|| {
            VicpError::Unsupported(format!("trigger type {:?} cannot be selected", kind))
        })?;
        let _link = self.session.lock();
        let source = self.trigger_channel()?;
        let hw_name = &self.roster.get(source)?.hw_name;
        self.write_cached(
            CacheKey::Trigger(TriggerField::Type),
            CachedValue::Trigger(kind),
            &format!("{}:TRSL {}", hw_name, code),
        )
    }
}
