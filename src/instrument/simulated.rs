//! Simulated VICP instrument.
//!
//! `SimulatedScope` is a [`Transport`] that decodes the frames the client
//! writes, interprets the commands the client issues, and queues framed
//! responses for the client to read. It keeps enough instrument state
//! (channel settings, trigger, voltmeter, generator, waveform memory) for
//! the facade to run end to end without hardware, and counts every command
//! it receives so tests can assert exactly what went over the wire.
//!
//! # Example
//!
//! ```
//! use vicp_scope::capabilities::ChannelControl;
//! use vicp_scope::config::VicpConfig;
//! use vicp_scope::instrument::{SimulatedScope, VicpOscilloscope};
//!
//! let sim = SimulatedScope::new("WS3024");
//! let scope = VicpOscilloscope::from_transport(Box::new(sim.clone()), &VicpConfig::default())?;
//! scope.set_voltage_range(0, 2.0)?;
//! assert_eq!(sim.command_count("C1:VOLT_DIV 2.5E-1"), 1);
//! # Ok::<(), vicp_scope::error::VicpError>(())
//! ```

use crate::protocol::frame::{encode_frame, ControlFlags, FrameHeader, HEADER_LEN};
use crate::transport::Transport;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use tracing::{trace, warn};

/// Build a little-endian waveform descriptor with the fields the client decodes
pub fn wave_descriptor(
    trigtime_len: u32,
    vertical_gain: f32,
    vertical_offset: f32,
    horizontal_interval: f32,
) -> Vec<u8> {
    let mut raw = vec![0u8; 346];
    raw[..8].copy_from_slice(b"WAVEDESC");
    raw[36..40].copy_from_slice(&346u32.to_le_bytes());
    raw[48..52].copy_from_slice(&trigtime_len.to_le_bytes());
    raw[156..160].copy_from_slice(&vertical_gain.to_le_bytes());
    raw[160..164].copy_from_slice(&vertical_offset.to_le_bytes());
    raw[176..180].copy_from_slice(&horizontal_interval.to_le_bytes());
    raw[180..188].copy_from_slice(&(-5e-6f64).to_le_bytes());
    raw[296..304].copy_from_slice(&12.5f64.to_le_bytes());
    raw[304] = 30;
    raw[305] = 14;
    raw[306] = 2;
    raw[307] = 7;
    raw[308..310].copy_from_slice(&2024u16.to_le_bytes());
    raw
}

/// Level the simulated logic probe reports on `line` at sample `index`
pub fn digital_level(line: usize, index: usize) -> u8 {
    ((index >> line) & 1) as u8
}

#[derive(Debug, Clone)]
struct SimChannel {
    trace: bool,
    volt_div: f64,
    offset: f64,
    coupling: String,
    attenuation: f64,
    bandwidth: String,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            trace: true,
            volt_div: 0.1,
            offset: 0.0,
            coupling: "D1M".into(),
            attenuation: 1.0,
            bandwidth: "OFF".into(),
        }
    }
}

#[derive(Debug)]
struct SimState {
    model: String,
    options: Vec<String>,
    selected_lines: Option<String>,
    channels: Vec<SimChannel>,
    trigger_source: String,
    trigger_level: f64,
    trigger_slope: String,
    inr: u32,
    segments: usize,
    samples_per_segment: usize,
    vbs: HashMap<String, String>,
    response_chunk: usize,
    receive_chunk: usize,
    inbound: Vec<u8>,
    command: Vec<u8>,
    outbound: VecDeque<u8>,
    commands: Vec<String>,
    counts: HashMap<String, usize>,
    closed: bool,
}

impl SimState {
    fn bytes_per_sample(&self) -> usize {
        if self.model.contains("HD") {
            2
        } else {
            1
        }
    }

    fn channel_index(&self, hw_name: &str) -> Option<usize> {
        let n: usize = hw_name.strip_prefix('C')?.parse().ok()?;
        (n >= 1 && n <= self.channels.len()).then(|| n - 1)
    }

    fn push_frames(&mut self, body: &[u8], eoi_last: bool) {
        let chunk = self.response_chunk.max(1);
        let pieces: Vec<&[u8]> = if body.is_empty() {
            vec![body]
        } else {
            body.chunks(chunk).collect()
        };
        let count = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            let mut flags = ControlFlags::DATA;
            flags.set(ControlFlags::EOI, eoi_last && i + 1 == count);
            if let Ok(frame) = encode_frame(flags, 1, piece) {
                self.outbound.extend(frame);
            }
        }
    }

    fn reply(&mut self, text: &str) {
        let body = format!("{}\n", text);
        self.push_frames(body.as_bytes(), true);
    }

    fn reply_block(&mut self, preamble: &str, payload: &[u8]) {
        let mut body = format!("{}#9{:09}", preamble, payload.len()).into_bytes();
        body.extend_from_slice(payload);
        self.push_frames(&body, false);
        self.push_frames(b"\n", true);
    }

    fn digital_document(&self, lines: &str) -> String {
        let samples = self.samples_per_segment;
        let mut data = Vec::new();
        for (line, selected) in lines.chars().enumerate() {
            if selected == '1' {
                data.extend((0..samples).map(|j| digital_level(line, j)));
            }
        }
        format!(
            "<Digital><SelectedLines={}/><HorPerStep>1E-9</HorPerStep>\
             <NumSamples>{}</NumSamples><BinaryData>{}</BinaryData></Digital>",
            lines,
            samples,
            STANDARD.encode(&data)
        )
    }

    fn waveform_data(&self, channel: usize) -> Vec<u8> {
        let total = self.segments * self.samples_per_segment * self.bytes_per_sample();
        (0..total).map(|k| (k + channel * 16) as u8).collect()
    }

    fn handle(&mut self, command: &str) {
        trace!(command, "simulated instrument received");
        self.commands.push(command.to_string());
        *self.counts.entry(command.to_string()).or_default() += 1;

        let (head, args) = match command.split_once(' ') {
            Some((h, a)) => (h, a.trim()),
            None => (command, ""),
        };

        // Channel-prefixed commands: C1:VOLT_DIV?, C2:TRLV 0.1 V, ...
        if let Some((prefix, verb)) = head.split_once(':') {
            if let Some(i) = self.channel_index(prefix) {
                self.handle_channel(i, prefix, verb, args);
                return;
            }
            if prefix == "Digital1" && verb == "WF?" {
                let payload = match &self.selected_lines {
                    Some(lines) => self.digital_document(lines),
                    None => String::new(),
                };
                self.reply_block("Digital1:WF ALL,", payload.as_bytes());
                return;
            }
        }

        match head {
            "CHDR" | "WAVEFORM_SETUP" | "COMM_FORMAT" => {}
            "*IDN?" => {
                let idn = format!("LECROY,{},SIM00001,9.2.0", self.model);
                self.reply(&idn);
            }
            "*OPT?" => {
                let opts = if self.options.is_empty() {
                    "0".to_string()
                } else {
                    self.options.join(",")
                };
                self.reply(&opts);
            }
            "INR?" => {
                let inr = self.inr;
                // New-waveform bit clears on read
                self.inr &= !0x0001;
                self.reply(&inr.to_string());
            }
            "TRIG_MODE" => match args {
                "SINGLE" | "NORM" | "AUTO" => self.inr |= 0x2000,
                _ => self.inr &= !0x2000,
            },
            "TRIG_SELECT?" => {
                let reply = format!("EDGE,SR,{},HT,OFF", self.trigger_source);
                self.reply(&reply);
            }
            "TRIG_SELECT" => {
                if let Some(source) = args.split(',').nth(2) {
                    self.trigger_source = source.trim().to_string();
                }
            }
            "TRLV?" => {
                let level = format!("{:E}", self.trigger_level);
                self.reply(&level);
            }
            "TRIG_SLOPE?" => {
                let slope = self.trigger_slope.clone();
                self.reply(&slope);
            }
            "BANDWIDTH_LIMIT?" => {
                let reply = self
                    .channels
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("C{},{}", i + 1, c.bandwidth))
                    .collect::<Vec<_>>()
                    .join(",");
                self.reply(&reply);
            }
            "BANDWIDTH_LIMIT" => {
                if let Some((name, value)) = args.split_once(',') {
                    if let Some(i) = self.channel_index(name.trim()) {
                        self.channels[i].bandwidth = value.trim().to_string();
                    }
                }
            }
            "VBS?" => {
                let property = args
                    .trim_matches('\'')
                    .trim()
                    .strip_prefix("return =")
                    .map(str::trim)
                    .unwrap_or_default()
                    .to_string();
                let value = self.vbs.get(&property).cloned().unwrap_or_else(|| "0".into());
                self.reply(&value);
            }
            "VBS" => {
                if let Some((property, value)) = args.trim_matches('\'').split_once('=') {
                    self.vbs
                        .insert(property.trim().to_string(), value.trim().to_string());
                }
            }
            _ => warn!(command, "simulated instrument ignored unknown command"),
        }
    }

    fn handle_channel(&mut self, i: usize, hw_name: &str, verb: &str, args: &str) {
        match verb {
            "TRACE?" => {
                let on = if self.channels[i].trace { "ON" } else { "OFF" };
                self.reply(on);
            }
            "TRACE" => self.channels[i].trace = args == "ON",
            "VOLT_DIV?" => {
                let v = format!("{:E}", self.channels[i].volt_div);
                self.reply(&v);
            }
            "VOLT_DIV" => {
                if let Ok(v) = args.parse() {
                    self.channels[i].volt_div = v;
                }
            }
            "OFFSET?" => {
                let v = format!("{:E}", self.channels[i].offset);
                self.reply(&v);
            }
            "OFFSET" => {
                if let Ok(v) = args.parse() {
                    self.channels[i].offset = v;
                }
            }
            "COUPLING?" => {
                let c = self.channels[i].coupling.clone();
                self.reply(&c);
            }
            "COUPLING" => self.channels[i].coupling = args.to_string(),
            "ATTENUATION?" => {
                let a = self.channels[i].attenuation.to_string();
                self.reply(&a);
            }
            "ATTENUATION" => {
                if let Ok(v) = args.parse() {
                    self.channels[i].attenuation = v;
                }
            }
            "TRLV" => {
                if let Some(Ok(v)) = args.split_whitespace().next().map(str::parse) {
                    self.trigger_level = v;
                }
            }
            "TRSL" => self.trigger_slope = args.to_string(),
            "WF?" => {
                let preamble = format!("{}:WF {},", hw_name, args);
                match args {
                    "DESC" => {
                        let trigtime = if self.segments > 1 {
                            (self.segments * 16) as u32
                        } else {
                            0
                        };
                        let desc = wave_descriptor(trigtime, 0.01, 0.0, 1e-9);
                        self.reply_block(&preamble, &desc);
                    }
                    "TIME" => {
                        let mut times = Vec::with_capacity(self.segments * 16);
                        for j in 0..self.segments {
                            times.extend_from_slice(&(j as f64 * 1e-3).to_le_bytes());
                            times.extend_from_slice(&0f64.to_le_bytes());
                        }
                        self.reply_block(&preamble, &times);
                    }
                    _ => {
                        let data = self.waveform_data(i);
                        self.reply_block(&preamble, &data);
                    }
                }
            }
            _ => warn!(hw_name, verb, "simulated instrument ignored channel command"),
        }
    }

    fn ingest(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
        loop {
            if self.inbound.len() < HEADER_LEN {
                return;
            }
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&self.inbound[..HEADER_LEN]);
            let header = match FrameHeader::decode(&raw) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "simulated instrument dropped bad header");
                    self.inbound.clear();
                    return;
                }
            };
            let end = HEADER_LEN + header.length as usize;
            if self.inbound.len() < end {
                return;
            }
            let payload: Vec<u8> = self.inbound.drain(..end).skip(HEADER_LEN).collect();

            if header.flags.contains(ControlFlags::CLEAR) {
                self.command.clear();
                self.outbound.clear();
                *self.counts.entry("<device clear>".into()).or_default() += 1;
                continue;
            }

            self.command.extend_from_slice(&payload);
            if header.flags.is_eoi() {
                let command = String::from_utf8_lossy(&self.command).trim().to_string();
                self.command.clear();
                self.handle(&command);
            }
        }
    }
}

/// Virtual instrument behind a [`Transport`]; clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedScope {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedScope {
    /// Instrument reporting `model`; the last digit sets the analog channel count
    pub fn new(model: &str) -> Self {
        let analog = model
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .unwrap_or(4) as usize;
        let mut vbs = HashMap::new();
        for (k, v) in [
            ("app.acquisition.DVM.Voltage", "1.234"),
            ("app.acquisition.DVM.Amplitude", "2.5"),
            ("app.acquisition.DVM.Frequency", "1000"),
            ("app.acquisition.DVM.DvmSource", "\"C1\""),
            ("app.acquisition.DVM.DvmMode", "\"DC\""),
            ("app.acquisition.DVM.AutoRange", "1"),
            ("app.wavesource.enable", "False"),
            ("app.wavesource.shape", "\"Sine\""),
            ("app.wavesource.amplitude", "1.0"),
            ("app.wavesource.offset", "0.0"),
            ("app.wavesource.dutycycle", "50"),
            ("app.wavesource.frequency", "1000"),
            ("app.wavesource.risetime", "1e-8"),
            ("app.wavesource.falltime", "1e-8"),
        ] {
            vbs.insert(k.to_string(), v.to_string());
        }

        Self {
            state: Arc::new(Mutex::new(SimState {
                model: model.to_string(),
                options: Vec::new(),
                selected_lines: None,
                channels: vec![SimChannel::default(); analog],
                trigger_source: "C1".into(),
                trigger_level: 0.0,
                trigger_slope: "POS".into(),
                inr: 0,
                segments: 1,
                samples_per_segment: 100,
                vbs,
                response_chunk: 4096,
                receive_chunk: usize::MAX,
                inbound: Vec::new(),
                command: Vec::new(),
                outbound: VecDeque::new(),
                commands: Vec::new(),
                counts: HashMap::new(),
                closed: false,
            })),
        }
    }

    /// Report these option codes from `*OPT?`
    pub fn with_options(self, options: &[&str]) -> Self {
        self.state.lock().options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    /// Attach a logic probe reporting `lines` (16 characters of `0`/`1`)
    pub fn with_logic_probe(self, lines: &str) -> Self {
        self.state.lock().selected_lines = Some(lines.to_string());
        self
    }

    /// Capture `segments` sequence-mode segments of `samples` samples each
    pub fn with_capture(self, segments: usize, samples: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.segments = segments.max(1);
            state.samples_per_segment = samples;
        }
        self
    }

    /// Split response bodies into frames of at most `bytes` payload
    pub fn with_response_chunk(self, bytes: usize) -> Self {
        self.state.lock().response_chunk = bytes.max(1);
        self
    }

    /// Return at most `bytes` per `receive` call
    pub fn with_receive_chunk(self, bytes: usize) -> Self {
        self.state.lock().receive_chunk = bytes.max(1);
        self
    }

    /// Simulate a trigger event: a new waveform is ready and the single capture stops
    pub fn fire_trigger(&self) {
        let mut state = self.state.lock();
        state.inr |= 0x0001;
        state.inr &= !0x2000;
    }

    /// Change a channel's volts/div behind the client's back (front panel, other client)
    pub fn set_volt_div(&self, channel: usize, volts_per_div: f64) {
        if let Some(c) = self.state.lock().channels.get_mut(channel) {
            c.volt_div = volts_per_div;
        }
    }

    /// Change the logic probe's line selection behind the client's back
    pub fn set_selected_lines(&self, lines: &str) {
        self.state.lock().selected_lines = Some(lines.to_string());
    }

    /// Volts/div the instrument currently holds for a channel
    pub fn volt_div(&self, channel: usize) -> Option<f64> {
        self.state.lock().channels.get(channel).map(|c| c.volt_div)
    }

    /// Offset the instrument currently holds for a channel
    pub fn offset(&self, channel: usize) -> Option<f64> {
        self.state.lock().channels.get(channel).map(|c| c.offset)
    }

    /// Trigger level the instrument currently holds
    pub fn trigger_level(&self) -> f64 {
        self.state.lock().trigger_level
    }

    /// Turn a channel on or off behind the client's back
    pub fn set_trace(&self, channel: usize, on: bool) {
        if let Some(c) = self.state.lock().channels.get_mut(channel) {
            c.trace = on;
        }
    }

    /// Set an automation property, e.g. `app.acquisition.DVM.Voltage`
    pub fn set_vbs(&self, property: &str, value: &str) {
        self.state
            .lock()
            .vbs
            .insert(property.to_string(), value.to_string());
    }

    /// Current value of an automation property
    pub fn vbs(&self, property: &str) -> Option<String> {
        self.state.lock().vbs.get(property).cloned()
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// How many times exactly `command` was received
    pub fn command_count(&self, command: &str) -> usize {
        self.state.lock().counts.get(command).copied().unwrap_or(0)
    }

    /// How many received commands start with `prefix`
    pub fn commands_starting_with(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Forget the command log and counters
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.counts.clear();
    }

    /// Response bytes not yet read by the client
    pub fn unread(&self) -> usize {
        self.state.lock().outbound.len()
    }
}

impl Transport for SimulatedScope {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated instrument closed",
            ));
        }
        state.ingest(data);
        Ok(data.len())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(0);
        }
        let n = buffer.len().min(state.outbound.len()).min(state.receive_chunk);
        for (slot, byte) in buffer.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
