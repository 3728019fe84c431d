//! Configuration cache with per-field validity bits.
//!
//! One map from `(key, field)` to a value plus a validity flag replaces a
//! separate member per cached datum, so a flush is a single sweep.
//!
//! # Locking
//!
//! The cache has its own lock, independent of the transport lock. It is only
//! ever held for a map lookup or update, never across instrument I/O, so a
//! reader hitting a valid entry never waits on another thread's exchange.
//! [`ConfigCache::read_through`] and [`ConfigCache::write_through`] call out to
//! the device with the cache unlocked and lock again only to store the result.
//!
//! Every store or invalidation bumps a generation counter. A fetched value is
//! only stored if the generation is unchanged since the miss, so a write or
//! flush that lands while a query is in flight is never overwritten by the
//! older reply. Callers that talk to the instrument hold the transport lock
//! across the whole read-through or write-through as well.

use crate::capabilities::TriggerType;
use crate::error::{AppResult, VicpError};
use crate::instrument::channel::CouplingType;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// Per-channel cached settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelField {
    /// Channel displayed / acquired
    Enabled,
    /// Input coupling
    Coupling,
    /// Probe attenuation factor
    Attenuation,
    /// Bandwidth limit in MHz (0 = off)
    BandwidthLimit,
    /// Full-scale voltage range
    VoltageRange,
    /// Vertical offset
    Offset,
}

/// Trigger settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerField {
    /// Source channel index
    Channel,
    /// Trigger level in volts
    Level,
    /// Edge / slope kind
    Type,
}

/// Cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A field of the channel at this roster index
    Channel(usize, ChannelField),
    /// A global trigger field
    Trigger(TriggerField),
}

/// Value stored in the cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CachedValue {
    /// Enabled flag
    Flag(bool),
    /// Floating-point setting (volts, factor)
    Real(f64),
    /// Integer setting (MHz, channel index)
    Count(usize),
    /// Input coupling
    Coupling(CouplingType),
    /// Trigger kind
    Trigger(TriggerType),
}

impl CachedValue {
    /// Flag payload, if this is a flag
    pub fn as_flag(&self) -> Option<bool> {
        match *self {
            CachedValue::Flag(v) => Some(v),
            _ => None,
        }
    }

    /// Real payload, if this is a real
    pub fn as_real(&self) -> Option<f64> {
        match *self {
            CachedValue::Real(v) => Some(v),
            _ => None,
        }
    }

    /// Count payload, if this is a count
    pub fn as_count(&self) -> Option<usize> {
        match *self {
            CachedValue::Count(v) => Some(v),
            _ => None,
        }
    }

    /// Coupling payload
    pub fn as_coupling(&self) -> Option<CouplingType> {
        match *self {
            CachedValue::Coupling(v) => Some(v),
            _ => None,
        }
    }

    /// Trigger type payload
    pub fn as_trigger(&self) -> Option<TriggerType> {
        match *self {
            CachedValue::Trigger(v) => Some(v),
            _ => None,
        }
    }
}

/// Stored value and its validity bit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    /// Last value stored
    pub value: CachedValue,
    /// Whether `value` still reflects the instrument
    pub valid: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    generation: u64,
}

impl CacheState {
    fn store(&mut self, key: CacheKey, value: CachedValue) {
        self.entries.insert(key, CacheEntry { value, valid: true });
        self.generation += 1;
    }
}

/// Thread-safe settings cache bounded to the channel roster
#[derive(Debug)]
pub struct ConfigCache {
    state: Mutex<CacheState>,
    channel_count: usize,
}

impl ConfigCache {
    /// Cache for a roster of `channel_count` channels
    pub fn new(channel_count: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            channel_count,
        }
    }

    /// Number of channels the cache accepts
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn check(&self, key: CacheKey) -> AppResult<()> {
        match key {
            CacheKey::Channel(i, _) if i >= self.channel_count => Err(VicpError::InvalidChannel(i)),
            _ => Ok(()),
        }
    }

    /// Entry for `key`, valid or not. `None` if it was never populated.
    pub fn get(&self, key: CacheKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(&key).copied()
    }

    /// Value for `key` only if it is valid
    pub fn get_valid(&self, key: CacheKey) -> Option<CachedValue> {
        self.get(key).filter(|e| e.valid).map(|e| e.value)
    }

    /// Store `value` and mark it valid
    pub fn put(&self, key: CacheKey, value: CachedValue) -> AppResult<()> {
        self.check(key)?;
        self.state.lock().store(key, value);
        Ok(())
    }

    /// Store several values under one lock acquisition
    pub fn put_many<I>(&self, values: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (CacheKey, CachedValue)>,
    {
        let values: Vec<_> = values.into_iter().collect();
        for (key, _) in &values {
            self.check(*key)?;
        }
        let mut state = self.state.lock();
        for (key, value) in values {
            state.store(key, value);
        }
        Ok(())
    }

    /// Clear the validity bit of one entry, keeping its last value
    pub fn invalidate(&self, key: CacheKey) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.valid = false;
        }
    }

    /// Clear every validity bit. Does not touch the instrument.
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        for entry in state.entries.values_mut() {
            entry.valid = false;
        }
        trace!(entries = state.entries.len(), "cache invalidated");
    }

    /// Return the cached value if valid, otherwise call `fetch` and store its result.
    ///
    /// `fetch` runs without the cache lock held. Its result is returned either
    /// way but only stored if nothing was stored or invalidated meanwhile.
    pub fn read_through<F>(&self, key: CacheKey, fetch: F) -> AppResult<CachedValue>
    where
        F: FnOnce() -> AppResult<CachedValue>,
    {
        self.check(key)?;
        let generation = {
            let state = self.state.lock();
            if let Some(entry) = state.entries.get(&key).filter(|e| e.valid) {
                trace!(?key, "cache hit");
                return Ok(entry.value);
            }
            state.generation
        };
        trace!(?key, "cache miss");
        let value = fetch()?;

        let mut state = self.state.lock();
        if state.generation == generation {
            state.store(key, value);
        } else {
            trace!(?key, "cache changed during fetch, reply not stored");
        }
        Ok(value)
    }

    /// Invalidate `key`, run `send`, and store `value` only if `send` succeeded.
    ///
    /// A failed write leaves the entry invalid so the next read goes to the device.
    pub fn write_through<F>(&self, key: CacheKey, value: CachedValue, send: F) -> AppResult<()>
    where
        F: FnOnce() -> AppResult<()>,
    {
        self.check(key)?;
        self.invalidate(key);
        send()?;
        self.put(key, value)
    }
}
