//! # vicp_scope
//!
//! Blocking client for oscilloscopes that speak VICP, the framed TCP
//! protocol LeCroy/Teledyne instruments expose on port 1861.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the byte-stream seam ([`transport::Transport`]) with a TCP
//!   implementation and a scripted one for tests.
//! - **`protocol`**: VICP frame headers, the link session with its reentrant
//!   transport lock, and the IEEE 488.2 definite-length block reader.
//! - **`cache`**: per-channel and trigger configuration cache with validity bits.
//! - **`capabilities`**: the instrument-agnostic surfaces (channel control,
//!   acquisition, metering, generation).
//! - **`instrument`**: [`instrument::VicpOscilloscope`], which implements every
//!   surface on top of one link session, plus a simulated instrument.
//! - **`config`** / **`logging`** / **`error`**: figment configuration,
//!   tracing setup and the crate error type.
//!
//! ## Example
//!
//! ```no_run
//! use vicp_scope::capabilities::{Acquisition, ChannelControl};
//! use vicp_scope::config::VicpConfig;
//! use vicp_scope::instrument::{Acquired, VicpOscilloscope};
//!
//! let mut config = VicpConfig::default();
//! config.connection.host = "192.168.1.40".into();
//! let scope = VicpOscilloscope::connect(&config)?;
//!
//! scope.set_voltage_range(0, 4.0)?;
//! scope.start_single_trigger()?;
//! while scope.poll_trigger()? != vicp_scope::capabilities::TriggerState::Triggered {}
//! if let Acquired::Returned(set) = scope.acquire_data(false)? {
//!     println!("{} channels captured", set.len());
//! }
//! # Ok::<(), vicp_scope::error::VicpError>(())
//! ```

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod protocol;
pub mod transport;
