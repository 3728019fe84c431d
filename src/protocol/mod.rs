//! VICP link layer.
//!
//! - [`frame`]: header layout, control flags and sequence numbering
//! - [`session`]: the locked transport, command framing and response reassembly
//! - [`block`]: length-prefixed binary blocks and string responses built on top of a session

pub mod block;
pub mod frame;
pub mod session;

pub use block::{BlockReader, BlockState};
pub use frame::{ControlFlags, FrameHeader};
pub use session::{Frame, LinkSession, SessionGuard};
