//! UDP transport for depth-camera frames.
//!
//! Messages larger than a datagram are split into fragments that each carry
//! a fixed 35-byte header, reassembled on the far side, and delivered as
//! [`Event`]s. A small session protocol (connect, acknowledge, command)
//! decides which peers receive outgoing frames.
//!
//! Start with [`Driver::spawn`].

pub mod net;
pub mod runtime;
pub mod time;
mod trace;

pub use trace::init_tracing;

pub use runtime::driver::{
    Command, Driver, DriverConfig, DriverError, Event, Feedback, FeedbackKind, MessageType,
    ReceivedFrame, ReceptionStatus, SessionSignal, SessionState, StatsSnapshot, UdpConnectionSettings,
};
