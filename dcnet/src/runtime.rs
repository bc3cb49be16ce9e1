//! Runtime for the frame transport.
//!
//! - `driver`: the threads, wire protocol and session handling behind a
//!   [`driver::Driver`] handle.

pub mod driver;
