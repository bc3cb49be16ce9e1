//! Network transport primitives.
//!
//! UDP socket wrapper used by the receive and send threads, plus the
//! addressing types that identify remote peers.

pub mod endpoint;
pub mod socket;

pub use endpoint::{Endpoint, EndpointId, Protocol};
pub use socket::UdpSocket;
