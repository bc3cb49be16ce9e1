//! Inter-thread command types for driver coordination.
//!
//! These are internal messages between the driver handle, the processing
//! thread and the TX thread. They are not part of the wire protocol.
//!
//! Command flows:
//! - Handle → Process: connection requests, commands, state queries
//! - Process → TX: destination updates, feedback and other directed messages
//! - Handle → TX: settings and pings for every destination

use std::net::IpAddr;

use crossbeam_channel::Sender;

use crate::net::{Endpoint, EndpointId};

use super::protocol::{Command, MessageType, UdpConnectionSettings};
use super::session::{Destination, SessionState};

/// Commands to the TX thread.
#[derive(Debug)]
pub enum TxCommand {
    AddDestination(EndpointId, Destination),
    RemoveDestination(EndpointId),
    /// Send a message to one address, registered or not.
    SendTo {
        to: Endpoint,
        message_type: MessageType,
        payload: Vec<u8>,
    },
    /// Send a message to every registered destination.
    Broadcast {
        message_type: MessageType,
        payload: Vec<u8>,
    },
    Shutdown,
}

/// Commands to the processing thread.
#[derive(Debug)]
pub enum ProcessCommand {
    /// Start a client session with a server.
    Connect {
        server: Endpoint,
        settings: UdpConnectionSettings,
    },
    /// Send a command to every connected peer and close the sessions.
    SendCommand(Command),
    /// Notify every connected peer of disconnection and forget them.
    DisconnectAll,
    /// Report the session state with the peer at an address.
    QueryState {
        address: IpAddr,
        reply: Sender<SessionState>,
    },
    Shutdown,
}
