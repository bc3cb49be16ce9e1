//! Per-peer session state machine.
//!
//! ```text
//! Disconnected ──begin_connect──> Connecting ──feedback{init, received}──> Connected
//!      ^                                                                      │
//!      └──── command sent/received, ending feedback, inactivity ─────────────┘
//! ```
//!
//! A server side moves straight to `Connected` when it receives
//! `init_connection`. Every received control message is acknowledged with
//! exactly one [`Feedback`], sent to the peer's registered destination or,
//! failing that, to the address the message came from.
//!
//! The manager performs no I/O. Each call returns [`SessionOutcome`]s that
//! the processing thread turns into outbound feedback, destination updates
//! for the send thread, and events.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::net::{Endpoint, EndpointId};
use crate::trace::{debug, info, warn};

use super::protocol::{
    Command, DEFAULT_MAX_PACKET_SIZE, Feedback, FeedbackKind, HEADER_SIZE, MAX_PACKET_SIZE,
    MessageType, ProtocolError, UdpConnectionSettings,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Where and how to send to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub endpoint: Endpoint,
    /// Largest datagram the peer accepts.
    pub max_packet_size: usize,
}

/// Session-level notifications for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Connected,
    Disconnected,
    /// A peer asked this side to act on a command.
    CommandReceived(Command),
    /// Peer went silent for longer than the session timeout.
    TimedOut,
}

/// Change to the set of fan-out destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationChange {
    Added(EndpointId, Destination),
    Removed(EndpointId),
}

/// Result of one session transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub endpoint: EndpointId,
    pub state: SessionState,
    /// Acknowledgement to send, and where.
    pub feedback: Option<(Endpoint, Feedback)>,
    pub signal: Option<SessionSignal>,
    pub destination: Option<DestinationChange>,
}

impl SessionOutcome {
    const fn new(endpoint: EndpointId, state: SessionState) -> Self {
        Self {
            endpoint,
            state,
            feedback: None,
            signal: None,
            destination: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub state: SessionState,
    pub last_activity_ns: i64,
    /// Type of the last control message acknowledged to or by this peer.
    pub last_ack: Option<MessageType>,
    pub destination: Option<Destination>,
}

/// Connection attempt waiting for the server's acknowledgement.
#[derive(Debug, Clone, Copy)]
struct PendingConnect {
    server: Destination,
    started_ns: i64,
}

#[derive(Debug)]
pub struct SessionManager {
    connections: HashMap<EndpointId, ConnectionState>,
    /// Keyed by server IP: its sender id is unknown until it answers.
    pending: HashMap<IpAddr, PendingConnect>,
    timeout_ns: i64,
}

impl SessionManager {
    #[must_use]
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            connections: HashMap::new(),
            pending: HashMap::new(),
            timeout_ns: i64::try_from(session_timeout.as_nanos()).unwrap_or(i64::MAX),
        }
    }

    #[must_use]
    pub fn state(&self, endpoint: &EndpointId) -> SessionState {
        self.connections
            .get(endpoint)
            .map_or(SessionState::Disconnected, |c| c.state)
    }

    /// State of the connection attempt or session with the server at `ip`.
    #[must_use]
    pub fn state_by_address(&self, ip: IpAddr) -> SessionState {
        if self.pending.contains_key(&ip) {
            return SessionState::Connecting;
        }
        self.connections
            .iter()
            .filter(|(id, _)| id.address == ip)
            .map(|(_, c)| c.state)
            .find(|s| *s == SessionState::Connected)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn connection(&self, endpoint: &EndpointId) -> Option<&ConnectionState> {
        self.connections.get(endpoint)
    }

    pub fn connected(&self) -> impl Iterator<Item = (&EndpointId, &ConnectionState)> {
        self.connections
            .iter()
            .filter(|(_, c)| c.state == SessionState::Connected)
    }

    /// Starts a client-side connection attempt to `server`.
    ///
    /// The caller is responsible for sending `init_connection`.
    pub fn begin_connect(&mut self, server: Destination, now_ns: i64) {
        info!(server = %server.endpoint, "connecting");
        self.pending.insert(
            server.endpoint.ip(),
            PendingConnect {
                server,
                started_ns: now_ns,
            },
        );
    }

    /// Refreshes the activity timestamp of a known peer.
    pub fn touch(&mut self, endpoint: &EndpointId, now_ns: i64) {
        if let Some(conn) = self.connections.get_mut(endpoint) {
            conn.last_activity_ns = now_ns;
        }
    }

    /// Server side: a peer asked to connect.
    pub fn on_init_connection(
        &mut self,
        endpoint: EndpointId,
        source: Endpoint,
        settings: Result<UdpConnectionSettings, ProtocolError>,
        now_ns: i64,
    ) -> SessionOutcome {
        let settings = match settings {
            Ok(settings) => settings,
            Err(_e) => {
                warn!(endpoint = %endpoint, error = %_e, "undecodable init_connection");
                return self.acknowledge(endpoint, source, MessageType::InitConnection, now_ns);
            }
        };

        if self.state(&endpoint) == SessionState::Connected {
            debug!(endpoint = %endpoint, "repeated init_connection");
            return self.acknowledge(endpoint, source, MessageType::InitConnection, now_ns);
        }

        let address = settings.address.trim();
        let ip = if address.is_empty() {
            source.ip()
        } else {
            address.parse().unwrap_or_else(|_| {
                warn!(endpoint = %endpoint, address, "unparseable reply address, using source");
                source.ip()
            })
        };
        let max_packet_size = match usize::from(settings.max_packet_size) {
            n if n > HEADER_SIZE && n <= MAX_PACKET_SIZE => n,
            _ => DEFAULT_MAX_PACKET_SIZE,
        };
        let destination = Destination {
            endpoint: Endpoint::new(ip, settings.port),
            max_packet_size,
        };
        info!(
            endpoint = %endpoint,
            reply_to = %destination.endpoint,
            max_packet_size,
            "peer connected"
        );

        self.connections.insert(
            endpoint,
            ConnectionState {
                state: SessionState::Connected,
                last_activity_ns: now_ns,
                last_ack: None,
                destination: Some(destination),
            },
        );
        let mut outcome = self.acknowledge(endpoint, source, MessageType::InitConnection, now_ns);
        outcome.signal = Some(SessionSignal::Connected);
        outcome.destination = Some(DestinationChange::Added(endpoint, destination));
        outcome
    }

    /// A peer sent a settings update.
    pub fn on_settings(
        &mut self,
        endpoint: EndpointId,
        source: Endpoint,
        message_type: MessageType,
        now_ns: i64,
    ) -> SessionOutcome {
        self.acknowledge(endpoint, source, message_type, now_ns)
    }

    /// A peer sent a command. The session with it ends after the reply.
    pub fn on_command(
        &mut self,
        endpoint: EndpointId,
        source: Endpoint,
        command: Result<Command, ProtocolError>,
        now_ns: i64,
    ) -> SessionOutcome {
        let command = match command {
            Ok(command) => command,
            Err(_e) => {
                warn!(endpoint = %endpoint, error = %_e, "undecodable command");
                return self.acknowledge(endpoint, source, MessageType::Command, now_ns);
            }
        };
        info!(endpoint = %endpoint, command = ?command, "command received");

        let reply_to = self.reply_destination(&endpoint, source);
        let mut outcome = SessionOutcome::new(endpoint, SessionState::Disconnected);
        outcome.feedback = Some((
            reply_to,
            Feedback::new(MessageType::Command, command.feedback_kind()),
        ));
        outcome.signal = Some(SessionSignal::CommandReceived(command));
        if let Some(conn) = self.connections.get_mut(&endpoint) {
            conn.last_ack = Some(MessageType::Command);
            conn.last_activity_ns = now_ns;
            if conn.state == SessionState::Connected {
                outcome.destination = Some(DestinationChange::Removed(endpoint));
            }
            conn.state = SessionState::Disconnected;
            conn.destination = None;
        }
        outcome
    }

    /// A peer acknowledged something this side sent.
    ///
    /// Returns `None` when the feedback causes no transition.
    pub fn on_feedback(
        &mut self,
        endpoint: EndpointId,
        feedback: Feedback,
        now_ns: i64,
    ) -> Option<SessionOutcome> {
        if let Some(conn) = self.connections.get_mut(&endpoint) {
            conn.last_ack = feedback.received_type();
            conn.last_activity_ns = now_ns;
        }

        let is_init_ack = feedback.received_type() == Some(MessageType::InitConnection)
            && feedback.kind == FeedbackKind::MessageReceived;
        if is_init_ack && let Some(pending) = self.pending.remove(&endpoint.address) {
            info!(
                endpoint = %endpoint,
                elapsed_ms = (now_ns - pending.started_ns) / 1_000_000,
                "connected to server"
            );
            self.connections.insert(
                endpoint,
                ConnectionState {
                    state: SessionState::Connected,
                    last_activity_ns: now_ns,
                    last_ack: Some(MessageType::InitConnection),
                    destination: Some(pending.server),
                },
            );
            let mut outcome = SessionOutcome::new(endpoint, SessionState::Connected);
            outcome.signal = Some(SessionSignal::Connected);
            outcome.destination = Some(DestinationChange::Added(endpoint, pending.server));
            return Some(outcome);
        }

        if feedback.kind.ends_session() {
            return self.close(endpoint, SessionSignal::Disconnected);
        }
        None
    }

    /// This side sent a command: every connected peer is now disconnected.
    pub fn on_command_sent(&mut self, command: Command) -> Vec<SessionOutcome> {
        debug!(command = ?command, "command sent, closing sessions");
        self.pending.clear();
        let ids: Vec<EndpointId> = self.connected().map(|(id, _)| *id).collect();
        ids.into_iter()
            .filter_map(|id| self.close(id, SessionSignal::Disconnected))
            .collect()
    }

    /// Disconnects peers silent for longer than the session timeout.
    pub fn check_inactivity(&mut self, now_ns: i64) -> Vec<SessionOutcome> {
        let timeout_ns = self.timeout_ns;
        let expired: Vec<EndpointId> = self
            .connected()
            .filter(|(_, c)| now_ns.saturating_sub(c.last_activity_ns) > timeout_ns)
            .map(|(id, _)| *id)
            .collect();
        let outcomes = expired
            .into_iter()
            .filter_map(|id| {
                warn!(endpoint = %id, "session timed out");
                self.close(id, SessionSignal::TimedOut)
            })
            .collect();

        let stale = |last_ns: i64| now_ns.saturating_sub(last_ns) > timeout_ns;
        self.connections
            .retain(|_, c| c.state == SessionState::Connected || !stale(c.last_activity_ns));
        self.pending.retain(|_ip, p| {
            let keep = !stale(p.started_ns);
            if !keep {
                warn!(server = %p.server.endpoint, "connection attempt got no answer");
            }
            keep
        });
        outcomes
    }

    /// Number of peers with any recorded state.
    #[must_use]
    pub fn known_peers(&self) -> usize {
        self.connections.len() + self.pending.len()
    }

    /// Tells every connected peer it is being disconnected and forgets them.
    pub fn disconnect_all(&mut self) -> Vec<SessionOutcome> {
        self.pending.clear();
        let ids: Vec<EndpointId> = self.connected().map(|(id, _)| *id).collect();
        ids.into_iter()
            .filter_map(|id| {
                let reply_to = self
                    .connections
                    .get(&id)
                    .and_then(|c| c.destination)
                    .map(|d| d.endpoint);
                let mut outcome = self.close(id, SessionSignal::Disconnected)?;
                outcome.feedback = reply_to.map(|to| {
                    (
                        to,
                        Feedback::new(MessageType::Command, FeedbackKind::Disconnect),
                    )
                });
                Some(outcome)
            })
            .collect()
    }

    fn close(&mut self, endpoint: EndpointId, signal: SessionSignal) -> Option<SessionOutcome> {
        let conn = self.connections.get_mut(&endpoint)?;
        if conn.state != SessionState::Connected {
            return None;
        }
        conn.state = SessionState::Disconnected;
        conn.destination = None;
        info!(endpoint = %endpoint, signal = ?signal, "session closed");

        let mut outcome = SessionOutcome::new(endpoint, SessionState::Disconnected);
        outcome.signal = Some(signal);
        outcome.destination = Some(DestinationChange::Removed(endpoint));
        Some(outcome)
    }

    fn acknowledge(
        &mut self,
        endpoint: EndpointId,
        source: Endpoint,
        message_type: MessageType,
        now_ns: i64,
    ) -> SessionOutcome {
        let reply_to = self.reply_destination(&endpoint, source);
        let state = match self.connections.get_mut(&endpoint) {
            Some(conn) => {
                conn.last_ack = Some(message_type);
                conn.last_activity_ns = now_ns;
                conn.state
            }
            None => SessionState::Disconnected,
        };
        let mut outcome = SessionOutcome::new(endpoint, state);
        outcome.feedback = Some((
            reply_to,
            Feedback::new(message_type, FeedbackKind::MessageReceived),
        ));
        outcome
    }

    fn reply_destination(&self, endpoint: &EndpointId, source: Endpoint) -> Endpoint {
        self.connections
            .get(endpoint)
            .and_then(|c| c.destination)
            .map_or(source, |d| d.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
    const SERVER_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    fn client() -> (EndpointId, Endpoint) {
        (EndpointId::new(CLIENT_IP, 77), Endpoint::new(CLIENT_IP, 40_000))
    }

    fn settings(port: u16) -> Result<UdpConnectionSettings, ProtocolError> {
        Ok(UdpConnectionSettings {
            address: String::new(),
            port,
            max_packet_size: 1400,
        })
    }

    fn connected_server() -> SessionManager {
        let mut mgr = SessionManager::new(Duration::from_secs(10));
        let (id, source) = client();
        mgr.on_init_connection(id, source, settings(8889), 0);
        mgr
    }

    #[test]
    fn init_connection_registers_reply_destination() {
        let mut mgr = SessionManager::new(Duration::from_secs(10));
        let (id, source) = client();
        let outcome = mgr.on_init_connection(id, source, settings(8889), 5);

        let dest = Destination {
            endpoint: Endpoint::new(CLIENT_IP, 8889),
            max_packet_size: 1400,
        };
        assert_eq!(outcome.state, SessionState::Connected);
        assert_eq!(outcome.signal, Some(SessionSignal::Connected));
        assert_eq!(outcome.destination, Some(DestinationChange::Added(id, dest)));
        assert_eq!(
            outcome.feedback,
            Some((
                dest.endpoint,
                Feedback::new(MessageType::InitConnection, FeedbackKind::MessageReceived)
            ))
        );
    }

    #[test]
    fn repeated_init_is_acknowledged_once_without_reregistering() {
        let mut mgr = connected_server();
        let (id, source) = client();
        let outcome = mgr.on_init_connection(id, source, settings(9999), 1);
        assert!(outcome.destination.is_none());
        assert!(outcome.signal.is_none());
        assert_eq!(outcome.feedback.unwrap().0, Endpoint::new(CLIENT_IP, 8889));
    }

    #[test]
    fn undecodable_init_is_still_acknowledged_to_source() {
        let mut mgr = SessionManager::new(Duration::from_secs(10));
        let (id, source) = client();
        let outcome = mgr.on_init_connection(
            id,
            source,
            UdpConnectionSettings::from_bytes(&[0xFF, 0xFF]),
            0,
        );
        assert_eq!(outcome.state, SessionState::Disconnected);
        assert_eq!(outcome.feedback.unwrap().0, source);
    }

    #[test]
    fn disconnect_command_replies_then_disconnects() {
        let mut mgr = connected_server();
        let (id, source) = client();
        let outcome = mgr.on_command(id, source, Ok(Command::Disconnect), 10);

        assert_eq!(outcome.state, SessionState::Disconnected);
        assert_eq!(
            outcome.feedback,
            Some((
                Endpoint::new(CLIENT_IP, 8889),
                Feedback::new(MessageType::Command, FeedbackKind::Disconnect)
            ))
        );
        assert_eq!(outcome.signal, Some(SessionSignal::CommandReceived(Command::Disconnect)));
        assert_eq!(outcome.destination, Some(DestinationChange::Removed(id)));
        assert_eq!(mgr.state(&id), SessionState::Disconnected);
    }

    #[test]
    fn command_from_unknown_peer_goes_to_source() {
        let mut mgr = SessionManager::new(Duration::from_secs(10));
        let (id, source) = client();
        let outcome = mgr.on_command(id, source, Ok(Command::Restart), 0);
        let (to, fb) = outcome.feedback.unwrap();
        assert_eq!(to, source);
        assert_eq!(fb.kind, FeedbackKind::Restart);
        assert!(outcome.destination.is_none());
    }

    #[test]
    fn settings_are_acknowledged() {
        let mut mgr = connected_server();
        let (id, source) = client();
        let outcome = mgr.on_settings(id, source, MessageType::UpdateColorSettings, 3);
        let (_, fb) = outcome.feedback.unwrap();
        assert_eq!(fb.received_type(), Some(MessageType::UpdateColorSettings));
        assert_eq!(fb.kind, FeedbackKind::MessageReceived);
        assert_eq!(
            mgr.connection(&id).unwrap().last_ack,
            Some(MessageType::UpdateColorSettings)
        );
    }

    #[test]
    fn client_connects_on_init_ack_from_pending_server() {
        let mut mgr = SessionManager::new(Duration::from_secs(10));
        let server = Destination {
            endpoint: Endpoint::new(SERVER_IP, 8888),
            max_packet_size: 9000,
        };
        mgr.begin_connect(server, 0);
        assert_eq!(mgr.state_by_address(SERVER_IP), SessionState::Connecting);

        let server_id = EndpointId::new(SERVER_IP, 1);
        let unrelated = Feedback::new(MessageType::UpdateMiscSettings, FeedbackKind::MessageReceived);
        assert!(mgr.on_feedback(server_id, unrelated, 1).is_none());

        let ack = Feedback::new(MessageType::InitConnection, FeedbackKind::MessageReceived);
        let outcome = mgr.on_feedback(server_id, ack, 2).unwrap();
        assert_eq!(outcome.state, SessionState::Connected);
        assert_eq!(outcome.destination, Some(DestinationChange::Added(server_id, server)));
        assert_eq!(mgr.state_by_address(SERVER_IP), SessionState::Connected);

        let bye = Feedback::new(MessageType::Command, FeedbackKind::Shutdown);
        let outcome = mgr.on_feedback(server_id, bye, 3).unwrap();
        assert_eq!(outcome.signal, Some(SessionSignal::Disconnected));
        assert_eq!(mgr.state(&server_id), SessionState::Disconnected);
    }

    #[test]
    fn sending_a_command_closes_sessions() {
        let mut mgr = connected_server();
        let outcomes = mgr.on_command_sent(Command::Quit);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].state, SessionState::Disconnected);
        assert!(mgr.on_command_sent(Command::Quit).is_empty());
    }

    #[test]
    fn inactivity_disconnects_silent_peers() {
        let mut mgr = connected_server();
        let (id, _) = client();
        mgr.touch(&id, 5_000_000_000);

        assert!(mgr.check_inactivity(15_000_000_000).is_empty());
        let outcomes = mgr.check_inactivity(15_000_000_001);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].signal, Some(SessionSignal::TimedOut));
        assert!(mgr.check_inactivity(99_000_000_000).is_empty());
    }

    #[test]
    fn closed_sessions_and_unanswered_attempts_are_forgotten() {
        let mut mgr = SessionManager::new(Duration::from_secs(10));
        for i in 0..50u16 {
            let id = EndpointId::new(CLIENT_IP, u32::from(i));
            mgr.on_init_connection(id, Endpoint::new(CLIENT_IP, 40_000 + i), settings(8889), 0);
        }
        let server = Destination {
            endpoint: Endpoint::new(SERVER_IP, 8888),
            max_packet_size: 1400,
        };
        mgr.begin_connect(server, 0);
        assert_eq!(mgr.known_peers(), 51);

        assert!(mgr.check_inactivity(9_000_000_000).is_empty());
        assert_eq!(mgr.known_peers(), 51);
        assert_eq!(mgr.check_inactivity(11_000_000_000).len(), 50);
        assert_eq!(mgr.known_peers(), 0);
        assert_eq!(mgr.state_by_address(SERVER_IP), SessionState::Disconnected);
    }

    #[test]
    fn disconnect_all_notifies_each_peer() {
        let mut mgr = connected_server();
        let outcomes = mgr.disconnect_all();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].feedback,
            Some((
                Endpoint::new(CLIENT_IP, 8889),
                Feedback::new(MessageType::Command, FeedbackKind::Disconnect)
            ))
        );
        assert_eq!(mgr.connected().count(), 0);
    }
}
