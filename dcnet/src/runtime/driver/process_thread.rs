//! Processing thread: reassembly, clock sync, and session handling.
//!
//! Owns every per-peer structure (reassemblers, clocks, sessions), so none
//! of them needs a lock. Packets arrive through the receive thread's
//! [`PacketQueue`]; everything leaving this thread goes out as
//! [`TxCommand`]s or [`Event`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::net::{Endpoint, EndpointId};
use crate::time::now_ns;
use crate::trace::{debug, info, trace, warn};

use super::clock::ClockSynchronizer;
use super::commands::{ProcessCommand, TxCommand};
use super::config::DriverConfig;
use super::events::{Event, EventSink, ReceivedFrame};
use super::protocol::{Command, Feedback, MessageType, UdpConnectionSettings};
use super::reassembly::{
    Completion, CompletedMessage, MessageReassembler, ReassemblyStats, RejectReason, UpdateResult,
};
use super::reception::ReceptionMonitor;
use super::rx_thread::{PacketQueue, ReceivedPacket};
use super::session::{
    Destination, DestinationChange, SessionManager, SessionOutcome, SessionSignal, SessionState,
};
use super::stats::DriverStats;

/// Emit a clock update every this many synchro samples.
const CLOCK_REPORT_EVERY: usize = 100;

/// Interval between timeout and inactivity sweeps.
const SWEEP_INTERVAL_NS: i64 = 10_000_000;

const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Synchro samples further than this from zero are discarded.
const MAX_CLOCK_SAMPLE_NS: i64 = 10_000_000_000;

/// Processing thread state and event loop.
pub struct Processor {
    queue: Arc<PacketQueue>,
    drained: VecDeque<ReceivedPacket>,
    reassemblers: HashMap<(EndpointId, MessageType), MessageReassembler>,
    clocks: HashMap<EndpointId, ClockSynchronizer>,
    reception: HashMap<EndpointId, ReceptionMonitor>,
    sessions: SessionManager,
    tx: Sender<TxCommand>,
    commands: Receiver<ProcessCommand>,
    events: EventSink,
    stats: Arc<DriverStats>,
    pool_depth: usize,
    reassembly_timeout: Duration,
    max_packet_size: usize,
    shutdown: Arc<AtomicBool>,
    /// Reassemblers quiet for this long are dropped.
    idle_timeout_ns: i64,
    last_sweep_ns: i64,
}

impl Processor {
    #[must_use]
    pub fn new(
        config: &DriverConfig,
        queue: Arc<PacketQueue>,
        tx: Sender<TxCommand>,
        commands: Receiver<ProcessCommand>,
        events: EventSink,
        stats: Arc<DriverStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            drained: VecDeque::with_capacity(config.packet_queue_capacity),
            reassemblers: HashMap::new(),
            clocks: HashMap::new(),
            reception: HashMap::new(),
            sessions: SessionManager::new(config.session_timeout),
            tx,
            commands,
            events,
            stats,
            pool_depth: config.pool_depth,
            reassembly_timeout: config.reassembly_timeout,
            max_packet_size: config.max_packet_size,
            shutdown,
            idle_timeout_ns: i64::try_from(config.session_timeout.as_nanos()).unwrap_or(i64::MAX),
            last_sweep_ns: now_ns(),
        }
    }

    /// Runs until the shutdown flag or a `Shutdown` command.
    pub fn run(&mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.process_commands() {
                return;
            }
            let processed = self.process_pending();

            let now = now_ns();
            if now - self.last_sweep_ns >= SWEEP_INTERVAL_NS {
                self.sweep(now);
                self.last_sweep_ns = now;
            }
            if processed == 0 {
                thread::sleep(IDLE_WAIT);
            }
        }
    }

    /// Returns `false` on shutdown.
    fn process_commands(&mut self) -> bool {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                ProcessCommand::Connect { server, settings } => self.connect(server, &settings),
                ProcessCommand::SendCommand(command) => {
                    self.send_tx(TxCommand::Broadcast {
                        message_type: MessageType::Command,
                        payload: command.encode().to_vec(),
                    });
                    for outcome in self.sessions.on_command_sent(command) {
                        self.apply(outcome);
                    }
                }
                ProcessCommand::DisconnectAll => {
                    for outcome in self.sessions.disconnect_all() {
                        self.apply(outcome);
                    }
                }
                ProcessCommand::QueryState { address, reply } => {
                    let _ = reply.send(self.sessions.state_by_address(address));
                }
                ProcessCommand::Shutdown => {
                    debug!("process: shutdown command received");
                    return false;
                }
            }
        }
        true
    }

    fn connect(&mut self, server: Endpoint, settings: &UdpConnectionSettings) {
        let payload = match settings.to_bytes() {
            Ok(payload) => payload,
            Err(_e) => {
                warn!(server = %server, error = %_e, "cannot encode connection settings");
                return;
            }
        };
        self.sessions.begin_connect(
            Destination {
                endpoint: server,
                max_packet_size: self.max_packet_size,
            },
            now_ns(),
        );
        self.send_tx(TxCommand::SendTo {
            to: server,
            message_type: MessageType::InitConnection,
            payload,
        });
    }

    /// Handles every packet queued since the last call. Returns how many.
    pub fn process_pending(&mut self) -> usize {
        self.queue.swap(&mut self.drained);
        let count = self.drained.len();
        while let Some(packet) = self.drained.pop_front() {
            self.handle_packet(packet);
        }
        count
    }

    fn handle_packet(&mut self, packet: ReceivedPacket) {
        self.sessions.touch(&packet.endpoint, packet.received_ns);

        let message_type = match packet.header.kind() {
            Ok(ty) => ty,
            Err(_) => {
                warn!(
                    endpoint = %packet.endpoint,
                    message_type = packet.header.message_type,
                    "unknown message type"
                );
                self.events.emit(Event::UnknownMessageType {
                    endpoint: packet.endpoint,
                    message_type: packet.header.message_type,
                });
                return;
            }
        };

        let session_only = matches!(message_type, MessageType::Synchro | MessageType::DataFrame);
        if session_only && self.sessions.state(&packet.endpoint) != SessionState::Connected {
            DriverStats::add(&self.stats.unsolicited_packets, 1);
            trace!(
                endpoint = %packet.endpoint,
                message_type = %message_type,
                "dropping packet from peer without a session"
            );
            return;
        }

        match message_type {
            MessageType::Synchro => self.handle_synchro(&packet),
            MessageType::Ping => {
                trace!(endpoint = %packet.endpoint, "ping");
            }
            _ => self.reassemble(packet, message_type),
        }
    }

    fn handle_synchro(&mut self, packet: &ReceivedPacket) {
        let sample = packet
            .received_ns
            .checked_sub(packet.header.creation_timestamp_ns)
            .filter(|d| d.unsigned_abs() <= MAX_CLOCK_SAMPLE_NS.unsigned_abs());
        let Some(sample) = sample else {
            debug!(
                endpoint = %packet.endpoint,
                emitted_ns = packet.header.creation_timestamp_ns,
                received_ns = packet.received_ns,
                "discarding implausible synchro timestamp"
            );
            return;
        };
        let clock = self.clocks.entry(packet.endpoint).or_default();
        clock.update_average_difference(sample);
        let samples = clock.sample_count();
        if samples % CLOCK_REPORT_EVERY == 0 {
            let offset_ns = clock.average_offset();
            debug!(endpoint = %packet.endpoint, offset_ns, samples, "clock offset");
            self.events.emit(Event::ClockOffset {
                endpoint: packet.endpoint,
                offset_ns,
                samples,
            });
        }
    }

    fn reassemble(&mut self, packet: ReceivedPacket, message_type: MessageType) {
        let (pool_depth, timeout) = (self.pool_depth, self.reassembly_timeout);
        let reassembler = self
            .reassemblers
            .entry((packet.endpoint, message_type))
            .or_insert_with(|| MessageReassembler::new(pool_depth, timeout));

        let before = reassembler.stats();
        let completion = match reassembler.update(&packet.header, &packet.payload, packet.received_ns) {
            UpdateResult::Complete => reassembler.finish(packet.header.message_id),
            UpdateResult::Rejected(reason) => Completion::Rejected(reason),
            UpdateResult::Pending | UpdateResult::Duplicate => Completion::NotReady,
        };
        let after = reassembler.stats();
        DriverStats::add(&self.stats.pool_overruns, after.overruns - before.overruns);

        if message_type == MessageType::DataFrame {
            let lost = lost_messages(&before, &after);
            if lost > 0 {
                self.reception.entry(packet.endpoint).or_default().record_losses(lost);
                if !matches!(completion, Completion::Accepted(_)) {
                    self.report_reception(packet.endpoint, now_ns());
                }
            }
        }

        match completion {
            Completion::Accepted(message) => {
                DriverStats::add(&self.stats.completed_messages, 1);
                self.dispatch(packet.endpoint, packet.source, message_type, message);
            }
            Completion::Stale { message_id, .. } => {
                DriverStats::add(&self.stats.stale_messages, 1);
                self.events.emit(Event::StaleMessageDropped {
                    endpoint: packet.endpoint,
                    message_type,
                    message_id,
                });
            }
            Completion::Rejected(RejectReason::Overrun) | Completion::NotReady => {}
            Completion::Rejected(_) => {
                DriverStats::add(&self.stats.invalid_packets, 1);
            }
        }
    }

    fn dispatch(
        &mut self,
        endpoint: EndpointId,
        source: Endpoint,
        message_type: MessageType,
        message: CompletedMessage,
    ) {
        let now = now_ns();
        trace!(
            endpoint = %endpoint,
            message_type = %message_type,
            message_id = message.message_id,
            len = message.data.len(),
            "message complete"
        );
        let outcome = match message_type {
            MessageType::DataFrame => {
                let clock_offset_ns = self
                    .clocks
                    .get(&endpoint)
                    .map_or(0, ClockSynchronizer::average_offset);
                let latency_ns = now.saturating_sub(
                    message
                        .first_packet_emitted_ns
                        .saturating_add(clock_offset_ns),
                );
                self.reception.entry(endpoint).or_default().record_delivery(
                    now,
                    message.data.len(),
                    latency_ns,
                );
                self.events.emit(Event::Frame(ReceivedFrame {
                    endpoint,
                    message_id: message.message_id,
                    data: message.data,
                    first_packet_received_ns: message.first_packet_received_ns,
                    first_packet_emitted_ns: message.first_packet_emitted_ns,
                    clock_offset_ns,
                }));
                self.report_reception(endpoint, now);
                None
            }
            MessageType::InitConnection => {
                let settings = UdpConnectionSettings::from_bytes(&message.data);
                Some(self.sessions.on_init_connection(endpoint, source, settings, now))
            }
            MessageType::Command => {
                let command = Command::decode(&message.data);
                Some(self.sessions.on_command(endpoint, source, command, now))
            }
            MessageType::Feedback => match Feedback::decode(&message.data) {
                Ok(feedback) => {
                    self.events.emit(Event::Feedback { endpoint, feedback });
                    self.sessions.on_feedback(endpoint, feedback, now)
                }
                Err(_e) => {
                    warn!(endpoint = %endpoint, error = %_e, "undecodable feedback");
                    None
                }
            },
            ty if ty.is_settings() => {
                let outcome = self.sessions.on_settings(endpoint, source, ty, now);
                self.events.emit(Event::Settings {
                    endpoint,
                    message_type: ty,
                    payload: message.data,
                });
                Some(outcome)
            }
            _ => None,
        };
        if let Some(outcome) = outcome {
            self.apply(outcome);
        }
    }

    /// Carries out a session transition: feedback first, then destination
    /// changes, then the application signal.
    fn apply(&mut self, outcome: SessionOutcome) {
        if let Some((to, feedback)) = outcome.feedback {
            self.send_tx(TxCommand::SendTo {
                to,
                message_type: MessageType::Feedback,
                payload: feedback.encode().to_vec(),
            });
        }
        match outcome.destination {
            Some(DestinationChange::Added(id, dest)) => {
                self.send_tx(TxCommand::AddDestination(id, dest));
            }
            Some(DestinationChange::Removed(id)) => {
                self.send_tx(TxCommand::RemoveDestination(id));
            }
            None => {}
        }
        if let Some(signal) = outcome.signal {
            // Connecting peers may restart their ids; closed ones are gone.
            self.forget_history(&outcome.endpoint);
            self.events.emit(Event::Session {
                endpoint: outcome.endpoint,
                signal,
            });
        }
    }

    fn forget_history(&mut self, endpoint: &EndpointId) {
        self.reassemblers.retain(|(id, _), _| id != endpoint);
        self.clocks.remove(endpoint);
        self.reception.remove(endpoint);
    }

    fn report_reception(&self, endpoint: EndpointId, now: i64) {
        if let Some(monitor) = self.reception.get(&endpoint) {
            self.events.emit(Event::ReceptionStatus {
                endpoint,
                status: monitor.status(now),
            });
        }
    }

    fn sweep(&mut self, now: i64) {
        let mut timed_out = Vec::new();
        for ((endpoint, message_type), reassembler) in &mut self.reassemblers {
            let count = reassembler.check_timeout(now);
            if count > 0 {
                timed_out.push((*endpoint, *message_type, count));
            }
        }
        for (endpoint, message_type, count) in timed_out {
            DriverStats::add(&self.stats.timed_out_messages, count as u64);
            self.events.emit(Event::MessagesTimedOut {
                endpoint,
                message_type,
                count,
            });
            if message_type == MessageType::DataFrame
                && let Some(monitor) = self.reception.get_mut(&endpoint)
            {
                monitor.record_losses(count);
                self.report_reception(endpoint, now);
            }
        }
        for outcome in self.sessions.check_inactivity(now) {
            self.apply(outcome);
        }

        let idle_ns = self.idle_timeout_ns;
        self.reassemblers.retain(|_, r| !r.is_idle(now, idle_ns));
        let sessions = &self.sessions;
        self.clocks
            .retain(|id, _| sessions.state(id) == SessionState::Connected);
        self.reception
            .retain(|id, _| sessions.state(id) == SessionState::Connected);
    }

    fn send_tx(&self, cmd: TxCommand) {
        if self.tx.send(cmd).is_err() {
            info!("TX thread gone, dropping command");
        }
    }
}

/// Messages of one reassembler that will never be delivered.
fn lost_messages(before: &ReassemblyStats, after: &ReassemblyStats) -> usize {
    let lost = |s: &ReassemblyStats| s.overruns + s.superseded + s.stale;
    (lost(after) - lost(before)) as usize
}
