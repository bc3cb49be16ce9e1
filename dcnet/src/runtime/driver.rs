//! Driver runtime: threads that move depth-camera frames over UDP.
//!
//! # Architecture
//!
//! The driver spawns three threads around one shared UDP socket:
//! - **RX thread** (`dcnet-rx`): reads and validates datagrams, queues them.
//! - **Process thread** (`dcnet-process`): reassembles messages, tracks
//!   clock offset, runs the session protocol, emits [`Event`]s.
//! - **TX thread** (`dcnet-tx`): fragments and fans out frames and control
//!   messages, and sends `synchro` when idle.
//!
//! ```text
//!            ┌──────────┐  PacketQueue   ┌──────────────┐  Event channel
//!  socket ──>│ dcnet-rx │──────────────> │dcnet-process │──────────────> application
//!            └──────────┘  (swap buffer) └──────┬───────┘
//!                                               │ TxCommand
//!            ┌──────────┐   frame queue         v
//!  socket <──│ dcnet-tx │<──────────────── Driver handle
//!            └──────────┘  (drop oldest)
//! ```
//!
//! # Session handshake
//!
//! ```text
//! Client                                   Server
//!   │  init_connection(address, port, mtu)   │
//!   │───────────────────────────────────────>│  register reply destination
//!   │  feedback(init_connection, received)   │
//!   │<───────────────────────────────────────│
//!   │                                        │
//!   │  data_frame / synchro                  │
//!   │<───────────────────────────────────────│
//!   │  command(disconnect)                   │
//!   │───────────────────────────────────────>│
//!   │  feedback(command, disconnect)         │
//!   │<───────────────────────────────────────│
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dcnet::runtime::driver::{Driver, DriverConfig, Event};
//!
//! let (driver, events) = Driver::spawn(DriverConfig {
//!     port: 8888,
//!     ..DriverConfig::default()
//! })?;
//!
//! for event in events.iter() {
//!     if let Event::Frame(frame) = event {
//!         println!("frame {} ({} bytes)", frame.message_id, frame.data.len());
//!     }
//! }
//! driver.shutdown();
//! # Ok::<(), dcnet::runtime::driver::DriverError>(())
//! ```

pub mod clock;
pub mod commands;
pub mod config;
pub mod events;
pub mod pool;
pub mod process_thread;
pub mod protocol;
pub mod reassembly;
pub mod reception;
pub mod rx_thread;
pub mod session;
pub mod stats;
pub mod tx_thread;

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use thiserror::Error;

use crate::net::Endpoint;
use crate::trace::{debug, info, warn};

use commands::{ProcessCommand, TxCommand};
use process_thread::Processor;
use rx_thread::{PacketReceiver, ReceiverError, ReceiverOptions};
use tx_thread::{PacketSender, TxThread};

pub use config::{ConfigError, DriverConfig};
pub use events::{Event, ReceivedFrame};
pub use protocol::{Command, Feedback, FeedbackKind, MessageType, UdpConnectionSettings};
pub use reception::ReceptionStatus;
pub use session::{SessionSignal, SessionState};
pub use stats::StatsSnapshot;

use stats::DriverStats;

/// How long a state query waits for the processing thread.
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Error spawning or using the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("settings payload must use a settings message type, got {0}")]
    NotSettings(MessageType),
    #[error("invalid connection settings: {0}")]
    Protocol(#[from] protocol::ProtocolError),
    #[error("driver threads have stopped")]
    Closed,
}

/// Handle to a running driver.
///
/// Dropping the handle signals shutdown but does not wait for threads to
/// exit. Use [`Driver::shutdown`] for a graceful stop.
pub struct Driver {
    shutdown_flag: Arc<AtomicBool>,
    receiver: PacketReceiver,
    local_addr: Endpoint,
    max_packet_size: usize,
    process_commands: Sender<ProcessCommand>,
    tx_commands: Sender<TxCommand>,
    frames: Arc<ArrayQueue<Vec<u8>>>,
    stats: Arc<DriverStats>,
    process_handle: Option<JoinHandle<()>>,
    tx_handle: Option<JoinHandle<()>>,
}

impl Driver {
    /// Binds the socket and spawns the driver threads.
    ///
    /// Returns the handle and the receiving end of the event channel.
    ///
    /// # Errors
    ///
    /// Invalid configuration, bind failure, or thread spawn failure.
    pub fn spawn(config: DriverConfig) -> Result<(Self, Receiver<Event>), DriverError> {
        config.validate()?;
        info!(
            bind_address = %config.bind_address,
            port = config.port,
            sender_id = format_args!("{:08x}", config.sender_id),
            max_packet_size = config.max_packet_size,
            "driver starting"
        );

        let stats = Arc::new(DriverStats::default());
        let (events, event_rx) = events::EventSink::new(config.event_capacity, Arc::clone(&stats));
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let mut receiver = PacketReceiver::init(
            &config.bind_address,
            config.port,
            config.protocol,
            ReceiverOptions::from(&config),
            events.clone(),
            Arc::clone(&stats),
        )?;
        let socket = receiver.socket();
        let local_addr = socket
            .local_addr()
            .map_err(|e| DriverError::Receiver(ReceiverError::Io(e)))?;
        if let Err(_e) = socket.set_send_buffer_size(config.send_buffer_size()) {
            warn!(error = %_e, "could not size send buffer");
        }

        let (tx_commands, tx_command_rx) = crossbeam_channel::unbounded();
        let (process_commands, process_command_rx) = crossbeam_channel::unbounded();
        let frames = Arc::new(ArrayQueue::new(config.send_queue_capacity));

        let mut tx = TxThread::new(
            PacketSender::new(socket, config.sender_id, config.checksum, Arc::clone(&stats)),
            tx_command_rx,
            Arc::clone(&frames),
            events.clone(),
            config.max_packet_size,
            Arc::clone(&shutdown_flag),
        );
        let mut processor = Processor::new(
            &config,
            receiver.queue(),
            tx_commands.clone(),
            process_command_rx,
            events,
            Arc::clone(&stats),
            Arc::clone(&shutdown_flag),
        );

        debug!("spawning TX thread");
        let tx_handle = thread::Builder::new()
            .name("dcnet-tx".into())
            .spawn(move || {
                info!("TX thread started");
                tx.run();
                info!("TX thread exiting");
            })
            .map_err(|source| DriverError::Spawn { name: "tx", source })?;

        debug!("spawning process thread");
        let process_handle = thread::Builder::new()
            .name("dcnet-process".into())
            .spawn(move || {
                info!("process thread started");
                processor.run();
                info!("process thread exiting");
            })
            .map_err(|source| {
                shutdown_flag.store(true, Ordering::Relaxed);
                DriverError::Spawn {
                    name: "process",
                    source,
                }
            })?;

        debug!("spawning RX thread");
        if let Err(e) = receiver.start() {
            shutdown_flag.store(true, Ordering::Relaxed);
            return Err(e.into());
        }

        info!(local_addr = %local_addr, "driver started successfully");
        Ok((
            Self {
                shutdown_flag,
                receiver,
                local_addr,
                max_packet_size: config.max_packet_size,
                process_commands,
                tx_commands,
                frames,
                stats,
                process_handle: Some(process_handle),
                tx_handle: Some(tx_handle),
            },
            event_rx,
        ))
    }

    /// Local address of the driver's socket.
    #[must_use]
    pub const fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    /// Queues a serialized frame for every connected peer.
    ///
    /// The queue is bounded; when full the oldest queued frame is dropped.
    pub fn send_frame(&self, frame: Vec<u8>) {
        if self.frames.force_push(frame).is_some() {
            DriverStats::add(&self.stats.send_queue_drops, 1);
            debug!("send queue full, dropped oldest frame");
        }
    }

    /// Connects to a server, asking it to reply to `reply_address` (empty:
    /// the address the request comes from) on this driver's port.
    ///
    /// Completion is reported as [`SessionSignal::Connected`].
    ///
    /// # Errors
    ///
    /// [`DriverError::Closed`] if the driver is shutting down.
    pub fn connect(&self, server: Endpoint, reply_address: &str) -> Result<(), DriverError> {
        let settings = UdpConnectionSettings {
            address: reply_address.to_owned(),
            port: self.local_addr.port(),
            max_packet_size: u16::try_from(self.max_packet_size).unwrap_or(u16::MAX),
        };
        self.process(ProcessCommand::Connect { server, settings })
    }

    /// Sends `command` to every connected peer and closes those sessions.
    ///
    /// # Errors
    ///
    /// [`DriverError::Closed`] if the driver is shutting down.
    pub fn send_command(&self, command: Command) -> Result<(), DriverError> {
        self.process(ProcessCommand::SendCommand(command))
    }

    /// Sends an opaque settings payload to every connected peer.
    ///
    /// # Errors
    ///
    /// [`DriverError::NotSettings`] for a non-settings type, or
    /// [`DriverError::Closed`] if the driver is shutting down.
    pub fn send_settings(&self, message_type: MessageType, payload: Vec<u8>) -> Result<(), DriverError> {
        if !message_type.is_settings() {
            return Err(DriverError::NotSettings(message_type));
        }
        self.tx(TxCommand::Broadcast {
            message_type,
            payload,
        })
    }

    /// Sends a keep-alive to every connected peer.
    ///
    /// # Errors
    ///
    /// [`DriverError::Closed`] if the driver is shutting down.
    pub fn ping(&self) -> Result<(), DriverError> {
        self.tx(TxCommand::Broadcast {
            message_type: MessageType::Ping,
            payload: Vec::new(),
        })
    }

    /// Tells every connected peer it is disconnected and forgets them.
    ///
    /// # Errors
    ///
    /// [`DriverError::Closed`] if the driver is shutting down.
    pub fn disconnect_all(&self) -> Result<(), DriverError> {
        self.process(ProcessCommand::DisconnectAll)
    }

    /// Session state with the peer at `address`.
    ///
    /// # Errors
    ///
    /// [`DriverError::Closed`] if the processing thread does not answer.
    pub fn session_state(&self, address: IpAddr) -> Result<SessionState, DriverError> {
        let (reply, answer) = crossbeam_channel::bounded(1);
        self.process(ProcessCommand::QueryState { address, reply })?;
        answer
            .recv_timeout(QUERY_TIMEOUT)
            .map_err(|_| DriverError::Closed)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Stops every thread and waits for them before the socket is closed.
    pub fn shutdown(mut self) {
        info!("driver shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let _ = self.process_commands.send(ProcessCommand::Shutdown);
        let _ = self.tx_commands.send(TxCommand::Shutdown);

        if let Some(handle) = self.process_handle.take() {
            debug!("waiting for process thread to exit");
            let _ = handle.join();
        }
        if let Some(handle) = self.tx_handle.take() {
            debug!("waiting for TX thread to exit");
            let _ = handle.join();
        }
        debug!("waiting for RX thread to exit");
        self.receiver.stop();
        info!("driver shutdown complete");
    }

    fn process(&self, cmd: ProcessCommand) -> Result<(), DriverError> {
        self.process_commands.send(cmd).map_err(|_| DriverError::Closed)
    }

    fn tx(&self, cmd: TxCommand) -> Result<(), DriverError> {
        self.tx_commands.send(cmd).map_err(|_| DriverError::Closed)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Threads notice within one receive timeout; the receiver's own
        // Drop joins the RX thread.
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}
