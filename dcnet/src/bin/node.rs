//! Depth-camera transport node.
//!
//! `serve` streams synthetic depth frames to every client that connects.
//! `connect` joins a server and reports frame sizes and latency.
//!
//! # Usage
//!
//! ```sh
//! dcnet-node serve --port 8888 --fps 30
//! dcnet-node connect --server 192.168.1.20:8888
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: disconnect peers, then shut down

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use signal_hook::consts::{SIGINT, SIGTERM};

use dcnet::net::{Endpoint, Protocol};
use dcnet::time::now_ns;
use dcnet::{
    Command, Driver, DriverConfig, DriverError, Event, ReceptionStatus, SessionSignal,
};

/// Bytes of capture timestamp at the start of every synthetic frame.
const STAMP_LEN: usize = 8;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "dcnet-node", version, about = "Depth-camera frame transport node")]
struct Cli {
    #[command(flatten)]
    socket: SocketArgs,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Args)]
struct SocketArgs {
    /// Local address to bind (empty: any address)
    #[arg(long, default_value = "", global = true)]
    bind: String,
    /// Bind an IPv6 socket
    #[arg(long, global = true)]
    ipv6: bool,
    /// Largest datagram to send, header included
    #[arg(long, default_value_t = 9000, global = true)]
    max_packet_size: usize,
    /// Seconds of silence before a peer is dropped
    #[arg(long, default_value_t = 10, global = true)]
    session_timeout: u64,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Stream synthetic frames to connected clients
    Serve {
        #[arg(short, long, default_value_t = 8888)]
        port: u16,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Frame width in pixels
        #[arg(long, default_value_t = 640)]
        width: usize,
        /// Frame height in pixels
        #[arg(long, default_value_t = 576)]
        height: usize,
    },
    /// Connect to a server and report received frames
    Connect {
        /// Server address, `ip:port`
        #[arg(short, long)]
        server: SocketAddr,
        #[arg(short, long, default_value_t = 0)]
        port: u16,
        /// Address the server should reply to (empty: our source address)
        #[arg(long, default_value = "")]
        reply_address: String,
    },
}

fn main() {
    dcnet::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("dcnet-node: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let term = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&term))?;
    }

    match cli.mode {
        Mode::Serve {
            port,
            fps,
            width,
            height,
        } => serve(&cli.socket, port, fps.max(1), width * height * 2, &term)?,
        Mode::Connect {
            server,
            port,
            reply_address,
        } => connect(&cli.socket, port, Endpoint::from(server), &reply_address, &term)?,
    }
    Ok(())
}

fn config(socket: &SocketArgs, port: u16) -> DriverConfig {
    DriverConfig {
        bind_address: socket.bind.clone(),
        port,
        protocol: if socket.ipv6 {
            Protocol::Ipv6
        } else {
            Protocol::Ipv4
        },
        max_packet_size: socket.max_packet_size,
        session_timeout: Duration::from_secs(socket.session_timeout),
        ..DriverConfig::default()
    }
}

fn serve(
    socket: &SocketArgs,
    port: u16,
    fps: u32,
    frame_len: usize,
    term: &AtomicBool,
) -> Result<(), DriverError> {
    let (driver, events) = Driver::spawn(config(socket, port))?;
    eprintln!(
        "dcnet-node: serving {frame_len}-byte frames at {fps} fps on {}",
        driver.local_addr()
    );

    let period = Duration::from_secs(1) / fps;
    let mut frame = vec![0u8; frame_len.max(STAMP_LEN)];
    let mut counter: u16 = 0;
    let mut next = Instant::now();
    let mut last_report = Instant::now();
    let mut sent = 0u64;

    while !term.load(Ordering::Relaxed) {
        drain_events(&events, &mut sent);
        let now = Instant::now();
        if now >= next {
            fill_frame(&mut frame, counter);
            counter = counter.wrapping_add(1);
            driver.send_frame(frame.clone());
            next += period;
        } else {
            std::thread::sleep((next - now).min(Duration::from_millis(5)));
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            eprintln!("dcnet-node: {sent} frame(s) delivered, {:?}", driver.stats());
            sent = 0;
            last_report = Instant::now();
        }
    }

    eprintln!("\ndcnet-node: received shutdown signal");
    driver.disconnect_all()?;
    std::thread::sleep(Duration::from_millis(50));
    driver.shutdown();
    eprintln!("dcnet-node: stopped");
    Ok(())
}

/// Writes a capture stamp followed by a moving depth ramp.
fn fill_frame(frame: &mut [u8], counter: u16) {
    let (stamp, pixels) = frame.split_at_mut(STAMP_LEN);
    stamp.copy_from_slice(&now_ns().to_le_bytes());
    for (i, px) in pixels.chunks_exact_mut(2).enumerate() {
        let depth = (i as u16).wrapping_add(counter);
        px.copy_from_slice(&depth.to_le_bytes());
    }
}

fn drain_events(events: &Receiver<Event>, sent: &mut u64) {
    for event in events.try_iter() {
        match event {
            Event::Session { endpoint, signal } => {
                eprintln!("dcnet-node: {endpoint}: {signal:?}");
            }
            Event::FrameSent { destinations, .. } if destinations > 0 => *sent += 1,
            Event::InvalidPacket { from, reason } => {
                eprintln!("dcnet-node: invalid packet from {from}: {reason}");
            }
            _ => {}
        }
    }
}

fn connect(
    socket: &SocketArgs,
    port: u16,
    server: Endpoint,
    reply_address: &str,
    term: &AtomicBool,
) -> Result<(), DriverError> {
    let (driver, events) = Driver::spawn(config(socket, port))?;
    eprintln!("dcnet-node: connecting to {server} from {}", driver.local_addr());
    driver.connect(server, reply_address)?;

    let mut latency = LatencyWindow::default();
    let mut last_report = Instant::now();

    while !term.load(Ordering::Relaxed) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Frame(frame)) => {
                if let Some(stamp) = frame.data.get(..STAMP_LEN) {
                    let mut capture = [0u8; STAMP_LEN];
                    capture.copy_from_slice(stamp);
                    let capture_local = frame.capture_to_local(i64::from_le_bytes(capture));
                    latency.record(
                        frame.data.len(),
                        frame.first_packet_received_ns.saturating_sub(capture_local),
                    );
                }
            }
            Ok(Event::ReceptionStatus { status, .. }) => latency.reception = Some(status),
            Ok(Event::Session { endpoint, signal }) => {
                eprintln!("dcnet-node: {endpoint}: {signal:?}");
                if matches!(
                    signal,
                    SessionSignal::Disconnected | SessionSignal::TimedOut
                ) {
                    break;
                }
            }
            Ok(Event::ClockOffset {
                endpoint,
                offset_ns,
                samples,
            }) => {
                eprintln!("dcnet-node: {endpoint}: clock offset {offset_ns} ns over {samples} samples");
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            latency.report();
            last_report = Instant::now();
        }
    }

    eprintln!("\ndcnet-node: disconnecting");
    driver.send_command(Command::Disconnect)?;
    std::thread::sleep(Duration::from_millis(50));
    driver.shutdown();
    eprintln!("dcnet-node: stopped");
    Ok(())
}

#[derive(Debug, Default)]
struct LatencyWindow {
    frames: u64,
    bytes: u64,
    total_ns: i64,
    max_ns: i64,
    reception: Option<ReceptionStatus>,
}

impl LatencyWindow {
    fn record(&mut self, len: usize, latency_ns: i64) {
        self.frames += 1;
        self.bytes += len as u64;
        self.total_ns = self.total_ns.saturating_add(latency_ns);
        self.max_ns = self.max_ns.max(latency_ns);
    }

    fn report(&mut self) {
        if self.frames > 0 {
            eprintln!(
                "dcnet-node: {} frame(s), {} bytes, latency avg {:.2} ms max {:.2} ms",
                self.frames,
                self.bytes,
                self.total_ns as f64 / self.frames as f64 / 1e6,
                self.max_ns as f64 / 1e6,
            );
        }
        if let Some(status) = self.reception {
            eprintln!(
                "dcnet-node: {}% received, {} fps, {} B/s",
                status.success_percent, status.framerate, status.bandwidth_bytes
            );
        }
        *self = Self::default();
    }
}
