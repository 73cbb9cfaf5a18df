//! Reconnecting duplex transport
//!
//! Protocol-independent substrate for byte-stream devices (TCP socket or
//! serial line) that must come back on their own after a drop.
//!
//! # Thread Model
//!
//! 1. **Supervisor** (one per transport, lives from `start()` to `stop()`):
//!    - Dials the endpoint; on failure sleeps the backoff and dials again,
//!      indefinitely, while running
//!    - On success spawns the two connection workers and blocks until either ends
//!    - Tears the connection down through [`ActiveConnection`]'s `Drop`, so the
//!      stream and workers are released on every exit path
//!
//! 2. **Reader** (one per connection): hands the inbound stream to the
//!    [`StreamProtocol`] hook
//!
//! 3. **Writer** (one per connection): drains the outbound queue in order and
//!    flushes each frame. An empty frame is the shutdown sentinel.
//!
//! ```text
//!            ┌──────────── running ────────────┐
//!  connect ──┤ ok   → reader + writer → either ends → teardown ─┐
//!            │ fail → sleep(backoff) ──────────────────────────┤
//!            └─────────────────────────────────────────────────┘
//! ```

use crate::config::{DuplexEndpoint, SerialConfig};
use crate::core::worker::Worker;
use crate::error::{DeviceError, DeviceResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// How often blocked loops re-check their flags
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// TCP dial timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for each worker during teardown
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for the supervisor in `stop()`
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between reconnect attempts
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

/// Inbound protocol hook
///
/// Called once per connection on the reader worker. Implementations parse
/// frames from `reader` and return when the stream ends, fails, or `alive`
/// clears. Read calls time out periodically, so `TimedOut`/`WouldBlock` should
/// be treated as "nothing yet" (see [`is_timeout`]).
pub trait StreamProtocol: Send + 'static {
    /// Consume the inbound stream of one connection
    fn read_stream(&mut self, reader: &mut dyn Read, alive: &AtomicBool) -> io::Result<()> {
        discard(reader, alive)
    }
}

/// Protocol hook that discards everything it receives
#[derive(Debug, Default)]
pub struct NoopProtocol;

impl StreamProtocol for NoopProtocol {}

/// Whether an I/O error is a read timeout rather than a failure
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn discard(reader: &mut dyn Read, alive: &AtomicBool) -> io::Result<()> {
    let mut buf = [0u8; 256];
    while alive.load(Ordering::Relaxed) {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => log::trace!("Discarded {} inbound bytes", n),
            Err(ref e) if is_timeout(e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Tuning for a [`DuplexTransport`]
#[derive(Debug, Clone)]
pub struct DuplexOptions {
    /// Delay between reconnect attempts
    pub backoff: Duration,
    /// Outbound queue capacity
    pub queue_capacity: usize,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            queue_capacity: 64,
        }
    }
}

/// Handle used to force a stream closed from another thread
enum Closer {
    Tcp(TcpStream),
    Serial,
}

impl Closer {
    fn close(&self) {
        if let Closer::Tcp(stream) = self {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// One established connection, split for the two workers
struct Connection {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    closer: Closer,
}

/// Serial port handle viewed as a plain byte stream
struct PortIo(Box<dyn SerialPort>);

impl Read for PortIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn connect(endpoint: &DuplexEndpoint) -> io::Result<Connection> {
    match endpoint {
        DuplexEndpoint::Tcp { host, port } => {
            let addr = (host.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", host))
                })?;
            let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(POLL_INTERVAL))?;

            Ok(Connection {
                reader: Box::new(stream.try_clone()?),
                writer: Box::new(stream.try_clone()?),
                closer: Closer::Tcp(stream),
            })
        }
        DuplexEndpoint::Serial(config) => {
            let polling = SerialConfig {
                timeout_ms: config.timeout_ms.min(POLL_INTERVAL.as_millis() as u64),
                ..config.clone()
            };
            let port = crate::transport::serial::open_port(&polling).map_err(io::Error::other)?;
            let writer = port.try_clone().map_err(io::Error::other)?;

            Ok(Connection {
                reader: Box::new(PortIo(port)),
                writer: Box::new(PortIo(writer)),
                closer: Closer::Serial,
            })
        }
    }
}

/// Human-readable endpoint name
pub fn endpoint_label(endpoint: &DuplexEndpoint) -> String {
    match endpoint {
        DuplexEndpoint::Tcp { host, port } => format!("tcp://{}:{}", host, port),
        DuplexEndpoint::Serial(config) => format!("serial://{}", config.port),
    }
}

/// State shared between the transport handle, the supervisor and the workers
struct Shared {
    endpoint: DuplexEndpoint,
    label: String,
    backoff: Duration,
    running: AtomicBool,
    connected: AtomicBool,
    connects: AtomicU64,
    protocol: Mutex<Box<dyn StreamProtocol>>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    closer: Mutex<Option<Closer>>,
}

/// Reconnecting duplex transport
pub struct DuplexTransport {
    shared: Arc<Shared>,
    supervisor: Option<Worker>,
}

impl DuplexTransport {
    /// Create a stopped transport
    pub fn new(
        endpoint: DuplexEndpoint,
        protocol: Box<dyn StreamProtocol>,
        options: DuplexOptions,
    ) -> Self {
        let (outbound_tx, outbound_rx) = bounded(options.queue_capacity.max(1));
        let label = endpoint_label(&endpoint);

        Self {
            shared: Arc::new(Shared {
                endpoint,
                label,
                backoff: options.backoff,
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                connects: AtomicU64::new(0),
                protocol: Mutex::new(protocol),
                outbound_tx,
                outbound_rx,
                closer: Mutex::new(None),
            }),
            supervisor: None,
        }
    }

    /// Start the connect loop; no-op when already running
    pub fn start(&mut self) -> io::Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        match Worker::spawn("duplex-supervisor", move || supervise(shared)) {
            Ok(worker) => {
                self.supervisor = Some(worker);
                log::info!("Duplex transport started for {}", self.shared.label);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Stop the connect loop and release the connection; idempotent
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(supervisor) = self.supervisor.take() else {
            return;
        };

        // Wake a writer blocked on the queue
        let _ = self.shared.outbound_tx.try_send(Vec::new());

        if !supervisor.join_timeout(STOP_TIMEOUT) {
            if let Some(closer) = self.shared.closer.lock().take() {
                closer.close();
            }
            self.shared.connected.store(false, Ordering::Release);
        }
        log::info!("Duplex transport stopped for {}", self.shared.label);
    }

    /// Queue a frame for the writer
    ///
    /// Fails when the queue is full; frames are never silently dropped.
    pub fn send(&self, frame: Vec<u8>) -> DeviceResult<()> {
        if frame.is_empty() {
            return Err(DeviceError::Config("empty frames are reserved".to_string()));
        }
        match self.shared.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeviceError::read(format!(
                "outbound queue full for {}",
                self.shared.label
            ))),
            Err(TrySendError::Disconnected(_)) => Err(DeviceError::NotOpen(self.shared.label.clone())),
        }
    }

    /// Whether the connect loop is running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether a connection is currently established
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of successful connections since creation
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Endpoint label (e.g. "tcp://10.0.0.5:2000")
    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Supervisor loop - dials, runs one connection at a time, backs off on failure
fn supervise(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        match connect(&shared.endpoint) {
            Ok(connection) => {
                let count = shared.connects.fetch_add(1, Ordering::Relaxed) + 1;
                log::info!("Connected to {} (connection #{})", shared.label, count);
                run_connection(&shared, connection);
                log::info!("Disconnected from {}", shared.label);
            }
            Err(e) => {
                log::debug!("Connect to {} failed: {}", shared.label, e);
                sleep_while_running(&shared.running, shared.backoff);
            }
        }
    }
    log::info!("Duplex supervisor for {} exiting", shared.label);
}

/// Live connection; dropping it tears everything down
struct ActiveConnection {
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    workers: Vec<Worker>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);

        if let Some(closer) = self.shared.closer.lock().take() {
            closer.close();
        }
        let _ = self.shared.outbound_tx.try_send(Vec::new());

        for worker in self.workers.drain(..) {
            worker.join_timeout(WORKER_JOIN_TIMEOUT);
        }
    }
}

fn run_connection(shared: &Arc<Shared>, connection: Connection) {
    let Connection {
        mut reader,
        mut writer,
        closer,
    } = connection;

    *shared.closer.lock() = Some(closer);
    shared.connected.store(true, Ordering::Release);

    let mut active = ActiveConnection {
        shared: Arc::clone(shared),
        alive: Arc::new(AtomicBool::new(true)),
        workers: Vec::with_capacity(2),
    };
    let (done_tx, done_rx) = bounded::<&'static str>(2);

    let reader_shared = Arc::clone(shared);
    let reader_alive = Arc::clone(&active.alive);
    let reader_done = done_tx.clone();
    match Worker::spawn("duplex-reader", move || {
        let result = reader_shared
            .protocol
            .lock()
            .read_stream(&mut *reader, &reader_alive);
        if let Err(e) = result {
            log::warn!("Read from {} failed: {}", reader_shared.label, e);
        }
        let _ = reader_done.send("reader");
    }) {
        Ok(worker) => active.workers.push(worker),
        Err(e) => {
            log::error!("Failed to spawn duplex reader: {}", e);
            return;
        }
    }

    let writer_shared = Arc::clone(shared);
    let writer_alive = Arc::clone(&active.alive);
    match Worker::spawn("duplex-writer", move || {
        if let Err(e) = write_loop(&mut *writer, &writer_shared, &writer_alive) {
            log::warn!("Write to {} failed: {}", writer_shared.label, e);
        }
        let _ = done_tx.send("writer");
    }) {
        Ok(worker) => active.workers.push(worker),
        Err(e) => {
            log::error!("Failed to spawn duplex writer: {}", e);
            return;
        }
    }

    // Block until either worker ends or the transport is stopped
    loop {
        match done_rx.recv_timeout(POLL_INTERVAL) {
            Ok(which) => {
                log::debug!("Duplex {} worker ended for {}", which, shared.label);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Writer loop - drains the outbound queue until the connection dies
fn write_loop(writer: &mut dyn Write, shared: &Shared, alive: &AtomicBool) -> io::Result<()> {
    while alive.load(Ordering::Acquire) {
        match shared.outbound_rx.recv_timeout(POLL_INTERVAL) {
            Ok(frame) if frame.is_empty() => {
                // Sentinel; a stale one left from an earlier teardown is ignored
                if !alive.load(Ordering::Acquire) || !shared.running.load(Ordering::Acquire) {
                    break;
                }
            }
            Ok(frame) => {
                writer.write_all(&frame)?;
                writer.flush()?;
                log::trace!("Sent {} bytes to {}", frame.len(), shared.label);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && running.load(Ordering::Acquire) {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
}
