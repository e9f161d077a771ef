//! Hardware link: owns the serial port and its connection state.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::SerialError;

/// Longest line kept while waiting for a terminator.
const MAX_LINE_LEN: usize = 4096;

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Opens the underlying byte stream. Production uses [`DeviceOpener`].
pub trait PortOpener: Send + 'static {
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn open(&mut self) -> Result<Self::Port, SerialError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Opens a real serial device through `tokio-serial`.
#[derive(Debug, Clone)]
pub struct DeviceOpener {
    path: String,
    baud_rate: u32,
}

impl DeviceOpener {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl PortOpener for DeviceOpener {
    type Port = SerialStream;

    fn open(&mut self) -> Result<SerialStream, SerialError> {
        tokio_serial::new(self.path.as_str(), self.baud_rate)
            .open_native_async()
            .map_err(|source| SerialError::Open {
                path: self.path.clone(),
                source,
            })
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// Timing knobs for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Upper bound for a single `read_line`/`read_exact` call.
    pub read_timeout: Duration,
    /// Delay before the first reopen attempt.
    pub initial_backoff: Duration,
    /// Ceiling for the doubling reopen delay.
    pub max_backoff: Duration,
    /// Give up after this many failed opens or faults with no traffic in
    /// between. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Doubling delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.failures += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// The hardware link.
///
/// State machine: `Disconnected -> Connecting -> Connected`; an I/O error
/// while connected moves to `Faulted`, from which [`connect`](Self::connect)
/// retries after the backoff delay. Once the retry budget is spent the link
/// stays `Faulted`.
///
/// The backoff only resets after the first successful read or write on a
/// freshly opened port. A port that opens and dies straight away keeps
/// doubling its delay and counts against the budget.
///
/// Reads accumulate into the link's own buffer, so dropping a pending
/// `read_line`/`read_exact`/`connect` future loses no data and keeps the
/// backoff schedule.
pub struct SerialLink<O: PortOpener> {
    opener: O,
    settings: LinkSettings,
    port: Option<O::Port>,
    buffer: BytesMut,
    state: watch::Sender<LinkState>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    exhausted: bool,
    healthy: bool,
}

impl<O: PortOpener> SerialLink<O> {
    pub fn new(opener: O, settings: LinkSettings) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            opener,
            backoff: Backoff::new(settings.initial_backoff, settings.max_backoff),
            settings,
            port: None,
            buffer: BytesMut::with_capacity(256),
            state,
            retry_at: None,
            exhausted: false,
            healthy: false,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state transitions (used by the health endpoint).
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    /// True once the retry budget is spent; the link will not reconnect.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn set_state(&self, next: LinkState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    /// Open the port, retrying with exponential backoff.
    pub async fn connect(&mut self) -> Result<(), SerialError> {
        if self.port.is_some() {
            return Ok(());
        }

        loop {
            if self.exhausted {
                return Err(SerialError::RetriesExhausted {
                    attempts: self.backoff.failures(),
                });
            }

            if let Some(at) = self.retry_at {
                sleep_until(at).await;
                self.retry_at = None;
            }

            self.set_state(LinkState::Connecting);
            match self.opener.open() {
                Ok(port) => {
                    self.port = Some(port);
                    self.buffer.clear();
                    self.healthy = false;
                    self.set_state(LinkState::Connected);
                    info!("Serial link connected to {}", self.opener.describe());
                    return Ok(());
                }
                Err(e) => match self.schedule_retry() {
                    Some(delay) => warn!(
                        "Failed to open {} (attempt {}): {}; retrying in {:?}",
                        self.opener.describe(),
                        self.backoff.failures(),
                        e,
                        delay
                    ),
                    None => {
                        let failures = self.backoff.failures();
                        self.set_state(LinkState::Faulted);
                        error!(
                            "Giving up on {} after {} attempts: {}",
                            self.opener.describe(),
                            failures,
                            e
                        );
                        return Err(SerialError::RetriesExhausted { attempts: failures });
                    }
                },
            }
        }
    }

    /// Count a failure and schedule the next open. `None` once the budget is spent.
    fn schedule_retry(&mut self) -> Option<Duration> {
        let delay = self.backoff.next_delay();
        if self
            .settings
            .max_attempts
            .is_some_and(|max| self.backoff.failures() >= max)
        {
            self.exhausted = true;
            self.retry_at = None;
            return None;
        }
        self.retry_at = Some(Instant::now() + delay);
        Some(delay)
    }

    /// The open port carried data; later faults start from the initial delay.
    fn mark_healthy(&mut self) {
        if !self.healthy {
            self.healthy = true;
            self.backoff.reset();
        }
    }

    /// Drop the port, enter `Faulted` and schedule the reopen.
    fn fault(&mut self, err: SerialError) -> SerialError {
        self.port = None;
        self.buffer.clear();
        self.set_state(LinkState::Faulted);

        match self.schedule_retry() {
            Some(delay) => warn!(
                "Serial link to {} faulted: {}; reopening in {:?}",
                self.opener.describe(),
                err,
                delay
            ),
            None => error!(
                "Serial link to {} faulted: {}; giving up after {} attempts",
                self.opener.describe(),
                err,
                self.backoff.failures()
            ),
        }
        err
    }

    /// Write raw bytes. No framing is added.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let Some(port) = self.port.as_mut() else {
            return Err(SerialError::NotConnected);
        };

        let result = async {
            port.write_all(bytes).await?;
            port.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.mark_healthy();
                Ok(())
            }
            Err(e) => Err(self.fault(e.into())),
        }
    }

    /// Read more bytes into the buffer. `Ok(false)` means the deadline passed.
    async fn fill(&mut self, deadline: Instant) -> Result<bool, SerialError> {
        let Some(port) = self.port.as_mut() else {
            return Err(SerialError::NotConnected);
        };

        match timeout_at(deadline, port.read_buf(&mut self.buffer)).await {
            Err(_elapsed) => Ok(false),
            Ok(Ok(0)) => Err(self.fault(SerialError::Closed)),
            Ok(Ok(_)) => {
                self.mark_healthy();
                Ok(true)
            }
            Ok(Err(e)) => Err(self.fault(e.into())),
        }
    }

    /// Read one line ending in `terminator`.
    ///
    /// The terminator and a trailing `\r` are stripped. Returns `Ok(None)`
    /// when the read timeout elapses before a full line is buffered.
    pub async fn read_line(&mut self, terminator: u8) -> Result<Option<String>, SerialError> {
        let deadline = Instant::now() + self.settings.read_timeout;
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.buffer[scanned..]
                .iter()
                .position(|b| *b == terminator)
            {
                let line = self.buffer.split_to(scanned + pos + 1);
                let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                return Ok(Some(text.trim_end_matches('\r').to_string()));
            }
            scanned = self.buffer.len();

            if scanned > MAX_LINE_LEN {
                warn!(
                    "Discarding {} bytes from {} without a line terminator",
                    scanned,
                    self.opener.describe()
                );
                self.buffer.clear();
                scanned = 0;
            }

            if !self.fill(deadline).await? {
                return Ok(None);
            }
        }
    }

    /// Wait until at least `n` bytes are buffered, then take exactly `n`.
    ///
    /// Returns `Ok(None)` when the read timeout elapses first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>, SerialError> {
        let deadline = Instant::now() + self.settings.read_timeout;

        while self.buffer.len() < n {
            if !self.fill(deadline).await? {
                return Ok(None);
            }
        }

        Ok(Some(self.buffer.split_to(n).freeze()))
    }
}
