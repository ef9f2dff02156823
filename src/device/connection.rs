//! Persistent line-delimited TCP session to one device.
//!
//! [`Connection`] owns the socket halves behind separate locks so the reader
//! task and writers never contend. Transient transport failures close the
//! socket and re-establish it with [`ReconnectPolicy`] backoff; once the
//! policy is exhausted the connection is permanently failed and every call
//! returns [`GatewayError::Connection`].

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::error::GatewayError;
use crate::reconnect::ReconnectPolicy;

/// Terminator appended to every outgoing frame.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Connection parameters for one device.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device host name or address.
    pub host: String,
    /// Device control port.
    pub port: u16,
    /// Bound on establishing the TCP session.
    pub connect_timeout: Duration,
    /// Bound on waiting for the next line.
    pub read_timeout: Duration,
    /// Bound on writing and flushing one line.
    pub write_timeout: Duration,
    /// Backoff applied when the session drops.
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    /// Creates a config with default timeouts for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Errors that close the session and trigger a reconnect.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}

fn non_transient(err: &io::Error) -> GatewayError {
    if err.kind() == io::ErrorKind::InvalidData {
        GatewayError::Parse(err.to_string())
    } else {
        GatewayError::Connection(err.to_string())
    }
}

/// Duplex line stream with timeout-bounded I/O and bounded reconnection.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Serializes recovery so concurrent failures reconnect once.
    reconnect_lock: Mutex<()>,
    /// Bumped after every successful reconnect.
    epoch: AtomicU64,
    reconnect_attempts: AtomicU32,
    alive: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Opens the TCP session within `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Timeout`] if the handshake does not finish in
    /// time, or [`GatewayError::Connection`] if the device refuses.
    pub async fn open(config: ConnectionConfig) -> Result<Self, GatewayError> {
        let (reader, writer) = Self::establish(&config).await?;
        tracing::info!(address = %config.address(), "device connection opened");
        Ok(Self {
            config,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            reconnect_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            alive: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    async fn establish(
        config: &ConnectionConfig,
    ) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), GatewayError> {
        let address = config.address();
        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| GatewayError::timeout(format!("connect to {address}"), config.connect_timeout))?
            .map_err(|e| GatewayError::Connection(format!("connect to {address}: {e}")))?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "could not set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        Ok((BufReader::new(read_half), write_half))
    }

    /// Returns the connection parameters.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns `true` while a live session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
            && !self.failed.load(Ordering::SeqCst)
            && !self.closed.load(Ordering::SeqCst)
    }

    /// Returns `true` once reconnection has been exhausted.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Number of reconnect attempts since the last successful session.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn ensure_usable(&self) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("connection closed".to_string()));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection(format!(
                "{} unreachable: reconnect attempts exhausted",
                self.config.address()
            )));
        }
        Ok(())
    }

    /// Writes `line` plus the terminator and flushes within `write_timeout`.
    ///
    /// A transient failure reconnects and retries the write once on the new
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] when the session is closed or
    /// cannot be re-established, and [`GatewayError::Parse`] for encoding
    /// failures (never retried).
    pub async fn write_line(&self, line: &str) -> Result<(), GatewayError> {
        let mut frame = String::with_capacity(line.len() + LINE_TERMINATOR.len());
        frame.push_str(line);
        frame.push_str(LINE_TERMINATOR);

        let mut retried = false;
        loop {
            self.ensure_usable()?;
            let epoch = self.epoch.load(Ordering::SeqCst);
            let outcome = {
                let mut guard = self.writer.lock().await;
                match guard.as_mut() {
                    Some(writer) => timeout(self.config.write_timeout, async {
                        writer.write_all(frame.as_bytes()).await?;
                        writer.flush().await
                    })
                    .await
                    .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))),
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "no active session")),
                }
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if is_transient(&err) && !retried => {
                    tracing::warn!(address = %self.config.address(), error = %err, "device write failed");
                    self.recover(epoch).await?;
                    retried = true;
                }
                Err(err) if is_transient(&err) => {
                    return Err(GatewayError::Connection(format!("write failed after reconnect: {err}")));
                }
                Err(err) => return Err(non_transient(&err)),
            }
        }
    }

    /// Reads the next terminated line, without its terminator.
    ///
    /// Returns `Ok(None)` when nothing usable arrived: the read timed out or
    /// the session dropped and was re-established.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connection`] once the session is closed or
    /// reconnection is exhausted, and [`GatewayError::Parse`] for non-UTF-8
    /// input.
    pub async fn read_line(&self) -> Result<Option<String>, GatewayError> {
        self.ensure_usable()?;
        let epoch = self.epoch.load(Ordering::SeqCst);
        let outcome = {
            let mut guard = self.reader.lock().await;
            match guard.as_mut() {
                Some(reader) => {
                    let mut buf = String::new();
                    match timeout(self.config.read_timeout, reader.read_line(&mut buf)).await {
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
                        Ok(Ok(0)) => Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "device closed the connection",
                        )),
                        Ok(Ok(_)) if !buf.ends_with('\n') => Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "truncated frame",
                        )),
                        Ok(Ok(_)) => Ok(buf),
                        Ok(Err(err)) => Err(err),
                    }
                }
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "no active session")),
            }
        };

        match outcome {
            Ok(line) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
            Err(err) if is_transient(&err) => {
                tracing::warn!(address = %self.config.address(), error = %err, "device read failed");
                self.recover(epoch).await?;
                Ok(None)
            }
            Err(err) => Err(non_transient(&err)),
        }
    }

    /// Drops the current session and reconnects with backoff.
    ///
    /// `seen_epoch` is the epoch the caller observed before failing; if
    /// another task already reconnected since then this returns at once.
    async fn recover(&self, seen_epoch: u64) -> Result<(), GatewayError> {
        let _guard = self.reconnect_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != seen_epoch {
            return self.ensure_usable();
        }
        self.ensure_usable()?;

        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        self.reader.lock().await.take();

        let policy = &self.config.reconnect;
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if !policy.allows(attempt) {
                self.reconnect_attempts.store(attempt - 1, Ordering::SeqCst);
                self.failed.store(true, Ordering::SeqCst);
                tracing::error!(
                    address = %self.config.address(),
                    attempts = attempt - 1,
                    "device reconnect attempts exhausted"
                );
                return self.ensure_usable();
            }

            let delay = policy.delay(attempt);
            tracing::info!(
                address = %self.config.address(),
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting to device"
            );
            sleep(delay).await;
            self.ensure_usable()?;

            match Self::establish(&self.config).await {
                Ok((reader, writer)) => {
                    *self.reader.lock().await = Some(reader);
                    *self.writer.lock().await = Some(writer);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    self.alive.store(true, Ordering::SeqCst);
                    tracing::info!(address = %self.config.address(), attempt, "device reconnected");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(address = %self.config.address(), attempt, error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    /// Closes the session. Further reads and writes fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        tracing::info!(address = %self.config.address(), "device connection closed");
    }
}
