//! Line-oriented TCP client for instrument communication
//!
//! Every instrument on the bench speaks the same framing: ASCII command
//! lines terminated by a single `\n`, with query replies terminated the same
//! way by the far end. One [`InstrumentLink`] owns one socket; commands for a
//! given instrument are issued from a single task, never concurrently.

use crate::error::{BenchError, Result};
use crate::logging::StructuredLogger;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Persistent line-oriented TCP session to one instrument
#[derive(Debug)]
pub struct InstrumentLink {
    /// Buffered socket; `None` once closed
    stream: Option<BufReader<TcpStream>>,

    /// Peer address, kept for error messages
    peer: String,

    /// I/O timeout applied to every operation
    io_timeout: Duration,

    /// Logger
    logger: StructuredLogger,
}

impl InstrumentLink {
    /// Establish a session to `ip:port`.
    ///
    /// Fails with a connection error when the peer is unreachable or the
    /// handshake does not complete within `io_timeout`.
    pub async fn connect(
        ip: &str,
        port: u16,
        read_buffer: usize,
        io_timeout: Duration,
    ) -> Result<Self> {
        let peer = format!("{}:{}", ip, port);
        let logger = crate::logging::get_instrument_logger("link", &peer);

        let addr: SocketAddr = peer
            .parse()
            .map_err(|e| BenchError::connection(format!("Invalid instrument address {}: {}", peer, e)))?;

        match timeout(io_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                logger.info("Connected to instrument");
                Ok(Self {
                    stream: Some(BufReader::with_capacity(read_buffer, stream)),
                    peer,
                    io_timeout,
                    logger,
                })
            }
            Ok(Err(e)) => {
                let message = format!("Failed to connect to {}: {}", peer, e);
                logger.error(&message);
                Err(BenchError::connection(message))
            }
            Err(_) => {
                let message = format!("Connection to {} timed out", peer);
                logger.error(&message);
                Err(BenchError::connection(message))
            }
        }
    }

    /// Send one command line; a `\n` terminator is appended.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let peer = self.peer.clone();
        let io_timeout = self.io_timeout;
        let stream = self.stream_mut()?;

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');

        match timeout(io_timeout, stream.get_mut().write_all(line.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BenchError::io(format!("Write to {} failed: {}", peer, e))),
            Err(_) => Err(BenchError::timeout(format!("Write to {} timed out", peer))),
        }
    }

    /// Read one `\n`-terminated line, returning the trimmed payload.
    ///
    /// Used both for query replies and for the sensor's unsolicited stream.
    pub async fn read_line(&mut self) -> Result<String> {
        let peer = self.peer.clone();
        let io_timeout = self.io_timeout;
        let stream = self.stream_mut()?;

        let mut line = String::new();
        match timeout(io_timeout, stream.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(BenchError::connection(format!(
                "{} closed the connection",
                peer
            ))),
            Ok(Ok(_)) => Ok(line.trim_end().to_string()),
            Ok(Err(e)) => Err(BenchError::io(format!("Read from {} failed: {}", peer, e))),
            Err(_) => Err(BenchError::timeout(format!(
                "No reply from {} within {:?}",
                peer, io_timeout
            ))),
        }
    }

    /// Send a query command and read its single-line reply.
    pub async fn send_and_receive(&mut self, command: &str) -> Result<String> {
        self.send(command).await?;
        self.read_line().await
    }

    /// Identity query round trip
    pub async fn ping(&mut self) -> Result<String> {
        self.send_and_receive("*IDN?").await
    }

    /// Whether the session is still open
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the session. Safe to call more than once.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            self.logger.info("Closed instrument link");
        }
    }

    /// Peer address this link was opened against
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn stream_mut(&mut self) -> Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| BenchError::connection(format!("Link to {} is closed", self.peer)))
    }
}

impl Drop for InstrumentLink {
    fn drop(&mut self) {
        self.close();
    }
}
