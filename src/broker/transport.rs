//! Bounded, retrying I/O over a client socket.
//!
//! Nothing here returns an `io::Error`: failures are logged, the transport
//! is marked closed, and callers see `false` / `None`.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, trace, warn};

use crate::config::RetryConfig;
use crate::core::packet::frame_len;

const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// Runs an operation a fixed number of times with a fixed pause between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retrier {
    pub tries: u32,
    pub delay: Duration,
}

impl Retrier {
    pub const fn new(tries: u32, delay: Duration) -> Self {
        Self { tries, delay }
    }

    /// 5 tries, 450 ms apart.
    pub const fn for_send() -> Self {
        Self::new(5, Duration::from_millis(450))
    }

    /// Calls `op` until it yields `Some`, at most `tries` times.
    pub async fn attempt<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 1..=self.tries {
            if let Some(value) = op().await {
                return Some(value);
            }
            self.pause(attempt).await;
        }
        None
    }

    /// Sleeps between attempts; no pause after the last one.
    pub async fn pause(&self, attempt: u32) {
        if attempt < self.tries {
            sleep(self.delay).await;
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::for_send()
    }
}

/// A client socket plus its read buffer.
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    read_buf: BytesMut,
    send_retry: Retrier,
    recv_retry: Retrier,
    max_frame: usize,
    closed: bool,
}

impl Transport {
    pub fn new(stream: TcpStream, retry: &RetryConfig, max_frame: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            send_retry: Retrier::new(retry.send_tries, Duration::from_millis(retry.send_delay_ms)),
            recv_retry: Retrier::new(retry.recv_tries, Duration::from_millis(retry.recv_delay_ms)),
            max_frame,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes all of `bytes`. Each round waits for write readiness for at
    /// most the retry delay; `false` once the send retrier is exhausted or
    /// the socket failed.
    pub async fn send(&mut self, bytes: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        let retry = self.send_retry;
        let mut written = 0;
        let mut attempt = 0;
        while written < bytes.len() {
            attempt += 1;
            match timeout(retry.delay, self.stream.writable()).await {
                Ok(Ok(())) => match self.stream.try_write(&bytes[written..]) {
                    Ok(0) => {
                        error!("socket accepted zero bytes; closing");
                        self.closed = true;
                        return false;
                    }
                    Ok(n) => {
                        written += n;
                        attempt = 0;
                        continue;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        retry.pause(attempt).await;
                    }
                    Err(e) => {
                        error!("write failed: {}", e);
                        self.closed = true;
                        return false;
                    }
                },
                Ok(Err(e)) => {
                    error!("write readiness failed: {}", e);
                    self.closed = true;
                    return false;
                }
                Err(_) => trace!(attempt, "socket not writable yet"),
            }
            if attempt >= retry.tries {
                warn!(
                    tries = retry.tries,
                    pending = bytes.len() - written,
                    "send retries exhausted"
                );
                self.closed = true;
                return false;
            }
        }
        true
    }

    /// Reads until one whole frame is buffered and returns it. `None` on EOF,
    /// I/O error, an oversized frame, or when the receive retrier runs out
    /// while a frame is still incomplete.
    ///
    /// A frame whose fixed header cannot be parsed is handed back as-is so
    /// the decoder reports the violation.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.closed {
            return None;
        }
        let retry = self.recv_retry;
        let mut attempt = 0;
        loop {
            match frame_len(&self.read_buf) {
                Ok(Some(total)) if total > self.max_frame => {
                    warn!(total, limit = self.max_frame, "frame exceeds max_packet_size");
                    self.closed = true;
                    return None;
                }
                Ok(Some(total)) if self.read_buf.len() >= total => {
                    return Some(self.read_buf.split_to(total).freeze());
                }
                Ok(_) => {}
                Err(_) => return Some(self.read_buf.split().freeze()),
            }

            attempt += 1;
            if attempt > retry.tries {
                warn!(buffered = self.read_buf.len(), "receive retries exhausted");
                return None;
            }
            match timeout(retry.delay, self.stream.readable()).await {
                Ok(Ok(())) => match self.stream.try_read_buf(&mut self.read_buf) {
                    Ok(0) => {
                        debug!("peer closed the connection");
                        self.closed = true;
                        return None;
                    }
                    Ok(_) => attempt = 0,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        error!("read failed: {}", e);
                        self.closed = true;
                        return None;
                    }
                },
                Ok(Err(e)) => {
                    error!("read readiness failed: {}", e);
                    self.closed = true;
                    return None;
                }
                Err(_) => trace!(attempt, "socket not readable yet"),
            }
        }
    }

    /// Waits up to `wait` for inbound data. Returns `true` immediately when a
    /// whole frame is already buffered or the transport is closed, so the
    /// following `recv` reports it.
    pub async fn poll_readable(&mut self, wait: Duration) -> bool {
        if self.closed || self.has_buffered_frame() {
            return true;
        }
        matches!(timeout(wait, self.stream.readable()).await, Ok(_))
    }

    fn has_buffered_frame(&self) -> bool {
        match frame_len(&self.read_buf) {
            Ok(Some(total)) => self.read_buf.len() >= total,
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Best-effort shutdown of the write half.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            trace!("shutdown: {}", e);
        }
    }
}
