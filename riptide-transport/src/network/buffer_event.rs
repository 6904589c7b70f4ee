//! Buffered, event-driven socket backend.
//!
//! A [`BufferEvent`] owns one socket plus its input and output buffers. Each
//! call to [`BufferEvent::next_event`] waits for socket readiness, moves as
//! many bytes as the socket accepts without blocking, and reports one
//! notification: input became readable, queued output fully flushed, or an
//! error (timeout, EOF, socket failure). Partial reads and writes are the
//! normal case and never surface as events of their own.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until};

use super::socket::close_socket;

/// Direction of a socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Transport condition delivered to a connection's error callback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {direction} timed out")]
    Timeout { direction: Direction },

    #[error("peer closed the connection")]
    Eof,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, TransportError::Eof)
    }
}

/// Notification produced by one turn of the backend.
#[derive(Debug)]
pub(crate) enum BackendEvent {
    /// New bytes were appended to the input buffer.
    Readable,
    /// The output buffer drained completely.
    WriteComplete,
    /// A direction failed and has been disabled.
    Error(TransportError),
    /// Nothing can make progress: no socket, or both directions are
    /// disabled, full or empty.
    Idle,
}

enum Readiness {
    Readable(io::Result<()>),
    Writable(io::Result<()>),
    TimedOut(Direction),
}

/// Socket plus buffers, timeouts and enable flags for one peer connection.
pub struct BufferEvent {
    stream: Option<TcpStream>,
    input: BytesMut,
    output: BytesMut,
    timeout: Duration,
    read_deadline: Instant,
    write_deadline: Instant,
    read_enabled: bool,
    write_enabled: bool,
    read_high_watermark: usize,
    read_paused: bool,
}

impl BufferEvent {
    /// Binds `stream` with both directions enabled and the timeout armed.
    pub fn new(stream: TcpStream, timeout: Duration, read_high_watermark: usize) -> Self {
        let now = Instant::now();
        Self {
            stream: Some(stream),
            input: BytesMut::with_capacity(read_high_watermark),
            output: BytesMut::new(),
            timeout,
            read_deadline: now + timeout,
            write_deadline: now + timeout,
            read_enabled: true,
            write_enabled: true,
            read_high_watermark,
            read_paused: false,
        }
    }

    pub fn has_socket(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Detaches the socket, leaving the buffers in place.
    pub fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Re-arms both timeouts and re-enables both directions.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        let deadline = Instant::now() + timeout;
        self.read_deadline = deadline;
        self.write_deadline = deadline;
        self.read_enabled = true;
        self.write_enabled = true;
    }

    pub fn read_high_watermark(&self) -> usize {
        self.read_high_watermark
    }

    /// Stops reading from the socket once `high` input bytes are buffered.
    pub fn set_read_high_watermark(&mut self, high: usize) {
        self.read_high_watermark = high;
    }

    pub fn is_read_enabled(&self) -> bool {
        self.read_enabled
    }

    pub fn is_write_enabled(&self) -> bool {
        self.write_enabled
    }

    pub fn input(&self) -> &BytesMut {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut BytesMut {
        &mut self.input
    }

    /// Number of queued output bytes not yet accepted by the socket.
    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Queues `data` behind any output already waiting.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.output.is_empty() {
            self.write_deadline = Instant::now() + self.timeout;
        }
        self.output.extend_from_slice(data);
    }

    /// Waits for the next notification.
    pub(crate) async fn next_event(&mut self) -> BackendEvent {
        loop {
            let Some(stream) = self.stream.as_ref() else {
                return BackendEvent::Idle;
            };

            // Reading resumes below the watermark with a fresh idle deadline.
            let read_paused = self.input.len() >= self.read_high_watermark;
            if self.read_paused && !read_paused {
                self.read_deadline = Instant::now() + self.timeout;
            }
            self.read_paused = read_paused;

            let want_read = self.read_enabled && !read_paused;
            let want_write = self.write_enabled && !self.output.is_empty();
            if !want_read && !want_write {
                return BackendEvent::Idle;
            }

            // Socket readiness wins over a deadline that expired meanwhile.
            let readiness = tokio::select! {
                biased;
                result = stream.readable(), if want_read => Readiness::Readable(result),
                result = stream.writable(), if want_write => Readiness::Writable(result),
                () = sleep_until(self.read_deadline), if want_read => Readiness::TimedOut(Direction::Read),
                () = sleep_until(self.write_deadline), if want_write => Readiness::TimedOut(Direction::Write),
            };

            let event = match readiness {
                Readiness::Readable(Ok(())) => self.fill_input(),
                Readiness::Writable(Ok(())) => self.flush_output(),
                Readiness::Readable(Err(e)) => {
                    self.read_enabled = false;
                    Some(BackendEvent::Error(TransportError::Io(e)))
                }
                Readiness::Writable(Err(e)) => {
                    self.write_enabled = false;
                    Some(BackendEvent::Error(TransportError::Io(e)))
                }
                Readiness::TimedOut(direction) => {
                    match direction {
                        Direction::Read => self.read_enabled = false,
                        Direction::Write => self.write_enabled = false,
                    }
                    Some(BackendEvent::Error(TransportError::Timeout { direction }))
                }
            };

            if let Some(event) = event {
                return event;
            }
        }
    }

    fn fill_input(&mut self) -> Option<BackendEvent> {
        let stream = self.stream.as_ref()?;
        let room = self.read_high_watermark.saturating_sub(self.input.len());
        self.input.reserve(room);

        let result = {
            let mut limited = (&mut self.input).limit(room);
            stream.try_read_buf(&mut limited)
        };

        match result {
            Ok(0) => {
                self.read_enabled = false;
                Some(BackendEvent::Error(TransportError::Eof))
            }
            Ok(n) => {
                self.read_deadline = Instant::now() + self.timeout;
                tracing::trace!("Read {} bytes, {} buffered", n, self.input.len());
                Some(BackendEvent::Readable)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                self.read_enabled = false;
                Some(BackendEvent::Error(TransportError::Io(e)))
            }
        }
    }

    fn flush_output(&mut self) -> Option<BackendEvent> {
        let stream = self.stream.as_ref()?;

        match stream.try_write(&self.output) {
            Ok(n) => {
                self.output.advance(n);
                self.write_deadline = Instant::now() + self.timeout;
                tracing::trace!("Wrote {} bytes, {} still queued", n, self.output.len());
                self.output.is_empty().then_some(BackendEvent::WriteComplete)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                self.write_enabled = false;
                Some(BackendEvent::Error(TransportError::Io(e)))
            }
        }
    }

    /// Closes the socket and releases both buffers.
    pub async fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            close_socket(stream).await;
        }
        self.input = BytesMut::new();
        self.output = BytesMut::new();
    }
}

impl fmt::Debug for BufferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferEvent")
            .field("has_socket", &self.stream.is_some())
            .field("input_len", &self.input.len())
            .field("output_len", &self.output.len())
            .field("timeout", &self.timeout)
            .field("read_enabled", &self.read_enabled)
            .field("write_enabled", &self.write_enabled)
            .finish()
    }
}
