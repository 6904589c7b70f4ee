//! Routes backend notifications to a connection's protocol callbacks.
//!
//! Read notifications run the registered read callback in a loop under the
//! session's callback lock until it stops asking for another pass or the
//! input runs dry. Write completion and transport errors invoke their
//! callbacks once each.

use std::mem;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::Instrument;

use super::buffer_event::{BackendEvent, TransportError};
use super::peer_io::PeerIo;

/// What a read callback wants the dispatch loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Call again immediately if input remains.
    Again,
    /// Wait until more bytes arrive.
    More,
    /// Stop for this notification.
    Done,
}

/// Consumes bytes from the connection's input buffer.
pub type CanReadFn = Box<dyn FnMut(&mut PeerIo, &mut BytesMut) -> ReadState + Send>;
/// Runs when queued output has fully reached the socket.
pub type DidWriteFn = Box<dyn FnMut(&mut PeerIo) + Send>;
/// Receives timeouts, EOF and socket failures.
pub type GotErrorFn = Box<dyn FnMut(&mut PeerIo, TransportError) + Send>;

#[derive(Default)]
pub(crate) struct IoCallbacks {
    can_read: Option<CanReadFn>,
    did_write: Option<DidWriteFn>,
    got_error: Option<GotErrorFn>,
    // Bumped on every replacement so an in-flight callback knows it was superseded.
    generation: u64,
    reading: bool,
    flush_pending: bool,
}

impl PeerIo {
    /// Installs the protocol callbacks, replacing any previous set.
    ///
    /// Input that arrived before a read callback was installed is delivered
    /// right away, so a handshake-to-protocol handoff loses no bytes.
    pub fn set_io_functions(
        &mut self,
        can_read: Option<CanReadFn>,
        did_write: Option<DidWriteFn>,
        got_error: Option<GotErrorFn>,
    ) {
        self.callbacks.can_read = can_read;
        self.callbacks.did_write = did_write;
        self.callbacks.got_error = got_error;
        self.callbacks.generation += 1;

        if self.callbacks.reading {
            self.callbacks.flush_pending = true;
        } else {
            self.try_read();
        }
    }

    /// Removes all callbacks; buffered input stays where it is.
    pub fn clear_io_functions(&mut self) {
        self.callbacks.can_read = None;
        self.callbacks.did_write = None;
        self.callbacks.got_error = None;
        self.callbacks.generation += 1;
        self.callbacks.flush_pending = false;
    }

    pub fn has_read_callback(&self) -> bool {
        self.callbacks.can_read.is_some()
    }

    /// Runs the read loop if input is already buffered.
    pub fn try_read(&mut self) {
        if !self.bufev.input().is_empty() {
            self.can_read_wrapper();
        }
    }

    /// Waits for the next backend notification and dispatches it.
    ///
    /// Returns false once the connection can make no further progress: the
    /// socket is gone, or every direction is disabled, full or empty.
    pub async fn process_next_event(&mut self) -> bool {
        let event = self.bufev.next_event().instrument(self.span.clone()).await;
        match event {
            BackendEvent::Readable => self.can_read_wrapper(),
            BackendEvent::WriteComplete => self.did_write_wrapper(),
            BackendEvent::Error(error) => self.got_error_wrapper(error),
            BackendEvent::Idle => return false,
        }
        true
    }

    /// Dispatches notifications until the connection goes idle.
    pub async fn run(&mut self) {
        while self.process_next_event().await {}
        self.span.in_scope(|| tracing::trace!("Event loop idle"));
    }

    fn can_read_wrapper(&mut self) {
        let Some(mut can_read) = self.callbacks.can_read.take() else {
            return;
        };
        let generation = self.callbacks.generation;

        let span = self.span.clone();
        let _entered = span.enter();
        let session = Arc::clone(&self.session);
        let _guard = session.lock_callbacks();

        let mut input = mem::take(self.bufev.input_mut());
        self.callbacks.reading = true;

        let mut passes = 0u32;
        loop {
            let state = can_read(self, &mut input);
            passes += 1;

            if self.callbacks.generation != generation {
                break;
            }
            match state {
                ReadState::Again if !input.is_empty() => continue,
                _ => break,
            }
        }

        self.callbacks.reading = false;
        *self.bufev.input_mut() = input;

        tracing::trace!(
            "Read callback ran {} times, {} bytes left",
            passes,
            self.bufev.input().len()
        );

        if self.callbacks.generation == generation {
            self.callbacks.can_read = Some(can_read);
        } else if mem::take(&mut self.callbacks.flush_pending) {
            drop(can_read);
            self.try_read();
        }
    }

    fn did_write_wrapper(&mut self) {
        let Some(mut did_write) = self.callbacks.did_write.take() else {
            return;
        };
        let generation = self.callbacks.generation;

        let span = self.span.clone();
        span.in_scope(|| did_write(self));

        if self.callbacks.generation == generation {
            self.callbacks.did_write = Some(did_write);
        }
    }

    fn got_error_wrapper(&mut self, error: TransportError) {
        let span = self.span.clone();
        let _entered = span.enter();
        match &error {
            TransportError::Io(_) => tracing::warn!("Socket failure: {}", error),
            _ => tracing::debug!("Transport error: {}", error),
        }

        let Some(mut got_error) = self.callbacks.got_error.take() else {
            return;
        };
        let generation = self.callbacks.generation;

        got_error(self, error);

        if self.callbacks.generation == generation {
            self.callbacks.got_error = Some(got_error);
        }
    }
}
