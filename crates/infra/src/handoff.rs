//! Cross-thread handoff into the event loop
//!
//! A [`Mailbox`] pairs a crossbeam channel with a non-blocking socket pair.
//! Senders push a message and then write one wake-up byte; the receiving
//! side is registered as a poll source that drains the wake-up bytes when
//! fired and hands over one message per dispatch pass until the queue is
//! empty.

use crate::event_loop::{Interest, LoopHandle, PollHandle, PollSource, Readiness, Result};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mailbox closed")]
pub struct MailboxClosed;

/// Sending side, usable from any thread
pub struct MailboxSender<T> {
    sender: Sender<T>,
    waker: Arc<UnixStream>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    pub fn send(&self, message: T) -> std::result::Result<(), MailboxClosed> {
        self.sender.send(message).map_err(|_| MailboxClosed)?;
        match (&*self.waker).write(&[1]) {
            Ok(_) => Ok(()),
            // A full socket buffer already guarantees a wake-up
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(MailboxClosed),
            Err(e) => {
                warn!(error = %e, "Failed to wake the event loop");
                Ok(())
            }
        }
    }
}

/// Receiving side, owned by the event-loop thread
pub struct Mailbox<T> {
    receiver: Receiver<T>,
    wake: UnixStream,
}

impl<T: 'static> Mailbox<T> {
    pub fn new() -> Result<(Self, MailboxSender<T>)> {
        let (sender, receiver) = channel::unbounded();
        let (wake, waker) = UnixStream::pair()?;
        wake.set_nonblocking(true)?;
        waker.set_nonblocking(true)?;
        Ok((
            Self { receiver, wake },
            MailboxSender {
                sender,
                waker: Arc::new(waker),
            },
        ))
    }

    /// Register on `event_loop`, calling `handler` for every message
    pub fn register<F>(self, event_loop: &LoopHandle, handler: F) -> PollHandle
    where
        F: FnMut(T, &LoopHandle) + 'static,
    {
        event_loop.add_source(
            Interest::Readable,
            MailboxSource {
                mailbox: self,
                handler,
            },
        )
    }

    /// Blocking receive for consumers running outside an event loop
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    fn drain_wakeups(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to drain mailbox wake-ups");
                    break;
                }
            }
        }
    }
}

struct MailboxSource<T, F> {
    mailbox: Mailbox<T>,
    handler: F,
}

impl<T, F> AsRawFd for MailboxSource<T, F> {
    fn as_raw_fd(&self) -> RawFd {
        self.mailbox.wake.as_raw_fd()
    }
}

impl<T: 'static, F: FnMut(T, &LoopHandle)> PollSource for MailboxSource<T, F> {
    fn fired(&mut self, readiness: Readiness, _handle: &LoopHandle) {
        if readiness.is_hangup() {
            debug!("Every mailbox sender is gone");
        }
        self.mailbox.drain_wakeups();
    }

    fn check(&mut self, _handle: &LoopHandle) -> bool {
        !self.mailbox.is_empty()
    }

    fn dispatch(&mut self, handle: &LoopHandle) -> bool {
        match self.mailbox.receiver.try_recv() {
            Ok(message) => {
                (self.handler)(message, handle);
                !self.mailbox.is_empty()
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }
}
