//! Single-threaded readiness loop over file descriptors and timers
//!
//! Each iteration runs up to four phases per registered source:
//! `prepare` before waiting, `fired` when its descriptor became ready,
//! `check` to decide whether to dispatch, and `dispatch`, which is repeated
//! while it returns `true`. Expired timers fire last. Timers count down
//! against the monotonic clock, so time spent in callbacks counts too.
//!
//! Sources and timers may be added or removed from inside any callback
//! through the [`LoopHandle`] the callback receives.

mod timer;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::cell::RefCell;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use timer::{TimerCallback, TimerList};
use tracing::{debug, trace};

pub type Result<T> = std::result::Result<T, LoopError>;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("nothing to wait on: no poll source and no running timer")]
    NothingToWaitOn,

    #[error("poll failed: {0}")]
    Poll(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown poll source")]
    UnknownSource,

    #[error("unknown timer")]
    UnknownTimer,

    #[error("repeating timer needs a non-zero period")]
    ZeroPeriod,
}

/// Identifies a registered poll source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle(u32);

/// Identifies a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u32);

/// Events a source wants to be woken for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
            Interest::ReadWrite => PollFlags::POLLIN | PollFlags::POLLOUT,
        }
    }
}

/// Readiness reported for a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(PollFlags);

impl Readiness {
    pub fn is_readable(&self) -> bool {
        self.0.contains(PollFlags::POLLIN)
    }

    pub fn is_writable(&self) -> bool {
        self.0.contains(PollFlags::POLLOUT)
    }

    pub fn is_hangup(&self) -> bool {
        self.0.contains(PollFlags::POLLHUP)
    }

    pub fn is_error(&self) -> bool {
        self.0.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL)
    }
}

/// A descriptor-backed participant of the loop
pub trait PollSource {
    /// Called before every wait; `true` asks for a dispatch without waiting
    fn prepare(&mut self, _handle: &LoopHandle) -> bool {
        false
    }

    /// The descriptor became ready
    fn fired(&mut self, readiness: Readiness, handle: &LoopHandle);

    /// Whether the accumulated readiness warrants a dispatch
    fn check(&mut self, _handle: &LoopHandle) -> bool {
        true
    }

    /// Do the work; `true` requests another pass in the same wake-up
    fn dispatch(&mut self, handle: &LoopHandle) -> bool;
}

type SharedSource = Rc<RefCell<dyn PollSource>>;

struct SourceEntry {
    handle: PollHandle,
    fd: RawFd,
    interest: PollFlags,
    source: SharedSource,
}

#[derive(Default)]
struct Registry {
    next_id: u32,
    sources: Vec<SourceEntry>,
    timers: TimerList,
    stopped: bool,
}

impl Registry {
    fn next_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

/// Cloneable access to the loop's sources and timers
#[derive(Clone, Default)]
pub struct LoopHandle {
    registry: Rc<RefCell<Registry>>,
}

impl LoopHandle {
    /// Register `source`, polling the descriptor it exposes
    ///
    /// The source owns the descriptor; it stays open for as long as the
    /// source is registered.
    pub fn add_source<S>(&self, interest: Interest, source: S) -> PollHandle
    where
        S: PollSource + AsRawFd + 'static,
    {
        let fd = source.as_raw_fd();
        let mut registry = self.registry.borrow_mut();
        let handle = PollHandle(registry.next_id());
        registry.sources.push(SourceEntry {
            handle,
            fd,
            interest: interest.flags(),
            source: Rc::new(RefCell::new(source)),
        });
        debug!(source = handle.0, fd, "Poll source added");
        handle
    }

    pub fn remove_source(&self, handle: PollHandle) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        let before = registry.sources.len();
        registry.sources.retain(|e| e.handle != handle);
        if registry.sources.len() == before {
            return Err(LoopError::UnknownSource);
        }
        debug!(source = handle.0, "Poll source removed");
        Ok(())
    }

    pub fn update_interest(&self, handle: PollHandle, interest: Interest) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        let entry = registry
            .sources
            .iter_mut()
            .find(|e| e.handle == handle)
            .ok_or(LoopError::UnknownSource)?;
        entry.interest = interest.flags();
        Ok(())
    }

    pub fn has_source(&self, handle: PollHandle) -> bool {
        self.registry
            .borrow()
            .sources
            .iter()
            .any(|e| e.handle == handle)
    }

    /// Start a timer expiring after `period`, re-armed after every expiry
    /// when `repeat` is set
    pub fn add_timer<F>(&self, period: Duration, repeat: bool, callback: F) -> Result<TimerHandle>
    where
        F: FnMut(&LoopHandle) + 'static,
    {
        if repeat && period.is_zero() {
            return Err(LoopError::ZeroPeriod);
        }
        let callback: TimerCallback = Rc::new(RefCell::new(callback));
        let mut registry = self.registry.borrow_mut();
        let handle = TimerHandle(registry.next_id());
        registry
            .timers
            .add(handle, period, repeat, callback, Instant::now());
        debug!(timer = handle.0, ?period, repeat, "Timer added");
        Ok(handle)
    }

    pub fn remove_timer(&self, handle: TimerHandle) -> Result<()> {
        self.timer_op(|timers| timers.remove(handle))
    }

    /// Re-arm with the current period
    pub fn restart_timer(&self, handle: TimerHandle) -> Result<()> {
        self.timer_op(|timers| timers.restart(handle, Instant::now()))
    }

    /// Change the period and re-arm
    pub fn update_timer(&self, handle: TimerHandle, period: Duration) -> Result<()> {
        self.timer_op(|timers| timers.update(handle, period, Instant::now()))
    }

    /// Keep the timer registered without counting down
    pub fn stop_timer(&self, handle: TimerHandle) -> Result<()> {
        self.timer_op(|timers| timers.stop(handle))
    }

    pub fn is_timer_running(&self, handle: TimerHandle) -> bool {
        self.registry.borrow().timers.is_running(handle)
    }

    pub fn has_timer(&self, handle: TimerHandle) -> bool {
        self.registry.borrow().timers.contains(handle)
    }

    /// Make [`EventLoop::run`] return after the current iteration
    pub fn stop(&self) {
        self.registry.borrow_mut().stopped = true;
    }

    fn timer_op(&self, op: impl FnOnce(&mut TimerList) -> bool) -> Result<()> {
        if op(&mut self.registry.borrow_mut().timers) {
            Ok(())
        } else {
            Err(LoopError::UnknownTimer)
        }
    }

    fn is_stopped(&self) -> bool {
        self.registry.borrow().stopped
    }
}

/// Owner of the dispatch cycle
#[derive(Default)]
pub struct EventLoop {
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Iterate until [`LoopHandle::stop`] is called
    pub fn run(&mut self) -> Result<()> {
        self.handle.registry.borrow_mut().stopped = false;
        debug!("Event loop started");
        while !self.handle.is_stopped() {
            self.turn()?;
        }
        debug!("Event loop stopped");
        Ok(())
    }

    /// One full iteration: prepare, wait, fired, check, dispatch, timers
    pub fn turn(&mut self) -> Result<()> {
        let handle = &self.handle;
        let snapshot: Vec<(PollHandle, RawFd, PollFlags, SharedSource)> = handle
            .registry
            .borrow()
            .sources
            .iter()
            .map(|e| (e.handle, e.fd, e.interest, e.source.clone()))
            .collect();

        let mut immediate = Vec::new();
        for (id, _, _, source) in &snapshot {
            if handle.has_source(*id) && source.borrow_mut().prepare(handle) {
                immediate.push(*id);
            }
        }

        let next_expiry = handle
            .registry
            .borrow()
            .timers
            .next_expiry(Instant::now());
        if snapshot.is_empty() && next_expiry.is_none() && immediate.is_empty() {
            return Err(LoopError::NothingToWaitOn);
        }
        let timeout = if !immediate.is_empty() {
            PollTimeout::ZERO
        } else {
            next_expiry.map_or(PollTimeout::NONE, poll_timeout)
        };

        let revents = {
            let mut fds: Vec<PollFd> = snapshot
                .iter()
                .map(|(_, fd, interest, _)| {
                    // SAFETY: the descriptor belongs to a registered source and
                    // the snapshot keeps that source alive until poll returns.
                    let fd = unsafe { BorrowedFd::borrow_raw(*fd) };
                    PollFd::new(fd, *interest)
                })
                .collect();
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => trace!("Poll interrupted"),
                Err(e) => return Err(e.into()),
            }
            fds.iter()
                .map(|fd| fd.revents().filter(|r| !r.is_empty()))
                .collect::<Vec<_>>()
        };

        let mut candidates = Vec::new();
        for ((id, _, _, source), ready) in snapshot.iter().zip(revents) {
            if ready.is_none() && !immediate.contains(id) {
                continue;
            }
            if !handle.has_source(*id) {
                continue;
            }
            if let Some(flags) = ready {
                source.borrow_mut().fired(Readiness(flags), handle);
            }
            candidates.push((*id, source.clone()));
        }

        let mut dispatching: Vec<(PollHandle, SharedSource)> = candidates
            .into_iter()
            .filter(|(id, source)| handle.has_source(*id) && source.borrow_mut().check(handle))
            .collect();
        while !dispatching.is_empty() {
            dispatching.retain(|(id, source)| {
                handle.has_source(*id) && source.borrow_mut().dispatch(handle)
            });
        }

        let now = Instant::now();
        let due = handle.registry.borrow().timers.due(now);
        for timer in due {
            let callback = {
                let mut registry = handle.registry.borrow_mut();
                registry.timers.fire(timer, now)
            };
            if let Some(callback) = callback {
                trace!(timer = timer.0, "Timer fired");
                (&mut *callback.borrow_mut())(handle);
            }
        }
        Ok(())
    }
}

/// Round up to whole milliseconds so a timer is never woken early
fn poll_timeout(remaining: Duration) -> PollTimeout {
    let millis = remaining.as_micros().div_ceil(1000);
    PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
}
