//! Countdown timers driven by the event loop
//!
//! A running timer holds the instant it expires at, so time spent anywhere
//! in an iteration counts towards it, callbacks included.

use super::{LoopHandle, TimerHandle};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut(&LoopHandle)>>;

struct Timer {
    handle: TimerHandle,
    period: Duration,
    repeat: bool,
    /// `None` while stopped
    deadline: Option<Instant>,
    callback: TimerCallback,
}

/// Timers in registration order
#[derive(Default)]
pub(crate) struct TimerList {
    timers: Vec<Timer>,
}

impl TimerList {
    pub(crate) fn add(
        &mut self,
        handle: TimerHandle,
        period: Duration,
        repeat: bool,
        callback: TimerCallback,
        now: Instant,
    ) {
        self.timers.push(Timer {
            handle,
            period,
            repeat,
            deadline: Some(now + period),
            callback,
        });
    }

    pub(crate) fn remove(&mut self, handle: TimerHandle) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.handle != handle);
        self.timers.len() != before
    }

    pub(crate) fn contains(&self, handle: TimerHandle) -> bool {
        self.timers.iter().any(|t| t.handle == handle)
    }

    /// Re-arm with the full period
    pub(crate) fn restart(&mut self, handle: TimerHandle, now: Instant) -> bool {
        self.with_timer(handle, |t| t.deadline = Some(now + t.period))
    }

    /// Change the period and re-arm
    pub(crate) fn update(&mut self, handle: TimerHandle, period: Duration, now: Instant) -> bool {
        self.with_timer(handle, |t| {
            t.period = period;
            t.deadline = Some(now + period);
        })
    }

    pub(crate) fn stop(&mut self, handle: TimerHandle) -> bool {
        self.with_timer(handle, |t| t.deadline = None)
    }

    pub(crate) fn is_running(&self, handle: TimerHandle) -> bool {
        self.timers
            .iter()
            .any(|t| t.handle == handle && t.deadline.is_some())
    }

    /// Time from `now` until the next running timer expires
    pub(crate) fn next_expiry(&self, now: Instant) -> Option<Duration> {
        self.timers
            .iter()
            .filter_map(|t| t.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Timers expired at `now`, in registration order
    pub(crate) fn due(&self, now: Instant) -> Vec<TimerHandle> {
        self.timers
            .iter()
            .filter(|t| t.deadline.is_some_and(|d| d <= now))
            .map(|t| t.handle)
            .collect()
    }

    /// Retire one expired timer and hand out its callback
    ///
    /// One-shot timers are removed, repeating ones re-armed from `now`.
    /// Returns `None` if the timer is gone or was re-armed since it expired.
    pub(crate) fn fire(&mut self, handle: TimerHandle, now: Instant) -> Option<TimerCallback> {
        let index = self
            .timers
            .iter()
            .position(|t| t.handle == handle && t.deadline.is_some_and(|d| d <= now))?;
        if self.timers[index].repeat {
            let timer = &mut self.timers[index];
            timer.deadline = Some(now + timer.period);
            Some(timer.callback.clone())
        } else {
            Some(self.timers.remove(index).callback)
        }
    }

    fn with_timer(&mut self, handle: TimerHandle, f: impl FnOnce(&mut Timer)) -> bool {
        match self.timers.iter_mut().find(|t| t.handle == handle) {
            Some(timer) => {
                f(timer);
                true
            }
            None => false,
        }
    }
}
