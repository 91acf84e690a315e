//! Controller callbacks
//!
//! The controller decides what to connect and when; the dispatcher reports
//! back through [`ControlBackend`].

use crate::domain::error::Result;
use crate::domain::handle::Handle;
use crate::domain::model::{
    ConnectionId, ConnectionState, HotSink, MainConnectionId, SinkId, SourceId, Volume,
};
use crate::domain::ramp::RampType;
use std::time::Duration;

/// What a finished action produced, besides its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDetail {
    None,
    Connection(ConnectionId),
    Volume(Volume),
    HotSink(HotSink),
}

/// The single terminal report for a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub handle: Handle,
    pub result: Result<()>,
    pub detail: CompletionDetail,
}

/// Target of a volume ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeTarget {
    Sink(SinkId),
    Source(SourceId),
}

/// One entry of a batched volume request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeChange {
    pub target: VolumeTarget,
    pub volume: Volume,
    pub ramp: RampType,
    pub time: Duration,
}

impl VolumeChange {
    pub fn new(target: VolumeTarget, volume: Volume) -> Self {
        Self {
            target,
            volume,
            ramp: RampType::Instant,
            time: Duration::ZERO,
        }
    }

    pub fn ramped(mut self, ramp: RampType, time: Duration) -> Self {
        self.ramp = ramp;
        self.time = time;
        self
    }
}

pub trait ControlBackend {
    /// Called exactly once per handle when it reaches a terminal state
    fn on_action_complete(&mut self, completion: &Completion);

    /// Called for every accepted progress tick of a ramped volume change
    fn on_volume_tick(&mut self, _handle: Handle, _target: VolumeTarget, _volume: Volume) {}

    fn on_main_connection_state(&mut self, _id: MainConnectionId, _state: ConnectionState) {}
}

/// Controller that ignores every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NullController;

impl ControlBackend for NullController {
    fn on_action_complete(&mut self, _completion: &Completion) {}
}
