//! Bookkeeping kept per outstanding handle

use crate::domain::control::VolumeChange;
use crate::domain::model::{
    ConnectionId, CrossfaderId, HotSink, SinkId, SoundProperty, SourceId, SourceState, Volume,
};
use crate::domain::ramp::RampPlan;
use std::time::Instant;

/// Where a handle stands between dispatch and its terminal report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePhase {
    Issued,
    Ticking,
}

/// What the handle is changing, with the requested value
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActionTarget {
    Connect {
        connection: ConnectionId,
    },
    Disconnect {
        connection: ConnectionId,
    },
    SinkVolume {
        sink: SinkId,
        volume: Volume,
    },
    SourceVolume {
        source: SourceId,
        volume: Volume,
    },
    Volumes {
        changes: Vec<VolumeChange>,
    },
    SourceState {
        source: SourceId,
        state: SourceState,
    },
    SinkSoundProperties {
        sink: SinkId,
        properties: Vec<SoundProperty>,
    },
    SourceSoundProperties {
        source: SourceId,
        properties: Vec<SoundProperty>,
    },
    CrossFade {
        crossfader: CrossfaderId,
        hot_sink: HotSink,
    },
}

impl ActionTarget {
    pub(crate) fn connection(&self) -> Option<ConnectionId> {
        match self {
            ActionTarget::Connect { connection } | ActionTarget::Disconnect { connection } => {
                Some(*connection)
            }
            _ => None,
        }
    }
}

/// Tick accounting for a ramped volume change
#[derive(Debug, Clone, Copy)]
pub(crate) struct RampProgress {
    pub plan: RampPlan,
    pub ticks: u32,
    pub last: Volume,
}

impl RampProgress {
    pub(crate) fn new(plan: RampPlan) -> Self {
        Self {
            plan,
            ticks: 0,
            last: plan.from,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PendingAction {
    /// Index of the adapter the request went to
    pub backend: usize,
    pub target: ActionTarget,
    pub phase: HandlePhase,
    pub aborted: bool,
    pub deadline: Instant,
    pub ramp: Option<RampProgress>,
}

impl PendingAction {
    pub(crate) fn new(backend: usize, target: ActionTarget, deadline: Instant) -> Self {
        Self {
            backend,
            target,
            phase: HandlePhase::Issued,
            aborted: false,
            deadline,
            ramp: None,
        }
    }

    pub(crate) fn with_ramp(mut self, plan: RampPlan) -> Self {
        if plan.is_ramped() {
            self.ramp = Some(RampProgress::new(plan));
        }
        self
    }
}
