//! Volume ramps
//!
//! A ramped volume change from `from` to `to` advances one unit per tick, so
//! it produces exactly `|to - from|` ticks before the terminal acknowledgement.

use crate::domain::model::Volume;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampType {
    /// Jump straight to the target, no ticks
    #[default]
    Instant,
    /// Unit steps at a constant interval
    Direct,
    /// Unit steps, the domain may shape the curve between them
    Linear,
    Exponential,
}

/// The schedule handed to an adapter for one volume change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPlan {
    pub from: Volume,
    pub to: Volume,
    pub ramp: RampType,
    pub duration: Duration,
}

impl RampPlan {
    pub fn new(from: Volume, to: Volume, ramp: RampType, duration: Duration) -> Self {
        Self {
            from,
            to,
            ramp,
            duration,
        }
    }

    pub fn is_ramped(&self) -> bool {
        self.ramp != RampType::Instant && self.from != self.to
    }

    /// Ticks the adapter must report before acknowledging
    pub fn expected_ticks(&self) -> u32 {
        if self.is_ramped() {
            self.from.distance(self.to)
        } else {
            0
        }
    }

    /// Time between two consecutive ticks
    pub fn step_interval(&self) -> Duration {
        match self.expected_ticks() {
            0 => Duration::ZERO,
            n => self.duration / n,
        }
    }

    /// Values reported by the ticks, in order; the last equals `to`
    pub fn steps(&self) -> impl Iterator<Item = Volume> {
        let from = i32::from(self.from.get());
        let direction = if self.to > self.from { 1 } else { -1 };
        (1..=self.expected_ticks() as i32).map(move |i| Volume::new((from + direction * i) as i16))
    }

    /// Whether `value` strictly moves from `last` toward the target
    /// without overshooting it
    pub fn is_progress(&self, last: Volume, value: Volume) -> bool {
        if self.to >= last {
            value > last && value <= self.to
        } else {
            value < last && value >= self.to
        }
    }
}
