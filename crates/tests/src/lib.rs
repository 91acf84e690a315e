//! Shared fixtures for the end-to-end tests

use crossover_core::domain::{
    Completion, ConnectionState, ControlBackend, DaemonConfig, Handle, MainConnectionId,
    SimulationConfig, Volume, VolumeTarget,
};
use crossover_infra::Daemon;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Everything a [`Recorder`] saw
#[derive(Debug, Default)]
pub struct Record {
    pub completions: Vec<Completion>,
    pub ticks: Vec<(Handle, VolumeTarget, Volume)>,
    pub mains: Vec<(MainConnectionId, ConnectionState)>,
}

impl Record {
    pub fn completion(&self, handle: Handle) -> Option<&Completion> {
        self.completions.iter().find(|c| c.handle == handle)
    }

    pub fn completions_for(&self, handle: Handle) -> usize {
        self.completions.iter().filter(|c| c.handle == handle).count()
    }
}

/// Controller recording every callback for later inspection
#[derive(Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Record>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn ControlBackend> {
        Box::new(self.clone())
    }
}

impl ControlBackend for Recorder {
    fn on_action_complete(&mut self, completion: &Completion) {
        self.0.borrow_mut().completions.push(*completion);
    }

    fn on_volume_tick(&mut self, handle: Handle, target: VolumeTarget, volume: Volume) {
        self.0.borrow_mut().ticks.push((handle, target, volume));
    }

    fn on_main_connection_state(&mut self, id: MainConnectionId, state: ConnectionState) {
        self.0.borrow_mut().mains.push((id, state));
    }
}

/// Factory topology with latencies short enough for tests
pub fn fast_config() -> DaemonConfig {
    let mut config = DaemonConfig::factory_default();
    config.simulation = SimulationConfig {
        connect_latency_ms: 20,
        disconnect_latency_ms: 10,
        action_latency_ms: 5,
        tick_interval_ms: 1,
        worker_slots: 10,
    };
    config.dispatcher.watchdog_interval_ms = 5;
    config
}

/// Turn the loop until `done` holds; `false` if `timeout` passed first
pub fn drive_until(daemon: &mut Daemon, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        if let Err(e) = daemon.turn() {
            panic!("event loop failed: {e}");
        }
    }
}
