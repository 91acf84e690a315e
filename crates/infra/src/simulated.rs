//! Simulated domain adapter running every request on a worker thread
//!
//! Each accepted request occupies one worker slot until its acknowledgement
//! is sent. Workers sleep for the configured latency, can be cancelled
//! through [`RoutingBackend::async_abort`], and report through the routing
//! mailbox, so results reach the dispatcher on the event-loop thread.

use crate::handoff::MailboxSender;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossover_core::domain::{
    ConnectionFormat, ConnectionId, CrossfaderId, DomainId, DomainState, Handle, HotSink,
    InterfaceVersion, RampPlan, RampType, Result, RoutingBackend, RoutingError, RoutingEvent,
    SimulationConfig, SinkId, SoundProperty, SourceId, SourceState, Volume, VolumeChange,
    ROUTING_INTERFACE_VERSION,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

type CancelMap = Arc<Mutex<HashMap<Handle, Sender<()>>>>;

fn lock(jobs: &Mutex<HashMap<Handle, Sender<()>>>) -> MutexGuard<'_, HashMap<Handle, Sender<()>>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a worker sees while running
struct Job {
    cancel: Receiver<()>,
    events: MailboxSender<RoutingEvent>,
}

impl Job {
    /// Sleep for `duration`; `true` if cancelled meanwhile
    fn wait(&self, duration: Duration) -> bool {
        match self.cancel.recv_timeout(duration) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn emit(&self, event: RoutingEvent) {
        if self.events.send(event).is_err() {
            debug!("Routing mailbox closed, dropping event");
        }
    }
}

/// Events a worker reports once its slot is released, acknowledgement first
type Finish = Vec<RoutingEvent>;

pub struct ThreadedDomain {
    busname: String,
    config: SimulationConfig,
    version: InterfaceVersion,
    events: MailboxSender<RoutingEvent>,
    jobs: CancelMap,
    busy: Arc<AtomicUsize>,
}

impl ThreadedDomain {
    pub fn new(
        busname: impl Into<String>,
        config: SimulationConfig,
        events: MailboxSender<RoutingEvent>,
    ) -> Self {
        Self {
            busname: busname.into(),
            config,
            version: ROUTING_INTERFACE_VERSION,
            events,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report a different interface version
    pub fn with_interface_version(mut self, version: InterfaceVersion) -> Self {
        self.version = version;
        self
    }

    /// Requests currently occupying a worker slot
    pub fn active_jobs(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    fn latency(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn spawn<F>(&self, handle: Handle, work: F) -> Result<()>
    where
        F: FnOnce(&Job) -> Finish + Send + 'static,
    {
        let slots = self.config.worker_slots;
        if self
            .busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < slots).then_some(n + 1)
            })
            .is_err()
        {
            warn!(bus = %self.busname, %handle, slots, "No free worker slot");
            return Err(RoutingError::NotPossible);
        }

        let (cancel_tx, cancel_rx) = channel::bounded(1);
        lock(&self.jobs).insert(handle, cancel_tx);

        let job = Job {
            cancel: cancel_rx,
            events: self.events.clone(),
        };
        let jobs = self.jobs.clone();
        let busy = self.busy.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.busname, handle))
            .spawn(move || {
                let finish = work(&job);
                lock(&jobs).remove(&handle);
                busy.fetch_sub(1, Ordering::SeqCst);
                for event in finish {
                    job.emit(event);
                }
            });

        if let Err(e) = spawned {
            lock(&self.jobs).remove(&handle);
            self.busy.fetch_sub(1, Ordering::SeqCst);
            warn!(bus = %self.busname, %handle, error = %e, "Failed to start worker");
            return Err(RoutingError::Unknown);
        }
        debug!(bus = %self.busname, %handle, "Worker started");
        Ok(())
    }

    /// Walk a volume plan, emitting one tick per unit step
    ///
    /// Returns the volume reached and whether the ramp ran to completion.
    fn run_ramp<T>(job: &Job, plan: RampPlan, fallback_tick: Duration, tick: T) -> (Volume, bool)
    where
        T: Fn(Volume) -> RoutingEvent,
    {
        let interval = match plan.step_interval() {
            d if d.is_zero() => fallback_tick,
            d => d,
        };
        let mut reached = plan.from;
        for step in plan.steps() {
            if job.wait(interval) {
                return (reached, false);
            }
            job.emit(tick(step));
            reached = step;
        }
        (reached, true)
    }

    fn volume_job<T, A>(&self, handle: Handle, plan: RampPlan, tick: T, ack: A) -> Result<()>
    where
        T: Fn(Volume) -> RoutingEvent + Send + 'static,
        A: Fn(Volume, Result<()>) -> RoutingEvent + Send + 'static,
    {
        let latency = Self::latency(self.config.action_latency_ms);
        let fallback_tick = Self::latency(self.config.tick_interval_ms);
        self.spawn(handle, move |job| {
            let ack = if !plan.is_ramped() {
                if job.wait(latency) {
                    ack(plan.from, Err(RoutingError::Aborted))
                } else {
                    ack(plan.to, Ok(()))
                }
            } else {
                match Self::run_ramp(job, plan, fallback_tick, tick) {
                    (reached, true) => ack(reached, Ok(())),
                    (reached, false) => ack(reached, Err(RoutingError::Aborted)),
                }
            };
            vec![ack]
        })
    }

    /// A request that only waits for the action latency
    fn simple_job<A>(&self, handle: Handle, latency: Duration, ack: A) -> Result<()>
    where
        A: Fn(Result<()>) -> RoutingEvent + Send + 'static,
    {
        self.spawn(handle, move |job| {
            let result = if job.wait(latency) {
                Err(RoutingError::Aborted)
            } else {
                Ok(())
            };
            vec![ack(result)]
        })
    }
}

impl RoutingBackend for ThreadedDomain {
    fn busname(&self) -> &str {
        &self.busname
    }

    fn interface_version(&self) -> InterfaceVersion {
        self.version
    }

    fn async_abort(&mut self, handle: Handle) -> Result<()> {
        let jobs = lock(&self.jobs);
        let cancel = jobs.get(&handle).ok_or(RoutingError::NonExistent)?;
        // A full channel means an abort is already on its way
        let _ = cancel.try_send(());
        debug!(bus = %self.busname, %handle, "Worker cancelled");
        Ok(())
    }

    fn async_connect(
        &mut self,
        handle: Handle,
        connection: ConnectionId,
        _source: SourceId,
        _sink: SinkId,
        _format: ConnectionFormat,
    ) -> Result<()> {
        let latency = Self::latency(self.config.connect_latency_ms);
        let delay = i16::try_from(self.config.connect_latency_ms).unwrap_or(i16::MAX);
        self.spawn(handle, move |job| {
            if job.wait(latency) {
                return vec![RoutingEvent::AckConnect {
                    handle,
                    connection,
                    result: Err(RoutingError::Aborted),
                }];
            }
            vec![
                RoutingEvent::AckConnect {
                    handle,
                    connection,
                    result: Ok(()),
                },
                RoutingEvent::TimingInformationChanged { connection, delay },
            ]
        })
    }

    fn async_disconnect(&mut self, handle: Handle, connection: ConnectionId) -> Result<()> {
        let latency = Self::latency(self.config.disconnect_latency_ms);
        self.simple_job(handle, latency, move |result| RoutingEvent::AckDisconnect {
            handle,
            connection,
            result,
        })
    }

    fn async_set_sink_volume(
        &mut self,
        handle: Handle,
        sink: SinkId,
        plan: RampPlan,
    ) -> Result<()> {
        self.volume_job(
            handle,
            plan,
            move |volume| RoutingEvent::SinkVolumeTick {
                handle,
                sink,
                volume,
            },
            move |volume, result| RoutingEvent::AckSetSinkVolume {
                handle,
                volume,
                result,
            },
        )
    }

    fn async_set_source_volume(
        &mut self,
        handle: Handle,
        source: SourceId,
        plan: RampPlan,
    ) -> Result<()> {
        self.volume_job(
            handle,
            plan,
            move |volume| RoutingEvent::SourceVolumeTick {
                handle,
                source,
                volume,
            },
            move |volume, result| RoutingEvent::AckSetSourceVolume {
                handle,
                volume,
                result,
            },
        )
    }

    /// Entries are applied together once the longest ramp time has passed;
    /// no ticks are reported for a batch
    fn async_set_volumes(&mut self, handle: Handle, changes: &[VolumeChange]) -> Result<()> {
        let longest = changes.iter().map(|c| c.time).max().unwrap_or_default();
        let latency = longest.max(Self::latency(self.config.action_latency_ms));
        let reached: Vec<_> = changes.iter().map(|c| (c.target, c.volume)).collect();
        self.spawn(handle, move |job| {
            let ack = if job.wait(latency) {
                RoutingEvent::AckSetVolumes {
                    handle,
                    volumes: Vec::new(),
                    result: Err(RoutingError::Aborted),
                }
            } else {
                RoutingEvent::AckSetVolumes {
                    handle,
                    volumes: reached,
                    result: Ok(()),
                }
            };
            vec![ack]
        })
    }

    fn async_set_source_state(
        &mut self,
        handle: Handle,
        _source: SourceId,
        _state: SourceState,
    ) -> Result<()> {
        let latency = Self::latency(self.config.action_latency_ms);
        self.simple_job(handle, latency, move |result| {
            RoutingEvent::AckSetSourceState { handle, result }
        })
    }

    fn async_set_sink_sound_property(
        &mut self,
        handle: Handle,
        _sink: SinkId,
        _property: SoundProperty,
    ) -> Result<()> {
        let latency = Self::latency(self.config.action_latency_ms);
        self.simple_job(handle, latency, move |result| {
            RoutingEvent::AckSetSinkSoundProperty { handle, result }
        })
    }

    fn async_set_sink_sound_properties(
        &mut self,
        handle: Handle,
        _sink: SinkId,
        _properties: &[SoundProperty],
    ) -> Result<()> {
        let latency = Self::latency(self.config.action_latency_ms);
        self.simple_job(handle, latency, move |result| {
            RoutingEvent::AckSetSinkSoundProperties { handle, result }
        })
    }

    fn async_set_source_sound_property(
        &mut self,
        handle: Handle,
        _source: SourceId,
        _property: SoundProperty,
    ) -> Result<()> {
        let latency = Self::latency(self.config.action_latency_ms);
        self.simple_job(handle, latency, move |result| {
            RoutingEvent::AckSetSourceSoundProperty { handle, result }
        })
    }

    fn async_set_source_sound_properties(
        &mut self,
        handle: Handle,
        _source: SourceId,
        _properties: &[SoundProperty],
    ) -> Result<()> {
        let latency = Self::latency(self.config.action_latency_ms);
        self.simple_job(handle, latency, move |result| {
            RoutingEvent::AckSetSourceSoundProperties { handle, result }
        })
    }

    fn async_cross_fade(
        &mut self,
        handle: Handle,
        _crossfader: CrossfaderId,
        hot_sink: HotSink,
        _ramp: RampType,
        time: Duration,
    ) -> Result<()> {
        let latency = time.max(Self::latency(self.config.action_latency_ms));
        self.simple_job(handle, latency, move |result| {
            let hot_sink = if result.is_ok() { hot_sink } else { HotSink::Unknown };
            RoutingEvent::AckCrossFading {
                handle,
                hot_sink,
                result,
            }
        })
    }

    fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()> {
        info!(bus = %self.busname, %domain, ?state, "Domain state applied");
        self.events
            .send(RoutingEvent::DomainStateChanged { domain, state })
            .map_err(|_| RoutingError::Unknown)
    }
}
