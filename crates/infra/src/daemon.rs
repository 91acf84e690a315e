//! Daemon context wiring the dispatcher, adapters and mailboxes onto one
//! event loop

use crate::control::{ControlHandle, ControlRequest};
use crate::event_loop::{EventLoop, LoopError, LoopHandle, TimerHandle};
use crate::handoff::{Mailbox, MailboxSender};
use crate::simulated::ThreadedDomain;
use crossover_core::domain::{
    ActionDispatcher, ConfigError, ControlBackend, DaemonConfig, InterfaceVersion, MemoryTopology,
    RoutingBackend, RoutingEvent, ROUTING_INTERFACE_VERSION,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

pub type SharedDispatcher = Rc<RefCell<ActionDispatcher<MemoryTopology>>>;

/// Conditions that keep the daemon from starting
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("event loop error: {0}")]
    Loop(#[from] LoopError),

    #[error("adapter on {bus} implements interface {found}, {required} required")]
    IncompatibleInterface {
        bus: String,
        found: InterfaceVersion,
        required: InterfaceVersion,
    },

    #[error("more than one adapter registered for bus {0}")]
    DuplicateBus(String),

    #[error("no adapter serves bus {0}")]
    MissingBackend(String),
}

pub struct Daemon {
    event_loop: EventLoop,
    dispatcher: SharedDispatcher,
    events: MailboxSender<RoutingEvent>,
    control: ControlHandle,
    watchdog: TimerHandle,
}

impl Daemon {
    /// Start with one simulated threaded adapter per configured bus
    pub fn new(
        config: &DaemonConfig,
        controller: Box<dyn ControlBackend>,
    ) -> Result<Self, StartupError> {
        let simulation = config.simulation.clone();
        let busnames = config.topology.busnames();
        Self::with_backends(config, controller, move |events| {
            busnames
                .into_iter()
                .map(|bus| {
                    Box::new(ThreadedDomain::new(bus, simulation.clone(), events.clone()))
                        as Box<dyn RoutingBackend>
                })
                .collect()
        })
    }

    /// Start with adapters built by `backends` from the routing mailbox
    pub fn with_backends<F>(
        config: &DaemonConfig,
        controller: Box<dyn ControlBackend>,
        backends: F,
    ) -> Result<Self, StartupError>
    where
        F: FnOnce(&MailboxSender<RoutingEvent>) -> Vec<Box<dyn RoutingBackend>>,
    {
        config.validate()?;
        let store = config.topology.build_store()?;
        let mut dispatcher = ActionDispatcher::new(store, &config.dispatcher, controller);

        let event_loop = EventLoop::new();
        let (routing_mailbox, events) = Mailbox::<RoutingEvent>::new()?;
        let (control_mailbox, control) = Mailbox::<ControlRequest>::new()?;

        for backend in backends(&events) {
            let bus = backend.busname().to_string();
            let found = backend.interface_version();
            if !ROUTING_INTERFACE_VERSION.accepts(found) {
                return Err(StartupError::IncompatibleInterface {
                    bus,
                    found,
                    required: ROUTING_INTERFACE_VERSION,
                });
            }
            if dispatcher.add_backend(backend).is_err() {
                return Err(StartupError::DuplicateBus(bus));
            }
        }
        if let Some(bus) = config
            .topology
            .busnames()
            .into_iter()
            .find(|bus| !dispatcher.has_backend(bus))
        {
            return Err(StartupError::MissingBackend(bus));
        }

        let dispatcher = Rc::new(RefCell::new(dispatcher));
        let handle = event_loop.handle();

        let target = dispatcher.clone();
        routing_mailbox.register(&handle, move |event, _| {
            target.borrow_mut().handle_event(event);
        });

        let target = dispatcher.clone();
        control_mailbox.register(&handle, move |request: ControlRequest, event_loop| {
            request.apply(&mut *target.borrow_mut(), event_loop);
        });

        let target = dispatcher.clone();
        let watchdog = handle.add_timer(config.dispatcher.watchdog_interval(), true, move |_| {
            let expired = target.borrow_mut().expire_overdue(Instant::now());
            if expired > 0 {
                warn!(expired, "Watchdog expired overdue actions");
            }
        })?;

        info!(
            domains = config.topology.domains.len(),
            buses = config.topology.busnames().len(),
            pool = config.dispatcher.max_in_flight,
            "Daemon assembled"
        );

        Ok(Self {
            event_loop,
            dispatcher,
            events,
            control: ControlHandle::new(control),
            watchdog,
        })
    }

    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Mailbox adapters report through
    pub fn event_sender(&self) -> MailboxSender<RoutingEvent> {
        self.events.clone()
    }

    pub fn dispatcher(&self) -> SharedDispatcher {
        self.dispatcher.clone()
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    pub fn watchdog(&self) -> TimerHandle {
        self.watchdog
    }

    /// Serve until a shutdown request arrives
    pub fn run(&mut self) -> Result<(), LoopError> {
        info!("Daemon running");
        self.event_loop.run()?;
        let outstanding = self.dispatcher.borrow().outstanding();
        if outstanding > 0 {
            warn!(outstanding, "Stopping with actions still outstanding");
        }
        info!("Daemon stopped");
        Ok(())
    }

    /// Run a single event-loop iteration
    pub fn turn(&mut self) -> Result<(), LoopError> {
        self.event_loop.turn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossover_core::domain::NullController;

    #[test]
    fn test_default_config_starts() {
        let daemon =
            Daemon::new(&DaemonConfig::factory_default(), Box::new(NullController)).unwrap();
        let dispatcher = daemon.dispatcher();
        assert!(dispatcher.borrow().has_backend("sim.head_unit"));
        assert!(dispatcher.borrow().has_backend("sim.bluetooth"));
        assert!(daemon.loop_handle().is_timer_running(daemon.watchdog()));
    }

    #[test]
    fn test_incompatible_adapter_is_fatal() {
        let config = DaemonConfig::factory_default();
        let simulation = config.simulation.clone();
        let result = Daemon::with_backends(&config, Box::new(NullController), |events| {
            ["sim.head_unit", "sim.bluetooth"]
                .into_iter()
                .map(|bus| {
                    Box::new(
                        ThreadedDomain::new(bus, simulation.clone(), events.clone())
                            .with_interface_version(InterfaceVersion::new(2, 9)),
                    ) as Box<dyn RoutingBackend>
                })
                .collect()
        });
        assert!(matches!(
            result,
            Err(StartupError::IncompatibleInterface { .. })
        ));
    }

    #[test]
    fn test_missing_and_duplicate_buses() {
        let config = DaemonConfig::factory_default();
        let simulation = config.simulation.clone();

        let only_head_unit = Daemon::with_backends(&config, Box::new(NullController), |events| {
            vec![Box::new(ThreadedDomain::new(
                "sim.head_unit",
                simulation.clone(),
                events.clone(),
            )) as Box<dyn RoutingBackend>]
        });
        assert!(matches!(
            only_head_unit,
            Err(StartupError::MissingBackend(bus)) if bus == "sim.bluetooth"
        ));

        let twice = Daemon::with_backends(&config, Box::new(NullController), |events| {
            (0..2)
                .map(|_| {
                    Box::new(ThreadedDomain::new(
                        "sim.head_unit",
                        simulation.clone(),
                        events.clone(),
                    )) as Box<dyn RoutingBackend>
                })
                .collect()
        });
        assert!(matches!(twice, Err(StartupError::DuplicateBus(bus)) if bus == "sim.head_unit"));
    }

    #[test]
    fn test_shutdown_request_stops_run() {
        let mut daemon =
            Daemon::new(&DaemonConfig::factory_default(), Box::new(NullController)).unwrap();
        daemon.control_handle().shutdown().unwrap();
        daemon.run().unwrap();
    }
}
