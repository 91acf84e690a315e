//! Requests from other threads into the running daemon
//!
//! Every request carries its own bounded reply channel. [`ControlHandle`]
//! wraps the round trip into blocking calls.

use crate::event_loop::LoopHandle;
use crate::handoff::MailboxSender;
use crossbeam::channel::{self, Sender};
use crossover_core::domain::{
    ActionDispatcher, Handle, MainConnection, MainConnectionId, RampType, Route, RoutingError,
    SinkId, SourceId, TopologyStore, Volume,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

type Reply<T> = Sender<std::result::Result<T, RoutingError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("routing request failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("daemon is not running")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug)]
pub enum ControlRequest {
    Connect {
        source: SourceId,
        sink: SinkId,
        reply: Reply<MainConnectionId>,
    },
    Disconnect {
        main: MainConnectionId,
        reply: Reply<()>,
    },
    SetSinkVolume {
        sink: SinkId,
        volume: Volume,
        ramp: RampType,
        time: Duration,
        reply: Reply<Handle>,
    },
    SetSourceVolume {
        source: SourceId,
        volume: Volume,
        ramp: RampType,
        time: Duration,
        reply: Reply<Handle>,
    },
    Abort {
        handle: Handle,
        reply: Reply<()>,
    },
    FindRoutes {
        source: SourceId,
        sink: SinkId,
        only_free: bool,
        reply: Reply<Vec<Route>>,
    },
    ListMainConnections {
        reply: Sender<Vec<MainConnection>>,
    },
    ListHandles {
        reply: Sender<Vec<Handle>>,
    },
    Shutdown,
}

fn answer<T>(reply: Sender<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("Control requester went away before the reply");
    }
}

impl ControlRequest {
    /// Execute on the event-loop thread
    pub fn apply<S: TopologyStore>(
        self,
        dispatcher: &mut ActionDispatcher<S>,
        event_loop: &LoopHandle,
    ) {
        match self {
            ControlRequest::Connect {
                source,
                sink,
                reply,
            } => answer(reply, dispatcher.connect_main(source, sink)),
            ControlRequest::Disconnect { main, reply } => {
                answer(reply, dispatcher.disconnect_main(main))
            }
            ControlRequest::SetSinkVolume {
                sink,
                volume,
                ramp,
                time,
                reply,
            } => answer(reply, dispatcher.set_sink_volume(sink, volume, ramp, time)),
            ControlRequest::SetSourceVolume {
                source,
                volume,
                ramp,
                time,
                reply,
            } => answer(
                reply,
                dispatcher.set_source_volume(source, volume, ramp, time),
            ),
            ControlRequest::Abort { handle, reply } => answer(reply, dispatcher.abort(handle)),
            ControlRequest::FindRoutes {
                source,
                sink,
                only_free,
                reply,
            } => answer(reply, dispatcher.find_routes(only_free, source, sink)),
            ControlRequest::ListMainConnections { reply } => answer(
                reply,
                dispatcher
                    .store()
                    .main_connections()
                    .into_iter()
                    .cloned()
                    .collect(),
            ),
            ControlRequest::ListHandles { reply } => answer(reply, dispatcher.list_handles()),
            ControlRequest::Shutdown => {
                info!("Shutdown requested");
                event_loop.stop();
            }
        }
    }
}

/// Blocking front end for [`ControlRequest`]s, usable from any thread
#[derive(Clone)]
pub struct ControlHandle {
    sender: MailboxSender<ControlRequest>,
}

impl ControlHandle {
    pub fn new(sender: MailboxSender<ControlRequest>) -> Self {
        Self { sender }
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> ControlRequest) -> Result<T> {
        let (reply, response) = channel::bounded(1);
        self.sender
            .send(build(reply))
            .map_err(|_| ControlError::Disconnected)?;
        response.recv().map_err(|_| ControlError::Disconnected)
    }

    fn routing_call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ControlRequest,
    ) -> Result<T> {
        Ok(self.call(build)??)
    }

    /// Route and connect `source` to `sink` as a main connection
    pub fn connect(&self, source: SourceId, sink: SinkId) -> Result<MainConnectionId> {
        self.routing_call(|reply| ControlRequest::Connect {
            source,
            sink,
            reply,
        })
    }

    pub fn disconnect(&self, main: MainConnectionId) -> Result<()> {
        self.routing_call(|reply| ControlRequest::Disconnect { main, reply })
    }

    pub fn set_sink_volume(
        &self,
        sink: SinkId,
        volume: Volume,
        ramp: RampType,
        time: Duration,
    ) -> Result<Handle> {
        self.routing_call(|reply| ControlRequest::SetSinkVolume {
            sink,
            volume,
            ramp,
            time,
            reply,
        })
    }

    pub fn set_source_volume(
        &self,
        source: SourceId,
        volume: Volume,
        ramp: RampType,
        time: Duration,
    ) -> Result<Handle> {
        self.routing_call(|reply| ControlRequest::SetSourceVolume {
            source,
            volume,
            ramp,
            time,
            reply,
        })
    }

    pub fn abort(&self, handle: Handle) -> Result<()> {
        self.routing_call(|reply| ControlRequest::Abort { handle, reply })
    }

    pub fn find_routes(
        &self,
        source: SourceId,
        sink: SinkId,
        only_free: bool,
    ) -> Result<Vec<Route>> {
        self.routing_call(|reply| ControlRequest::FindRoutes {
            source,
            sink,
            only_free,
            reply,
        })
    }

    pub fn main_connections(&self) -> Result<Vec<MainConnection>> {
        self.call(|reply| ControlRequest::ListMainConnections { reply })
    }

    pub fn handles(&self) -> Result<Vec<Handle>> {
        self.call(|reply| ControlRequest::ListHandles { reply })
    }

    /// Ask the event loop to stop; does not wait for it
    pub fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ControlRequest::Shutdown)
            .map_err(|_| ControlError::Disconnected)
    }
}
