//! Aggregation of per-hop handles into main connection transitions

use crate::domain::error::RoutingError;
use crate::domain::handle::Handle;
use crate::domain::model::{ConnectionId, MainConnectionId};
use crate::domain::topology::TopologyStore;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Connecting,
    Disconnecting,
}

#[derive(Debug)]
struct Outstanding {
    direction: Direction,
    handles: HashSet<Handle>,
    failure: Option<RoutingError>,
}

/// How a main connection's batch of hop actions ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MainOutcome {
    Connected,
    ConnectFailed(RoutingError),
    Disconnected,
    DisconnectFailed(RoutingError),
}

#[derive(Debug, Default)]
pub(crate) struct MainConnectionTracker {
    owners: HashMap<Handle, MainConnectionId>,
    batches: HashMap<MainConnectionId, Outstanding>,
}

impl MainConnectionTracker {
    pub(crate) fn track_connect(&mut self, main: MainConnectionId, handles: &[Handle]) {
        self.track(main, Direction::Connecting, handles, None);
    }

    pub(crate) fn track_disconnect(
        &mut self,
        main: MainConnectionId,
        handles: &[Handle],
        failure: Option<RoutingError>,
    ) {
        self.track(main, Direction::Disconnecting, handles, failure);
    }

    fn track(
        &mut self,
        main: MainConnectionId,
        direction: Direction,
        handles: &[Handle],
        failure: Option<RoutingError>,
    ) {
        for handle in handles {
            self.owners.insert(*handle, main);
        }
        self.batches.insert(
            main,
            Outstanding {
                direction,
                handles: handles.iter().copied().collect(),
                failure,
            },
        );
    }

    pub(crate) fn is_busy(&self, main: MainConnectionId) -> bool {
        self.batches.contains_key(&main)
    }

    /// Record a hop's terminal result; returns the main connection's outcome
    /// once its last hop finished
    pub(crate) fn hop_finished(
        &mut self,
        handle: Handle,
        result: Result<(), RoutingError>,
    ) -> Option<(MainConnectionId, MainOutcome)> {
        let main = self.owners.remove(&handle)?;
        let batch = self.batches.get_mut(&main)?;
        batch.handles.remove(&handle);
        if let Err(e) = result {
            batch.failure.get_or_insert(e);
        }
        if !batch.handles.is_empty() {
            return None;
        }

        let batch = self.batches.remove(&main)?;
        let outcome = match (batch.direction, batch.failure) {
            (Direction::Connecting, None) => MainOutcome::Connected,
            (Direction::Connecting, Some(e)) => MainOutcome::ConnectFailed(e),
            (Direction::Disconnecting, None) => MainOutcome::Disconnected,
            (Direction::Disconnecting, Some(e)) => MainOutcome::DisconnectFailed(e),
        };
        Some((main, outcome))
    }
}

/// Sum of hop delays; unknown while any hop has not reported one
pub(crate) fn aggregate_delay<S: TopologyStore + ?Sized>(
    store: &S,
    connections: &[ConnectionId],
) -> Option<i16> {
    connections.iter().try_fold(0i16, |total, id| {
        store
            .connection(*id)
            .and_then(|c| c.delay)
            .map(|delay| total.saturating_add(delay))
    })
}
