//! Controller that reports every outcome to the log

use crossover_core::domain::{
    Completion, ConnectionState, ControlBackend, Handle, MainConnectionId, Volume, VolumeTarget,
};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct LoggingController {
    completed: u64,
    failed: u64,
}

impl ControlBackend for LoggingController {
    fn on_action_complete(&mut self, completion: &Completion) {
        match completion.result {
            Ok(()) => {
                self.completed += 1;
                info!(handle = %completion.handle, detail = ?completion.detail, completed = self.completed, "Action completed");
            }
            Err(e) => {
                self.failed += 1;
                warn!(handle = %completion.handle, error = %e, failed = self.failed, "Action failed");
            }
        }
    }

    fn on_volume_tick(&mut self, handle: Handle, target: VolumeTarget, volume: Volume) {
        debug!(%handle, ?target, %volume, "Volume tick");
    }

    fn on_main_connection_state(&mut self, id: MainConnectionId, state: ConnectionState) {
        info!(main = %id, ?state, "Main connection state");
    }
}
