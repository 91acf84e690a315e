//! Runtime side of the routing daemon: the poll-based event loop, the
//! cross-thread mailboxes, simulated domain adapters and the [`Daemon`]
//! context tying them together.

pub mod control;
pub mod daemon;
pub mod event_loop;
pub mod handoff;
pub mod simulated;

pub use control::{ControlError, ControlHandle, ControlRequest};
pub use daemon::{Daemon, SharedDispatcher, StartupError};
pub use event_loop::{
    EventLoop, Interest, LoopError, LoopHandle, PollHandle, PollSource, Readiness, TimerHandle,
};
pub use handoff::{Mailbox, MailboxClosed, MailboxSender};
pub use simulated::ThreadedDomain;
