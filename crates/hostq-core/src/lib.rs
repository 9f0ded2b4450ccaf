//! Command queue and event dependency engine for a heterogeneous compute runtime.
//!
//! Applications submit [`Command`]s to a [`CommandQueue`]; each command may wait on others (in any
//! queue, or on user commands driven by the application). The engine decides when a command is
//! eligible, hands it to the queue's [`Backend`], propagates completion and failure along the
//! dependency graph and reaps finished commands.
//!
//! - [`Command`]: status machine, wait edges, callbacks, profiling timestamps
//! - [`CommandQueue`]: pending list, admission pass, reaping, `flush` / `finish`
//! - [`Backend`]: executor boundary (see `hostq-cpu` for a thread-pool implementation)
//! - [`HandleRegistry`]: raw-handle validation for binding layers
//!
//! Locks nest only queue -> command; callbacks and backend pushes never run under a lock.
#![forbid(unsafe_code)]

mod backend;
mod command;
mod config;
mod error;
mod handle;
mod queue;
mod timing;
mod trampoline;
mod types;

pub use backend::{Backend, BackendData};
pub use command::{wait_for_commands, Command, CommandWork, DependencyLink};
pub use config::{
    parse_var, QueueConfig, ReleaseMode, DEFAULT_BACKPRESSURE_IN_FLIGHT,
    DEFAULT_EXPLORATION_THRESHOLD, DEFAULT_REAP_BATCH,
};
pub use error::{codes, ConfigError, QueueError, Result};
pub use handle::{Handle, HandleRegistry, ObjectKind};
pub use queue::{CommandQueue, QueueCounters};
pub use timing::{monotonic_now_ns, CommandTiming, TimingPoint};
pub use types::{CommandKind, CommandStatus, QueueProperties};
