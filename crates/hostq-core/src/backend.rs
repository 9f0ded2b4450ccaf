use std::any::Any;

use crate::{Command, CommandKind, QueueProperties, Result};

/// Opaque per-command state owned by a backend.
pub type BackendData = Box<dyn Any + Send>;

/// Boundary between the command queue engine and an executor (CPU thread pool, DSP cluster, a test
/// double, ...).
///
/// The engine hands every eligible command to [`Backend::push_command`] exactly once, in
/// `Submitted` state. Implementations may run it synchronously or asynchronously, on any thread,
/// but must eventually report the outcome with [`Command::set_status`]: `Complete`, or
/// `Error(code)` with a negative code. That call may re-enter the engine (dependency propagation,
/// admission passes), so it must not be made while holding a backend lock.
pub trait Backend: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "backend"
    }

    /// Queue properties this backend can honour.
    fn supported_queue_properties(&self) -> QueueProperties;

    /// Prepare backend state for `command` before it enters a queue.
    ///
    /// State is attached with [`Command::set_backend_data`]. A failure is reported synchronously to
    /// the caller of `queue_command` and the command is never queued.
    fn init_command_data(&self, command: &Command) -> Result<()>;

    /// Receives the state attached in [`Backend::init_command_data`] when the command is dropped.
    fn free_command_data(&self, _kind: CommandKind, _data: BackendData) {}

    /// Accept a `Submitted` command for execution.
    fn push_command(&self, command: Command);

    /// Back-pressure hint: `true` when the backend has enough queued work that an out-of-order
    /// queue may skip an admission pass. Never required for correctness.
    fn got_enough_to_work_on(&self) -> bool {
        false
    }
}
