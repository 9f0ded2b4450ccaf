use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::backend::Backend;
use crate::command::{Command, CommandWork, Transition};
use crate::config::{QueueConfig, ReleaseMode};
use crate::error::{QueueError, Result};
use crate::timing::TimingPoint;
use crate::trampoline::{self, Job};
use crate::{CommandKind, CommandStatus, QueueProperties};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Accounting carried by an admission pass for the command whose completion triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finished {
    Nothing,
    /// A command held by the backend completed: it is still in `pending` until reaped.
    OnBackend,
    /// An instantaneous command completed: it already left `pending` when it was detached.
    Instantaneous,
}

/// Snapshot of a queue's bookkeeping counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    /// Commands in the pending list.
    pub queued: usize,
    /// Commands handed to the backend (or detached for instantaneous completion) and not finished.
    pub on_backend: usize,
    /// Commands known complete but not reaped yet.
    pub completed: usize,
}

struct QueueState {
    properties: QueueProperties,
    pending: VecDeque<Command>,
    queued: usize,
    on_backend: usize,
    // Signed: a reaping pass may observe a completion before its accounting pass runs.
    completed: isize,
    flushed: bool,
    released: Vec<Command>,
}

impl QueueState {
    fn counters(&self) -> QueueCounters {
        QueueCounters {
            queued: self.queued,
            on_backend: self.on_backend,
            completed: usize::try_from(self.completed).unwrap_or(0),
        }
    }

    fn take_reaped(&mut self, index: usize) -> Option<Command> {
        let command = self.pending.remove(index)?;
        self.queued -= 1;
        self.completed -= 1;
        Some(command)
    }
}

pub(crate) struct QueueShared {
    id: u64,
    backend: Arc<dyn Backend>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    drained: Condvar,
}

impl QueueShared {
    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn properties(&self) -> QueueProperties {
        self.lock().properties
    }

    /// A command the backend held ended in `Error` instead of completing.
    pub(crate) fn backend_released_failed(&self) {
        let mut state = self.lock();
        state.on_backend = state.on_backend.saturating_sub(1);
    }

    /// Drop an engine-held reference to one of this queue's commands, now or later depending on the
    /// release mode. Never called with the queue lock held.
    pub(crate) fn release(&self, command: Command) {
        match self.config.release_mode {
            ReleaseMode::Immediate => drop(command),
            ReleaseMode::Deferred => self.lock().released.push(command),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An ordered (or out-of-order) stream of commands bound to one backend.
///
/// Cloning a `CommandQueue` retains the queue; every command it owns retains it as well.
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    pub fn new(
        backend: Arc<dyn Backend>,
        properties: QueueProperties,
        config: QueueConfig,
    ) -> Result<Self> {
        validate_properties(properties, backend.as_ref())?;
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            queue = id,
            backend = backend.name(),
            out_of_order = properties.is_out_of_order(),
            profiling = properties.is_profiling(),
            "command queue created"
        );
        Ok(Self {
            shared: Arc::new(QueueShared {
                id,
                backend,
                config,
                state: Mutex::new(QueueState {
                    properties,
                    pending: VecDeque::new(),
                    queued: 0,
                    on_backend: 0,
                    completed: 0,
                    flushed: true,
                    released: Vec::new(),
                }),
                drained: Condvar::new(),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn properties(&self) -> QueueProperties {
        self.shared.properties()
    }

    pub fn counters(&self) -> QueueCounters {
        self.shared.lock().counters()
    }

    /// Whether the last admission pass handed every eligible command to the backend.
    pub fn is_flushed(&self) -> bool {
        self.shared.lock().flushed
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub fn ptr_eq(&self, other: &CommandQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Retained handles of the pending commands, in submission order.
    pub fn commands(&self, include_completed: bool) -> Vec<Command> {
        self.shared
            .lock()
            .pending
            .iter()
            .filter(|c| include_completed || c.status() != CommandStatus::Complete)
            .cloned()
            .collect()
    }

    /// Verify the current properties against the backend.
    pub fn check_properties(&self) -> Result<()> {
        validate_properties(self.properties(), self.shared.backend.as_ref())
    }

    /// Enable or disable `properties`, returning the previous set. A rejected change leaves the
    /// previous properties in place.
    pub fn set_property(
        &self,
        properties: QueueProperties,
        enable: bool,
    ) -> Result<QueueProperties> {
        let mut state = self.shared.lock();
        let old = state.properties;
        let new = if enable {
            old | properties
        } else {
            old - properties
        };
        validate_properties(new, self.shared.backend.as_ref())?;
        state.properties = new;
        Ok(old)
    }

    /// [`CommandQueue::set_property`] for raw property bits.
    pub fn set_property_raw(&self, bits: u64, enable: bool) -> Result<QueueProperties> {
        self.set_property(QueueProperties::from_raw(bits)?, enable)
    }

    /// Append `command` to the queue and run an admission pass.
    pub fn queue_command(&self, command: &Command) -> Result<()> {
        if command.kind() == CommandKind::User {
            return Err(QueueError::InvalidCommand("user commands cannot be queued"));
        }
        let owned = command
            .shared_queue()
            .is_some_and(|queue| Arc::ptr_eq(queue, &self.shared));
        if !owned {
            return Err(QueueError::InvalidCommand(
                "command belongs to another queue",
            ));
        }
        if !command.claim_enqueue() {
            return Err(QueueError::InvalidOperation("command is already queued"));
        }
        if let Err(err) = self.shared.backend.init_command_data(command) {
            debug!(
                queue = self.id(),
                command = command.id(),
                kind = %command.kind(),
                error = %err,
                "backend refused command"
            );
            command.unclaim_enqueue();
            return Err(err);
        }

        {
            let mut state = self.shared.lock();
            if state.properties.is_profiling() {
                command.update_timing(TimingPoint::Queued);
            }
            state.pending.push_back(command.clone());
            state.queued += 1;
            state.flushed = false;
        }

        self.push_eligible_commands(None, false);
        self.clean_released_commands();
        Ok(())
    }

    /// Create a command of `kind` waiting on `wait_list`, attach `work` and queue it.
    pub fn enqueue(
        &self,
        kind: CommandKind,
        wait_list: &[Command],
        work: Option<CommandWork>,
    ) -> Result<Command> {
        let wait_list = (!wait_list.is_empty()).then_some(wait_list);
        let command = Command::new(Some(self), kind, CommandStatus::Queued, wait_list)?;
        if let Some(work) = work {
            command.set_work(work);
        }
        self.queue_command(&command)?;
        Ok(command)
    }

    /// A marker that completes once every command currently unfinished in this queue completed.
    pub fn enqueue_marker(&self) -> Result<Command> {
        let unfinished = self.commands(false);
        self.enqueue(CommandKind::Marker, &unfinished, None)
    }

    pub fn enqueue_marker_with_wait_list(&self, wait_list: &[Command]) -> Result<Command> {
        self.enqueue(CommandKind::Marker, wait_list, None)
    }

    pub fn enqueue_barrier(&self) -> Result<Command> {
        self.enqueue(CommandKind::Barrier, &[], None)
    }

    /// A wait-for-events command: later commands of an in-order queue, and every later command
    /// inspected by an out-of-order scan, wait until `wait_list` has completed.
    pub fn enqueue_wait_for(&self, wait_list: &[Command]) -> Result<Command> {
        if wait_list.is_empty() {
            return Err(QueueError::InvalidValue("empty wait list"));
        }
        self.enqueue(CommandKind::WaitForEvents, wait_list, None)
    }

    /// Run an admission pass.
    ///
    /// `ready_hint` names a command that just became eligible: the pass is exhaustive and stops at
    /// that command if it was already handled. `one_finished_on_backend` accounts for one command
    /// that the backend finished.
    pub fn push_eligible_commands(
        &self,
        ready_hint: Option<&Command>,
        one_finished_on_backend: bool,
    ) {
        trampoline::drive(Job::Admit {
            queue: Arc::clone(&self.shared),
            ready: ready_hint.cloned(),
            finished: if one_finished_on_backend {
                Finished::OnBackend
            } else {
                Finished::Nothing
            },
        });
    }

    /// Reap completed commands from the pending list (amortized).
    pub fn clean_commands(&self) {
        let reaped = {
            let mut state = self.shared.lock();
            let config = &self.shared.config;
            let counters = state.counters();
            if counters.completed < config.reap_batch
                && counters.on_backend > 0
                && counters.queued > counters.completed
            {
                return;
            }

            let out_of_order = state.properties.is_out_of_order();
            let mut reaped = Vec::new();
            let mut index = 0;
            while index < state.pending.len() {
                if state.pending[index].status() == CommandStatus::Complete {
                    reaped.extend(state.take_reaped(index));
                } else if out_of_order {
                    index += 1;
                } else {
                    break;
                }
            }
            if !reaped.is_empty() {
                debug!(queue = self.id(), reaped = reaped.len(), "reaped completed commands");
            }
            if state.queued == 0 {
                self.shared.drained.notify_all();
            }
            reaped
        };
        self.release_reaped(reaped);
    }

    /// Drop commands parked by deferred release.
    pub fn clean_released_commands(&self) {
        let released = mem::take(&mut self.shared.lock().released);
        drop(released);
    }

    pub fn flush(&self) {
        self.push_eligible_commands(None, false);
        self.clean_released_commands();
    }

    /// Block until every queued command completed and was reaped.
    pub fn finish(&self) {
        self.clean_commands();
        {
            let mut state = self.shared.lock();
            while state.queued != 0 {
                state = self
                    .shared
                    .drained
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        self.clean_released_commands();
    }

    fn release_reaped(&self, reaped: Vec<Command>) {
        match self.shared.config.release_mode {
            ReleaseMode::Immediate => drop(reaped),
            ReleaseMode::Deferred => self.shared.lock().released.extend(reaped),
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id())
            .field("backend", &self.shared.backend.name())
            .field("properties", &self.properties())
            .finish()
    }
}

fn validate_properties(properties: QueueProperties, backend: &dyn Backend) -> Result<()> {
    if QueueProperties::from_bits(properties.bits()).is_none() {
        return Err(QueueError::InvalidPropertyValue(properties.bits()));
    }
    if !backend.supported_queue_properties().contains(properties) {
        return Err(QueueError::InvalidQueueProperties(properties));
    }
    Ok(())
}

enum ScanEnd {
    /// Scanned everything that could be pushed.
    Done,
    /// An instantaneous command was detached; its completion continues the work.
    Instantaneous(Command),
}

/// One admission pass over `queue`. Runs on the trampoline.
pub(crate) fn admit(queue: &Arc<QueueShared>, ready: Option<&Command>, finished: Finished) {
    let mut reaped = Vec::new();
    let mut submitted: Vec<(Command, Transition)> = Vec::new();

    let end = {
        let mut state = queue.lock();
        match finished {
            Finished::Nothing => {}
            Finished::OnBackend => {
                state.on_backend = state.on_backend.saturating_sub(1);
                state.completed += 1;
            }
            Finished::Instantaneous => {
                state.on_backend = state.on_backend.saturating_sub(1);
            }
        }

        let out_of_order = state.properties.is_out_of_order();
        let profiling = state.properties.is_profiling();
        let config = &queue.config;

        if out_of_order
            && ready.is_none()
            && state.on_backend > config.backpressure_in_flight
            && queue.backend.got_enough_to_work_on()
        {
            trace!(
                queue = queue.id,
                on_backend = state.on_backend,
                "backend busy, skipping pass"
            );
            return;
        }

        let mut flushed = true;
        let mut unfinished = 0usize;
        let mut index = 0usize;
        let mut end = ScanEnd::Done;

        while index < state.pending.len() {
            let command = state.pending[index].clone();
            let status = command.status();

            if status == CommandStatus::Complete {
                reaped.extend(state.take_reaped(index));
                continue;
            }
            if status.is_error() {
                flushed = false;
                break;
            }

            unfinished += 1;
            if ready.is_none() && unfinished > config.exploration_threshold {
                flushed = false;
                break;
            }
            let first = unfinished == 1;
            if !out_of_order && !first {
                flushed = false;
                break;
            }
            if command.kind() == CommandKind::Barrier && !first {
                flushed = false;
                break;
            }
            if status != CommandStatus::Queued {
                if ready.is_some_and(|hint| hint.ptr_eq(&command)) {
                    break;
                }
                index += 1;
                continue;
            }
            if !command.wait_list_resolved() {
                flushed = false;
                if command.kind() == CommandKind::WaitForEvents {
                    break;
                }
                index += 1;
                continue;
            }

            if command.kind().is_instantaneous() {
                state.pending.remove(index);
                state.queued -= 1;
                state.on_backend += 1;
                command.mark_detached();
                trace!(
                    queue = queue.id,
                    command = command.id(),
                    kind = %command.kind(),
                    "completing instantaneous command"
                );
                end = ScanEnd::Instantaneous(command);
                break;
            }

            if profiling {
                command.update_timing(TimingPoint::Submitted);
            }
            if let Some(transition) = command.transition(CommandStatus::Submitted) {
                state.on_backend += 1;
                trace!(
                    queue = queue.id,
                    command = command.id(),
                    kind = %command.kind(),
                    "pushing command to backend"
                );
                submitted.push((command, transition));
            }
            index += 1;
        }

        if ready.is_some() {
            flushed = state.queued == 0;
        }
        if matches!(end, ScanEnd::Done) {
            state.flushed = flushed;
        }
        if state.queued == 0 {
            queue.drained.notify_all();
        }
        end
    };

    match queue.config.release_mode {
        ReleaseMode::Immediate => drop(reaped),
        ReleaseMode::Deferred => queue.lock().released.extend(reaped),
    }

    for (command, transition) in submitted {
        command.finish_transition(transition);
        queue.backend.push_command(command);
    }

    if let ScanEnd::Instantaneous(command) = end {
        trampoline::drive(Job::SetStatus {
            command,
            status: CommandStatus::Complete,
        });
    }
}

