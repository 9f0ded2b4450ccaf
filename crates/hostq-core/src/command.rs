use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use tracing::{debug, trace, warn};

use crate::backend::BackendData;
use crate::error::{QueueError, Result};
use crate::queue::{CommandQueue, Finished, QueueShared};
use crate::timing::{monotonic_now_ns, CommandTiming, TimingPoint};
use crate::trampoline::{self, Job};
use crate::{CommandKind, CommandStatus};

/// Host code executed by backends that run commands on the CPU.
pub type CommandWork = Box<dyn FnOnce(&Command) -> Result<()> + Send>;

type Callback = Box<dyn FnOnce(&Command, CommandStatus) + Send>;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`Command::add_dependent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyLink {
    /// The dependent was recorded and will be notified when this command resolves.
    Tracked,
    /// This command is already complete; nothing to wait for.
    AlreadyComplete,
    /// This command failed; the dependent must fail too.
    InError,
}

/// A unit of work submitted to a [`CommandQueue`], or a user command driven by the application.
///
/// `Command` is a cheap, reference-counted handle: cloning it retains the command, dropping it
/// releases it. A command keeps its owning queue alive; predecessors named in its wait list are kept
/// alive until they resolve.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

pub(crate) struct CommandInner {
    id: u64,
    kind: CommandKind,
    queue: Option<Arc<QueueShared>>,
    /// Set when the command was taken out of its queue's pending list to complete instantaneously.
    detached: AtomicBool,
    enqueued: AtomicBool,
    state: Mutex<CommandState>,
    status_changed: Condvar,
    work: Mutex<Option<CommandWork>>,
    backend_data: Mutex<Option<BackendData>>,
}

struct CommandState {
    status: CommandStatus,
    wait_set: Vec<Command>,
    dependents: Vec<Weak<CommandInner>>,
    callbacks: Vec<(CommandStatus, Callback)>,
    timing: CommandTiming,
}

/// Everything a status change has to do once the command lock is released.
pub(crate) struct Transition {
    previous: CommandStatus,
    status: CommandStatus,
    callbacks: Vec<Callback>,
    dependents: Vec<Weak<CommandInner>>,
    released_waits: Vec<Command>,
}

impl Drop for CommandInner {
    fn drop(&mut self) {
        // Predecessors only this command still holds are torn down here, one at a time, instead of
        // through nested drops along the chain.
        let mut orphans = mem::take(
            &mut self
                .state
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .wait_set,
        );
        while let Some(pred) = orphans.pop() {
            if let Ok(mut inner) = Arc::try_unwrap(pred.inner) {
                let state = inner
                    .state
                    .get_mut()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                orphans.append(&mut state.wait_set);
            }
        }

        let data = self
            .backend_data
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let (Some(data), Some(queue)) = (data, self.queue.as_ref()) {
            queue.backend().free_command_data(self.kind, data);
        }
        trace!(command = self.id, kind = %self.kind, "command dropped");
    }
}

impl Command {
    /// Create a command, optionally owned by `queue` and waiting on `wait_list`.
    ///
    /// A wait list that is present but empty is malformed. Only commands that belong to a queue
    /// record their predecessors; a predecessor that fails between validation and linking moves the
    /// new command to `Error` right away.
    pub fn new(
        queue: Option<&CommandQueue>,
        kind: CommandKind,
        status: CommandStatus,
        wait_list: Option<&[Command]>,
    ) -> Result<Command> {
        if let Some(list) = wait_list {
            if list.is_empty() {
                return Err(QueueError::InvalidWaitList);
            }
            if list.iter().any(|pred| pred.status().is_error()) {
                return Err(QueueError::DependencyInError);
            }
        }
        if kind == CommandKind::User && queue.is_some() {
            return Err(QueueError::InvalidCommand("user commands cannot belong to a queue"));
        }

        let command = Command::alloc(queue.map(|q| Arc::clone(q.shared())), kind, status);

        let mut in_error = false;
        if let (Some(_), Some(list)) = (queue, wait_list) {
            // Holding our own lock while linking means a predecessor completing concurrently blocks
            // in `remove_wait` until its edge is in the wait set.
            let mut state = command.lock_state();
            for pred in list {
                match pred.add_dependent(&command) {
                    DependencyLink::Tracked => state.wait_set.push(pred.clone()),
                    DependencyLink::AlreadyComplete => {}
                    DependencyLink::InError => in_error = true,
                }
            }
        }
        if in_error {
            command.set_status(CommandStatus::Error(QueueError::DependencyInError.code()));
        }

        trace!(command = command.id(), %kind, "command created");
        Ok(command)
    }

    /// A queue-less user command, created `Submitted`. Its outcome is set by the application with
    /// [`Command::set_user_status`].
    pub fn user() -> Command {
        Command::alloc(None, CommandKind::User, CommandStatus::Submitted)
    }

    fn alloc(queue: Option<Arc<QueueShared>>, kind: CommandKind, status: CommandStatus) -> Command {
        Command {
            inner: Arc::new(CommandInner {
                id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                queue,
                detached: AtomicBool::new(false),
                enqueued: AtomicBool::new(false),
                state: Mutex::new(CommandState {
                    status,
                    wait_set: Vec::new(),
                    dependents: Vec::new(),
                    callbacks: Vec::new(),
                    timing: CommandTiming::default(),
                }),
                status_changed: Condvar::new(),
                work: Mutex::new(None),
                backend_data: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> CommandKind {
        self.inner.kind
    }

    pub fn name(&self) -> &'static str {
        self.inner.kind.name()
    }

    pub fn status(&self) -> CommandStatus {
        self.lock_state().status
    }

    /// Owning queue, `None` for user commands.
    pub fn queue(&self) -> Option<CommandQueue> {
        self.inner.queue.clone().map(CommandQueue::from_shared)
    }

    /// Number of live handles (application handles, wait edges and engine references).
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Command) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn wait_list_resolved(&self) -> bool {
        self.lock_state().wait_set.is_empty()
    }

    /// Number of predecessors this command still waits for.
    pub fn wait_list_len(&self) -> usize {
        self.lock_state().wait_set.len()
    }

    pub fn timing(&self) -> CommandTiming {
        self.lock_state().timing
    }

    /// Record the current time for `point`, unless it is already set or the command is terminal.
    pub fn update_timing(&self, point: TimingPoint) -> bool {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return false;
        }
        state.timing.record(point, monotonic_now_ns())
    }

    /// Recorded timestamp for `point`, in nanoseconds.
    ///
    /// Available only for complete commands of a profiling queue.
    pub fn profiling_info(&self, point: TimingPoint) -> Result<u64> {
        let profiling = self
            .inner
            .queue
            .as_ref()
            .is_some_and(|queue| queue.properties().is_profiling());
        if !profiling {
            return Err(QueueError::ProfilingInfoNotAvailable);
        }
        let state = self.lock_state();
        if state.status != CommandStatus::Complete {
            return Err(QueueError::ProfilingInfoNotAvailable);
        }
        state
            .timing
            .get(point)
            .ok_or(QueueError::ProfilingInfoNotAvailable)
    }

    /// Whether the owning queue currently records profiling timestamps.
    pub fn queue_profiling_enabled(&self) -> bool {
        self.inner
            .queue
            .as_ref()
            .is_some_and(|queue| queue.properties().is_profiling())
    }

    pub fn set_work(&self, work: CommandWork) {
        *lock(&self.inner.work) = Some(work);
    }

    pub fn take_work(&self) -> Option<CommandWork> {
        lock(&self.inner.work).take()
    }

    pub fn has_work(&self) -> bool {
        lock(&self.inner.work).is_some()
    }

    pub fn set_backend_data(&self, data: BackendData) {
        *lock(&self.inner.backend_data) = Some(data);
    }

    /// Run `f` against the attached backend data, if any.
    pub fn with_backend_data<R>(&self, f: impl FnOnce(Option<&mut BackendData>) -> R) -> R {
        f(lock(&self.inner.backend_data).as_mut())
    }

    /// Record `dependent` as waiting on this command.
    pub fn add_dependent(&self, dependent: &Command) -> DependencyLink {
        let mut state = self.lock_state();
        match state.status {
            CommandStatus::Complete => DependencyLink::AlreadyComplete,
            CommandStatus::Error(_) => DependencyLink::InError,
            _ => {
                state.dependents.push(Arc::downgrade(&dependent.inner));
                DependencyLink::Tracked
            }
        }
    }

    /// Drop the wait edge on `predecessor`. Returns `true` when this removed the last edge, making
    /// the command eligible for admission.
    pub fn remove_wait(&self, predecessor: &Command) -> bool {
        let (edge, now_empty) = {
            let mut state = self.lock_state();
            match state.wait_set.iter().position(|c| c.ptr_eq(predecessor)) {
                Some(pos) => {
                    let edge = state.wait_set.remove(pos);
                    (Some(edge), state.wait_set.is_empty())
                }
                None => (None, false),
            }
        };
        if let Some(edge) = edge {
            release_command(edge);
        }
        now_empty
    }

    /// Move the command to `status` and run everything that follows from it: callbacks, dependency
    /// propagation and admission passes.
    ///
    /// Moves backwards and changes after a terminal status are ignored. When called from inside a
    /// callback or another status change on the same thread, the work is queued and runs before the
    /// outermost call returns.
    pub fn set_status(&self, status: CommandStatus) {
        trampoline::drive(Job::SetStatus {
            command: self.clone(),
            status,
        });
    }

    /// Set the outcome of a user command: `Complete` or a negative error code, once.
    pub fn set_user_status(&self, status: CommandStatus) -> Result<()> {
        if self.kind() != CommandKind::User {
            return Err(QueueError::InvalidCommand("not a user command"));
        }
        if !status.is_terminal() {
            return Err(QueueError::InvalidValue(
                "user command status must be complete or an error code",
            ));
        }
        if self.status() != CommandStatus::Submitted {
            return Err(QueueError::InvalidOperation(
                "user command status was already set",
            ));
        }
        self.set_status(status);
        Ok(())
    }

    /// Block until the status equals `target` or the command is terminal.
    pub fn wait_for_status(&self, target: CommandStatus) -> CommandStatus {
        let mut state = self.lock_state();
        while state.status != target && !state.status.is_terminal() {
            state = self
                .inner
                .status_changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.status
    }

    /// Register `callback` to run once the status reaches `trigger` (`Submitted`, `Running` or
    /// `Complete`). An error reaches every trigger. Runs immediately on this thread when the trigger
    /// was already reached.
    pub fn set_callback<F>(&self, trigger: CommandStatus, callback: F) -> Result<()>
    where
        F: FnOnce(&Command, CommandStatus) + Send + 'static,
    {
        if !matches!(
            trigger,
            CommandStatus::Submitted | CommandStatus::Running | CommandStatus::Complete
        ) {
            return Err(QueueError::InvalidValue(
                "callback trigger must be submitted, running or complete",
            ));
        }
        let mut state = self.lock_state();
        if state.status.has_reached(trigger) {
            let status = state.status;
            drop(state);
            callback(self, status);
            return Ok(());
        }
        state.callbacks.push((trigger, Box::new(callback)));
        Ok(())
    }

    pub(crate) fn shared_queue(&self) -> Option<&Arc<QueueShared>> {
        self.inner.queue.as_ref()
    }

    pub(crate) fn downgrade(&self) -> Weak<CommandInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<CommandInner>) -> Command {
        Command { inner }
    }

    pub(crate) fn mark_detached(&self) {
        self.inner.detached.store(true, Ordering::Release);
    }

    fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    /// Claim the one-time right to enter a queue. Returns `false` if the command was queued before.
    pub(crate) fn claim_enqueue(&self) -> bool {
        !self.inner.enqueued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unclaim_enqueue(&self) {
        self.inner.enqueued.store(false, Ordering::Release);
    }

    /// Record `status` under the command lock. Returns what must be done after the lock is released,
    /// or `None` if the change was ignored.
    pub(crate) fn transition(&self, status: CommandStatus) -> Option<Transition> {
        let mut state = self.lock_state();
        let previous = state.status;
        if previous.is_terminal() {
            debug!(
                command = self.id(),
                kind = %self.kind(),
                %previous,
                requested = %status,
                "ignoring status change of a finished command"
            );
            return None;
        }
        if !status.is_terminal() && status.as_raw() >= previous.as_raw() {
            warn!(
                command = self.id(),
                kind = %self.kind(),
                %previous,
                requested = %status,
                "ignoring backwards status change"
            );
            return None;
        }

        state.status = status;
        let mut callbacks = Vec::new();
        let mut kept = Vec::new();
        for (trigger, callback) in state.callbacks.drain(..) {
            if status.has_reached(trigger) {
                callbacks.push(callback);
            } else {
                kept.push((trigger, callback));
            }
        }
        state.callbacks = kept;

        let (dependents, released_waits) = if status.is_terminal() {
            (
                mem::take(&mut state.dependents),
                mem::take(&mut state.wait_set),
            )
        } else {
            (Vec::new(), Vec::new())
        };
        self.inner.status_changed.notify_all();

        Some(Transition {
            previous,
            status,
            callbacks,
            dependents,
            released_waits,
        })
    }

    /// Trampoline entry for [`Command::set_status`].
    pub(crate) fn apply_status(&self, status: CommandStatus) {
        if let Some(transition) = self.transition(status) {
            self.finish_transition(transition);
        }
    }

    pub(crate) fn finish_transition(&self, transition: Transition) {
        let Transition {
            previous,
            status,
            callbacks,
            dependents,
            released_waits,
        } = transition;

        if !callbacks.is_empty() {
            let _retained = self.clone();
            for callback in callbacks {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(self, status)));
                if outcome.is_err() {
                    warn!(command = self.id(), kind = %self.kind(), %status, "callback panicked");
                }
            }
        }
        released_waits.into_iter().for_each(release_command);

        match status {
            CommandStatus::Complete => self.notify_completion(dependents),
            CommandStatus::Error(code) => {
                warn!(command = self.id(), kind = %self.kind(), code, "command failed");
                let held_by_backend = matches!(
                    previous,
                    CommandStatus::Submitted | CommandStatus::Running
                ) && !self.kind().is_instantaneous();
                if held_by_backend {
                    if let Some(queue) = self.shared_queue() {
                        queue.backend_released_failed();
                    }
                }
                let propagated = CommandStatus::Error(QueueError::DependencyInError.code());
                for dependent in dependents.iter().filter_map(Weak::upgrade) {
                    trampoline::drive(Job::SetStatus {
                        command: Command::from_inner(dependent),
                        status: propagated,
                    });
                }
            }
            _ => {}
        }
    }

    fn notify_completion(&self, dependents: Vec<Weak<CommandInner>>) {
        // Keeps the queue alive until every pass below has been requested.
        let own_queue = self.inner.queue.clone();
        let finished = if self.is_detached() {
            Finished::Instantaneous
        } else {
            Finished::OnBackend
        };
        let mut accounted = own_queue.is_none();

        for dependent in dependents.iter().filter_map(Weak::upgrade) {
            let dependent = Command::from_inner(dependent);
            if !dependent.remove_wait(self) {
                continue;
            }
            let Some(dep_queue) = dependent.inner.queue.clone() else {
                continue;
            };
            let same_queue = own_queue
                .as_ref()
                .is_some_and(|queue| Arc::ptr_eq(queue, &dep_queue));
            let carried = if same_queue && !accounted {
                accounted = true;
                finished
            } else {
                Finished::Nothing
            };
            trampoline::drive(Job::Admit {
                queue: dep_queue,
                ready: Some(dependent),
                finished: carried,
            });
        }

        if let Some(queue) = own_queue {
            if !accounted {
                trampoline::drive(Job::Admit {
                    queue,
                    ready: None,
                    finished,
                });
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CommandState> {
        lock(&self.inner.state)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Command {}

/// Block until every command in `commands` is terminal.
///
/// Fails with `InvalidValue` on an empty list and with `DependencyInError` when any of them failed.
pub fn wait_for_commands(commands: &[Command]) -> Result<()> {
    if commands.is_empty() {
        return Err(QueueError::InvalidValue("empty command list"));
    }
    let mut failed = false;
    for command in commands {
        if command.wait_for_status(CommandStatus::Complete).is_error() {
            failed = true;
        }
    }
    if failed {
        return Err(QueueError::DependencyInError);
    }
    Ok(())
}

/// Drop an engine-held reference through the command's owning queue.
pub(crate) fn release_command(command: Command) {
    match command.shared_queue().cloned() {
        Some(queue) => queue.release(command),
        None => drop(command),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn user_command_starts_submitted_without_queue() {
        let cmd = Command::user();
        assert_eq!(cmd.kind(), CommandKind::User);
        assert_eq!(cmd.status(), CommandStatus::Submitted);
        assert!(cmd.queue().is_none());
        assert!(cmd.wait_list_resolved());
    }

    #[test]
    fn empty_wait_list_is_rejected() {
        let err = Command::new(None, CommandKind::Marker, CommandStatus::Queued, Some(&[]))
            .unwrap_err();
        assert_eq!(err, QueueError::InvalidWaitList);
    }

    #[test]
    fn failed_predecessor_is_rejected() {
        let pred = Command::user();
        pred.set_user_status(CommandStatus::Error(-3)).unwrap();
        let err = Command::new(
            None,
            CommandKind::Marker,
            CommandStatus::Queued,
            Some(&[pred]),
        )
        .unwrap_err();
        assert_eq!(err, QueueError::DependencyInError);
    }

    #[test]
    fn backwards_and_post_terminal_changes_are_ignored() {
        let cmd = Command::user();
        cmd.set_status(CommandStatus::Queued);
        assert_eq!(cmd.status(), CommandStatus::Submitted);
        cmd.set_status(CommandStatus::Complete);
        cmd.set_status(CommandStatus::Error(-1));
        assert_eq!(cmd.status(), CommandStatus::Complete);
    }

    #[test]
    fn user_status_rules() {
        let cmd = Command::user();
        assert!(matches!(
            cmd.set_user_status(CommandStatus::Running),
            Err(QueueError::InvalidValue(_))
        ));
        cmd.set_user_status(CommandStatus::Complete).unwrap();
        assert!(matches!(
            cmd.set_user_status(CommandStatus::Complete),
            Err(QueueError::InvalidOperation(_))
        ));
    }

    #[test]
    fn callbacks_fire_once_per_threshold() {
        let cmd = Command::user();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        cmd.set_callback(CommandStatus::Submitted, move |_, status| {
            assert_eq!(status, CommandStatus::Submitted);
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1, "already reached, runs inline");

        let h = hits.clone();
        cmd.set_callback(CommandStatus::Complete, move |_, status| {
            assert_eq!(status, CommandStatus::Error(-2));
            h.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();
        cmd.set_user_status(CommandStatus::Error(-2)).unwrap();
        cmd.set_status(CommandStatus::Complete);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(matches!(
            cmd.set_callback(CommandStatus::Queued, |_, _| {}),
            Err(QueueError::InvalidValue(_))
        ));
    }

    #[test]
    fn wait_for_status_returns_on_terminal() {
        let cmd = Command::user();
        let waiter = {
            let cmd = cmd.clone();
            std::thread::spawn(move || cmd.wait_for_status(CommandStatus::Running))
        };
        cmd.set_user_status(CommandStatus::Complete).unwrap();
        assert_eq!(waiter.join().unwrap(), CommandStatus::Complete);
    }

    #[test]
    fn wait_for_commands_reports_failures() {
        assert!(matches!(
            wait_for_commands(&[]),
            Err(QueueError::InvalidValue(_))
        ));
        let ok = Command::user();
        let bad = Command::user();
        ok.set_user_status(CommandStatus::Complete).unwrap();
        bad.set_user_status(CommandStatus::Error(-1)).unwrap();
        assert_eq!(wait_for_commands(&[ok.clone()]), Ok(()));
        assert_eq!(
            wait_for_commands(&[ok, bad]),
            Err(QueueError::DependencyInError)
        );
    }

    #[test]
    fn profiling_info_needs_a_profiling_queue() {
        let cmd = Command::user();
        cmd.set_user_status(CommandStatus::Complete).unwrap();
        assert_eq!(
            cmd.profiling_info(TimingPoint::Queued),
            Err(QueueError::ProfilingInfoNotAvailable)
        );
    }
}
