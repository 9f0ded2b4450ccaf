//! Host CPU backend for `hostq-core`: a fixed pool of worker threads sharing one FIFO.
//!
//! Commands carry their host code as [`hostq_core::CommandWork`]. Transfer commands without work
//! complete as soon as a worker picks them up; kernels must have work attached before they are
//! queued.
#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use hostq_core::{
    codes, parse_var, Backend, Command, CommandStatus, ConfigError, QueueError, QueueProperties,
    TimingPoint,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CpuBackendError {
    #[error("cpu backend needs at least one worker")]
    NoWorkers,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuBackendConfig {
    pub workers: usize,
    /// Used for worker thread names and logs.
    pub name: String,
}

impl Default for CpuBackendConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            name: "cpu".to_string(),
        }
    }
}

impl CpuBackendConfig {
    /// Read `HOSTQ_CPU_WORKERS`; unset means one worker per available core.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let workers = parse_var(&lookup, "HOSTQ_CPU_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidEnv("HOSTQ_CPU_WORKERS"));
        }
        Ok(Self {
            workers,
            ..defaults
        })
    }
}

/// Counters since the backend was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuBackendStats {
    pub pushed: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Fifo {
    commands: VecDeque<Command>,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    fifo: Mutex<Fifo>,
    available: Condvar,
    pushed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Fifo> {
        self.fifo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_command(&self) -> Option<Command> {
        let mut fifo = self.lock();
        loop {
            if let Some(command) = fifo.commands.pop_front() {
                return Some(command);
            }
            if fifo.stopping {
                return None;
            }
            fifo = self
                .available
                .wait(fifo)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

pub struct CpuBackend {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuBackend {
    pub fn new(config: CpuBackendConfig) -> Result<Self, CpuBackendError> {
        if config.workers == 0 {
            return Err(CpuBackendError::NoWorkers);
        }
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{index}", config.name))
                .spawn(move || run_worker(&worker_shared, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    stop_workers(&shared, workers);
                    return Err(err.into());
                }
            }
        }
        debug!(
            backend = %config.name,
            workers = config.workers,
            "cpu backend started"
        );
        Ok(Self {
            name: config.name,
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn stats(&self) -> CpuBackendStats {
        CpuBackendStats {
            pushed: self.shared.pushed.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_queue_properties(&self) -> QueueProperties {
        QueueProperties::OUT_OF_ORDER_EXEC_MODE | QueueProperties::PROFILING
    }

    fn init_command_data(&self, command: &Command) -> hostq_core::Result<()> {
        if command.kind().is_kernel() && !command.has_work() {
            return Err(QueueError::BackendInitFailed {
                code: codes::INVALID_PROGRAM_EXECUTABLE,
                reason: format!("{} has no host code attached", command.kind()),
            });
        }
        Ok(())
    }

    fn push_command(&self, command: Command) {
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
        self.shared.lock().commands.push_back(command);
        self.shared.available.notify_one();
    }

    fn got_enough_to_work_on(&self) -> bool {
        !self.shared.lock().commands.is_empty()
    }
}

impl Drop for CpuBackend {
    fn drop(&mut self) {
        let workers = std::mem::take(
            self.workers
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        stop_workers(&self.shared, workers);
        debug!(backend = %self.name, "cpu backend stopped");
    }
}

/// Ask every worker to exit once the FIFO is drained and join them. The calling thread is never
/// joined: the last command reference can be dropped by a worker, taking the backend with it.
fn stop_workers(shared: &Shared, workers: Vec<JoinHandle<()>>) {
    shared.lock().stopping = true;
    shared.available.notify_all();

    let current = thread::current().id();
    for handle in workers {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            warn!("cpu worker exited by panicking");
        }
    }
}

fn run_worker(shared: &Shared, index: usize) {
    debug!(worker = index, "cpu worker started");
    while let Some(command) = shared.next_command() {
        execute(shared, command);
    }
    debug!(worker = index, "cpu worker exiting");
}

fn execute(shared: &Shared, command: Command) {
    // Failed or was completed by someone else while it sat in the FIFO.
    if command.status().is_terminal() {
        debug!(command = command.id(), status = %command.status(), "skipping finished command");
        drop(command.take_work());
        return;
    }
    let profiling = command.queue_profiling_enabled();
    if profiling {
        command.update_timing(TimingPoint::Started);
    }
    command.set_status(CommandStatus::Running);

    let outcome = match command.take_work() {
        None => CommandStatus::Complete,
        Some(work) => match panic::catch_unwind(AssertUnwindSafe(|| work(&command))) {
            Ok(Ok(())) => CommandStatus::Complete,
            Ok(Err(err)) => {
                let code = err.code();
                debug!(command = command.id(), error = %err, "command work failed");
                CommandStatus::Error(if code < 0 {
                    code
                } else {
                    codes::OUT_OF_RESOURCES
                })
            }
            Err(_) => {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                warn!(command = command.id(), kind = %command.kind(), "command work panicked");
                CommandStatus::Error(codes::OUT_OF_RESOURCES)
            }
        },
    };

    if profiling {
        command.update_timing(TimingPoint::Ended);
    }
    match outcome {
        CommandStatus::Complete => shared.completed.fetch_add(1, Ordering::Relaxed),
        _ => shared.failed.fetch_add(1, Ordering::Relaxed),
    };
    command.set_status(outcome);
}
