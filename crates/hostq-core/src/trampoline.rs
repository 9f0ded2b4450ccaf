//! Per-thread work list for status changes and admission passes.
//!
//! Completing a command notifies its dependents and runs admission passes, which can complete
//! further (instantaneous) commands, which notify their dependents, and so on. Instead of recursing,
//! every such step is a [`Job`]. The first job on a thread becomes the driver and runs every job
//! queued behind it before returning; jobs requested while a driver is active are appended to its
//! list. Stack depth therefore stays constant no matter how long the chain is, and a public call still
//! returns only after all work it caused on its own thread has run.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::queue::{self, Finished, QueueShared};
use crate::{Command, CommandStatus};

pub(crate) enum Job {
    SetStatus {
        command: Command,
        status: CommandStatus,
    },
    Admit {
        queue: Arc<QueueShared>,
        ready: Option<Command>,
        finished: Finished,
    },
}

impl Job {
    fn run(self) {
        match self {
            Job::SetStatus { command, status } => command.apply_status(status),
            Job::Admit {
                queue,
                ready,
                finished,
            } => queue::admit(&queue, ready.as_ref(), finished),
        }
    }
}

thread_local! {
    static WORK_LIST: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Clears the work list when the driver unwinds, so the thread does not stay in "deferring" mode.
struct DriverGuard;

impl Drop for DriverGuard {
    fn drop(&mut self) {
        WORK_LIST.with(|list| list.borrow_mut().take());
    }
}

/// Run `job` now if no driver is active on this thread, otherwise queue it behind the current one.
pub(crate) fn drive(job: Job) {
    let job = WORK_LIST.with(|list| {
        let mut list = list.borrow_mut();
        match list.as_mut() {
            Some(pending) => {
                pending.push_back(job);
                None
            }
            None => {
                *list = Some(VecDeque::new());
                Some(job)
            }
        }
    });
    let Some(job) = job else {
        return;
    };

    let _guard = DriverGuard;
    job.run();
    while let Some(next) = pop_next() {
        next.run();
    }
}

fn pop_next() -> Option<Job> {
    WORK_LIST.with(|list| list.borrow_mut().as_mut().and_then(VecDeque::pop_front))
}

