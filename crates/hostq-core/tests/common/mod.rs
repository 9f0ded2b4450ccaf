//! Shared helpers for `hostq-core` integration tests.
//!
//! [`MockBackend`] never runs anything on its own: pushed commands accumulate until the test
//! completes them, which makes every admission decision observable and deterministic.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hostq_core::{
    Backend, BackendData, Command, CommandKind, CommandQueue, CommandStatus, QueueConfig,
    QueueError, QueueProperties, Result,
};

pub struct MockBackend {
    supported: QueueProperties,
    complete_on_push: bool,
    enough: AtomicBool,
    fail_init: Mutex<Option<CommandKind>>,
    pushed: Mutex<Vec<Command>>,
    history: Mutex<Vec<u64>>,
    freed: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Self::with_supported(QueueProperties::all())
    }

    pub fn with_supported(supported: QueueProperties) -> Arc<Self> {
        Arc::new(Self::build(supported, false))
    }

    /// Completes every command synchronously from inside `push_command`.
    pub fn completing() -> Arc<Self> {
        Arc::new(Self::build(QueueProperties::all(), true))
    }

    fn build(supported: QueueProperties, complete_on_push: bool) -> Self {
        Self {
            supported,
            complete_on_push,
            enough: AtomicBool::new(false),
            fail_init: Mutex::new(None),
            pushed: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            freed: AtomicUsize::new(0),
        }
    }

    pub fn set_got_enough(&self, enough: bool) {
        self.enough.store(enough, Ordering::SeqCst);
    }

    pub fn fail_init_for(&self, kind: CommandKind) {
        *self.fail_init.lock().unwrap() = Some(kind);
    }

    /// Ids of every command ever pushed, in push order.
    pub fn history(&self) -> Vec<u64> {
        self.history.lock().unwrap().clone()
    }

    pub fn was_pushed(&self, command: &Command) -> bool {
        self.history().contains(&command.id())
    }

    /// Commands pushed and not yet handed back to the test.
    pub fn take_pushed(&self) -> Vec<Command> {
        std::mem::take(&mut *self.pushed.lock().unwrap())
    }

    /// Complete every outstanding command, including ones pushed while completing. Returns how many
    /// were completed.
    pub fn complete_all(&self) -> usize {
        let mut total = 0;
        loop {
            let batch = self.take_pushed();
            if batch.is_empty() {
                return total;
            }
            total += batch.len();
            for command in batch {
                command.set_status(CommandStatus::Running);
                command.set_status(CommandStatus::Complete);
            }
        }
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn supported_queue_properties(&self) -> QueueProperties {
        self.supported
    }

    fn init_command_data(&self, command: &Command) -> Result<()> {
        if *self.fail_init.lock().unwrap() == Some(command.kind()) {
            return Err(QueueError::BackendInitFailed {
                code: -45,
                reason: format!("mock refuses {}", command.kind()),
            });
        }
        command.set_backend_data(Box::new(command.id()));
        Ok(())
    }

    fn free_command_data(&self, _kind: CommandKind, data: BackendData) {
        assert!(data.downcast::<u64>().is_ok());
        self.freed.fetch_add(1, Ordering::SeqCst);
    }

    fn push_command(&self, command: Command) {
        assert_eq!(command.status(), CommandStatus::Submitted);
        self.history.lock().unwrap().push(command.id());
        if self.complete_on_push {
            command.set_status(CommandStatus::Complete);
        } else {
            self.pushed.lock().unwrap().push(command);
        }
    }

    fn got_enough_to_work_on(&self) -> bool {
        self.enough.load(Ordering::SeqCst)
    }
}

pub fn in_order(backend: &Arc<MockBackend>) -> CommandQueue {
    queue_with(backend, QueueProperties::empty(), QueueConfig::default())
}

pub fn out_of_order(backend: &Arc<MockBackend>) -> CommandQueue {
    queue_with(
        backend,
        QueueProperties::OUT_OF_ORDER_EXEC_MODE,
        QueueConfig::default(),
    )
}

pub fn queue_with(
    backend: &Arc<MockBackend>,
    properties: QueueProperties,
    config: QueueConfig,
) -> CommandQueue {
    let backend: Arc<dyn Backend> = backend.clone();
    CommandQueue::new(backend, properties, config).unwrap()
}

pub fn kernel(queue: &CommandQueue, wait_list: &[Command]) -> Command {
    queue
        .enqueue(CommandKind::NdRangeKernel, wait_list, None)
        .unwrap()
}
