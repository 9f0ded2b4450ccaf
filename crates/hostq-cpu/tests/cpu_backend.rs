use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use hostq_core::{
    codes, Backend, Command, CommandKind, CommandQueue, CommandStatus, QueueConfig, QueueError,
    QueueProperties, TimingPoint,
};
use hostq_cpu::{CpuBackend, CpuBackendConfig};
use pretty_assertions::assert_eq;

fn backend(workers: usize) -> Arc<CpuBackend> {
    Arc::new(
        CpuBackend::new(CpuBackendConfig {
            workers,
            name: "test-cpu".into(),
        })
        .unwrap(),
    )
}

fn queue(backend: &Arc<CpuBackend>, properties: QueueProperties) -> CommandQueue {
    let backend: Arc<dyn Backend> = backend.clone();
    CommandQueue::new(backend, properties, QueueConfig::default()).unwrap()
}

#[test]
fn in_order_queue_runs_work_in_submission_order() {
    let cpu = backend(4);
    let queue = queue(&cpu, QueueProperties::empty());
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..32 {
        let log = log.clone();
        queue
            .enqueue(
                CommandKind::NdRangeKernel,
                &[],
                Some(Box::new(move |_| {
                    log.lock().unwrap().push(i);
                    Ok(())
                })),
            )
            .unwrap();
    }
    queue.finish();

    assert_eq!(*log.lock().unwrap(), (0..32).collect::<Vec<_>>());
    assert_eq!(cpu.stats().completed, 32);
}

#[test]
fn out_of_order_queue_respects_dependencies() {
    let cpu = backend(4);
    let queue = queue(&cpu, QueueProperties::OUT_OF_ORDER_EXEC_MODE);
    let produced = Arc::new(AtomicUsize::new(0));

    let producers: Vec<Command> = (0..8)
        .map(|_| {
            let produced = produced.clone();
            queue
                .enqueue(
                    CommandKind::TaskKernel,
                    &[],
                    Some(Box::new(move |_| {
                        produced.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })),
                )
                .unwrap()
        })
        .collect();

    let seen = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let produced = produced.clone();
        let seen = seen.clone();
        queue
            .enqueue(
                CommandKind::NdRangeKernel,
                &producers,
                Some(Box::new(move |_| {
                    seen.store(produced.load(Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap()
    };

    queue.finish();
    assert_eq!(consumer.status(), CommandStatus::Complete);
    assert_eq!(seen.load(Ordering::SeqCst), 8);
}

#[test]
fn failing_and_panicking_work_report_error_codes() {
    let cpu = backend(2);
    let queue = queue(&cpu, QueueProperties::OUT_OF_ORDER_EXEC_MODE);

    // Hold both back until the downstream command is linked to the panicking one.
    let gate = Command::user();
    let failing = queue
        .enqueue(
            CommandKind::NativeKernel,
            &[gate.clone()],
            Some(Box::new(|_| Err(QueueError::BackendExecutionFailed { code: -1001 }))),
        )
        .unwrap();
    let panicking = queue
        .enqueue(
            CommandKind::NativeKernel,
            &[gate.clone()],
            Some(Box::new(|_| panic!("boom"))),
        )
        .unwrap();
    let downstream = queue
        .enqueue(CommandKind::ReadBuffer, &[panicking.clone()], None)
        .unwrap();
    gate.set_user_status(CommandStatus::Complete).unwrap();

    assert_eq!(
        failing.wait_for_status(CommandStatus::Complete),
        CommandStatus::Error(-1001)
    );
    assert_eq!(
        panicking.wait_for_status(CommandStatus::Complete),
        CommandStatus::Error(codes::OUT_OF_RESOURCES)
    );
    assert_eq!(
        downstream.wait_for_status(CommandStatus::Complete),
        CommandStatus::Error(codes::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
    );

    let stats = cpu.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.panicked, 1);
}

#[test]
fn kernels_without_work_are_refused() {
    let cpu = backend(1);
    let queue = queue(&cpu, QueueProperties::empty());

    let err = queue
        .enqueue(CommandKind::NdRangeKernel, &[], None)
        .unwrap_err();
    assert_eq!(err.code(), codes::INVALID_PROGRAM_EXECUTABLE);

    let copy = queue.enqueue(CommandKind::CopyBuffer, &[], None).unwrap();
    queue.finish();
    assert_eq!(copy.status(), CommandStatus::Complete);
}

#[test]
fn profiling_queue_records_all_timestamps() {
    let cpu = backend(2);
    let queue = queue(&cpu, QueueProperties::PROFILING);

    let cmd = queue
        .enqueue(
            CommandKind::NdRangeKernel,
            &[],
            Some(Box::new(|_| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                Ok(())
            })),
        )
        .unwrap();
    queue.finish();

    let times: Vec<u64> = TimingPoint::ALL
        .iter()
        .map(|point| cmd.profiling_info(*point).unwrap())
        .collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
    assert!(times[3] - times[2] >= 2_000_000);
}

#[test]
fn user_command_gates_cpu_work() {
    let cpu = backend(2);
    let queue = queue(&cpu, QueueProperties::OUT_OF_ORDER_EXEC_MODE);
    let gate = Command::user();

    let gated = queue
        .enqueue(CommandKind::WriteBuffer, &[gate.clone()], None)
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert_eq!(gated.status(), CommandStatus::Queued);

    gate.set_user_status(CommandStatus::Complete).unwrap();
    queue.finish();
    assert_eq!(gated.status(), CommandStatus::Complete);
}

#[test]
fn backend_may_be_dropped_by_a_worker() {
    let cpu = backend(2);
    let queue = queue(&cpu, QueueProperties::empty());
    drop(cpu);

    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = done.clone();
        queue
            .enqueue(
                CommandKind::NativeKernel,
                &[],
                Some(Box::new(move |_| {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap();
    }
    queue.finish();
    // The last references to the queue and its backend now go away on whichever thread drops the
    // command last.
    drop(queue);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_callback_keeps_the_only_worker_alive() {
    let cpu = backend(1);
    let queue = queue(&cpu, QueueProperties::OUT_OF_ORDER_EXEC_MODE);
    let gate = Command::user();

    let first = queue
        .enqueue(CommandKind::CopyBuffer, &[gate.clone()], None)
        .unwrap();
    first
        .set_callback(CommandStatus::Complete, |_, _| panic!("callback failure"))
        .unwrap();
    let second = queue
        .enqueue(CommandKind::CopyBuffer, &[first.clone()], None)
        .unwrap();
    gate.set_user_status(CommandStatus::Complete).unwrap();

    assert_eq!(
        second.wait_for_status(CommandStatus::Complete),
        CommandStatus::Complete
    );
    let after = queue.enqueue(CommandKind::CopyBuffer, &[], None).unwrap();
    queue.finish();
    assert_eq!(after.status(), CommandStatus::Complete);
    assert_eq!(cpu.stats().completed, 3);
}

#[test]
fn commands_failed_while_in_the_fifo_are_skipped() {
    let cpu = backend(1);
    let busy = queue(&cpu, QueueProperties::empty());
    let (release, hold) = mpsc::channel::<()>();
    busy.enqueue(
        CommandKind::NativeKernel,
        &[],
        Some(Box::new(move |_| {
            let _ = hold.recv();
            Ok(())
        })),
    )
    .unwrap();

    let other = queue(&cpu, QueueProperties::OUT_OF_ORDER_EXEC_MODE);
    let ran = Arc::new(AtomicBool::new(false));
    let failed = {
        let ran = ran.clone();
        other
            .enqueue(
                CommandKind::NativeKernel,
                &[],
                Some(Box::new(move |_| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap()
    };
    assert_eq!(failed.status(), CommandStatus::Submitted);
    failed.set_status(CommandStatus::Error(-3));
    assert_eq!(other.counters().on_backend, 0);

    release.send(()).unwrap();
    // Queued behind the failed command in the single worker's FIFO.
    let after = busy.enqueue(CommandKind::CopyBuffer, &[], None).unwrap();
    busy.finish();

    assert_eq!(after.status(), CommandStatus::Complete);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(failed.status(), CommandStatus::Error(-3));
    let stats = cpu.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
}
