#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use hostq::cpu::{CpuBackend, CpuBackendConfig};
use hostq::{Backend, CommandQueue, QueueConfig, QueueProperties};

static TRACING: OnceLock<()> = OnceLock::new();

/// Route engine logs through the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn cpu(workers: usize) -> Arc<CpuBackend> {
    init_tracing();
    Arc::new(
        CpuBackend::new(CpuBackendConfig {
            workers,
            name: "e2e".into(),
        })
        .unwrap(),
    )
}

pub fn queue_on(cpu: &Arc<CpuBackend>, properties: QueueProperties) -> CommandQueue {
    queue_with(cpu, properties, QueueConfig::default())
}

pub fn queue_with(
    cpu: &Arc<CpuBackend>,
    properties: QueueProperties,
    config: QueueConfig,
) -> CommandQueue {
    let backend: Arc<dyn Backend> = cpu.clone();
    CommandQueue::new(backend, properties, config).unwrap()
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
