#![forbid(unsafe_code)]

// Native-only tool; keep a stub so `--target wasm32-unknown-unknown --workspace` still builds.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use clap::Parser;
    use hostq_core::{
        wait_for_commands, Backend, Command, CommandKind, CommandQueue, CommandStatus,
        CommandWork, QueueConfig, QueueError, QueueProperties, TimingPoint,
    };
    use hostq_cpu::{CpuBackend, CpuBackendConfig};

    /// Predecessors are drawn from this many most recent commands.
    const DEPENDENCY_WINDOW: usize = 64;
    const INJECTED_FAILURE_CODE: i32 = -9999;

    #[derive(Debug, Parser)]
    #[command(about = "Run a synthetic command dependency graph on the hostq CPU backend")]
    pub struct Args {
        /// Number of kernel commands to enqueue.
        #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        commands: u64,

        /// Maximum number of predecessors per command.
        #[arg(long, default_value_t = 2)]
        fan_in: usize,

        /// Worker threads (overrides `HOSTQ_CPU_WORKERS`).
        #[arg(long)]
        workers: Option<usize>,

        /// Use an out-of-order queue.
        #[arg(long)]
        out_of_order: bool,

        /// Record timestamps and report queued->ended latency.
        #[arg(long)]
        profiling: bool,

        /// Enqueue a barrier before every Nth command.
        #[arg(long)]
        barrier_every: Option<usize>,

        /// Make the command with this index fail.
        #[arg(long)]
        fail_at: Option<u64>,

        /// Busy-wait this many microseconds inside each command.
        #[arg(long, default_value_t = 0)]
        spin_us: u64,

        /// Seed for the dependency graph.
        #[arg(long, default_value_t = 1)]
        seed: u64,
    }

    /// xorshift64*, enough to shape a reproducible graph.
    pub(crate) struct GraphRng(u64);

    impl GraphRng {
        pub(crate) fn new(seed: u64) -> Self {
            Self(seed.max(1))
        }

        pub(crate) fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            self.0 = x;
            x.wrapping_mul(0x2545_f491_4f6c_dd1d)
        }
    }

    /// Indices of up to `fan_in` distinct predecessors among the `available` earlier commands.
    pub(crate) fn pick_predecessors(
        rng: &mut GraphRng,
        available: usize,
        fan_in: usize,
    ) -> Vec<usize> {
        let window = available.min(DEPENDENCY_WINDOW);
        if window == 0 {
            return Vec::new();
        }
        let mut picked: Vec<usize> = (0..fan_in.min(window))
            .map(|_| available - 1 - (rng.next_u64() % window as u64) as usize)
            .collect();
        picked.sort_unstable();
        picked.dedup();
        picked
    }

    fn spin(duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }

    #[derive(Debug, Default)]
    struct Summary {
        enqueued: usize,
        rejected: usize,
        completed: usize,
        failed: usize,
        stalled: usize,
        mean_latency: Option<Duration>,
    }

    fn summarize(commands: &[Command], rejected: usize, profiling: bool) -> Summary {
        let mut summary = Summary {
            enqueued: commands.len(),
            rejected,
            ..Summary::default()
        };
        let mut latency_total = 0u128;
        let mut latency_samples = 0u128;
        for command in commands {
            match command.status() {
                CommandStatus::Complete => summary.completed += 1,
                CommandStatus::Error(_) => summary.failed += 1,
                _ => summary.stalled += 1,
            }
            if !profiling {
                continue;
            }
            let queued = command.profiling_info(TimingPoint::Queued);
            let ended = command.profiling_info(TimingPoint::Ended);
            if let (Ok(queued), Ok(ended)) = (queued, ended) {
                latency_total += u128::from(ended.saturating_sub(queued));
                latency_samples += 1;
            }
        }
        if latency_samples > 0 {
            let mean = latency_total / latency_samples;
            let mean = u64::try_from(mean).unwrap_or(u64::MAX);
            summary.mean_latency = Some(Duration::from_nanos(mean));
        }
        summary
    }

    pub fn main() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();

        let args = Args::parse();

        let queue_config = QueueConfig::from_env().context("invalid queue configuration")?;
        let mut cpu_config =
            CpuBackendConfig::from_env().context("invalid cpu backend configuration")?;
        if let Some(workers) = args.workers {
            cpu_config.workers = workers;
        }
        let cpu = Arc::new(CpuBackend::new(cpu_config).context("failed to start cpu backend")?);

        let mut properties = QueueProperties::empty();
        properties.set(QueueProperties::OUT_OF_ORDER_EXEC_MODE, args.out_of_order);
        properties.set(QueueProperties::PROFILING, args.profiling);
        let backend: Arc<dyn Backend> = cpu.clone();
        let queue = CommandQueue::new(backend, properties, queue_config)
            .context("failed to create command queue")?;

        tracing::info!(
            commands = args.commands,
            fan_in = args.fan_in,
            workers = cpu.worker_count(),
            out_of_order = args.out_of_order,
            "running synthetic graph"
        );

        let start = Instant::now();
        let spin_for = Duration::from_micros(args.spin_us);
        let mut rng = GraphRng::new(args.seed);
        let mut commands: Vec<Command> = Vec::new();
        let mut rejected = 0usize;
        let mut failing_position = None;

        for index in 0..args.commands {
            if let Some(every) = args.barrier_every.filter(|&every| every > 0) {
                if index > 0 && index % every as u64 == 0 {
                    queue.enqueue_barrier().context("failed to enqueue barrier")?;
                }
            }

            let picked = pick_predecessors(&mut rng, commands.len(), args.fan_in);
            let wait_list: Vec<Command> = picked
                .into_iter()
                .map(|i| commands[i].clone())
                .collect();
            let fail = args.fail_at == Some(index);
            let work: CommandWork = Box::new(move |_| {
                spin(spin_for);
                if fail {
                    return Err(QueueError::BackendExecutionFailed {
                        code: INJECTED_FAILURE_CODE,
                    });
                }
                Ok(())
            });

            match queue.enqueue(CommandKind::NdRangeKernel, &wait_list, Some(work)) {
                Ok(command) => {
                    if fail {
                        failing_position = Some(commands.len());
                    }
                    commands.push(command);
                }
                Err(QueueError::DependencyInError) => rejected += 1,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to enqueue command {index}"))
                }
            }
        }
        queue.flush();

        // A failed command stays at its position in the queue and blocks everything queued after
        // it, so only the commands up to it are guaranteed to settle.
        let settling = match failing_position {
            Some(position) => &commands[..=position],
            None => &commands[..],
        };
        match wait_for_commands(settling) {
            Ok(()) => queue.finish(),
            Err(QueueError::DependencyInError) => {
                tracing::warn!("some commands failed; the queue stays blocked behind them");
            }
            Err(err) => return Err(err).context("waiting for commands"),
        }
        let elapsed = start.elapsed();

        let summary = summarize(&commands, rejected, args.profiling);
        let stats = cpu.stats();
        println!("enqueued:  {}", summary.enqueued);
        println!("rejected:  {}", summary.rejected);
        println!("completed: {}", summary.completed);
        println!("failed:    {}", summary.failed);
        println!("stalled:   {}", summary.stalled);
        println!("wall time: {:.3} ms", elapsed.as_secs_f64() * 1e3);
        if let Some(latency) = summary.mean_latency {
            println!("mean queued->ended: {:.1} us", latency.as_secs_f64() * 1e6);
        }
        println!(
            "backend:   pushed={} completed={} failed={} panicked={}",
            stats.pushed, stats.completed, stats.failed, stats.panicked
        );
        Ok(())
    }

}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
