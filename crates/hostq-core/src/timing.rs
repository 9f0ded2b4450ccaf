use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingPoint {
    /// The command entered its queue.
    Queued,
    /// The command was handed to the backend.
    Submitted,
    /// The backend started executing it.
    Started,
    /// The backend finished executing it.
    Ended,
}

impl TimingPoint {
    pub const ALL: [TimingPoint; 4] = [
        TimingPoint::Queued,
        TimingPoint::Submitted,
        TimingPoint::Started,
        TimingPoint::Ended,
    ];

    fn index(self) -> usize {
        match self {
            Self::Queued => 0,
            Self::Submitted => 1,
            Self::Started => 2,
            Self::Ended => 3,
        }
    }
}

/// Monotonic nanoseconds since the first call in this process.
pub fn monotonic_now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    // Saturate instead of wrapping after ~584 years of uptime.
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Profiling timestamps of one command. Each point is recorded at most once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandTiming {
    points: [Option<u64>; 4],
}

impl CommandTiming {
    pub fn get(&self, point: TimingPoint) -> Option<u64> {
        self.points[point.index()]
    }

    /// Record `now_ns` for `point` unless it already has a value. Returns whether it was recorded.
    pub(crate) fn record(&mut self, point: TimingPoint, now_ns: u64) -> bool {
        let slot = &mut self.points[point.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(now_ns);
        true
    }
}
