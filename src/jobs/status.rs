//! Job states and the queue-wide status-count table.

use parking_lot::Mutex;

/// Lifecycle of one queue node.
///
/// Driver-reported states sit between `Submitted` and `Done`/`Exit`; the
/// queue owns every other transition. `DoKill` and `DoKillNodeFailure` are
/// requests that the manager loop converts to their terminal outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    NotActive,
    Waiting,
    Submitted,
    Pending,
    Running,
    Done,
    Exit,
    DoKill,
    DoKillNodeFailure,
    Success,
    Failed,
    IsKilled,
}

pub const NUM_STATUSES: usize = 12;

pub const ALL_STATUSES: [JobStatus; NUM_STATUSES] = [
    JobStatus::NotActive,
    JobStatus::Waiting,
    JobStatus::Submitted,
    JobStatus::Pending,
    JobStatus::Running,
    JobStatus::Done,
    JobStatus::Exit,
    JobStatus::DoKill,
    JobStatus::DoKillNodeFailure,
    JobStatus::Success,
    JobStatus::Failed,
    JobStatus::IsKilled,
];

impl JobStatus {
    fn index(self) -> usize {
        match self {
            JobStatus::NotActive => 0,
            JobStatus::Waiting => 1,
            JobStatus::Submitted => 2,
            JobStatus::Pending => 3,
            JobStatus::Running => 4,
            JobStatus::Done => 5,
            JobStatus::Exit => 6,
            JobStatus::DoKill => 7,
            JobStatus::DoKillNodeFailure => 8,
            JobStatus::Success => 9,
            JobStatus::Failed => 10,
            JobStatus::IsKilled => 11,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::IsKilled
        )
    }

    /// States from which an external kill request is meaningful.
    pub fn can_kill(self) -> bool {
        matches!(
            self,
            JobStatus::Waiting
                | JobStatus::Submitted
                | JobStatus::Pending
                | JobStatus::Running
                | JobStatus::DoKill
        )
    }

    /// States whose progress is owned by the driver and must be polled.
    pub fn driver_polled(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Pending | JobStatus::Running
        )
    }

    /// Legal state-machine moves; everything else is a programmer error.
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            NotActive => matches!(to, Waiting),
            Waiting => matches!(to, Submitted | DoKill | IsKilled),
            Submitted => matches!(to, Pending | Running | Done | Exit | DoKill | DoKillNodeFailure | IsKilled),
            Pending => matches!(to, Running | Done | Exit | DoKill | DoKillNodeFailure | IsKilled),
            Running => matches!(to, Done | Exit | DoKill | DoKillNodeFailure | IsKilled),
            Done => matches!(to, Success | Exit),
            Exit => matches!(to, Waiting | Failed),
            DoKill => matches!(to, IsKilled),
            DoKillNodeFailure => matches!(to, Exit),
            Success | Failed | IsKilled => false,
        }
    }
}

/// Counts of nodes per status, updated atomically with every transition.
///
/// Readers take one consistent copy; summing per-node statuses instead is
/// exactly the race this table exists to avoid.
#[derive(Default)]
pub struct StatusTable {
    counts: Mutex<[usize; NUM_STATUSES]>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a newly created node.
    pub fn register(&self, status: JobStatus) {
        self.counts.lock()[status.index()] += 1;
    }

    /// Move one node between status buckets.
    pub fn transition(&self, from: JobStatus, to: JobStatus) {
        let mut counts = self.counts.lock();
        debug_assert!(counts[from.index()] > 0, "status table underflow on {from:?}");
        counts[from.index()] -= 1;
        counts[to.index()] += 1;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            counts: *self.counts.lock(),
        }
    }
}

/// One consistent read of the status table.
#[derive(Clone, Copy, Debug)]
pub struct StatusSnapshot {
    counts: [usize; NUM_STATUSES],
}

impl StatusSnapshot {
    pub fn count(&self, status: JobStatus) -> usize {
        self.counts[status.index()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Jobs that have reached a terminal state.
    pub fn num_complete(&self) -> usize {
        self.count(JobStatus::Success)
            + self.count(JobStatus::Failed)
            + self.count(JobStatus::IsKilled)
    }

    pub fn num_active(&self) -> usize {
        self.count(JobStatus::Pending) + self.count(JobStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_state_machine() {
        use JobStatus::*;
        assert!(NotActive.can_transition(Waiting));
        assert!(Waiting.can_transition(Submitted));
        assert!(Running.can_transition(Done));
        assert!(Done.can_transition(Success));
        assert!(Done.can_transition(Exit));
        assert!(Exit.can_transition(Waiting));
        assert!(Exit.can_transition(Failed));
        assert!(DoKill.can_transition(IsKilled));
        assert!(DoKillNodeFailure.can_transition(Exit));

        assert!(!Success.can_transition(Waiting));
        assert!(!IsKilled.can_transition(IsKilled));
        assert!(!Waiting.can_transition(Running));
        assert!(!Done.can_transition(Failed));
    }

    #[test]
    fn table_counts_stay_balanced() {
        let table = StatusTable::new();
        table.register(JobStatus::NotActive);
        table.register(JobStatus::NotActive);
        table.transition(JobStatus::NotActive, JobStatus::Waiting);
        let snap = table.snapshot();
        assert_eq!(snap.total(), 2);
        assert_eq!(snap.count(JobStatus::Waiting), 1);
        assert_eq!(snap.count(JobStatus::NotActive), 1);
        assert_eq!(snap.num_complete(), 0);
    }
}
