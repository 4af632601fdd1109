use super::WorkerId;
use core::time::Duration;
use std::collections::VecDeque;

/// Ordered queue of slots scheduled for graceful replacement.
///
/// Consumed strictly front to back; the supervisor never starts the next
/// replacement before the previous one is ready.
#[derive(Debug, Clone, Default)]
pub struct RestartPlan {
    queue: VecDeque<WorkerId>,
}

impl RestartPlan {
    pub fn new(ids: impl IntoIterator<Item = WorkerId>) -> Self {
        Self {
            queue: ids.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Iterator for RestartPlan {
    type Item = WorkerId;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop_front()
    }
}

/// Outcome of a [`rolling_restart`](super::Supervisor::rolling_restart).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutReport {
    /// Slots that got a fresh, ready incarnation, in plan order.
    pub restarted: Vec<WorkerId>,
    /// Slots left alone: suspended by the crash-loop guard or already being
    /// replaced after a crash.
    pub skipped: Vec<WorkerId>,
    /// Slots whose worker had to be force-terminated after the drain timeout.
    pub drain_timeouts: Vec<WorkerId>,
    pub elapsed: Duration,
}
