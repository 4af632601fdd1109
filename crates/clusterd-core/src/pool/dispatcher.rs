//! Accept-time worker selection.
//!
//! The [`Dispatcher`] only picks an index; the supervisor calls it while
//! holding the pool lock and bumps the chosen worker's connection count in
//! the same critical section, so selection and accounting never race.

use super::WorkerStatus;
use crate::{Error, LoadBalancePolicy, Result};

/// What the dispatcher needs to know about a pool entry.
pub trait Assignable {
    fn status(&self) -> WorkerStatus;
    fn active_connections(&self) -> usize;

    fn is_eligible(&self) -> bool {
        self.status().is_serving()
    }
}

/// Load-balancing state for one pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy: LoadBalancePolicy,
    /// Index the next round-robin scan starts from.
    cursor: usize,
}

impl Dispatcher {
    pub const fn new(policy: LoadBalancePolicy) -> Self {
        Self { policy, cursor: 0 }
    }

    pub const fn policy(&self) -> LoadBalancePolicy {
        self.policy
    }

    /// Picks the index of the worker that should take the next connection.
    ///
    /// Runs in `O(pool.len())` and never waits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCapacity`] if no entry is `Ready` or `Busy`.
    pub fn select<T: Assignable>(&mut self, pool: &[T]) -> Result<usize> {
        match self.policy {
            LoadBalancePolicy::RoundRobin => self.next_round_robin(pool),
            LoadBalancePolicy::LeastConnections => least_connections(pool),
        }
    }

    fn next_round_robin<T: Assignable>(&mut self, pool: &[T]) -> Result<usize> {
        let len = pool.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if pool[idx].is_eligible() {
                self.cursor = (idx + 1) % len;
                return Ok(idx);
            }
        }
        Err(Error::NoCapacity)
    }
}

fn least_connections<T: Assignable>(pool: &[T]) -> Result<usize> {
    pool.iter()
        .enumerate()
        .filter(|(_, w)| w.is_eligible())
        // `min_by_key` keeps the first minimum, which is the pool-order tie
        // break.
        .min_by_key(|(_, w)| w.active_connections())
        .map(|(idx, _)| idx)
        .ok_or(Error::NoCapacity)
}
