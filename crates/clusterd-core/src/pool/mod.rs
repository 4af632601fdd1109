//! The worker pool: records, selection, worker incarnations and the
//! supervisor that ties them together.

mod dispatcher;
mod record;
mod restart;
mod supervisor;
mod worker;

#[cfg(test)]
mod tests;

pub use dispatcher::{Assignable, Dispatcher};
pub use record::{WorkerId, WorkerPid, WorkerSnapshot, WorkerStatus};
pub use restart::{RestartPlan, RolloutReport};
pub use supervisor::Supervisor;

/// Where [`Supervisor::assign`] placed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerId,
    pub pid: WorkerPid,
}

/// A connection [`Supervisor::try_assign`] could not place.
#[derive(Debug)]
pub struct Rejected<C> {
    pub error: crate::Error,
    pub connection: C,
}

impl<C> Rejected<C> {
    pub(crate) const fn new(error: crate::Error, connection: C) -> Self {
        Self { error, connection }
    }
}
