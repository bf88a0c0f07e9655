//! The per-runtime job queue and its interrupt rules.
//!
//! Dispatch is plain FIFO; the interesting rules run when a *lifecycle
//! action* is enqueued, and they only ever touch jobs that are still
//! pending (an executing job is beyond interruption):
//!
//!  * A new `StopDaemon` interrupts every pending start/restart and every
//!    pending command with `InterruptedByStop`, and coalesces with an
//!    already-pending stop (completing together with it).
//!  * A new start/restart symmetrically interrupts pending conflicting
//!    lifecycle jobs and coalesces with a pending peer of the same kind,
//!    but leaves pending commands alone.
//!
//! So a start that was already executing when a stop arrived runs to its
//! own conclusion, while everything the stop made moot is failed promptly.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::err::{Error, Result};
use crate::job::{ActionKind, Job, JobArgument, JobCallbacks, JobHandle};

/// What to do with one pending job when an action is enqueued.
enum Disposition {
    /// Peer of the same kind: the new job will complete together with it.
    CoalesceInto,
    /// Moot under the new action: fails with `InterruptedByStop`.
    Interrupt,
    /// Unaffected; stays queued.
    Keep,
}

/// The queue of not-yet-executed jobs of one runtime.
///
/// Mutated only under the runtime's queue lock.
pub(crate) struct JobQueue {
    /// Id for the next job.
    next_id: u64,
    /// Pending jobs, oldest first.
    queue: VecDeque<Arc<Job>>,
    /// Set once the runtime is destroyed; enqueues fail from then on.
    destroyed: bool,
}

impl JobQueue {
    /// An empty queue.
    pub(crate) fn new() -> JobQueue {
        JobQueue {
            next_id: 0,
            queue: VecDeque::new(),
            destroyed: false,
        }
    }

    /// Add a job, applying the interrupt rules; returns its handle.
    pub(crate) fn enqueue(
        &mut self,
        name: impl Into<String>,
        argument: JobArgument,
        callbacks: JobCallbacks,
    ) -> Result<JobHandle> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        let id = self.next_id;
        self.next_id += 1;
        let action = argument.as_action();
        let (job, handle) = Job::new(id, name, argument, callbacks);
        match action {
            Some(kind) => {
                match self.reconcile(kind) {
                    Some(peer) => {
                        // The new action completes with its pending peer.
                        peer.adopt(job);
                    }
                    None => self.queue.push_back(job),
                }
            }
            None => self.queue.push_back(job),
        }
        Ok(handle)
    }

    /// Apply the interrupt rules for a newly enqueued `action` to the
    /// pending jobs.  Returns the pending peer to coalesce into, if any.
    fn reconcile(&mut self, action: ActionKind) -> Option<Arc<Job>> {
        let pending = std::mem::take(&mut self.queue);
        let mut peer = None;
        for job in pending {
            let disposition = match job.argument() {
                JobArgument::Action(other) if *other == action => Disposition::CoalesceInto,
                JobArgument::Action(_) => Disposition::Interrupt,
                JobArgument::Command { .. } if action == ActionKind::StopDaemon => {
                    Disposition::Interrupt
                }
                JobArgument::Command { .. } => Disposition::Keep,
            };
            match disposition {
                Disposition::CoalesceInto => {
                    peer.get_or_insert_with(|| Arc::clone(&job));
                    self.queue.push_back(job);
                }
                Disposition::Interrupt => {
                    job.fail_enqueued(Error::InterruptedByStop { by: action });
                }
                Disposition::Keep => self.queue.push_back(job),
            }
        }
        peer
    }

    /// Pop the oldest runnable job and mark it executing.
    ///
    /// Returns `None` when nothing is runnable.
    pub(crate) fn pop_next(&mut self) -> Option<Arc<Job>> {
        loop {
            let job = self.queue.pop_front()?;
            if !job.mark_executing() {
                // Cancelled while queued; skip it.
                continue;
            }
            return Some(job);
        }
    }

    /// Whether any job is pending.
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Refuse further enqueues and cancel everything still pending.
    pub(crate) fn destroy(&mut self) {
        self.destroyed = true;
        let pending = std::mem::take(&mut self.queue);
        if !pending.is_empty() {
            debug!("cancelling {} queued jobs", pending.len());
        }
        for job in pending {
            job.fail_enqueued(Error::Cancelled);
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::job::{JobOutput, JobState};
    use assert_matches::assert_matches;
    use tor_ctrl::{Command, TorSignal};

    fn action(queue: &mut JobQueue, kind: ActionKind) -> JobHandle {
        queue
            .enqueue(kind.to_string(), JobArgument::Action(kind), JobCallbacks::new())
            .unwrap()
    }

    fn command(queue: &mut JobQueue, name: &str) -> JobHandle {
        queue
            .enqueue(
                name,
                JobArgument::Command {
                    cmd: Command::Signal(TorSignal::Newnym),
                    deadline: None,
                },
                JobCallbacks::new(),
            )
            .unwrap()
    }

    #[test]
    fn plain_fifo_for_commands() {
        let mut q = JobQueue::new();
        let _first = command(&mut q, "one");
        let second = command(&mut q, "two");
        let a = q.pop_next().unwrap();
        assert_eq!(a.name(), "one");
        a.complete(Ok(JobOutput::Command(tor_ctrl::CommandReply::Ok)));
        let b = q.pop_next().unwrap();
        assert_eq!(b.name(), "two");
        b.complete(Ok(JobOutput::Command(tor_ctrl::CommandReply::Ok)));
        assert!(q.pop_next().is_none());
        assert_eq!(second.state(), JobState::Succeeded);
    }

    #[test]
    fn stop_interrupts_pending_start_but_not_executing_one() {
        // Start, Start, Stop enqueued in rapid succession.
        let mut q = JobQueue::new();
        let start1 = action(&mut q, ActionKind::StartDaemon);
        // The dispatcher picked the first start up already.
        let executing = q.pop_next().unwrap();
        let start2 = action(&mut q, ActionKind::StartDaemon);
        let stop = action(&mut q, ActionKind::StopDaemon);

        // The executing start is beyond interruption...
        assert_eq!(start1.state(), JobState::Executing);
        executing.complete(Ok(JobOutput::Action(ActionKind::StartDaemon)));
        assert_eq!(start1.state(), JobState::Succeeded);

        // ...the pending one was interrupted the moment the stop arrived.
        assert_matches!(
            futures::executor::block_on(start2.wait()),
            Err(Error::InterruptedByStop {
                by: ActionKind::StopDaemon
            })
        );

        // And the stop is next in line.
        let next = q.pop_next().unwrap();
        assert_eq!(next.name(), "StopDaemon");
        next.complete(Ok(JobOutput::Action(ActionKind::StopDaemon)));
        assert_eq!(stop.state(), JobState::Succeeded);
    }

    #[test]
    fn pending_stops_coalesce() {
        let mut q = JobQueue::new();
        let stop1 = action(&mut q, ActionKind::StopDaemon);
        let stop2 = action(&mut q, ActionKind::StopDaemon);
        let stop3 = action(&mut q, ActionKind::StopDaemon);

        // One stop in the queue; the others ride along.
        let executing = q.pop_next().unwrap();
        assert!(q.is_empty());
        executing.complete(Ok(JobOutput::Action(ActionKind::StopDaemon)));
        for handle in [stop1, stop2, stop3] {
            assert_eq!(handle.state(), JobState::Succeeded);
        }
    }

    #[test]
    fn stop_interrupts_pending_commands_but_start_spares_them() {
        let mut q = JobQueue::new();
        let cmd = command(&mut q, "newnym");
        let _start = action(&mut q, ActionKind::StartDaemon);
        // The command survived the start being enqueued.
        assert_eq!(cmd.state(), JobState::Enqueued);

        let _stop = action(&mut q, ActionKind::StopDaemon);
        assert_matches!(
            futures::executor::block_on(cmd.wait()),
            Err(Error::InterruptedByStop { .. })
        );
    }

    #[test]
    fn conflicting_lifecycle_actions_interrupt() {
        let mut q = JobQueue::new();
        let stop = action(&mut q, ActionKind::StopDaemon);
        let _restart = action(&mut q, ActionKind::RestartDaemon);
        // The newer restart wins over the pending stop.
        assert_matches!(
            futures::executor::block_on(stop.wait()),
            Err(Error::InterruptedByStop {
                by: ActionKind::RestartDaemon
            })
        );
    }

    #[test]
    fn cancelled_jobs_are_skipped_at_dispatch() {
        let mut q = JobQueue::new();
        let first = command(&mut q, "one");
        let _second = command(&mut q, "two");
        assert!(first.cancel());
        let executing = q.pop_next().unwrap();
        assert_eq!(executing.name(), "two");
        assert_eq!(first.state(), JobState::Cancelled);
    }

    #[test]
    fn destroy_cancels_pending_and_rejects_enqueues() {
        let mut q = JobQueue::new();
        let pending = command(&mut q, "doomed");
        q.destroy();
        assert_eq!(pending.state(), JobState::Cancelled);
        assert_matches!(
            q.enqueue(
                "late",
                JobArgument::Action(ActionKind::StartDaemon),
                JobCallbacks::new()
            ),
            Err(Error::Destroyed)
        );
    }
}
