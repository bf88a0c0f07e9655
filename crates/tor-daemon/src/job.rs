//! Jobs: enqueued units of work with state, callbacks, and cancellation.
//!
//! A job's life is `Enqueued → Executing → {Succeeded, Failed}`, or
//! `Enqueued → Cancelled`; terminal states are sticky, and whichever of
//! the terminal callbacks applies fires exactly once, under the job's own
//! lock discipline.  Jobs coalesced into another job become its children
//! and complete together with it.

use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{FutureExt as _, Shared};
use tracing::trace;

use crate::err::{Error, Result};
use tor_ctrl::{Command, CommandReply};

/// A lifecycle operation on the runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, strum::Display)]
#[allow(clippy::exhaustive_enums)]
pub enum ActionKind {
    /// Start the daemon.
    StartDaemon,
    /// Stop the daemon.
    StopDaemon,
    /// Stop, then start, the daemon.
    RestartDaemon,
}

/// What a job does when it executes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum JobArgument {
    /// Drive the lifecycle state machine.
    Action(ActionKind),
    /// Round-trip a command through the control connection.
    Command {
        /// The command itself.
        cmd: Command,
        /// Optional reply deadline.
        deadline: Option<std::time::Duration>,
    },
}

impl JobArgument {
    /// The action, if this is an action job.
    pub(crate) fn as_action(&self) -> Option<ActionKind> {
        match self {
            JobArgument::Action(a) => Some(*a),
            JobArgument::Command { .. } => None,
        }
    }
}

/// The value a finished job produced.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum JobOutput {
    /// An action completed.
    Action(ActionKind),
    /// A command completed with this reply.
    Command(CommandReply),
}

/// What a job terminated with.
pub type JobResult = Result<JobOutput>;

/// Observable state of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum JobState {
    /// Waiting in the queue.
    Enqueued,
    /// Currently running.  No longer cancellable.
    Executing,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl JobState {
    /// Whether this state is terminal.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Callback invoked on success, with the job's output.
pub type SuccessCallback = Box<dyn FnOnce(&JobOutput) + Send>;
/// Callback invoked on failure (including cancellation), with the error.
pub type FailureCallback = Box<dyn FnOnce(&Error) + Send>;

/// The optional terminal callbacks of one job.
#[derive(Default)]
#[non_exhaustive]
pub struct JobCallbacks {
    /// Runs once if the job succeeds.
    pub(crate) on_success: Option<SuccessCallback>,
    /// Runs once if the job fails or is cancelled.
    pub(crate) on_failure: Option<FailureCallback>,
}

impl JobCallbacks {
    /// No callbacks.
    pub fn new() -> JobCallbacks {
        JobCallbacks::default()
    }

    /// Add a success callback.
    pub fn on_success(mut self, f: impl FnOnce(&JobOutput) + Send + 'static) -> JobCallbacks {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Add a failure callback.
    pub fn on_failure(mut self, f: impl FnOnce(&Error) + Send + 'static) -> JobCallbacks {
        self.on_failure = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// State behind the job's lock.
struct JobCore {
    /// Current state.
    state: JobState,
    /// Terminal callbacks, taken exactly once.
    callbacks: JobCallbacks,
    /// Completion signal for [`JobHandle::wait`].
    done_tx: Option<oneshot::Sender<JobResult>>,
    /// Jobs coalesced into this one; they complete with it.
    children: Vec<Arc<Job>>,
    /// The terminal result, kept so that late-adopted children can be
    /// completed consistently.
    outcome: Option<JobResult>,
}

/// The shared core of one enqueued job.
pub(crate) struct Job {
    /// Queue-assigned id.
    id: u64,
    /// Human-readable name, for logs.
    name: String,
    /// What the job does.
    argument: JobArgument,
    /// Everything mutable.
    core: Mutex<JobCore>,
}

impl Job {
    /// Create a job and its handle.
    pub(crate) fn new(
        id: u64,
        name: impl Into<String>,
        argument: JobArgument,
        callbacks: JobCallbacks,
    ) -> (Arc<Job>, JobHandle) {
        let name = name.into();
        let (done_tx, done_rx) = oneshot::channel();
        let job = Arc::new(Job {
            id,
            name: name.clone(),
            argument,
            core: Mutex::new(JobCore {
                state: JobState::Enqueued,
                callbacks,
                done_tx: Some(done_tx),
                children: Vec::new(),
                outcome: None,
            }),
        });
        let handle = JobHandle {
            name,
            job: Arc::clone(&job),
            done: done_rx.shared(),
        };
        (job, handle)
    }

    /// What the job does.
    pub(crate) fn argument(&self) -> &JobArgument {
        &self.argument
    }

    /// The job's name.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub(crate) fn state(&self) -> JobState {
        self.core.lock().expect("job lock poisoned").state
    }

    /// Transition `Enqueued → Executing`.
    ///
    /// Returns false when the job is no longer runnable (it was cancelled
    /// or otherwise completed while queued).
    pub(crate) fn mark_executing(&self) -> bool {
        let mut core = self.core.lock().expect("job lock poisoned");
        if core.state == JobState::Enqueued {
            core.state = JobState::Executing;
            trace!("job#{} {} executing", self.id, self.name);
            true
        } else {
            false
        }
    }

    /// Coalesce `child` into this job: it completes when we do.
    ///
    /// If we are already terminal the child completes right away, with
    /// the same outcome.
    pub(crate) fn adopt(&self, child: Arc<Job>) {
        let late_outcome = {
            let mut core = self.core.lock().expect("job lock poisoned");
            trace!("job#{} {} adopted by #{}", child.id, child.name, self.id);
            match &core.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    core.children.push(Arc::clone(&child));
                    None
                }
            }
        };
        if let Some(outcome) = late_outcome {
            child.complete(outcome);
        }
    }

    /// Drive the job to a terminal state and fire its callbacks.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub(crate) fn complete(&self, result: JobResult) {
        self.complete_inner(result, false);
    }

    /// Shared transition logic for [`Job::complete`] and
    /// [`Job::fail_enqueued`].  Returns whether this call performed the
    /// terminal transition.
    fn complete_inner(&self, result: JobResult, only_if_enqueued: bool) -> bool {
        let (callbacks, done_tx, children) = {
            let mut core = self.core.lock().expect("job lock poisoned");
            if core.state.is_terminal() {
                return false;
            }
            if only_if_enqueued && core.state != JobState::Enqueued {
                return false;
            }
            core.state = match &result {
                Ok(_) => JobState::Succeeded,
                Err(Error::Cancelled) | Err(Error::Destroyed) => JobState::Cancelled,
                Err(_) => JobState::Failed,
            };
            core.outcome = Some(result.clone());
            trace!("job#{} {} -> {:?}", self.id, self.name, core.state);
            (
                std::mem::take(&mut core.callbacks),
                core.done_tx.take(),
                std::mem::take(&mut core.children),
            )
        };
        // Callbacks run outside the lock; they may re-enter the runtime.
        match &result {
            Ok(output) => {
                if let Some(f) = callbacks.on_success {
                    f(output);
                }
            }
            Err(e) => {
                if let Some(f) = callbacks.on_failure {
                    f(e);
                }
            }
        }
        if let Some(tx) = done_tx {
            let _ = tx.send(result.clone());
        }
        for child in children {
            child.complete(result.clone());
        }
        true
    }

    /// Fail the job if it is still enqueued; no-op otherwise.
    ///
    /// Used for cancellation and for lifecycle interrupts.  Returns
    /// whether the job was failed by this call.
    pub(crate) fn fail_enqueued(&self, err: Error) -> bool {
        self.complete_inner(Err(err), true)
    }
}

/// The caller's handle to an enqueued job.
///
/// Cloneable; every clone observes the same job.
#[derive(Clone)]
pub struct JobHandle {
    /// The job's name.
    name: String,
    /// The shared job core.
    job: Arc<Job>,
    /// Completion future, shareable across clones.
    done: Shared<oneshot::Receiver<JobResult>>,
}

impl JobHandle {
    /// The job's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The job's current state.
    pub fn state(&self) -> JobState {
        self.job.state()
    }

    /// Request cancellation.
    ///
    /// Only jobs still enqueued can be cancelled; a cancel on an executing
    /// or finished job is silently ignored.  Returns whether this call
    /// cancelled the job.
    pub fn cancel(&self) -> bool {
        self.job.fail_enqueued(Error::Cancelled)
    }

    /// Suspend until the job terminates.
    pub async fn wait(&self) -> JobResult {
        match self.done.clone().await {
            Ok(result) => result,
            // The runtime went away without completing the job.
            Err(_cancelled) => Err(Error::Destroyed),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
