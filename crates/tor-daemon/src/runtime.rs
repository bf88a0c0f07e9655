//! The runtime: one tor process, one control connection, one job queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt as _;
use tracing::{debug, info, warn};

use tor_ctrl::{Command, CommandReply, ConfSetting, ControlConn, Observer, ObserverId};

use crate::caps::{Capabilities, NetworkStatus};
use crate::config::{RestartPolicy, TorDaemonConfig};
use crate::env::{DaemonEnv, EnvGuard, Fid};
use crate::err::{Error, Result};
use crate::job::{
    ActionKind, Job, JobArgument, JobCallbacks, JobHandle, JobOutput,
};
use crate::queue::JobQueue;
use crate::{shutdown, startup};

/// Lifecycle state of the daemon.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum::Display)]
#[allow(clippy::exhaustive_enums)]
pub enum DaemonState {
    /// No process, no connection.
    #[default]
    Off,
    /// Between the first start dispatch and readiness.
    Starting,
    /// Process up, control connection authenticated.
    On,
    /// Between a stop dispatch (or connection loss) and full teardown.
    Stopping,
}

/// Whether tor is allowed to touch the network.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum::Display)]
#[allow(clippy::exhaustive_enums)]
pub enum NetworkState {
    /// `DisableNetwork 0`.
    #[default]
    Enabled,
    /// `DisableNetwork 1`.
    Disabled,
}

/// A snapshot of the runtime's observable state.
///
/// Published on a watch channel: see [`TorRuntime::status_events`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DaemonStatus {
    /// Lifecycle state.
    pub state: DaemonState,
    /// Network enablement.
    pub network: NetworkState,
    /// Tor's reported bootstrap percentage, 0..=100.
    pub bootstrap: u8,
}

/// A stream of [`DaemonStatus`] snapshots.
///
/// Not every intermediate state is guaranteed to be observed; if changes
/// outpace the reader, only the latest is retained.
#[derive(Clone)]
pub struct StatusEvents {
    /// The receiver that implements this stream.
    pub(crate) inner: postage::watch::Receiver<DaemonStatus>,
}

impl futures::Stream for StatusEvents {
    type Item = DaemonStatus;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Mutable lifecycle state.  Guarded by a lock that is never held across
/// an await; the dispatcher task does the long-running work.
pub(crate) struct Live {
    /// Lifecycle state.
    pub(crate) state: DaemonState,
    /// Desired network enablement.
    pub(crate) network: NetworkState,
    /// Last reported bootstrap percentage.
    pub(crate) bootstrap: u8,
    /// The live control connection, while On.
    pub(crate) conn: Option<ControlConn>,
    /// The tor child process, while running.
    pub(crate) child: Option<Box<dyn crate::caps::ChildProc>>,
    /// Increments for every new control connection; stale close
    /// notifications are recognized by epoch mismatch.
    pub(crate) conn_epoch: u64,
    /// Whether the most recent executed lifecycle action was a start or
    /// restart.
    pub(crate) last_action_was_start: bool,
    /// Whether a user-initiated stop has been requested since then.
    pub(crate) stop_requested: bool,
    /// Consecutive startup failures.
    pub(crate) start_failures: u32,
    /// Set once the runtime is destroyed.
    pub(crate) destroyed: bool,
}

/// One registered runtime observer and, when a connection is live, its
/// per-connection registration.
pub(crate) struct RegisteredObserver {
    /// Runtime-level id, stable across reconnects.
    pub(crate) id: u64,
    /// The observer itself; replayed onto each new connection.
    pub(crate) observer: Observer,
    /// Its id on the current connection, tagged by epoch.
    pub(crate) conn_id: Option<(u64, ObserverId)>,
}

/// Shared core of a [`TorRuntime`].
pub(crate) struct RuntimeInner {
    /// The directories we own.
    pub(crate) env: DaemonEnv,
    /// How we behave.
    pub(crate) config: TorDaemonConfig,
    /// Platform capabilities.
    pub(crate) caps: Capabilities,
    /// The job queue.
    pub(crate) queue: Mutex<JobQueue>,
    /// Wakes the dispatcher after an enqueue.
    pub(crate) wake_tx: mpsc::UnboundedSender<()>,
    /// Lifecycle state.
    pub(crate) live: Mutex<Live>,
    /// Publishes [`DaemonStatus`] snapshots.
    status_tx: Mutex<postage::watch::Sender<DaemonStatus>>,
    /// Receiver template for subscribers.
    status_rx: postage::watch::Receiver<DaemonStatus>,
    /// Desired tor-event observers, replayed onto every connection.
    pub(crate) observers: Mutex<Vec<RegisteredObserver>>,
    /// Id source for runtime observers.
    next_observer_id: AtomicU64,
    /// Registration of our directories; released on drop.
    _env_guard: EnvGuard,
}

impl RuntimeInner {
    /// Snapshot and publish the current status.
    pub(crate) fn publish(&self) {
        let status = {
            let live = self.live.lock().expect("live lock poisoned");
            DaemonStatus {
                state: live.state,
                network: live.network,
                bootstrap: live.bootstrap,
            }
        };
        let mut tx = self.status_tx.lock().expect("status lock poisoned");
        *tx.borrow_mut() = status;
    }

    /// Record a bootstrap percentage (from stdout or a STATUS_CLIENT
    /// event) and publish if it moved.
    pub(crate) fn set_bootstrap(&self, percent: u8) {
        let changed = {
            let mut live = self.live.lock().expect("live lock poisoned");
            let clamped = percent.min(100);
            let changed = live.bootstrap != clamped;
            live.bootstrap = clamped;
            changed
        };
        if changed {
            self.publish();
        }
    }

    /// The live control connection, if any.
    pub(crate) fn conn(&self) -> Option<ControlConn> {
        self.live.lock().expect("live lock poisoned").conn.clone()
    }

    /// Enqueue a job and wake the dispatcher.
    pub(crate) fn enqueue(
        &self,
        name: impl Into<String>,
        argument: JobArgument,
        callbacks: JobCallbacks,
    ) -> Result<JobHandle> {
        let handle = self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .enqueue(name, argument, callbacks)?;
        let _ = self.wake_tx.unbounded_send(());
        Ok(handle)
    }

    /// React to the control connection closing underneath us.
    ///
    /// Called from the connection's destroy handler.  Ignored when the
    /// close belongs to an older connection or was deliberate (the
    /// lifecycle code takes the connection out of `live` first).
    pub(crate) fn note_conn_closed(self: &Arc<Self>, epoch: u64) {
        let restart = {
            let mut live = self.live.lock().expect("live lock poisoned");
            if live.destroyed || live.conn_epoch != epoch || live.conn.is_none() {
                return;
            }
            warn!("[{}] control connection lost unexpectedly", self.env.fid());
            live.conn = None;
            live.state = DaemonState::Off;
            live.bootstrap = 0;
            // The child exits on its own (TAKEOWNERSHIP); drop our handle.
            live.child = None;
            let restart = match self.config.restart_policy {
                RestartPolicy::Never => false,
                RestartPolicy::Always => true,
                RestartPolicy::AfterStart => {
                    live.last_action_was_start && !live.stop_requested
                }
            };
            restart && live.start_failures <= self.config.max_start_failures
        };
        self.publish();
        if restart {
            info!("[{}] scheduling automatic restart", self.env.fid());
            let _ = self.enqueue(
                "auto-restart",
                JobArgument::Action(ActionKind::StartDaemon),
                JobCallbacks::new(),
            );
        }
    }

    /// Record the desired network state; when On, reconcile tor's
    /// `DisableNetwork` through the queue.
    pub(crate) fn set_network(self: &Arc<Self>, status: NetworkStatus) {
        let (changed, apply) = {
            let mut live = self.live.lock().expect("live lock poisoned");
            let desired = match status {
                NetworkStatus::Connected => NetworkState::Enabled,
                NetworkStatus::Disconnected => NetworkState::Disabled,
            };
            let changed = live.network != desired;
            live.network = desired;
            (changed, live.conn.is_some())
        };
        if !changed {
            return;
        }
        self.publish();
        if apply {
            let setting = {
                let live = self.live.lock().expect("live lock poisoned");
                match live.network {
                    NetworkState::Enabled => ConfSetting::set("DisableNetwork", "0"),
                    NetworkState::Disabled => ConfSetting::set("DisableNetwork", "1"),
                }
            };
            let _ = self.enqueue(
                "network-toggle",
                JobArgument::Command {
                    cmd: Command::SetConf(vec![setting]),
                    deadline: Some(Duration::from_millis(2000)),
                },
                JobCallbacks::new(),
            );
        }
    }
}

/// The dispatcher: pops and runs one job at a time, forever.
async fn dispatcher(inner: Arc<RuntimeInner>, mut wake: mpsc::UnboundedReceiver<()>) {
    loop {
        let job = inner
            .queue
            .lock()
            .expect("queue lock poisoned")
            .pop_next();
        match job {
            Some(job) => run_job(&inner, job).await,
            None => {
                if wake.next().await.is_none() {
                    break;
                }
            }
        }
    }
    debug!("[{}] dispatcher exiting", inner.env.fid());
}

/// Execute one job to a terminal state.
async fn run_job(inner: &Arc<RuntimeInner>, job: Arc<Job>) {
    debug!("[{}] running job {}", inner.env.fid(), job.name());
    let result = match job.argument().clone() {
        JobArgument::Command { cmd, deadline } => run_command(inner, cmd, deadline)
            .await
            .map(JobOutput::Command),
        JobArgument::Action(kind) => run_action(inner, kind).await.map(|()| JobOutput::Action(kind)),
    };
    job.complete(result);
}

/// Round-trip one command through the control connection.
async fn run_command(
    inner: &Arc<RuntimeInner>,
    cmd: Command,
    deadline: Option<Duration>,
) -> Result<CommandReply> {
    let conn = inner.conn().ok_or(Error::NotRunning)?;
    let reply = match deadline {
        Some(d) => conn.execute_with_deadline(cmd, d).await?,
        None => conn.execute(cmd).await?,
    };
    Ok(reply)
}

/// Drive the lifecycle state machine for one action.
async fn run_action(inner: &Arc<RuntimeInner>, kind: ActionKind) -> Result<()> {
    match kind {
        ActionKind::StartDaemon => startup::start_daemon(inner).await,
        ActionKind::StopDaemon => shutdown::stop_daemon(inner).await,
        ActionKind::RestartDaemon => {
            shutdown::stop_daemon(inner).await?;
            startup::start_daemon(inner).await
        }
    }
}

/// A supervised tor daemon.
///
/// Create one with [`TorRuntime::launch`]; drive it by enqueuing actions
/// and commands.  Dropping the runtime kills the daemon (the child is
/// spawned kill-on-drop), but [`TorRuntime::destroy`] is the orderly way
/// out.
pub struct TorRuntime {
    /// The shared core.
    inner: Arc<RuntimeInner>,
}

impl TorRuntime {
    /// Launch a runtime with the default (tokio-backed) capabilities.
    ///
    /// Must be called within a tokio runtime.
    pub fn launch(env: DaemonEnv, config: TorDaemonConfig) -> Result<TorRuntime> {
        TorRuntime::launch_with(env, config, Capabilities::default())
    }

    /// Launch a runtime with explicit capabilities.
    pub fn launch_with(
        env: DaemonEnv,
        config: TorDaemonConfig,
        caps: Capabilities,
    ) -> Result<TorRuntime> {
        let env_guard = EnvGuard::claim(&env)?;
        let (wake_tx, wake_rx) = mpsc::unbounded();
        let (status_tx, status_rx) = postage::watch::channel();
        let inner = Arc::new(RuntimeInner {
            env,
            config,
            caps,
            queue: Mutex::new(JobQueue::new()),
            wake_tx,
            live: Mutex::new(Live {
                state: DaemonState::Off,
                network: NetworkState::Enabled,
                bootstrap: 0,
                conn: None,
                child: None,
                conn_epoch: 0,
                last_action_was_start: false,
                stop_requested: false,
                start_failures: 0,
                destroyed: false,
            }),
            status_tx: Mutex::new(status_tx),
            status_rx,
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            _env_guard: env_guard,
        });
        tokio::spawn(dispatcher(Arc::clone(&inner), wake_rx));
        if let Some(network) = inner.caps.network.clone() {
            let events = network.watch();
            let debounce = inner.config.network_debounce;
            tokio::spawn(network_task(Arc::downgrade(&inner), events, debounce));
        }
        info!("[{}] runtime launched", inner.env.fid());
        Ok(TorRuntime { inner })
    }

    /// The runtime's fid.
    pub fn fid(&self) -> Fid {
        self.inner.env.fid()
    }

    /// The runtime's environment.
    pub fn env(&self) -> &DaemonEnv {
        &self.inner.env
    }

    /// The current status snapshot.
    pub fn status(&self) -> DaemonStatus {
        let live = self.inner.live.lock().expect("live lock poisoned");
        DaemonStatus {
            state: live.state,
            network: live.network,
            bootstrap: live.bootstrap,
        }
    }

    /// A stream of status snapshots, starting with the current one.
    pub fn status_events(&self) -> StatusEvents {
        StatusEvents {
            inner: self.inner.status_rx.clone(),
        }
    }

    /// Enqueue a lifecycle action.
    ///
    /// Returns a handle immediately; the action runs when the queue
    /// reaches it, subject to the interrupt/coalesce rules.
    pub fn enqueue_action(&self, kind: ActionKind, callbacks: JobCallbacks) -> Result<JobHandle> {
        if matches!(kind, ActionKind::StartDaemon | ActionKind::RestartDaemon) {
            // An explicit start is a fresh request: forgive old failures.
            let mut live = self.inner.live.lock().expect("live lock poisoned");
            live.start_failures = 0;
        }
        self.inner
            .enqueue(kind.to_string(), JobArgument::Action(kind), callbacks)
    }

    /// Enqueue a control command.
    pub fn enqueue_command(&self, cmd: Command, callbacks: JobCallbacks) -> Result<JobHandle> {
        self.enqueue_command_with_deadline(cmd, None, callbacks)
    }

    /// Enqueue a control command with an optional reply deadline.
    pub fn enqueue_command_with_deadline(
        &self,
        cmd: Command,
        deadline: Option<Duration>,
        callbacks: JobCallbacks,
    ) -> Result<JobHandle> {
        self.inner.enqueue(
            cmd.keyword().to_string(),
            JobArgument::Command { cmd, deadline },
            callbacks,
        )
    }

    /// Register a tor-event observer.
    ///
    /// The observer survives restarts: it is replayed onto every new
    /// control connection, with `SETEVENTS` recomputed.
    pub async fn subscribe(&self, observer: Observer) -> Result<u64> {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let conn = self.inner.conn();
        let conn_id = match &conn {
            Some(conn) => {
                let epoch = self
                    .inner
                    .live
                    .lock()
                    .expect("live lock poisoned")
                    .conn_epoch;
                Some((epoch, conn.subscribe(observer.clone()).await?))
            }
            None => None,
        };
        self.inner
            .observers
            .lock()
            .expect("observer lock poisoned")
            .push(RegisteredObserver {
                id,
                observer,
                conn_id,
            });
        Ok(id)
    }

    /// Remove a previously registered observer.
    pub async fn unsubscribe(&self, id: u64) -> Result<bool> {
        let (found, live_registration) = {
            let mut observers = self.inner.observers.lock().expect("observer lock poisoned");
            match observers.iter().position(|r| r.id == id) {
                Some(idx) => {
                    let removed = observers.remove(idx);
                    (true, removed.conn_id)
                }
                None => (false, None),
            }
        };
        if let Some((epoch, conn_id)) = live_registration {
            let matches_epoch = {
                let live = self.inner.live.lock().expect("live lock poisoned");
                live.conn_epoch == epoch && live.conn.is_some()
            };
            if matches_epoch {
                if let Some(conn) = self.inner.conn() {
                    let _ = conn.unsubscribe(conn_id).await;
                }
            }
        }
        Ok(found)
    }

    /// Destroy the runtime.
    ///
    /// Pending jobs are cancelled; the executing job (if any) gets a short
    /// grace window; then the daemon is torn down and the environment's
    /// directories are released.
    pub async fn destroy(self) {
        let fid = self.inner.env.fid();
        debug!("[{}] destroying runtime", fid);
        {
            let mut live = self.inner.live.lock().expect("live lock poisoned");
            live.destroyed = true;
            live.stop_requested = true;
        }
        self.inner
            .queue
            .lock()
            .expect("queue lock poisoned")
            .destroy();
        // Give the executing job a chance to finish cleanly.
        tokio::time::sleep(self.inner.config.destroy_grace).await;
        shutdown::teardown(&self.inner).await;
        self.inner.wake_tx.close_channel();
        info!("[{}] runtime destroyed", fid);
    }
}

impl std::fmt::Debug for TorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorRuntime")
            .field("fid", &self.inner.env.fid())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Watch connectivity, debounce flaps, and feed the runtime.
async fn network_task(
    inner: Weak<RuntimeInner>,
    mut events: BoxStream<'static, NetworkStatus>,
    debounce: Duration,
) {
    while let Some(first) = events.next().await {
        // Absorb rapid flips: within the debounce window, only the last
        // state counts.
        let mut latest = first;
        loop {
            match tokio::time::timeout(debounce, events.next()).await {
                Ok(Some(next)) => latest = next,
                Ok(None) | Err(_) => break,
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.set_network(latest);
    }
}
