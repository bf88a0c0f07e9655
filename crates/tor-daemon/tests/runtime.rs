//! End-to-end tests: the full runtime driven against an in-process,
//! scripted tor (fake process launcher + fake control listener).

#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::Notify;
use tokio_util::compat::TokioAsyncReadCompatExt as _;

use tor_daemon::caps::{
    BoxedStream, Capabilities, ChildProc, CtrlAddr, NetworkStatus, NetworkWatcher, OutputLine,
    ProcessLauncher, SpawnTor, StdStream, StreamConnector,
};
use tor_daemon::tor_ctrl::{Command, CommandReply, TorSignal};
use tor_daemon::{
    ActionKind, ControlListener, DaemonEnv, DaemonState, Error, JobCallbacks, JobOutput,
    TorDaemonConfig, TorRuntime,
};

/// Shared state of the scripted tor.
struct FakeTor {
    /// `DisableNetwork`, as last set over the control port.
    disable_network: Mutex<String>,
    /// Whether the "process" has exited.
    exited: AtomicBool,
    /// Wakes `FakeChild::wait`.
    exit_notify: Notify,
    /// Control connections accepted so far.
    connections: AtomicUsize,
    /// The live control-server task, so tests can crash the connection.
    server: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FakeTor {
    fn new() -> Arc<FakeTor> {
        Arc::new(FakeTor {
            disable_network: Mutex::new("1".to_string()),
            exited: AtomicBool::new(false),
            exit_notify: Notify::new(),
            connections: AtomicUsize::new(0),
            server: Mutex::new(None),
        })
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.exit_notify.notify_waiters();
    }

    /// Sever the live control connection without marking the process
    /// exited, as if the connection crashed.
    fn kill_connection(&self) {
        if let Some(handle) = self.server.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// The stdout script of a tor that comes up normally.
fn readiness_script() -> Vec<String> {
    [
        "[notice] Tor 0.4.8.12 opening log file.",
        "[notice] Bootstrapped 0% (starting): Starting",
        "[notice] Opened Socks listener connection (ready) on 127.0.0.1:9050",
        "[notice] Opened Control listener connection (ready) on 127.0.0.1:9051",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// A launcher that yields children speaking from canned scripts.
struct FakeLauncher {
    tor: Arc<FakeTor>,
    /// Scripts for successive spawns; when empty, [`readiness_script`].
    scripts: Mutex<VecDeque<Vec<String>>>,
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, _spec: SpawnTor) -> io::Result<Box<dyn ChildProc>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(readiness_script);
        self.tor.exited.store(false, Ordering::SeqCst);
        let lines = script.into_iter().map(|line| OutputLine {
            stream: StdStream::Stdout,
            line,
        });
        Ok(Box::new(FakeChild {
            tor: Arc::clone(&self.tor),
            output: Some(futures::stream::iter(lines).boxed()),
        }))
    }
}

/// One fake tor process.
struct FakeChild {
    tor: Arc<FakeTor>,
    output: Option<BoxStream<'static, OutputLine>>,
}

#[async_trait]
impl ChildProc for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_output(&mut self) -> Option<BoxStream<'static, OutputLine>> {
        self.output.take()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.tor.exited.load(Ordering::SeqCst).then_some(0))
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        loop {
            if self.tor.exited.load(Ordering::SeqCst) {
                return Ok(Some(0));
            }
            tokio::select! {
                _ = self.tor.exit_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.tor.mark_exited();
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.tor.mark_exited();
        Ok(())
    }
}

/// Serves the control protocol on one connection.
async fn serve(tor: Arc<FakeTor>, stream: tokio::io::DuplexStream) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply: String = if line.starts_with("PROTOCOLINFO") {
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n\
             250-VERSION Tor=\"0.4.8.12\"\r\n250 OK\r\n"
                .into()
        } else if line.starts_with("SETCONF DisableNetwork=") {
            let value = line
                .trim_start_matches("SETCONF DisableNetwork=")
                .trim()
                .to_string();
            *tor.disable_network.lock().unwrap() = value;
            "250 OK\r\n".into()
        } else if line.starts_with("GETCONF DisableNetwork") {
            format!(
                "250 DisableNetwork={}\r\n",
                tor.disable_network.lock().unwrap()
            )
        } else if line.starts_with("GETINFO version") {
            "250-version=0.4.8.12\r\n250 OK\r\n".into()
        } else if line.starts_with("SIGNAL SHUTDOWN") || line.starts_with("SIGNAL HALT") {
            let _ = write.write_all(b"250 OK\r\n").await;
            tor.mark_exited();
            break;
        } else {
            // AUTHENTICATE, TAKEOWNERSHIP, SETEVENTS, other SIGNALs...
            "250 OK\r\n".into()
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Hands out in-process control connections served by [`serve`].
struct FakeConnector {
    tor: Arc<FakeTor>,
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(&self, _addr: &CtrlAddr) -> tor_daemon::Result<BoxedStream> {
        let (local, server) = tokio::io::duplex(8192);
        self.tor.connections.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(serve(Arc::clone(&self.tor), server));
        *self.tor.server.lock().unwrap() = Some(handle);
        Ok(Box::new(local.compat()))
    }
}

/// A network watcher fed by hand from the test.
struct ChannelWatcher {
    rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkStatus>>>,
}

impl NetworkWatcher for ChannelWatcher {
    fn watch(&self) -> BoxStream<'static, NetworkStatus> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .expect("watch() called twice")
            .boxed()
    }
}

/// Everything a test needs.
struct Harness {
    runtime: TorRuntime,
    tor: Arc<FakeTor>,
    network: mpsc::UnboundedSender<NetworkStatus>,
    _dir: tempfile::TempDir,
}

/// Build a runtime wired to a fresh fake tor.
fn harness(failing_scripts: Vec<Vec<String>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let tor_path = dir.path().join("tor");
    std::fs::write(&tor_path, b"#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&tor_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let env = DaemonEnv::new(dir.path().join("work"), dir.path().join("cache")).unwrap();
    let config = TorDaemonConfig::builder()
        .tor_path(&tor_path)
        .control_listener(ControlListener::Fixed(9051))
        .trust_insecure_dirs(true)
        .network_debounce(Duration::from_millis(10))
        .terminate_timeout(Duration::from_millis(200))
        .destroy_grace(Duration::from_millis(50))
        .readiness_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let tor = FakeTor::new();
    let (network_tx, network_rx) = mpsc::unbounded();
    let caps = Capabilities {
        launcher: Arc::new(FakeLauncher {
            tor: Arc::clone(&tor),
            scripts: Mutex::new(failing_scripts.into_iter().collect()),
        }),
        connector: Arc::new(FakeConnector {
            tor: Arc::clone(&tor),
        }),
        network: Some(Arc::new(ChannelWatcher {
            rx: Mutex::new(Some(network_rx)),
        })),
        panic_handler: None,
    };
    let runtime = TorRuntime::launch_with(env, config, caps).unwrap();
    Harness {
        runtime,
        tor,
        network: network_tx,
        _dir: dir,
    }
}

/// Poll until `predicate` holds or `limit` elapses.
async fn wait_for(limit: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

#[tokio::test]
async fn start_authenticate_and_round_trip() {
    let h = harness(Vec::new());
    assert_eq!(h.runtime.status().state, DaemonState::Off);

    let start = h
        .runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap();
    assert_matches!(start.wait().await, Ok(JobOutput::Action(ActionKind::StartDaemon)));
    assert_eq!(h.runtime.status().state, DaemonState::On);

    // A command round-trips through the authenticated connection.
    let job = h
        .runtime
        .enqueue_command(Command::GetInfo(vec!["version".into()]), JobCallbacks::new())
        .unwrap();
    let output = job.wait().await.unwrap();
    let version = match output {
        JobOutput::Command(reply) => reply.into_info_value("version").unwrap(),
        other => panic!("unexpected output {:?}", other),
    };
    assert!(
        version.split('.').take(3).all(|p| p.parse::<u32>().is_ok()),
        "version {:?} is not dotted-numeric",
        version
    );

    // Torrc and torrc-defaults landed in the work directory.
    let torrc = std::fs::read_to_string(h.runtime.env().work_dir().join("torrc")).unwrap();
    assert!(torrc.contains("ControlPort 9051"));
    assert!(std::fs::metadata(h.runtime.env().work_dir().join("torrc-defaults")).is_ok());

    let stop = h
        .runtime
        .enqueue_action(ActionKind::StopDaemon, JobCallbacks::new())
        .unwrap();
    stop.wait().await.unwrap();
    assert_eq!(h.runtime.status().state, DaemonState::Off);
    h.runtime.destroy().await;
}

#[tokio::test]
async fn interrupt_semantics() {
    let h = harness(Vec::new());

    // Enqueued in rapid succession: Start, Start, Stop.
    let start1 = h
        .runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap();
    let start2 = h
        .runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap();
    let stop = h
        .runtime
        .enqueue_action(ActionKind::StopDaemon, JobCallbacks::new())
        .unwrap();

    // The first start either ran (and succeeded) before the stop arrived,
    // or was interrupted with it.  Nothing else is permitted.
    match start1.wait().await {
        Ok(JobOutput::Action(ActionKind::StartDaemon))
        | Err(Error::InterruptedByStop { .. }) => {}
        other => panic!("unexpected first-start outcome {:?}", other),
    }
    // The second start never survives the stop.
    assert_matches!(start2.wait().await, Err(Error::InterruptedByStop { .. }));
    stop.wait().await.unwrap();
    assert_eq!(h.runtime.status().state, DaemonState::Off);
    h.runtime.destroy().await;
}

#[tokio::test]
async fn network_loss_toggles_disable_network() {
    let h = harness(Vec::new());
    h.runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Once up, the runtime has enabled the network.
    assert_eq!(*h.tor.disable_network.lock().unwrap(), "0");

    h.network
        .unbounded_send(NetworkStatus::Disconnected)
        .unwrap();
    assert!(
        wait_for(Duration::from_millis(500), || {
            *h.tor.disable_network.lock().unwrap() == "1"
        })
        .await,
        "DisableNetwork did not reach 1"
    );

    h.network.unbounded_send(NetworkStatus::Connected).unwrap();
    assert!(
        wait_for(Duration::from_millis(500), || {
            *h.tor.disable_network.lock().unwrap() == "0"
        })
        .await,
        "DisableNetwork did not return to 0"
    );

    // And what tor reports over GETCONF agrees.
    let job = h
        .runtime
        .enqueue_command(
            Command::GetConf(vec!["DisableNetwork".into()]),
            JobCallbacks::new(),
        )
        .unwrap();
    match job.wait().await.unwrap() {
        JobOutput::Command(CommandReply::ConfValues(values)) => {
            assert_eq!(
                values,
                vec![("DisableNetwork".to_string(), Some("0".to_string()))]
            );
        }
        other => panic!("unexpected output {:?}", other),
    }
    h.runtime.destroy().await;
}

#[tokio::test]
async fn config_rejection_fails_startup_with_output_tail() {
    let h = harness(vec![vec![
        "[notice] Tor 0.4.8.12 opening log file.".to_string(),
        "[warn] Failed to parse/validate config: Invalid DNSPort \"-1\"".to_string(),
    ]]);

    let start = h
        .runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap();
    let err = start.wait().await.unwrap_err();
    match err {
        Error::ProcessStart(details) => {
            assert!(
                details
                    .stdout_tail
                    .iter()
                    .any(|l| l.contains("Failed to parse/validate")),
                "stdout tail missing the config complaint: {:?}",
                details.stdout_tail
            );
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.runtime.status().state, DaemonState::Off);
    h.runtime.destroy().await;
}

#[tokio::test]
async fn destroy_races_cleanly_with_an_executing_command() {
    let h = harness(Vec::new());
    h.runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap()
        .wait()
        .await
        .unwrap();

    let job = h
        .runtime
        .enqueue_command(Command::Signal(TorSignal::Newnym), JobCallbacks::new())
        .unwrap();
    let outcome = {
        let waiter = job.clone();
        let wait = tokio::spawn(async move { waiter.wait().await });
        h.runtime.destroy().await;
        wait.await.unwrap()
    };
    // Either the signal made it before teardown, or the job died with the
    // runtime.  Nothing else is permitted.
    match outcome {
        Ok(JobOutput::Command(_)) => {}
        Err(Error::Cancelled) | Err(Error::Destroyed) => {}
        Err(Error::Control(tor_daemon::tor_ctrl::Error::ConnectionLost)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn unexpected_connection_loss_triggers_one_restart() {
    let h = harness(Vec::new());
    h.runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(h.tor.connections.load(Ordering::SeqCst), 1);

    h.tor.kill_connection();

    assert!(
        wait_for(Duration::from_secs(5), || {
            h.tor.connections.load(Ordering::SeqCst) >= 2
                && h.runtime.status().state == DaemonState::On
        })
        .await,
        "runtime did not restart after losing its control connection"
    );
    h.runtime.destroy().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_status_stream_moves() {
    let h = harness(Vec::new());
    let mut events = h.runtime.status_events();

    // Stopping an already-off runtime succeeds without doing anything.
    h.runtime
        .enqueue_action(ActionKind::StopDaemon, JobCallbacks::new())
        .unwrap()
        .wait()
        .await
        .unwrap();

    h.runtime
        .enqueue_action(ActionKind::StartDaemon, JobCallbacks::new())
        .unwrap()
        .wait()
        .await
        .unwrap();

    // The status stream saw the runtime reach On.  (The stream is lossy:
    // a short-lived Starting may be skipped, so we don't insist on it.)
    let mut seen_on = false;
    while let Ok(Some(status)) =
        tokio::time::timeout(Duration::from_millis(500), events.next()).await
    {
        seen_on |= status.state == DaemonState::On;
        if seen_on {
            break;
        }
    }
    assert!(seen_on, "never observed On");
    h.runtime.destroy().await;
}
