//! Capability interfaces for platform behavior.
//!
//! The runtime state machine never touches the OS directly: it spawns
//! processes through a [`ProcessLauncher`], opens control streams through a
//! [`StreamConnector`], and hears about connectivity through a
//! [`NetworkWatcher`].  A platform (or a test) supplies implementations;
//! the tokio-backed defaults here cover ordinary desktop/server use.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt as _;
use tokio::io::AsyncBufReadExt as _;
use tokio_util::compat::TokioAsyncReadCompatExt as _;
use tracing::debug;

use crate::err::{Error, Result};
use tor_ctrl::EventExecutor;

/// Where a control listener lives: a TCP address or an AF_UNIX path.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CtrlAddr {
    /// An IPv4/IPv6 address and port.
    Inet(std::net::SocketAddr),
    /// An AF_UNIX socket path.
    Unix(PathBuf),
}

impl std::fmt::Display for CtrlAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CtrlAddr::Inet(a) => write!(f, "inet:{}", a),
            CtrlAddr::Unix(p) => write!(f, "unix:{}", p.display()),
        }
    }
}

/// Both halves of a byte stream, boxable.
pub trait DuplexByteStream: futures::AsyncRead + futures::AsyncWrite + Send + Unpin {}
impl<T> DuplexByteStream for T where T: futures::AsyncRead + futures::AsyncWrite + Send + Unpin {}

/// A boxed duplex byte stream, as handed to the control connection.
pub type BoxedStream = Box<dyn DuplexByteStream>;

/// Which output stream a process line arrived on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum StdStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of child-process output.
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct OutputLine {
    /// Which stream it arrived on.
    pub stream: StdStream,
    /// The line, without its terminator.
    pub line: String,
}

/// A spawned tor process.
#[async_trait]
pub trait ChildProc: Send {
    /// The OS process id, while the process runs.
    fn pid(&self) -> Option<u32>;

    /// Take the merged stdout/stderr line stream.
    ///
    /// Yields `None` after the first call: there is one reader.
    fn take_output(&mut self) -> Option<BoxStream<'static, OutputLine>>;

    /// Report the exit code if the process has already exited.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Wait for the process to exit; returns its code, if any.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to terminate (SIGTERM where available).
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process outright.
    async fn kill(&mut self) -> io::Result<()>;
}

/// What to spawn.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SpawnTor {
    /// The tor binary.
    pub program: PathBuf,
    /// Its arguments.
    pub args: Vec<String>,
    /// Extra environment (`HOME` in particular).
    pub env: Vec<(String, String)>,
    /// Working directory for the child.
    pub cwd: PathBuf,
}

/// Spawns child processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `spec` with piped output.
    async fn spawn(&self, spec: SpawnTor) -> io::Result<Box<dyn ChildProc>>;
}

/// Opens byte streams to control listeners.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect to `addr`.
    async fn connect(&self, addr: &CtrlAddr) -> Result<BoxedStream>;
}

/// Host connectivity, as reported by the platform.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum NetworkStatus {
    /// The host believes it has a usable network.
    Connected,
    /// The host believes it is offline.
    Disconnected,
}

/// Reports connectivity changes.
pub trait NetworkWatcher: Send + Sync {
    /// A stream of connectivity transitions.  The first item may describe
    /// the current state.
    fn watch(&self) -> BoxStream<'static, NetworkStatus>;
}

/// The bundle of capabilities a runtime needs.
#[derive(Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct Capabilities {
    /// How to spawn tor.
    pub launcher: Arc<dyn ProcessLauncher>,
    /// How to reach its control listener.
    pub connector: Arc<dyn StreamConnector>,
    /// Connectivity reports, if the platform has them.
    pub network: Option<Arc<dyn NetworkWatcher>>,
    /// Where panics escaping observer callbacks are reported.
    pub panic_handler: Option<tor_ctrl::PanicHandler>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            launcher: Arc::new(TokioLauncher),
            connector: Arc::new(TokioConnector),
            network: None,
            panic_handler: None,
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("network", &self.network.is_some())
            .finish_non_exhaustive()
    }
}

/// The default launcher: `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct TokioLauncher;

/// Turn an async reader into a stream of tagged lines.
fn lines_stream<R>(reader: R, stream: StdStream) -> BoxStream<'static, OutputLine>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let lines = tokio::io::BufReader::new(reader).lines();
    futures::stream::unfold(lines, move |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((OutputLine { stream, line }, lines)),
            _ => None,
        }
    })
    .boxed()
}

/// A child spawned by [`TokioLauncher`].
struct TokioChild {
    /// The underlying process handle.
    child: tokio::process::Child,
    /// The merged output stream, until taken.
    output: Option<BoxStream<'static, OutputLine>>,
}

#[async_trait]
impl ChildProc for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<BoxStream<'static, OutputLine>> {
        self.output.take()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.and_then(|s| s.code()))
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: sending a signal to a pid we own.
                let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                return Ok(());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            // No polite signal to send; fall back to a hard kill.
            self.child.start_kill()
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, spec: SpawnTor) -> io::Result<Box<dyn ChildProc>> {
        use std::process::Stdio;
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn()?;
        debug!("spawned {} (pid {:?})", spec.program.display(), child.id());

        let stdout = child
            .stdout
            .take()
            .map(|r| lines_stream(r, StdStream::Stdout));
        let stderr = child
            .stderr
            .take()
            .map(|r| lines_stream(r, StdStream::Stderr));
        let output = match (stdout, stderr) {
            (Some(o), Some(e)) => Some(futures::stream::select(o, e).boxed()),
            (Some(o), None) => Some(o),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        Ok(Box::new(TokioChild { child, output }))
    }
}

/// The default connector: `tokio::net`.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct TokioConnector;

#[async_trait]
impl StreamConnector for TokioConnector {
    async fn connect(&self, addr: &CtrlAddr) -> Result<BoxedStream> {
        match addr {
            CtrlAddr::Inet(sa) => {
                let stream = tokio::net::TcpStream::connect(sa)
                    .await
                    .map_err(|e| Error::io(format!("connecting to {}", addr), e))?;
                Ok(Box::new(stream.compat()))
            }
            #[cfg(unix)]
            CtrlAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::io(format!("connecting to {}", addr), e))?;
                Ok(Box::new(stream.compat()))
            }
            #[cfg(not(unix))]
            CtrlAddr::Unix(_) => Err(Error::Unsupported("AF_UNIX control listeners")),
        }
    }
}

/// Run observer callbacks on tokio's blocking-work pool.
#[derive(Clone, Debug)]
pub struct BackgroundExecutor {
    /// Handle to the runtime whose pool we use.
    handle: tokio::runtime::Handle,
}

impl BackgroundExecutor {
    /// Use the current tokio runtime's pool.
    ///
    /// Returns `None` when called outside a runtime.
    pub fn current() -> Option<BackgroundExecutor> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| BackgroundExecutor { handle })
    }
}

impl EventExecutor for BackgroundExecutor {
    fn execute(&self, f: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(f);
    }
}

/// Run observer callbacks on a consumer-designated "main" dispatcher.
///
/// When no dispatcher has been supplied this is equivalent to running
/// immediately on the dispatching task.
#[derive(Clone)]
pub struct MainExecutor {
    /// The dispatcher, if one was installed.
    dispatch: Option<Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>>,
}

impl MainExecutor {
    /// Use `dispatch` to reach the main thread.
    pub fn new(dispatch: Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>) -> MainExecutor {
        MainExecutor {
            dispatch: Some(dispatch),
        }
    }

    /// No main thread available: run callbacks immediately.
    pub fn unavailable() -> MainExecutor {
        MainExecutor { dispatch: None }
    }
}

impl EventExecutor for MainExecutor {
    fn execute(&self, f: Box<dyn FnOnce() + Send>) {
        match &self.dispatch {
            Some(d) => d(f),
            None => f(),
        }
    }
}

impl std::fmt::Debug for MainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainExecutor")
            .field("available", &self.dispatch.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn addr_display() {
        let inet = CtrlAddr::Inet("127.0.0.1:9051".parse().unwrap());
        assert_eq!(inet.to_string(), "inet:127.0.0.1:9051");
        let unix = CtrlAddr::Unix(PathBuf::from("/run/tor/ctrl.sock"));
        assert_eq!(unix.to_string(), "unix:/run/tor/ctrl.sock");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launcher_pipes_output() {
        let mut child = TokioLauncher
            .spawn(SpawnTor {
                program: "/bin/sh".into(),
                args: vec!["-c".into(), "echo one; echo two 1>&2".into()],
                env: Vec::new(),
                cwd: std::env::temp_dir(),
            })
            .await
            .unwrap();
        let output = child.take_output().unwrap();
        assert!(child.take_output().is_none());

        let mut lines: Vec<_> = output.collect().await;
        lines.sort_by(|a, b| a.line.cmp(&b.line));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, "one");
        assert_eq!(lines[0].stream, StdStream::Stdout);
        assert_eq!(lines[1].line, "two");
        assert_eq!(lines[1].stream, StdStream::Stderr);

        assert_eq!(child.wait().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn background_executor_runs_closures() {
        let (tx, rx) = std::sync::mpsc::channel();
        let exec = BackgroundExecutor::current().unwrap();
        exec.execute(Box::new(move || {
            tx.send(42_u8).unwrap();
        }));
        let got = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(got, 42);
    }
}
