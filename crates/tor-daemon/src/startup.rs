//! Startup: from `Off` to an authenticated, owned control connection.
//!
//! The sequence is deliberately strict.  Configuration is validated and
//! written before the process exists; the process must prove itself by
//! opening its control listener within a bounded amount of output; and the
//! runtime only reports `On` once the control connection is authenticated,
//! owns the daemon, and has the event subscriptions it needs.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt as _;
use tracing::{debug, info, trace, warn};

use tor_ctrl::auth;
use tor_ctrl::{
    Command, ConfSetting, ConnConfig, ControlConn, EventKind, ImmediateExecutor, Observer,
};
use tor_torrc::{Argument, PortValue, TorOption, Torrc, TorrcBuilder};

use crate::caps::{ChildProc, CtrlAddr, OutputLine, SpawnTor, StdStream};
use crate::config::{ControlListener, TorDaemonConfig};
use crate::env::DaemonEnv;
use crate::err::{Error, ProcessStartError, Result};
use crate::runtime::{DaemonState, NetworkState, RuntimeInner};

/// How many tail lines of process output we keep for error reports.
const TAIL_LINES: usize = 30;

/// The stdout notice that tells us the control listener is up.
const READINESS_MARKER: &str = "Opened Control listener";

/// Run one `StartDaemon` action.
pub(crate) async fn start_daemon(inner: &Arc<RuntimeInner>) -> Result<()> {
    {
        let mut live = inner.live.lock().expect("live lock poisoned");
        if live.destroyed {
            return Err(Error::Destroyed);
        }
        if live.state == DaemonState::On {
            // Already running; starting is idempotent.
            return Ok(());
        }
        if live.start_failures > inner.config.max_start_failures {
            return Err(Error::TooManyFailures {
                failures: live.start_failures,
            });
        }
        live.state = DaemonState::Starting;
        live.stop_requested = false;
        live.last_action_was_start = true;
        live.bootstrap = 0;
    }
    inner.publish();

    match try_start(inner).await {
        Ok(()) => {
            {
                let mut live = inner.live.lock().expect("live lock poisoned");
                live.state = DaemonState::On;
                live.start_failures = 0;
            }
            inner.publish();
            info!("[{}] tor is up", inner.env.fid());
            Ok(())
        }
        Err(e) => {
            let failures = {
                let mut live = inner.live.lock().expect("live lock poisoned");
                live.state = DaemonState::Off;
                live.conn = None;
                live.child = None;
                live.start_failures += 1;
                live.start_failures
            };
            inner.publish();
            warn!(
                "[{}] startup failed ({} consecutive): {}",
                inner.env.fid(),
                failures,
                e
            );
            Err(e)
        }
    }
}

/// The fallible body of a start.
async fn try_start(inner: &Arc<RuntimeInner>) -> Result<()> {
    let env = &inner.env;
    let config = &inner.config;

    prepare_directories(env, config)?;
    check_binary(&config.tor_path)?;

    let torrc = build_torrc(env, config)?;
    write_config_files(env, &torrc)?;

    let mut child = spawn_tor(inner).await?;
    match bring_up(inner, &mut child).await {
        Ok(conn) => {
            let epoch = {
                let mut live = inner.live.lock().expect("live lock poisoned");
                if live.destroyed {
                    // The runtime was destroyed under us; don't resurrect.
                    None
                } else {
                    live.conn = Some(conn.clone());
                    live.child = Some(child);
                    Some(live.conn_epoch)
                }
            };
            let Some(epoch) = epoch else {
                conn.close().await;
                return Err(Error::Destroyed);
            };
            let weak = Arc::downgrade(inner);
            conn.on_close(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.note_conn_closed(epoch);
                }
            }));
            Ok(())
        }
        Err(e) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(e)
        }
    }
}

/// From a freshly spawned child to an authenticated connection.
async fn bring_up(
    inner: &Arc<RuntimeInner>,
    child: &mut Box<dyn ChildProc>,
) -> Result<ControlConn> {
    let env = &inner.env;
    let config = &inner.config;

    let output = child
        .take_output()
        .ok_or_else(|| Error::Unsupported("process launcher provides no output stream"))?;
    let output = await_readiness(inner, child, output).await?;
    // Keep draining: tor reports bootstrap progress on stdout too, and an
    // undrained pipe would eventually block it.
    tokio::spawn(drain_output(Arc::downgrade(inner), output));

    let epoch = {
        let mut live = inner.live.lock().expect("live lock poisoned");
        live.conn_epoch += 1;
        live.conn_epoch
    };

    let addr = control_address(env, config).await?;
    debug!("[{}] control listener at {}", env.fid(), addr);
    let stream = inner.caps.connector.connect(&addr).await?;
    let (conn, reactor) = tor_ctrl::launch(
        stream,
        ConnConfig {
            static_tag: config.static_tag.clone(),
            required_events: required_events(),
            panic_handler: inner.caps.panic_handler.clone(),
        },
    );
    tokio::spawn(reactor.run());

    auth::authenticate(&conn, config.control_password.as_deref()).await?;
    // With ownership set, tor exits when this connection closes; together
    // with --OwningControllerProcess on the argv, the daemon cannot
    // outlive us.
    conn.take_ownership().await?;

    subscribe_bootstrap(inner, &conn).await?;
    replay_observers(inner, &conn, epoch).await?;

    let network = {
        let live = inner.live.lock().expect("live lock poisoned");
        live.network
    };
    if network == NetworkState::Enabled {
        conn.execute(Command::SetConf(vec![ConfSetting::set("DisableNetwork", "0")]))
            .await?;
    }
    Ok(conn)
}

/// The event kinds the runtime itself depends on, always included in
/// `SETEVENTS`.
fn required_events() -> BTreeSet<EventKind> {
    [EventKind::StatusClient].into_iter().collect()
}

/// Watch tor's bootstrap progress through `STATUS_CLIENT` events.
async fn subscribe_bootstrap(inner: &Arc<RuntimeInner>, conn: &ControlConn) -> Result<()> {
    let weak = Arc::downgrade(inner);
    let observer = Observer::new(
        EventKind::StatusClient,
        Arc::new(ImmediateExecutor),
        Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                if let Some(percent) = parse_bootstrap_event(&event.content) {
                    inner.set_bootstrap(percent);
                }
            }
        }),
    );
    conn.subscribe(observer).await?;
    Ok(())
}

/// Re-register every consumer observer on a new connection.
async fn replay_observers(inner: &Arc<RuntimeInner>, conn: &ControlConn, epoch: u64) -> Result<()> {
    let wanted: Vec<(u64, Observer)> = {
        let observers = inner.observers.lock().expect("observer lock poisoned");
        observers
            .iter()
            .map(|r| (r.id, r.observer.clone()))
            .collect()
    };
    for (id, observer) in wanted {
        let conn_id = conn.subscribe(observer).await?;
        let mut observers = inner.observers.lock().expect("observer lock poisoned");
        if let Some(entry) = observers.iter_mut().find(|r| r.id == id) {
            entry.conn_id = Some((epoch, conn_id));
        }
    }
    Ok(())
}

/// Create the on-disk layout.
fn prepare_directories(env: &DaemonEnv, config: &TorDaemonConfig) -> Result<()> {
    let mistrust = if config.trust_insecure_dirs {
        fs_mistrust::Mistrust::new_dangerously_trust_everyone()
    } else {
        fs_mistrust::Mistrust::new()
    };
    mistrust.make_directory(env.work_dir())?;
    mistrust.make_directory(env.cache_dir())?;
    // Tor insists on private directories for its data and keys.
    mistrust.verifier().make_secure_dir(env.data_dir())?;
    mistrust.verifier().make_secure_dir(env.auth_clients_dir())?;
    mistrust.verifier().make_secure_dir(env.hs_dir())?;
    for service in &config.hidden_services {
        mistrust.verifier().make_secure_dir(service.dir())?;
    }
    Ok(())
}

/// Reject a missing or non-executable tor binary.
fn check_binary(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::io(format!("inspecting tor binary {}", path.display()), e))?;
    if !metadata.is_file() {
        return Err(ProcessStartError {
            exit_code: None,
            stdout_tail: Vec::new(),
            stderr_tail: Vec::new(),
            cause: format!("{} is not a regular file", path.display()),
        }
        .into());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ProcessStartError {
                exit_code: None,
                stdout_tail: Vec::new(),
                stderr_tail: Vec::new(),
                cause: format!("{} is not executable", path.display()),
            }
            .into());
        }
    }
    Ok(())
}

/// Build the effective tor configuration.
fn build_torrc(env: &DaemonEnv, config: &TorDaemonConfig) -> Result<Torrc> {
    let mut builder = TorrcBuilder::new();
    builder
        .put(TorOption::DATA_DIRECTORY, Argument::path(env.data_dir())?)?
        .put(TorOption::CACHE_DIRECTORY, Argument::path(env.cache_dir())?)?
        .put(TorOption::SOCKS_PORT, config.socks_port)?
        .put(TorOption::COOKIE_AUTHENTICATION, true)?
        .put(
            TorOption::COOKIE_AUTH_FILE,
            Argument::path(env.work_dir().join("control_auth_cookie"))?,
        )?
        // The network stays off until the runtime is fully up (and the
        // platform says we are online).
        .put(TorOption::DISABLE_NETWORK, true)?
        .put(
            TorOption::CLIENT_ONION_AUTH_DIR,
            Argument::path(env.auth_clients_dir())?,
        )?;
    match &config.control_listener {
        ControlListener::Auto => {
            builder.put(TorOption::CONTROL_PORT, PortValue::Auto)?.put(
                TorOption::CONTROL_PORT_WRITE_TO_FILE,
                Argument::path(env.control_port_file())?,
            )?;
        }
        ControlListener::Fixed(port) => {
            builder.put(TorOption::CONTROL_PORT, PortValue::Fixed(*port))?;
        }
        ControlListener::Unix(addr) => {
            if cfg!(not(unix)) {
                return Err(Error::Unsupported("AF_UNIX control listeners"));
            }
            builder.put(TorOption::CONTROL_PORT, addr.clone())?;
        }
    }
    for service in &config.hidden_services {
        builder.put_service(service.clone())?;
    }
    for (key, value) in &config.extra_settings {
        builder.put(TorOption::other(key), Argument::string(value)?)?;
    }
    let mut torrc = builder.build()?;
    let moved = torrc.reassign_unavailable_ports(&config.reassignable_ports, port_unavailable);
    for (option, port) in &moved {
        debug!("{} {} is taken; falling back to auto", option, port);
    }
    Ok(torrc)
}

/// Probe whether a TCP port is already taken on localhost.
fn port_unavailable(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Baseline settings that the effective torrc may override.
fn build_defaults() -> Result<Torrc> {
    let mut builder = TorrcBuilder::new();
    builder
        .put(TorOption::RUN_AS_DAEMON, false)?
        .put(TorOption::DORMANT_CANCELED_BY_STARTUP, true)?;
    Ok(builder.build()?)
}

/// Write `torrc` and `torrc-defaults` into the work directory.
fn write_config_files(env: &DaemonEnv, torrc: &Torrc) -> Result<()> {
    let defaults = build_defaults()?;
    std::fs::write(env.torrc_defaults_path(), defaults.render())
        .map_err(|e| Error::io("writing torrc-defaults", e))?;
    std::fs::write(env.torrc_path(), torrc.render())
        .map_err(|e| Error::io("writing torrc", e))?;
    Ok(())
}

/// Spawn the tor process.
async fn spawn_tor(inner: &Arc<RuntimeInner>) -> Result<Box<dyn ChildProc>> {
    let env = &inner.env;
    let args = vec![
        "--defaults-torrc".to_string(),
        env.torrc_defaults_path().display().to_string(),
        "-f".to_string(),
        env.torrc_path().display().to_string(),
        "--OwningControllerProcess".to_string(),
        std::process::id().to_string(),
    ];
    let spec = SpawnTor {
        program: inner.config.tor_path.clone(),
        args,
        env: vec![(
            "HOME".to_string(),
            env.work_dir().display().to_string(),
        )],
        cwd: env.work_dir().to_owned(),
    };
    inner
        .caps
        .launcher
        .spawn(spec)
        .await
        .map_err(|e| Error::io("spawning tor", e))
}

/// Scan tor's output until it opens its control listener.
///
/// Gives up when the line budget or the wall-clock limit is exhausted,
/// when tor reports a configuration failure, or when the process dies.
/// On success, returns the output stream for continued draining.
async fn await_readiness(
    inner: &Arc<RuntimeInner>,
    child: &mut Box<dyn ChildProc>,
    mut output: BoxStream<'static, OutputLine>,
) -> Result<BoxStream<'static, OutputLine>> {
    let config = &inner.config;
    let mut stdout_tail = VecDeque::with_capacity(TAIL_LINES);
    let mut stderr_tail = VecDeque::with_capacity(TAIL_LINES);
    let mut seen = 0_usize;
    let deadline = tokio::time::Instant::now() + config.readiness_timeout;

    loop {
        let line = match tokio::time::timeout_at(deadline, output.next()).await {
            Err(_elapsed) => {
                return Err(start_error(
                    child,
                    stdout_tail,
                    stderr_tail,
                    format!(
                        "no readiness within {:?}",
                        config.readiness_timeout
                    ),
                ));
            }
            Ok(None) => {
                return Err(start_error(
                    child,
                    stdout_tail,
                    stderr_tail,
                    "tor exited before opening its control listener".to_string(),
                ));
            }
            Ok(Some(line)) => line,
        };

        trace!("tor says: {}", line.line);
        let tail = match line.stream {
            StdStream::Stdout => &mut stdout_tail,
            StdStream::Stderr => &mut stderr_tail,
        };
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.line.clone());

        if let Some(percent) = parse_bootstrap_stdout(&line.line) {
            inner.set_bootstrap(percent);
        }
        if line.line.contains(READINESS_MARKER) {
            return Ok(output);
        }
        if is_config_failure(&line.line) {
            return Err(start_error(
                child,
                stdout_tail,
                stderr_tail,
                format!("tor rejected its configuration: {}", line.line),
            ));
        }
        seen += 1;
        if seen >= config.startup_line_budget {
            return Err(start_error(
                child,
                stdout_tail,
                stderr_tail,
                format!(
                    "no readiness within {} lines of output",
                    config.startup_line_budget
                ),
            ));
        }
    }
}

/// Lines that mean tor gave up on its configuration.
fn is_config_failure(line: &str) -> bool {
    (line.contains("[err]") && line.contains("Reading config failed"))
        || line.contains("[warn] Failed to parse/validate")
}

/// Assemble a [`ProcessStartError`] from the collected evidence.
fn start_error(
    child: &mut Box<dyn ChildProc>,
    stdout_tail: VecDeque<String>,
    stderr_tail: VecDeque<String>,
    cause: String,
) -> Error {
    let exit_code = child.try_wait().ok().flatten();
    ProcessStartError {
        exit_code,
        stdout_tail: stdout_tail.into_iter().collect(),
        stderr_tail: stderr_tail.into_iter().collect(),
        cause,
    }
    .into()
}

/// Keep consuming process output after readiness, feeding bootstrap
/// progress back into the runtime.
async fn drain_output(
    inner: std::sync::Weak<RuntimeInner>,
    mut output: BoxStream<'static, OutputLine>,
) {
    while let Some(line) = output.next().await {
        trace!("tor says: {}", line.line);
        if let Some(percent) = parse_bootstrap_stdout(&line.line) {
            match inner.upgrade() {
                Some(inner) => inner.set_bootstrap(percent),
                None => break,
            }
        }
    }
}

/// Extract `N` from a stdout `... Bootstrapped N% ...` notice.
fn parse_bootstrap_stdout(line: &str) -> Option<u8> {
    let rest = &line[line.find("Bootstrapped ")? + "Bootstrapped ".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if !rest[digits.len()..].starts_with('%') {
        return None;
    }
    digits.parse().ok()
}

/// Extract `N` from a `STATUS_CLIENT ... BOOTSTRAP PROGRESS=N ...` event.
fn parse_bootstrap_event(content: &str) -> Option<u8> {
    if !content.contains("BOOTSTRAP") {
        return None;
    }
    let rest = &content[content.find("PROGRESS=")? + "PROGRESS=".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Work out where the control listener is.
async fn control_address(env: &DaemonEnv, config: &TorDaemonConfig) -> Result<CtrlAddr> {
    match &config.control_listener {
        ControlListener::Fixed(port) => Ok(CtrlAddr::Inet(std::net::SocketAddr::from((
            [127, 0, 0, 1],
            *port,
        )))),
        ControlListener::Unix(addr) => Ok(CtrlAddr::Unix(addr.path().to_owned())),
        ControlListener::Auto => read_control_port_file(&env.control_port_file()).await,
    }
}

/// Poll the control-port file tor writes for `ControlPort auto`.
///
/// The file appears asynchronously, shortly after the readiness notice.
async fn read_control_port_file(path: &Path) -> Result<CtrlAddr> {
    /// How often we look.
    const POLL: std::time::Duration = std::time::Duration::from_millis(100);
    /// How many times we look before giving up.
    const ATTEMPTS: usize = 50;

    for _ in 0..ATTEMPTS {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Some(addr) = parse_control_port_file(&content) {
                return Ok(addr);
            }
        }
        tokio::time::sleep(POLL).await;
    }
    Err(Error::io(
        format!("waiting for control-port file {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::TimedOut, "file never appeared"),
    ))
}

/// Parse `PORT=host:port` / `UNIX_SOCKET=path` lines.
fn parse_control_port_file(content: &str) -> Option<CtrlAddr> {
    for line in content.lines() {
        if let Some(addr) = line.trim().strip_prefix("PORT=") {
            if let Ok(sa) = addr.parse() {
                return Some(CtrlAddr::Inet(sa));
            }
        }
        if let Some(path) = line.trim().strip_prefix("UNIX_SOCKET=") {
            return Some(CtrlAddr::Unix(Path::new(path).to_owned()));
        }
    }
    None
}
