//! Shutdown: from any state back to `Off`.
//!
//! The polite path asks tor to exit over the control connection; since we
//! hold ownership (`TAKEOWNERSHIP`), merely closing the connection would
//! do, but an explicit signal gives tor the chance to exit on its own
//! schedule.  When the connection is already dead we fall back to OS-level
//! termination, escalating to a hard kill on a bounded timeout.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tor_ctrl::{Command, ControlConn, TorSignal};

use crate::caps::ChildProc;
use crate::runtime::{DaemonState, RuntimeInner};
use crate::Result;

/// Run one `StopDaemon` action.
pub(crate) async fn stop_daemon(inner: &Arc<RuntimeInner>) -> Result<()> {
    let (conn, child) = {
        let mut live = inner.live.lock().expect("live lock poisoned");
        live.stop_requested = true;
        live.last_action_was_start = false;
        if live.state == DaemonState::Off && live.conn.is_none() && live.child.is_none() {
            // Nothing to do; stopping is idempotent.
            return Ok(());
        }
        live.state = DaemonState::Stopping;
        // This close is deliberate: retire the epoch so the connection's
        // destroy handler doesn't mistake it for a crash.
        live.conn_epoch += 1;
        (live.conn.take(), live.child.take())
    };
    inner.publish();

    bring_down(inner, conn, child, false).await;

    {
        let mut live = inner.live.lock().expect("live lock poisoned");
        live.state = DaemonState::Off;
        live.bootstrap = 0;
    }
    inner.publish();
    clear_transient_observers(inner);
    info!("[{}] tor is down", inner.env.fid());
    Ok(())
}

/// Teardown for [`TorRuntime::destroy`](crate::TorRuntime::destroy):
/// immediate, not an action.
pub(crate) async fn teardown(inner: &Arc<RuntimeInner>) {
    let (conn, child) = {
        let mut live = inner.live.lock().expect("live lock poisoned");
        live.conn_epoch += 1;
        if live.conn.is_some() || live.child.is_some() {
            live.state = DaemonState::Stopping;
        }
        (live.conn.take(), live.child.take())
    };
    inner.publish();
    bring_down(inner, conn, child, true).await;
    {
        let mut live = inner.live.lock().expect("live lock poisoned");
        live.state = DaemonState::Off;
        live.bootstrap = 0;
    }
    inner.publish();
}

/// Close the control connection and see the process out.
async fn bring_down(
    inner: &Arc<RuntimeInner>,
    conn: Option<ControlConn>,
    mut child: Option<Box<dyn ChildProc>>,
    immediate: bool,
) {
    let grace = inner.config.terminate_timeout;

    if let Some(conn) = &conn {
        let signal = if immediate {
            TorSignal::Halt
        } else {
            TorSignal::Shutdown
        };
        // Best effort: the connection may already be gone.
        let _ = conn
            .execute_with_deadline(Command::Signal(signal), grace)
            .await;
        conn.close().await;
    }

    if let Some(child) = &mut child {
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        if !exited {
            debug!("[{}] tor ignored shutdown; terminating", inner.env.fid());
            let _ = child.terminate();
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            if !exited {
                warn!("[{}] tor ignored SIGTERM; killing", inner.env.fid());
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

/// Drop every runtime observer not protected by the static tag.
fn clear_transient_observers(inner: &Arc<RuntimeInner>) {
    let static_tag = inner.config.static_tag.clone();
    let mut observers = inner.observers.lock().expect("observer lock poisoned");
    let before = observers.len();
    match &static_tag {
        Some(tag) => observers.retain(|r| r.observer.tag() == Some(tag.as_str())),
        None => observers.clear(),
    }
    if observers.len() != before {
        debug!(
            "[{}] dropped {} transient observers",
            inner.env.fid(),
            before - observers.len()
        );
    }
}
