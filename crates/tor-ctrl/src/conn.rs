//! The public handle for a control connection.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::{AsyncRead, AsyncWrite};

use crate::cmd::{Command, CommandReply};
use crate::err::{Error, Result};
use crate::event::{EventKind, Observer, ObserverId, ObserverSet, PanicHandler};
use crate::msg::Reply;
use crate::reactor::{CtrlMsg, Reactor};

/// Options for [`launch`].
#[derive(Default)]
#[allow(clippy::exhaustive_structs)]
pub struct ConnConfig {
    /// Tag that protects observers from bulk removal; see
    /// [`Observer::with_tag`].
    pub static_tag: Option<String>,
    /// Event kinds to keep enabled in every `SETEVENTS`, whether or not an
    /// observer wants them.
    pub required_events: BTreeSet<EventKind>,
    /// Where panics from observer callbacks are reported.
    pub panic_handler: Option<PanicHandler>,
}

/// Wrap `stream` as a control connection.
///
/// Returns the handle and the [`Reactor`] that drives it; the caller must
/// spawn a task running [`Reactor::run`], or nothing will happen.  The
/// connection is not authenticated yet: see
/// [`auth::authenticate`](crate::auth::authenticate).
pub fn launch<S>(stream: S, config: ConnConfig) -> (ControlConn, Reactor<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (ctrl, ctrl_rx) = mpsc::unbounded();
    let observers = Arc::new(Mutex::new(ObserverSet::new(
        config.static_tag,
        config.required_events,
        config.panic_handler,
    )));
    let reactor = Reactor::new(stream, ctrl_rx, Arc::clone(&observers));
    (ControlConn { ctrl, observers }, reactor)
}

/// A handle to a running control connection.
///
/// Handles are cheap to clone; all of them drive the same reactor.  Every
/// operation that touches the wire is serialized behind the connection's
/// single command queue, in call order.
#[derive(Clone)]
pub struct ControlConn {
    /// Channel to the reactor.
    ctrl: mpsc::UnboundedSender<CtrlMsg>,
    /// Observer registry, shared with the reactor.
    observers: Arc<Mutex<ObserverSet>>,
}

impl ControlConn {
    /// Execute `cmd` and decode its reply.
    ///
    /// Suspends until the reply is received or the connection closes.  A
    /// non-2xx reply becomes [`Error::Rejected`]; `6xx` messages are never
    /// returned here (they go to observers).
    pub async fn execute(&self, cmd: Command) -> Result<CommandReply> {
        let reply = self.execute_raw(cmd.encode()).await?;
        cmd.decode(reply.into_result()?)
    }

    /// Execute `cmd` with a deadline.
    ///
    /// On expiry the command fails with [`Error::CommandTimeout`]; it is
    /// not retried, the connection stays open, and tor's eventual reply is
    /// discarded.
    pub async fn execute_with_deadline(
        &self,
        cmd: Command,
        deadline: Duration,
    ) -> Result<CommandReply> {
        match tokio::time::timeout(deadline, self.execute(cmd)).await {
            Ok(res) => res,
            Err(_elapsed) => Err(Error::CommandTimeout),
        }
    }

    /// Send one already-encoded line and await its full reply.
    async fn execute_raw(&self, line: String) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.ctrl
            .unbounded_send(CtrlMsg::Execute { line, tx })
            .map_err(|_| Error::ConnectionLost)?;
        match rx.await {
            Ok(result) => result,
            // Reactor dropped the sender without answering.
            Err(_cancelled) => Err(Error::ConnectionLost),
        }
    }

    /// Register an observer, reconciling `SETEVENTS` with tor if the set
    /// of wanted event kinds changed.
    pub async fn subscribe(&self, observer: Observer) -> Result<ObserverId> {
        let (id, update) = {
            let mut set = self.observers.lock().expect("observer lock poisoned");
            let id = set.insert(observer);
            (id, set.take_setevents_update())
        };
        self.sync_events(update).await?;
        Ok(id)
    }

    /// Remove the observer `id`; the inverse of [`ControlConn::subscribe`].
    pub async fn unsubscribe(&self, id: ObserverId) -> Result<bool> {
        let (removed, update) = {
            let mut set = self.observers.lock().expect("observer lock poisoned");
            let removed = set.remove(id);
            (removed, set.take_setevents_update())
        };
        self.sync_events(update).await?;
        Ok(removed)
    }

    /// Remove every observer not protected by the static tag.
    pub async fn remove_transient_observers(&self) -> Result<()> {
        let update = {
            let mut set = self.observers.lock().expect("observer lock poisoned");
            set.clear_transient();
            set.take_setevents_update()
        };
        self.sync_events(update).await
    }

    /// Push `update` to tor, if there is one.
    async fn sync_events(&self, update: Option<BTreeSet<EventKind>>) -> Result<()> {
        match update {
            Some(kinds) => self.execute(Command::SetEvents(kinds)).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Issue `TAKEOWNERSHIP`: once set, tor exits when this control
    /// connection closes.
    pub async fn take_ownership(&self) -> Result<()> {
        self.execute(Command::TakeOwnership).await.map(|_| ())
    }

    /// Run `handler` when the connection is destroyed.
    ///
    /// If the connection is already gone, `handler` runs immediately.
    pub fn on_close(&self, handler: Box<dyn FnOnce() + Send>) {
        if let Err(rejected) = self.ctrl.unbounded_send(CtrlMsg::OnClose(handler)) {
            if let CtrlMsg::OnClose(handler) = rejected.into_inner() {
                handler();
            }
        }
    }

    /// Close the connection.
    ///
    /// Idempotent.  Queued and in-flight commands fail with
    /// `ConnectionLost`; destroy handlers run before this returns.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ctrl.unbounded_send(CtrlMsg::Close { tx }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.ctrl.is_closed()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::cmd::TorSignal;
    use crate::event::ImmediateExecutor;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream};
    use tokio_util::compat::TokioAsyncReadCompatExt as _;

    /// Spawn a connection over an in-memory stream, plus the peer half.
    fn connected(config: ConnConfig) -> (ControlConn, DuplexStream) {
        let (local, peer) = tokio::io::duplex(4096);
        let (conn, reactor) = launch(local.compat(), config);
        tokio::spawn(reactor.run());
        (conn, peer)
    }

    /// A scripted tor: answers each received line with canned replies.
    async fn fake_tor(peer: DuplexStream, script: Vec<(&'static str, &'static str)>) {
        let (read, mut write) = tokio::io::split(peer);
        let mut lines = BufReader::new(read).lines();
        let mut script = script.into_iter();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some((expect, reply)) = script.next() else {
                break;
            };
            assert!(
                line.starts_with(expect),
                "expected {:?}, got {:?}",
                expect,
                line
            );
            write.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn execute_round_trip() {
        let (conn, peer) = connected(ConnConfig::default());
        tokio::spawn(fake_tor(
            peer,
            vec![("GETINFO version", "250-version=0.4.8.12\r\n250 OK\r\n")],
        ));

        let out = conn
            .execute(Command::GetInfo(vec!["version".into()]))
            .await
            .unwrap();
        let version = out.into_info_value("version").unwrap();
        assert_eq!(version, "0.4.8.12");
    }

    #[tokio::test]
    async fn replies_arrive_in_send_order() {
        let (conn, peer) = connected(ConnConfig::default());
        tokio::spawn(fake_tor(
            peer,
            vec![
                ("GETINFO one", "250-one=1\r\n250 OK\r\n"),
                ("GETINFO two", "250-two=2\r\n250 OK\r\n"),
                ("GETINFO three", "250-three=3\r\n250 OK\r\n"),
            ],
        ));

        let (a, b, c) = tokio::join!(
            conn.execute(Command::GetInfo(vec!["one".into()])),
            conn.execute(Command::GetInfo(vec!["two".into()])),
            conn.execute(Command::GetInfo(vec!["three".into()])),
        );
        assert_eq!(a.unwrap().into_info_value("one").unwrap(), "1");
        assert_eq!(b.unwrap().into_info_value("two").unwrap(), "2");
        assert_eq!(c.unwrap().into_info_value("three").unwrap(), "3");
    }

    #[tokio::test]
    async fn rejection_carries_status_and_lines() {
        let (conn, peer) = connected(ConnConfig::default());
        tokio::spawn(fake_tor(
            peer,
            vec![("SIGNAL NEWNYM", "552 Unrecognized signal\r\n")],
        ));

        let err = conn
            .execute(Command::Signal(TorSignal::Newnym))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Rejected { status, ref first_line, .. }
                if status.as_u16() == 552 && first_line == "Unrecognized signal"
        );
    }

    #[tokio::test]
    async fn events_go_to_observers_not_command_waiters() {
        let (conn, peer) = connected(ConnConfig::default());
        // The event is wedged between the command's arrival and its reply.
        tokio::spawn(fake_tor(
            peer,
            vec![
                ("SETEVENTS STATUS_CLIENT", "250 OK\r\n"),
                (
                    "GETINFO version",
                    "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=90\r\n\
                     250-version=0.4.8.12\r\n250 OK\r\n",
                ),
            ],
        ));

        let (event_tx, event_rx) = std::sync::mpsc::channel();
        conn.subscribe(Observer::new(
            EventKind::StatusClient,
            Arc::new(ImmediateExecutor),
            Arc::new(move |ev| {
                event_tx.send(ev.content.clone()).unwrap();
            }),
        ))
        .await
        .unwrap();

        let out = conn
            .execute(Command::GetInfo(vec!["version".into()]))
            .await
            .unwrap();
        assert_eq!(out.into_info_value("version").unwrap(), "0.4.8.12");
        let content = event_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(content, "NOTICE BOOTSTRAP PROGRESS=90");
    }

    #[tokio::test]
    async fn close_fails_pending_and_runs_destroy_handlers() {
        // A peer that answers nothing: the command stays in flight.
        let (conn, _peer) = connected(ConnConfig::default());

        let destroyed = Arc::new(AtomicBool::new(false));
        {
            let destroyed = Arc::clone(&destroyed);
            conn.on_close(Box::new(move || {
                destroyed.store(true, Ordering::SeqCst);
            }));
        }

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.execute(Command::Signal(TorSignal::Newnym)).await })
        };
        // Give the command a moment to reach the reactor.
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.close().await;
        assert!(destroyed.load(Ordering::SeqCst));
        assert_matches!(pending.await.unwrap(), Err(Error::ConnectionLost));
        assert!(conn.is_closed());

        // And close is idempotent.
        conn.close().await;
    }

    #[tokio::test]
    async fn peer_close_fails_in_flight_commands() {
        let (conn, peer) = connected(ConnConfig::default());
        // Simulate `SIGNAL SHUTDOWN`: tor acknowledges, then hangs up.
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(peer);
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await;
            write.write_all(b"250 OK\r\n").await.unwrap();
            drop((lines, write));
        });

        conn.execute(Command::Signal(TorSignal::Shutdown))
            .await
            .unwrap();
        // The connection winds down; later commands fail cleanly.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = conn
            .execute(Command::GetInfo(vec!["version".into()]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ConnectionLost);
    }

    #[tokio::test]
    async fn deadline_leaves_the_connection_usable() {
        let (conn, peer) = connected(ConnConfig::default());
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(peer);
            let mut lines = BufReader::new(read).lines();
            // Swallow the first command, answering only after a delay that
            // outlives its deadline.
            let _ = lines.next_line().await;
            tokio::time::sleep(Duration::from_millis(80)).await;
            write.write_all(b"250 OK\r\n").await.unwrap();
            // The second command gets a prompt answer.
            let _ = lines.next_line().await;
            write
                .write_all(b"250-version=0.4.8.12\r\n250 OK\r\n")
                .await
                .unwrap();
            // Hold the stream open.
            std::future::pending::<()>().await;
        });

        let err = conn
            .execute_with_deadline(
                Command::Signal(TorSignal::Newnym),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::CommandTimeout);

        // The late reply is discarded; the next command still works.
        let out = conn
            .execute(Command::GetInfo(vec!["version".into()]))
            .await
            .unwrap();
        assert_eq!(out.into_info_value("version").unwrap(), "0.4.8.12");
    }

    #[tokio::test]
    async fn unsubscribe_reconciles_setevents() {
        let (conn, peer) = connected(ConnConfig {
            required_events: [EventKind::StatusClient].into_iter().collect(),
            ..ConnConfig::default()
        });
        tokio::spawn(fake_tor(
            peer,
            vec![
                ("SETEVENTS BW STATUS_CLIENT", "250 OK\r\n"),
                ("SETEVENTS STATUS_CLIENT", "250 OK\r\n"),
            ],
        ));

        let id = conn
            .subscribe(Observer::new(
                EventKind::Bandwidth,
                Arc::new(ImmediateExecutor),
                Arc::new(|_| ()),
            ))
            .await
            .unwrap();
        // Removing the observer drops BW, but the required kind stays.
        assert!(conn.unsubscribe(id).await.unwrap());
    }
}
