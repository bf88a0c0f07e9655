//! The task that owns a control connection's byte stream.
//!
//! One reactor per connection: it is the only reader and the only writer.
//! Commands are strictly serialized because tor answers in send order; the
//! reactor keeps a FIFO of waiting commands, puts one on the wire at a
//! time, and routes incoming reply sets either to the in-flight command's
//! waiter or (for `6xx`) to event observers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use asynchronous_codec::Framed;
use futures::channel::{mpsc, oneshot};
use futures::stream::Fuse;
use futures::{select, AsyncRead, AsyncWrite, SinkExt as _, StreamExt as _};
use tracing::{debug, trace};

use crate::codec::{ControlCodec, Frame};
use crate::err::{Error, Result};
use crate::event::{self, ObserverSet};
use crate::msg::{Reply, ReplyLine, TorEvent};

/// Channel on which a command's reply (or failure) is delivered.
pub(crate) type ReplyChannel = oneshot::Sender<Result<Reply>>;

/// A message telling the reactor to do something.
pub(crate) enum CtrlMsg {
    /// Send `line` and deliver its reply on `tx`.
    Execute {
        /// The encoded command line, without CRLF.
        line: String,
        /// Where the reply goes.
        tx: ReplyChannel,
    },
    /// Run a handler when the connection is destroyed.
    OnClose(Box<dyn FnOnce() + Send>),
    /// Shut the connection down; `tx` fires once teardown is complete.
    Close {
        /// Completion signal.
        tx: oneshot::Sender<()>,
    },
}

/// One command that has been written to the wire and awaits its reply.
struct InFlight {
    /// The waiter.
    tx: ReplyChannel,
}

/// One command waiting for the wire to go idle.
struct PendingExec {
    /// The encoded command line.
    line: String,
    /// The waiter.
    tx: ReplyChannel,
}

/// Why the reactor loop stopped.
enum ReactorStop {
    /// Deliberate or peer-initiated clean close.
    Clean,
    /// Something went wrong; the error is reported to all waiters.
    Err(Error),
}

/// Object that drives a control connection.
///
/// This is returned by [`launch`](crate::conn::launch); you need to spawn
/// a task that calls [`run`](Reactor::run) on it.
#[must_use = "If you don't call run() on a reactor, the connection won't work."]
pub struct Reactor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// The framed stream.  Fused: we keep selecting after EOF.
    framed: Fuse<Framed<S, ControlCodec>>,
    /// Messages from [`ControlConn`](crate::conn::ControlConn) handles.
    control: mpsc::UnboundedReceiver<CtrlMsg>,
    /// Commands waiting for the wire.
    pending: VecDeque<PendingExec>,
    /// The command currently on the wire, if any.
    in_flight: Option<InFlight>,
    /// Lines of the reply set being accumulated for the in-flight command.
    partial_reply: Vec<ReplyLine>,
    /// Lines of the `6xx` reply set being accumulated.
    partial_event: Vec<ReplyLine>,
    /// The connection's observers, shared with the handles.
    observers: Arc<Mutex<ObserverSet>>,
    /// Handlers to run when the connection is destroyed.
    destroy_handlers: Vec<Box<dyn FnOnce() + Send>>,
    /// Close waiters to notify when teardown is complete.
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl<S> Reactor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Construct a reactor over `stream`.
    pub(crate) fn new(
        stream: S,
        control: mpsc::UnboundedReceiver<CtrlMsg>,
        observers: Arc<Mutex<ObserverSet>>,
    ) -> Reactor<S> {
        Reactor {
            framed: Framed::new(stream, ControlCodec::default()).fuse(),
            control,
            pending: VecDeque::new(),
            in_flight: None,
            partial_reply: Vec::new(),
            partial_event: Vec::new(),
            observers,
            destroy_handlers: Vec::new(),
            close_waiters: Vec::new(),
        }
    }

    /// Drive the connection until it closes or fails.
    ///
    /// Once this returns the connection is dead: every queued and in-flight
    /// command has been failed with `ConnectionLost` (or the underlying
    /// error), and the destroy handlers have run.
    pub async fn run(mut self) -> Result<()> {
        debug!("control reactor running");
        let result = loop {
            match self.run_once().await {
                Ok(()) => (),
                Err(ReactorStop::Clean) => break Ok(()),
                Err(ReactorStop::Err(e)) => break Err(e),
            }
        };
        match &result {
            Ok(()) => debug!("control reactor stopped"),
            Err(e) => debug!("control reactor stopped: {}", e),
        }
        self.shutdown(&result);
        result
    }

    /// Handle one unit of work.
    async fn run_once(&mut self) -> std::result::Result<(), ReactorStop> {
        // The wire is idle and a command is waiting: put it out.
        if self.in_flight.is_none() {
            if let Some(req) = self.pending.pop_front() {
                trace!("control tx: {}", first_word(&req.line));
                if let Err(e) = self.framed.send(req.line).await {
                    let _ = req.tx.send(Err(e.clone()));
                    return Err(ReactorStop::Err(e));
                }
                self.in_flight = Some(InFlight { tx: req.tx });
            }
        }

        select! {
            msg = self.control.next() => match msg {
                None => Err(ReactorStop::Clean),
                Some(CtrlMsg::Close { tx }) => {
                    self.close_waiters.push(tx);
                    Err(ReactorStop::Clean)
                }
                Some(CtrlMsg::Execute { line, tx }) => {
                    self.pending.push_back(PendingExec { line, tx });
                    Ok(())
                }
                Some(CtrlMsg::OnClose(handler)) => {
                    self.destroy_handlers.push(handler);
                    Ok(())
                }
            },
            frame = self.framed.next() => match frame {
                None => {
                    // Peer closed.  That is the normal end of a `SIGNAL
                    // SHUTDOWN`/`HALT`/`QUIT` exchange; it is only an error
                    // for commands still awaiting replies, and those are
                    // failed with `ConnectionLost` during teardown.
                    Err(ReactorStop::Clean)
                }
                Some(Err(e)) => Err(ReactorStop::Err(e)),
                Some(Ok(frame)) => self.handle_frame(frame),
            },
        }
    }

    /// Route one decoded reply line.
    fn handle_frame(&mut self, frame: Frame) -> std::result::Result<(), ReactorStop> {
        if frame.line.status.is_async() {
            let last = frame.last;
            self.partial_event.push(frame.line);
            if last {
                let reply = Reply::from_lines(std::mem::take(&mut self.partial_event));
                let event = TorEvent::from_reply(reply).map_err(ReactorStop::Err)?;
                self.dispatch_event(event);
            }
            return Ok(());
        }

        if self.in_flight.is_none() {
            return Err(ReactorStop::Err(Error::proto(format!(
                "unsolicited reply line {} {:?}",
                frame.line.status, frame.line.text
            ))));
        }
        let last = frame.last;
        self.partial_reply.push(frame.line);
        if last {
            let reply = Reply::from_lines(std::mem::take(&mut self.partial_reply));
            if let Some(in_flight) = self.in_flight.take() {
                trace!("control rx: {}", reply.status());
                // The waiter may have given up (deadline); that's fine.
                let _ = in_flight.tx.send(Ok(reply));
            }
        }
        Ok(())
    }

    /// Deliver `event` to interested observers.
    fn dispatch_event(&mut self, event: TorEvent) {
        trace!("control event: {}", event.kind);
        let (snapshot, panic_handler) = {
            let set = self.observers.lock().expect("observer lock poisoned");
            (set.snapshot_for(&event.kind), set.panic_handler())
        };
        if !snapshot.is_empty() {
            let event = Arc::new(event);
            event::dispatch(snapshot, panic_handler, &event);
        }
    }

    /// Fail the outstanding work, run destroy handlers, notify closers.
    fn shutdown(mut self, result: &Result<()>) {
        let err = match result {
            Ok(()) => Error::ConnectionLost,
            Err(e) => e.clone(),
        };
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.tx.send(Err(err.clone()));
        }
        for req in self.pending.drain(..) {
            let _ = req.tx.send(Err(err.clone()));
        }
        for handler in self.destroy_handlers.drain(..) {
            handler();
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// The first word of a command line, for logging without arguments
/// (arguments can carry credentials).
fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}
