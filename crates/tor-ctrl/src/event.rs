//! Event kinds, observers, and callback dispatch.
//!
//! Observers are `(event kind, optional tag, callback, executor)` tuples.
//! The registry is guarded by a lock; dispatch iterates a snapshot taken
//! under that lock, so a callback may freely subscribe or unsubscribe.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::msg::TorEvent;

/// The kinds of asynchronous event tor can emit.
///
/// The wire keyword of each kind is its `Display` form.  Kinds we have no
/// name for arrive as [`EventKind::Unrecognized`]; tor will reject them in
/// `SETEVENTS` if they are not real, so they are only useful for events
/// newer than this crate.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(strum::Display, strum::EnumString)]
#[non_exhaustive]
pub enum EventKind {
    /// Bandwidth used in the last second.
    #[strum(serialize = "BW")]
    Bandwidth,
    /// Circuit status changed.
    #[strum(serialize = "CIRC")]
    Circ,
    /// Stream status changed.
    #[strum(serialize = "STREAM")]
    Stream,
    /// OR connection status changed.
    #[strum(serialize = "ORCONN")]
    OrConn,
    /// Log message at debug severity.
    #[strum(serialize = "DEBUG")]
    LogDebug,
    /// Log message at info severity.
    #[strum(serialize = "INFO")]
    LogInfo,
    /// Log message at notice severity.
    #[strum(serialize = "NOTICE")]
    LogNotice,
    /// Log message at warn severity.
    #[strum(serialize = "WARN")]
    LogWarn,
    /// Log message at err severity.
    #[strum(serialize = "ERR")]
    LogErr,
    /// New descriptors are available.
    #[strum(serialize = "NEWDESC")]
    NewDesc,
    /// An address mapping was created or removed.
    #[strum(serialize = "ADDRMAP")]
    AddrMap,
    /// Our descriptor changed.
    #[strum(serialize = "DESCCHANGED")]
    DescChanged,
    /// General-purpose status event.
    #[strum(serialize = "STATUS_GENERAL")]
    StatusGeneral,
    /// Client-relevant status event (bootstrap progress lives here).
    #[strum(serialize = "STATUS_CLIENT")]
    StatusClient,
    /// Server-relevant status event.
    #[strum(serialize = "STATUS_SERVER")]
    StatusServer,
    /// Guard set changed.
    #[strum(serialize = "GUARD")]
    Guard,
    /// Network status document arrived.
    #[strum(serialize = "NS")]
    NetworkStatus,
    /// Per-stream bandwidth used.
    #[strum(serialize = "STREAM_BW")]
    StreamBw,
    /// Per-country client stats (bridges only).
    #[strum(serialize = "CLIENTS_SEEN")]
    ClientsSeen,
    /// A new consensus was accepted.
    #[strum(serialize = "NEWCONSENSUS")]
    NewConsensus,
    /// Circuit build-timeout values changed.
    #[strum(serialize = "BUILDTIMEOUT_SET")]
    BuildTimeoutSet,
    /// Tor handled a signal.
    #[strum(serialize = "SIGNAL")]
    Signal,
    /// Configuration changed (SETCONF/RELOAD).
    #[strum(serialize = "CONF_CHANGED")]
    ConfChanged,
    /// Per-circuit cell statistics.  The body is not guaranteed UTF-8.
    #[strum(serialize = "CELL_STATS")]
    CellStats,
    /// Per-circuit bandwidth used.
    #[strum(serialize = "CIRC_BW")]
    CircBw,
    /// Per-connection bandwidth used.
    #[strum(serialize = "CONN_BW")]
    ConnBw,
    /// Hidden-service descriptor activity.
    #[strum(serialize = "HS_DESC")]
    HsDesc,
    /// Hidden-service descriptor content.
    #[strum(serialize = "HS_DESC_CONTENT")]
    HsDescContent,
    /// Network liveness changed.
    #[strum(serialize = "NETWORK_LIVENESS")]
    NetworkLiveness,
    /// An event kind this crate has no name for.
    #[strum(default, to_string = "{0}")]
    Unrecognized(String),
}

/// Something that can run an observer callback.
///
/// The connection never blocks on observers: dispatch hands the callback to
/// the observer's executor and moves on.  `tor-daemon` provides executors
/// for "immediately", "on the UI thread", and "on a worker pool"; tests use
/// [`ImmediateExecutor`].
pub trait EventExecutor: Send + Sync {
    /// Run `f`, now or later.
    fn execute(&self, f: Box<dyn FnOnce() + Send>);
}

/// Run callbacks synchronously on the dispatching task.
#[derive(Clone, Copy, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct ImmediateExecutor;

impl EventExecutor for ImmediateExecutor {
    fn execute(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }
}

/// Sink for panics escaping observer callbacks.
///
/// Observer callbacks must not panic; when one does anyway, the panic is
/// caught so that dispatch to the remaining observers continues, and the
/// payload lands here.
pub type PanicHandler = Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>;

/// An observer callback.
pub type EventCallback = Arc<dyn Fn(&TorEvent) + Send + Sync>;

/// Identifies one registered observer, for unsubscribing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ObserverId(u64);

/// One registered observer.
#[derive(Clone)]
pub struct Observer {
    /// The event kind this observer wants.
    kind: EventKind,
    /// An optional tag, used for bulk removal.
    tag: Option<String>,
    /// Where the callback runs.
    executor: Arc<dyn EventExecutor>,
    /// The callback itself.
    callback: EventCallback,
}

impl Observer {
    /// Construct an observer for `kind` running `callback` on `executor`.
    pub fn new(
        kind: EventKind,
        executor: Arc<dyn EventExecutor>,
        callback: EventCallback,
    ) -> Observer {
        Observer {
            kind,
            tag: None,
            executor,
            callback,
        }
    }

    /// Tag this observer.
    ///
    /// Observers whose tag equals the connection's static tag survive
    /// [`ObserverSet::clear_transient`].
    pub fn with_tag(mut self, tag: impl Into<String>) -> Observer {
        self.tag = Some(tag.into());
        self
    }

    /// The event kind this observer wants.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// The observer's tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("kind", &self.kind)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// The set of observers registered on one connection.
///
/// Mutated only under the owning `Mutex`; see
/// [`ControlConn`](crate::conn::ControlConn).
pub(crate) struct ObserverSet {
    /// The connection's static tag, if one was configured.
    static_tag: Option<String>,
    /// Event kinds the connection must keep enabled regardless of
    /// observers (internal dependencies of the caller).
    required: BTreeSet<EventKind>,
    /// Registered observers.
    observers: Vec<(ObserverId, Observer)>,
    /// Next observer id.
    next_id: u64,
    /// The event-kind set most recently pushed to tor via `SETEVENTS`.
    last_sent: Option<BTreeSet<EventKind>>,
    /// Where panics from observer callbacks go.
    panic_handler: Option<PanicHandler>,
}

impl ObserverSet {
    /// Construct an empty set.
    pub(crate) fn new(
        static_tag: Option<String>,
        required: BTreeSet<EventKind>,
        panic_handler: Option<PanicHandler>,
    ) -> ObserverSet {
        ObserverSet {
            static_tag,
            required,
            observers: Vec::new(),
            next_id: 0,
            last_sent: None,
            panic_handler,
        }
    }

    /// Add an observer; returns its id.
    pub(crate) fn insert(&mut self, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Remove the observer with `id`, if present.
    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Remove every observer whose tag is *not* the static tag.
    pub(crate) fn clear_transient(&mut self) {
        match &self.static_tag {
            Some(tag) => self
                .observers
                .retain(|(_, o)| o.tag.as_deref() == Some(tag.as_str())),
            None => self.observers.clear(),
        }
    }

    /// The full event-kind set tor should deliver: the union of what
    /// observers want and what the caller requires.
    pub(crate) fn wanted_kinds(&self) -> BTreeSet<EventKind> {
        let mut kinds = self.required.clone();
        kinds.extend(self.observers.iter().map(|(_, o)| o.kind.clone()));
        kinds
    }

    /// If the wanted set differs from what was last pushed to tor, record
    /// and return it.
    pub(crate) fn take_setevents_update(&mut self) -> Option<BTreeSet<EventKind>> {
        let wanted = self.wanted_kinds();
        if self.last_sent.as_ref() == Some(&wanted) {
            None
        } else {
            self.last_sent = Some(wanted.clone());
            Some(wanted)
        }
    }

    /// Forget what was pushed to tor (used on reconnect).
    pub(crate) fn reset_sent(&mut self) {
        self.last_sent = None;
    }

    /// Snapshot the observers interested in `kind`.
    pub(crate) fn snapshot_for(&self, kind: &EventKind) -> Vec<Observer> {
        self.observers
            .iter()
            .filter(|(_, o)| &o.kind == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// The panic handler, for dispatch.
    pub(crate) fn panic_handler(&self) -> Option<PanicHandler> {
        self.panic_handler.clone()
    }
}

/// Deliver `event` to each observer in `snapshot`, via its executor.
pub(crate) fn dispatch(
    snapshot: Vec<Observer>,
    panic_handler: Option<PanicHandler>,
    event: &Arc<TorEvent>,
) {
    for observer in snapshot {
        let event = Arc::clone(event);
        let handler = panic_handler.clone();
        let callback = Arc::clone(&observer.callback);
        observer.executor.execute(Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                match handler {
                    Some(h) => h(payload),
                    None => debug!("observer callback panicked; no panic handler installed"),
                }
            }
        }));
    }
}
