//! Transport layer for a control-port connection.
//!
//! A [`ControlConn`] owns the socket and multiplexes it between
//! synchronous request/response exchanges (which any thread may perform)
//! and the stream of asynchronous `650` events.  Two worker threads exist
//! while a connection is alive:
//!
//! * The *reader* decodes replies off the socket.  Events go to the event
//!   queue; everything else (including decode errors) goes to the reply
//!   slot where a pending [`request`](ControlConn::request) is waiting.
//!   Depositing errors there is what unblocks callers on disconnect.
//! * The *event dispatcher* drains the event queue into the installed
//!   event handler, off the reader's critical path, so that a slow
//!   handler cannot back-pressure the wire framing.
//!
//! NOTE that the fields of the shared state have documented lock
//! invariants; except where noted, they only hold when nobody holds the
//! named lock.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, trace, warn};

use crate::llconn;
use crate::msgs::reply::Reply;
use crate::{Error, Result};

/// The connection states a control connection moves through.
///
/// A connection starts in `Init` when it is established, may observe any
/// number of `Reset`s (tor reloaded its configuration), and ends in
/// `Closed`.  Status listeners receive these; they must be prepared for
/// new states to appear here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum ConnState {
    /// A new connection to tor has been established.
    #[display("INIT")]
    Init,
    /// Tor has reloaded its configuration (it received the equivalent of a
    /// SIGHUP).
    #[display("RESET")]
    Reset,
    /// The connection to tor has been torn down.
    #[display("CLOSED")]
    Closed,
}

/// Where to find the control port of the tor process we want to talk to.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ConnTarget {
    /// Connect over TCP, per tor's `ControlPort` option.
    Port(SocketAddr),
    /// Connect over an `AF_UNIX` stream socket, per tor's `ControlSocket`
    /// option.
    #[cfg(unix)]
    SocketFile(PathBuf),
}

impl ConnTarget {
    /// Return the conventional TCP target, `127.0.0.1:9051`.
    pub fn default_port() -> Self {
        ConnTarget::Port(
            "127.0.0.1:9051"
                .parse()
                .expect("default address unparseable"),
        )
    }

    /// Return the conventional socket-file target,
    /// `/var/run/tor/control`.
    #[cfg(unix)]
    pub fn default_socket_file() -> Self {
        ConnTarget::SocketFile("/var/run/tor/control".into())
    }

    /// Open a new stream to this target.
    fn make_stream(&self) -> io::Result<ControlStream> {
        match self {
            ConnTarget::Port(addr) => TcpStream::connect(addr).map(ControlStream::Tcp),
            #[cfg(unix)]
            ConnTarget::SocketFile(path) => UnixStream::connect(path).map(ControlStream::Unix),
        }
    }
}

/// A connected stream of either supported flavor.
enum ControlStream {
    /// A TCP connection.
    Tcp(TcpStream),
    /// An `AF_UNIX` connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ControlStream {
    /// Return a new handle to the same underlying socket.
    fn try_clone(&self) -> io::Result<ControlStream> {
        match self {
            ControlStream::Tcp(s) => s.try_clone().map(ControlStream::Tcp),
            #[cfg(unix)]
            ControlStream::Unix(s) => s.try_clone().map(ControlStream::Unix),
        }
    }

    /// Shut down both directions of the socket.
    ///
    /// This is what unblocks a reader parked in a blocking `read`.
    fn shutdown(&self) -> io::Result<()> {
        match self {
            ControlStream::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            #[cfg(unix)]
            ControlStream::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        }
    }
}

impl io::Read for ControlStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ControlStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            ControlStream::Unix(s) => s.read(buf),
        }
    }
}

impl io::Write for ControlStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ControlStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            ControlStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ControlStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            ControlStream::Unix(s) => s.flush(),
        }
    }
}

/// The signature of a status listener callback.
///
/// The second argument is the unix time, in seconds, at which the change
/// was observed.
pub type StatusCallback = dyn Fn(ConnState, u64) + Send + Sync;

/// The signature of the asynchronous-event hook.
pub type EventHandler = dyn Fn(Reply) + Send + Sync;

/// A registered status listener, which doubles as the token for removing
/// it again.
///
/// Each listener chooses its delivery mode at registration time: spawned
/// listeners get a fresh thread per notification, in-band listeners run
/// in the context of whatever thread observed the change, under the
/// listener-list lock.
#[derive(Clone, educe::Educe)]
#[educe(Debug)]
pub struct ListenerHandle {
    /// The callback to invoke.
    #[educe(Debug(ignore))]
    callback: Arc<StatusCallback>,
    /// Whether to notify this listener on a newly spawned thread.
    spawn: bool,
}

/// A queue of items paired with a condition variable announcing arrivals.
struct WaitQueue<T> {
    /// The queued items, oldest first.
    queue: Mutex<VecDeque<T>>,
    /// Signaled whenever an item arrives or the connection state changes.
    ready: Condvar,
}

impl<T> WaitQueue<T> {
    /// Construct a new, empty queue.
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append `item` and wake every waiter.
    fn push(&self, item: T) {
        let mut queue = self.queue.lock().expect("poisoned lock");
        queue.push_back(item);
        self.ready.notify_all();
    }

    /// Remove and return the oldest item, if there is one.
    fn try_pop(&self) -> Option<T> {
        self.queue.lock().expect("poisoned lock").pop_front()
    }

    /// Remove and return the oldest item, waiting for one to arrive while
    /// `keep_waiting` stays true.  Returns `None` once the queue is empty
    /// and `keep_waiting` reports false.
    fn pop_or_wait<F>(&self, keep_waiting: F) -> Option<T>
    where
        F: Fn() -> bool,
    {
        let mut queue = self.queue.lock().expect("poisoned lock");
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if !keep_waiting() {
                return None;
            }
            queue = self.ready.wait(queue).expect("poisoned lock");
        }
    }

    /// Wake every waiter so it can re-check its exit condition.
    ///
    /// Takes the queue lock first: a state change published right before
    /// this call is then guaranteed visible to every waiter that was
    /// between its check and its wait.
    fn wake_all(&self) {
        let _queue = self.queue.lock().expect("poisoned lock");
        self.ready.notify_all();
    }
}

/// State guarded by the send lock.
///
/// Invariant: these fields change only while the send lock is held; in
/// particular `ControlConn::is_alive` can only change under it.
struct SendState {
    /// The writer for the current connection, if one is open.
    writer: Option<llconn::Writer>,
    /// A handle to the current socket, kept so that `close` can shut it
    /// down and thereby unblock the reader.
    stream: Option<ControlStream>,
    /// The reader worker for the current connection.
    reader_thread: Option<JoinHandle<()>>,
    /// The event-dispatcher worker for the current connection.
    event_thread: Option<JoinHandle<()>>,
}

/// The state shared between a [`ControlConn`]'s handles and its workers.
struct Inner {
    /// Where we (re)connect to.
    target: ConnTarget,
    /// The send lock; see [`SendState`].
    send: Mutex<SendState>,
    /// True from a successful `connect()` until the connection is torn
    /// down for any reason.
    alive: AtomicBool,
    /// Bumped on every connect and teardown.  A worker thread belongs to
    /// exactly one connection cycle; comparing its generation against this
    /// keeps a stale worker from tearing down its successor.
    generation: AtomicU64,
    /// Replies (and reader-side errors) awaiting a `request`/`receive`
    /// caller.
    replies: WaitQueue<Result<Reply>>,
    /// Decoded events awaiting dispatch.
    events: WaitQueue<Reply>,
    /// The registered status listeners.
    listeners: Mutex<Vec<ListenerHandle>>,
    /// The installed event handler, if any.
    handler: Mutex<Option<Arc<EventHandler>>>,
    /// Serializes `request` calls: send-plus-await-reply is one critical
    /// section.
    request_lock: Mutex<()>,
}

/// A connection to the control port of a tor process.
///
/// Cloning a `ControlConn` yields another handle to the same connection.
/// All methods are thread safe; concurrent [`request`](ControlConn::request)
/// calls are serialized and each receives the reply to its own command.
///
/// Closing is idempotent, may be performed from any thread (including
/// from a status listener or the event handler), and unblocks every
/// pending request with [`Error::SocketClosed`].
#[derive(Clone)]
pub struct ControlConn {
    /// The shared connection state.
    inner: Arc<Inner>,
}

/// A weak handle to a [`ControlConn`].
///
/// The event hook the session installs needs a way back to the connection
/// (to issue `Reset` notifications), but the connection owns the hook;
/// holding a strong handle there would keep the shared state alive
/// forever.
pub(crate) struct WeakControlConn {
    /// The weakly held shared state.
    inner: Weak<Inner>,
}

impl WeakControlConn {
    /// Return a usable handle, unless the connection is already gone.
    pub(crate) fn upgrade(&self) -> Option<ControlConn> {
        self.inner.upgrade().map(|inner| ControlConn { inner })
    }
}

impl fmt::Debug for ControlConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConn")
            .field("target", &self.inner.target)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl ControlConn {
    /// Construct a new, unconnected `ControlConn` for `target`.
    ///
    /// Call [`connect`](ControlConn::connect) to open it.
    pub fn new(target: ConnTarget) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                send: Mutex::new(SendState {
                    writer: None,
                    stream: None,
                    reader_thread: None,
                    event_thread: None,
                }),
                alive: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                replies: WaitQueue::new(),
                events: WaitQueue::new(),
                listeners: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                request_lock: Mutex::new(()),
            }),
        }
    }

    /// Return the target this connection (re)connects to.
    pub fn target(&self) -> &ConnTarget {
        &self.inner.target
    }

    /// Return a weak handle to this connection.
    pub(crate) fn downgrade(&self) -> WeakControlConn {
        WeakControlConn {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Return true if this connection is open.
    ///
    /// This becomes true only via [`connect`](ControlConn::connect), and
    /// false only when the connection is torn down; within one connection
    /// cycle it never flips back.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Connect to the target, closing any connection we already have.
    ///
    /// On success the two worker threads are running and an
    /// [`Init`](ConnState::Init) notification has been issued.
    pub fn connect(&self) -> Result<()> {
        // Drop any connection we already have.  Doing this as a full close
        // issues the old connection's `Closed` notification before the new
        // connection's `Init`.
        self.close();

        let mut send = self.inner.send.lock().expect("poisoned lock");
        let stream = self.inner.target.make_stream().map_err(Error::from_io)?;
        let reader_stream = stream.try_clone().map_err(Error::from_io)?;
        let writer_stream = stream.try_clone().map_err(Error::from_io)?;

        send.writer = Some(llconn::Writer::new(writer_stream));
        send.stream = Some(stream);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.alive.store(true, Ordering::SeqCst);

        let reader = llconn::Reader::new(BufReader::new(reader_stream));
        let conn = self.clone();
        let spawned = thread::Builder::new()
            .name("tor control reader".into())
            .spawn(move || conn.reader_loop(generation, reader))
            .and_then(|reader_thread| {
                let conn = self.clone();
                let event_thread = thread::Builder::new()
                    .name("tor event dispatcher".into())
                    .spawn(move || conn.event_loop(generation))?;
                Ok((reader_thread, event_thread))
            });
        match spawned {
            Ok((reader_thread, event_thread)) => {
                send.reader_thread = Some(reader_thread);
                send.event_thread = Some(event_thread);
            }
            Err(e) => {
                let mut stale = Vec::new();
                self.teardown(&mut send, &mut stale);
                drop(send);
                Self::join_workers(stale);
                return Err(Error::Socket(Arc::new(e)));
            }
        }
        drop(send);

        self.notify_status(ConnState::Init, Some(true));
        Ok(())
    }

    /// Close the connection.  If it is already closed this is a no-op.
    ///
    /// Exactly one [`Closed`](ConnState::Closed) notification is issued
    /// per real open-to-closed transition, no matter how many threads
    /// race to close.
    pub fn close(&self) {
        let mut send = self.inner.send.lock().expect("poisoned lock");
        if !self.is_alive() {
            return;
        }
        let mut stale = Vec::new();
        self.teardown(&mut send, &mut stale);
        drop(send);
        Self::join_workers(stale);
        self.notify_status(ConnState::Closed, Some(false));
    }

    /// Format `message` and write it to the socket.
    ///
    /// A send failure that means the peer is gone closes the connection
    /// before the error is returned.
    pub fn send(&self, message: &str, raw: bool) -> Result<()> {
        let mut send = self.inner.send.lock().expect("poisoned lock");
        if !self.is_alive() {
            return Err(Error::SocketClosed);
        }
        let writer = send.writer.as_mut().expect("alive without a writer");
        match writer.send_command(message, raw) {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, Error::SocketClosed) {
                    let mut stale = Vec::new();
                    self.teardown(&mut send, &mut stale);
                    drop(send);
                    Self::join_workers(stale);
                    self.notify_status(ConnState::Closed, Some(false));
                }
                Err(e)
            }
        }
    }

    /// Block until the reader delivers one reply, and return it.
    ///
    /// Event messages never show up here; the reader routes them to the
    /// event dispatcher before feeding the reply slot.
    pub fn receive(&self) -> Result<Reply> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        match self.inner.replies.pop_or_wait(|| self.is_alive()) {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => {
                if matches!(e, Error::SocketClosed) {
                    // The reader noticed the disconnection; finish the
                    // close on its behalf if nobody else is on it.
                    self.close_from_io(generation);
                }
                Err(e)
            }
            None => Err(Error::SocketClosed),
        }
    }

    /// Send `message` and return the reply to it.
    ///
    /// Concurrent callers are serialized; replies are matched to commands
    /// by order, which the serialization makes unambiguous.  When this
    /// returns [`Error::SocketClosed`], the connection really is closed by
    /// the time the caller sees the error.
    pub fn request(&self, message: &str) -> Result<Reply> {
        let _guard = self.inner.request_lock.lock().expect("poisoned lock");

        // If the reply slot isn't empty then one of a few things happened:
        // the connection died and was re-established while nobody was
        // looking (the leftover closure errors are expected); pulling for
        // replies hit a transport or parsing problem; or a previous caller
        // lost the reply to its own command, which should not be possible.
        while let Some(leftover) = self.inner.replies.try_pop() {
            match leftover {
                Err(Error::SocketClosed) => {}
                Err(Error::Protocol(msg)) => info!("Tor provided a malformed message ({msg})"),
                Err(e) => info!("Socket experienced a problem ({e})"),
                Ok(reply) => warn!("BUG: a request failed to deliver its reply: {reply}"),
            }
        }

        let outcome = self.send(message, false).and_then(|()| self.receive());
        if matches!(outcome, Err(Error::SocketClosed)) {
            // The closure may have been noticed mid-request; make sure the
            // teardown has fully happened before the caller sees the error.
            self.close();
        }
        outcome
    }

    /// Register `callback` to be notified of connection state changes.
    ///
    /// With `spawn` set, each notification is delivered on a newly spawned
    /// thread; otherwise the callback runs in the context of the thread
    /// where the change occurred, under the listener-list lock.  In-band
    /// callbacks therefore must not block, and must not call back into
    /// this connection's `connect`/`close` or listener registration.
    ///
    /// The returned handle removes the registration again when passed to
    /// [`remove_status_listener`](ControlConn::remove_status_listener).
    pub fn add_status_listener<F>(&self, callback: F, spawn: bool) -> ListenerHandle
    where
        F: Fn(ConnState, u64) + Send + Sync + 'static,
    {
        let handle = ListenerHandle {
            callback: Arc::new(callback),
            spawn,
        };
        self.inner
            .listeners
            .lock()
            .expect("poisoned lock")
            .push(handle.clone());
        handle
    }

    /// Stop notifying the listener behind `handle`.
    ///
    /// Returns true if a registration was removed.
    pub fn remove_status_listener(&self, handle: &ListenerHandle) -> bool {
        let mut listeners = self.inner.listeners.lock().expect("poisoned lock");
        let before = listeners.len();
        listeners.retain(|entry| !Arc::ptr_eq(&entry.callback, &handle.callback));
        listeners.len() != before
    }

    /// Install `handler` as the asynchronous-event hook.
    ///
    /// Every decoded `650` reply is passed to it, in decode order, on the
    /// event-dispatcher thread.  Replaces any previously installed hook.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(Reply) + Send + Sync + 'static,
    {
        *self.inner.handler.lock().expect("poisoned lock") = Some(Arc::new(handler));
    }

    /// Notify every status listener of `state`.
    ///
    /// If `expect_alive` is set and disagrees with
    /// [`is_alive`](ControlConn::is_alive) at delivery time, the
    /// notification is discarded: states imply an aliveness, which can be
    /// stale by the time a notification for a near-simultaneous change is
    /// delivered, and listeners must not see e.g. a `Reset` after the
    /// `Closed` that follows it.
    ///
    /// In-band deliveries serialize on the listener-list lock, and the
    /// gate is evaluated under it, which is what makes the ordering above
    /// hold without taking the send lock here.
    pub(crate) fn notify_status(&self, state: ConnState, expect_alive: Option<bool>) {
        let listeners = self.inner.listeners.lock().expect("poisoned lock");
        if let Some(expected) = expect_alive {
            if expected != self.is_alive() {
                return;
            }
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        for entry in listeners.iter() {
            let callback = Arc::clone(&entry.callback);
            if entry.spawn {
                let spawned = thread::Builder::new()
                    .name(format!("{state} notification"))
                    .spawn(move || callback(state, timestamp));
                if let Err(e) = spawned {
                    warn!("Unable to spawn a {state} notification thread: {e}");
                }
            } else {
                callback(state, timestamp);
            }
        }
    }

    /// Tear down the current connection.  The caller holds the send lock
    /// and afterwards must (in order) release it, pass `stale` to
    /// [`join_workers`](Self::join_workers), and issue any notification.
    fn teardown(&self, send: &mut SendState, stale: &mut Vec<JoinHandle<()>>) {
        if let Some(stream) = send.stream.take() {
            let _ = stream.shutdown();
        }
        send.writer = None;
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        stale.extend(send.reader_thread.take());
        stale.extend(send.event_thread.take());

        // Whoever is parked on a queue needs to re-check its condition.
        self.inner.replies.wake_all();
        self.inner.events.wake_all();
    }

    /// Join the given worker threads, skipping the calling thread itself:
    /// a worker that ends up on the close path must not deadlock on its
    /// own handle.  (Dropping the handle detaches it; the worker is
    /// already past the point of touching shared state.)
    fn join_workers(stale: Vec<JoinHandle<()>>) {
        let me = thread::current().id();
        for handle in stale {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    /// Return true if the connection cycle numbered `generation` is still
    /// the live one.
    fn is_current(&self, generation: u64) -> bool {
        self.is_alive() && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Close the connection in response to an observed disconnection, but
    /// only if connection cycle `generation` is still current, and only if
    /// the send lock is free.
    ///
    /// If the lock is held, a concurrent `send`/`close`/`connect` already
    /// owns the state transition and the close is left to it.
    fn close_from_io(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if let Ok(mut send) = self.inner.send.try_lock() {
            if !self.is_current(generation) {
                return;
            }
            let mut stale = Vec::new();
            self.teardown(&mut send, &mut stale);
            drop(send);
            Self::join_workers(stale);
            self.notify_status(ConnState::Closed, Some(false));
        }
    }

    /// Body of the reader worker for connection cycle `generation`.
    fn reader_loop(&self, generation: u64, mut reader: llconn::Reader) {
        while self.is_current(generation) {
            match reader.read_reply() {
                Ok(reply) if reply.is_event() => self.inner.events.push(reply),
                Ok(reply) => self.inner.replies.push(Ok(reply)),
                Err(e @ Error::Protocol(_)) => {
                    // The framing went wrong but the stream itself is
                    // intact; report it and keep reading.
                    self.inner.replies.push(Err(e));
                }
                Err(e) => {
                    let closed = matches!(e, Error::SocketClosed);
                    self.inner.replies.push(Err(e));
                    if closed {
                        self.close_from_io(generation);
                    }
                    break;
                }
            }
        }
        trace!("control reader exiting");
    }

    /// Body of the event-dispatcher worker for connection cycle
    /// `generation`.
    ///
    /// Events already queued when the connection dies are still delivered
    /// before the worker exits.
    fn event_loop(&self, generation: u64) {
        while let Some(event) = self
            .inner
            .events
            .pop_or_wait(|| self.is_current(generation))
        {
            let handler = self.inner.handler.lock().expect("poisoned lock").clone();
            match handler {
                Some(handler) => handler(event),
                None => trace!("Discarding an event with no handler installed: {event}"),
            }
        }
        trace!("event dispatcher exiting");
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::testing::{ScriptedTor, Step};

    /// Register a `spawn = false` listener that records every state it
    /// sees.
    fn recording_listener(conn: &ControlConn) -> Arc<Mutex<Vec<ConnState>>> {
        let states = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&states);
        let _handle = conn.add_status_listener(
            move |state, _timestamp| recorded.lock().unwrap().push(state),
            false,
        );
        states
    }

    #[test]
    fn request_round_trip() {
        let tor = ScriptedTor::spawn(vec![
            Step::Recv,
            Step::Send("250-version=0.2.3.24-rc\r\n250 OK\r\n"),
            Step::Recv,
            Step::Send("250 closing connection\r\n"),
        ]);
        let conn = tor.conn();
        conn.connect().unwrap();

        let reply = conn.request("GETINFO version").unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.lines()[0].content(), "version=0.2.3.24-rc");

        let quit = conn.request("QUIT").unwrap();
        assert_eq!(quit.message(), "closing connection");
        conn.close();

        assert_eq!(tor.finish(), vec!["GETINFO version\r\n", "QUIT\r\n"]);
    }

    #[test]
    fn alive_transitions_fire_one_notification_each() {
        let tor = ScriptedTor::spawn(vec![Step::Recv]);
        let conn = tor.conn();
        let states = recording_listener(&conn);

        assert!(!conn.is_alive());
        conn.connect().unwrap();
        assert!(conn.is_alive());
        conn.close();
        assert!(!conn.is_alive());
        // Closing twice must not fire a second notification.
        conn.close();

        assert_eq!(*states.lock().unwrap(), vec![ConnState::Init, ConnState::Closed]);
        let _ = tor.finish();
    }

    #[test]
    fn spawned_listener_delivery() {
        let tor = ScriptedTor::spawn(vec![Step::Recv]);
        let conn = tor.conn();
        let (tx, rx) = mpsc::channel();
        let _handle = conn.add_status_listener(move |state, _| tx.send(state).unwrap(), true);

        conn.connect().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ConnState::Init
        );
        conn.close();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ConnState::Closed
        );
        let _ = tor.finish();
    }

    #[test]
    fn removed_listener_is_quiet() {
        let tor = ScriptedTor::spawn(vec![Step::Recv]);
        let conn = tor.conn();
        let states = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&states);
        let handle =
            conn.add_status_listener(move |state, _| recorded.lock().unwrap().push(state), false);

        assert!(conn.remove_status_listener(&handle));
        assert!(!conn.remove_status_listener(&handle));

        conn.connect().unwrap();
        conn.close();
        assert!(states.lock().unwrap().is_empty());
        let _ = tor.finish();
    }

    #[test]
    fn request_after_close_fails() {
        let tor = ScriptedTor::spawn(vec![Step::Recv]);
        let conn = tor.conn();
        conn.connect().unwrap();
        conn.close();

        assert_matches!(conn.request("GETINFO version"), Err(Error::SocketClosed));
        assert_matches!(conn.receive(), Err(Error::SocketClosed));
        let _ = tor.finish();
    }

    #[test]
    fn events_go_to_the_handler_not_the_caller() {
        let tor = ScriptedTor::spawn(vec![
            Step::Send("650 BW 100 200\r\n"),
            Step::Recv,
            Step::Send("250 OK\r\n"),
            Step::Recv,
        ]);
        let conn = tor.conn();
        let (tx, rx) = mpsc::channel();
        conn.set_event_handler(move |event| tx.send(event).unwrap());
        conn.connect().unwrap();

        // Even with an event in flight, the request gets its own reply.
        let reply = conn.request("SIGNAL NEWNYM").unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.message(), "OK");

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(event.is_event());
        assert_eq!(event.message(), "BW 100 200");

        conn.close();
        assert_eq!(tor.finish()[0], "SIGNAL NEWNYM\r\n");
    }

    #[test]
    fn disconnect_during_request() {
        // The server reads our command and then hangs up without answering.
        let tor = ScriptedTor::spawn(vec![Step::Recv]);
        let conn = tor.conn();
        let states = recording_listener(&conn);
        conn.connect().unwrap();

        assert_matches!(conn.request("GETINFO version"), Err(Error::SocketClosed));
        assert!(!conn.is_alive());
        assert_eq!(*states.lock().unwrap(), vec![ConnState::Init, ConnState::Closed]);
        assert_eq!(tor.finish(), vec!["GETINFO version\r\n"]);
    }

    #[test]
    fn stale_replies_are_drained() {
        let tor = ScriptedTor::spawn(vec![
            Step::Send("250 stray\r\n"),
            Step::Recv,
            Step::Send("250 real\r\n"),
            Step::Recv,
        ]);
        let conn = tor.conn();
        conn.connect().unwrap();

        // Give the reader time to deposit the stray reply nobody asked for.
        thread::sleep(Duration::from_millis(100));
        let reply = conn.request("GETINFO version").unwrap();
        assert_eq!(reply.message(), "real");

        conn.close();
        let _ = tor.finish();
    }

    #[test]
    fn concurrent_requests_get_their_own_replies() {
        // A minimal tor that answers according to what was asked.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            for _ in 0..2 {
                let mut command = String::new();
                reader.read_line(&mut command).unwrap();
                let response = if command.contains("alpha") {
                    "250-alpha=A\r\n250 OK\r\n"
                } else {
                    "250-beta=B\r\n250 OK\r\n"
                };
                stream.write_all(response.as_bytes()).unwrap();
            }
            // Hold the socket open until the controller closes.
            let mut rest = String::new();
            let _ = reader.read_line(&mut rest);
        });

        let conn = ControlConn::new(ConnTarget::Port(addr));
        conn.connect().unwrap();

        let conn_a = conn.clone();
        let thread_a = thread::spawn(move || conn_a.request("GETINFO alpha").unwrap());
        let conn_b = conn.clone();
        let thread_b = thread::spawn(move || conn_b.request("GETINFO beta").unwrap());

        let reply_a = thread_a.join().unwrap();
        let reply_b = thread_b.join().unwrap();
        assert_eq!(reply_a.lines()[0].content(), "alpha=A");
        assert_eq!(reply_b.lines()[0].content(), "beta=B");

        conn.close();
        server.join().unwrap();
    }

    #[test]
    fn reconnect_reuses_the_target() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            // Two connections in sequence, one request each.
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut command = String::new();
                reader.read_line(&mut command).unwrap();
                stream.write_all(b"250 OK\r\n").unwrap();
                let mut rest = String::new();
                let _ = reader.read_line(&mut rest);
            }
        });

        let conn = ControlConn::new(ConnTarget::Port(addr));
        let states = recording_listener(&conn);

        conn.connect().unwrap();
        assert!(conn.request("SIGNAL NEWNYM").unwrap().is_ok());
        // Reconnecting closes the old connection first.
        conn.connect().unwrap();
        assert!(conn.request("SIGNAL NEWNYM").unwrap().is_ok());
        conn.close();

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnState::Init,
                ConnState::Closed,
                ConnState::Init,
                ConnState::Closed
            ]
        );
        server.join().unwrap();
    }

    #[test]
    fn connect_failure_is_a_socket_error() {
        // Bind a listener and drop it, so the port is (very probably)
        // refusing connections.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let conn = ControlConn::new(ConnTarget::Port(addr));
        assert_matches!(conn.connect(), Err(e) if e.is_socket_error());
        assert!(!conn.is_alive());
    }
}
