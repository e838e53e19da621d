//! Multiplexed request/response client over a single framed connection
//!
//! The client owns two tasks: a reader, which is the only consumer of the
//! connection's receive side, and a scheduler, which is the only writer and
//! the sole owner of the pending-request table. Callers interact through
//! [`MuxClient::write`] (fire-and-forget) and [`MuxClient::request`]
//! (awaits the correlated reply); unsolicited messages are dispatched to the
//! connection's [`MuxConn::handle`].

use crate::error::MuxError;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Fallback heartbeat interval when the connection has no schedule
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// A message carried over a mux connection.
///
/// Messages that participate in request/response matching expose a
/// correlation key; a request and its reply must produce equal keys. The
/// default implementation exposes no key, which makes every send
/// fire-and-forget.
pub trait MuxMessage: Send + 'static {
    /// Correlation key; must be equality-comparable
    type Key: Eq + Hash + Send + 'static;

    /// The message's correlation key, when it has one
    fn key(&self) -> Option<Self::Key> {
        None
    }
}

/// A framed full-duplex connection driven by a [`MuxClient`].
///
/// The client guarantees single-task access: `read` is only called from the
/// reader task, while `write`, `handle` and `heartbeat` are only called from
/// the scheduler task. Implementations needing stronger guarantees for the
/// underlying transport provide them internally.
pub trait MuxConn: Send + Sync + 'static {
    /// The message type carried by this connection
    type Msg: MuxMessage;

    /// Read one message. Blocks until a message arrives or the connection
    /// fails. Must return an error promptly once [`close`](MuxConn::close)
    /// has been called; the client relies on this to unblock its reader.
    fn read(&self) -> impl Future<Output = io::Result<Self::Msg>> + Send;

    /// Write one message
    fn write(&self, msg: Self::Msg) -> impl Future<Output = io::Result<()>> + Send;

    /// Close the connection and release its resources
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Handle a message that matched no pending request, such as a server
    /// push. A returned message is written back on the connection.
    fn handle(&self, msg: Self::Msg) -> impl Future<Output = Option<Self::Msg>> + Send;

    /// Next heartbeat payload and deadline.
    ///
    /// Called once at startup with `connect` true (the payload is ignored,
    /// only the deadline is used) and then on every tick with the running
    /// tick count. Returning no payload skips the write and merely
    /// reschedules. The default keeps a silent [`DEFAULT_HEARTBEAT`] clock
    /// for connections without a heartbeat protocol.
    fn heartbeat(&self, connect: bool, count: u64) -> (Option<Self::Msg>, Instant) {
        let _ = (connect, count);
        (None, Instant::now() + DEFAULT_HEARTBEAT)
    }
}

type ResponseSlot<M> = oneshot::Sender<Result<Option<M>, MuxError>>;

struct SendEvent<M: MuxMessage> {
    msg: M,
    notify: bool,
    response: ResponseSlot<M>,
}

struct RecvEvent<M> {
    msg: Option<M>,
    error: Option<io::Error>,
}

struct MuxState<C: MuxConn> {
    conn: Option<Arc<C>>,
    send_tx: Option<mpsc::Sender<SendEvent<C::Msg>>>,
    cancel: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Multiplexed request/response client.
///
/// Safe for concurrent use: any number of tasks may call
/// [`write`](MuxClient::write) and [`request`](MuxClient::request)
/// simultaneously. Every submission accepted into the send queue is resolved
/// exactly once, with its write outcome, its matched reply, or
/// [`MuxError::ConnectionClosed`]. Write and read failures are terminal for
/// the whole client; the caller chooses between [`reset`](MuxClient::reset)
/// and [`close`](MuxClient::close).
pub struct MuxClient<C: MuxConn> {
    state: RwLock<MuxState<C>>,
    running: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<MuxError>>>,
    heart_count: Arc<AtomicU64>,
}

impl<C: MuxConn> MuxClient<C> {
    /// Start a client over `conn`. Both worker tasks start immediately, so
    /// this must be called within a tokio runtime.
    pub fn new(conn: C) -> Self {
        let running = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));
        let heart_count = Arc::new(AtomicU64::new(0));
        let state = Self::start(conn, &running, &last_error, &heart_count);

        MuxClient {
            state: RwLock::new(state),
            running,
            last_error,
            heart_count,
        }
    }

    fn start(
        conn: C,
        running: &Arc<AtomicBool>,
        last_error: &Arc<Mutex<Option<MuxError>>>,
        heart_count: &Arc<AtomicU64>,
    ) -> MuxState<C> {
        running.store(true, Ordering::SeqCst);
        // A fresh connection starts with a clean slate; errors belong to the
        // connection that produced them.
        *last_error.lock().unwrap() = None;

        let conn = Arc::new(conn);
        let (send_tx, send_rx) = mpsc::channel(16);
        let (recv_tx, recv_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Seed the heartbeat clock; the connect-time payload is not written.
        let (_, heart_at) = conn.heartbeat(true, 0);

        let reader = tokio::spawn(read_loop(
            Arc::clone(&conn),
            Arc::clone(running),
            recv_tx,
        ));
        let scheduler = tokio::spawn(schedule_loop(
            Arc::clone(&conn),
            Arc::clone(running),
            Arc::clone(last_error),
            Arc::clone(heart_count),
            send_rx,
            recv_rx,
            cancel_rx,
            heart_at,
        ));

        MuxState {
            conn: Some(conn),
            send_tx: Some(send_tx),
            cancel: Some(cancel_tx),
            tasks: vec![reader, scheduler],
        }
    }

    async fn shutdown_state(state: &mut MuxState<C>) {
        if let Some(cancel) = state.cancel.take() {
            let _ = cancel.send(true);
        }
        // Dropping the sender closes the send queue; the scheduler drains
        // whatever is left with ConnectionClosed.
        state.send_tx = None;
        state.conn = None;
        for task in state.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Replace the underlying connection.
    ///
    /// Only permitted while the client is not running, that is after the
    /// previous connection failed or [`close`](MuxClient::close) was called;
    /// otherwise fails with [`MuxError::AlreadyConnected`]. Waits for the
    /// previous workers to exit before starting the new ones.
    pub async fn reset(&self, conn: C) -> Result<(), MuxError> {
        let mut state = self.state.write().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(MuxError::AlreadyConnected);
        }
        Self::shutdown_state(&mut state).await;
        *state = Self::start(conn, &self.running, &self.last_error, &self.heart_count);
        Ok(())
    }

    /// The connection currently driven by the client, if any
    pub async fn conn(&self) -> Option<Arc<C>> {
        self.state.read().await.conn.clone()
    }

    /// Whether both worker tasks are live
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the client and wait for both workers to exit.
    ///
    /// Idempotent. The first call reports the error the connection died
    /// with, if any; later calls return `Ok`.
    pub async fn close(&self) -> Result<(), MuxError> {
        let mut state = self.state.write().await;
        self.running.store(false, Ordering::SeqCst);
        Self::shutdown_state(&mut state).await;

        match self.last_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Send a message without awaiting a reply. Returns once the scheduler
    /// has written it, or with the write error that killed the connection.
    pub async fn write(&self, msg: C::Msg) -> Result<(), MuxError> {
        self.submit(msg, false).await.map(|_| ())
    }

    /// Send a request and await the reply whose key matches.
    ///
    /// A message exposing no correlation key degrades to fire-and-forget and
    /// resolves with `None` as soon as the write completes. Cancel by
    /// dropping the future, while queuing or while awaiting the reply.
    pub async fn request(&self, msg: C::Msg) -> Result<Option<C::Msg>, MuxError> {
        self.submit(msg, true).await
    }

    async fn submit(&self, msg: C::Msg, notify: bool) -> Result<Option<C::Msg>, MuxError> {
        let send_tx = {
            let state = self.state.read().await;
            if !self.running.load(Ordering::SeqCst) {
                return Err(MuxError::NotConnected);
            }
            state.send_tx.clone().ok_or(MuxError::NotConnected)?
        };

        let (response_tx, response_rx) = oneshot::channel();
        send_tx
            .send(SendEvent {
                msg,
                notify,
                response: response_tx,
            })
            .await
            .map_err(|_| MuxError::ConnectionClosed)?;

        match response_rx.await {
            Ok(result) => result,
            // The slot was dropped without a verdict: the scheduler is gone.
            Err(_) => Err(MuxError::ConnectionClosed),
        }
    }
}

/// Resolve a pending request matching `msg`, or hand the message back.
fn correlate<M: MuxMessage>(
    pending: &mut HashMap<M::Key, ResponseSlot<M>>,
    msg: M,
) -> Option<M> {
    if let Some(key) = msg.key() {
        if let Some(slot) = pending.remove(&key) {
            let _ = slot.send(Ok(Some(msg)));
            return None;
        }
    }
    Some(msg)
}

/// Reader task: sole consumer of the connection's receive side.
async fn read_loop<C: MuxConn>(
    conn: Arc<C>,
    running: Arc<AtomicBool>,
    recv_tx: mpsc::Sender<RecvEvent<C::Msg>>,
) {
    while running.load(Ordering::SeqCst) {
        match conn.read().await {
            Ok(msg) => {
                let event = RecvEvent {
                    msg: Some(msg),
                    error: None,
                };
                if recv_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                running.store(false, Ordering::SeqCst);
                let event = RecvEvent {
                    msg: None,
                    error: Some(err),
                };
                let _ = recv_tx.send(event).await;
                break;
            }
        }
    }
}

/// Scheduler task: sole writer on the connection and sole owner of the
/// pending-request table.
#[allow(clippy::too_many_arguments)]
async fn schedule_loop<C: MuxConn>(
    conn: Arc<C>,
    running: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<MuxError>>>,
    heart_count: Arc<AtomicU64>,
    mut send_rx: mpsc::Receiver<SendEvent<C::Msg>>,
    mut recv_rx: mpsc::Receiver<RecvEvent<C::Msg>>,
    mut cancel_rx: watch::Receiver<bool>,
    mut heart_at: Instant,
) {
    let mut pending: HashMap<<C::Msg as MuxMessage>::Key, ResponseSlot<C::Msg>> = HashMap::new();

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            // The stop signal only comes from close or reset; it is a clean
            // shutdown, not an error.
            _ = cancel_rx.changed() => running.store(false, Ordering::SeqCst),

            event = recv_rx.recv() => match event {
                None => running.store(false, Ordering::SeqCst),
                Some(event) => {
                    if let Some(err) = event.error {
                        *last_error.lock().unwrap() = Some(MuxError::Io(err));
                        running.store(false, Ordering::SeqCst);
                    } else if let Some(msg) = event.msg {
                        if let Some(unmatched) = correlate(&mut pending, msg) {
                            if let Some(reply) = conn.handle(unmatched).await {
                                if let Err(err) = conn.write(reply).await {
                                    *last_error.lock().unwrap() = Some(MuxError::Io(err));
                                    running.store(false, Ordering::SeqCst);
                                }
                            }
                        }
                    }
                }
            },

            event = send_rx.recv() => match event {
                None => running.store(false, Ordering::SeqCst),
                Some(event) => {
                    let key = if event.notify { event.msg.key() } else { None };
                    match conn.write(event.msg).await {
                        Ok(()) => match key {
                            // Park the slot until the matching reply arrives.
                            // A reused key displaces the older slot, whose
                            // request then resolves with ConnectionClosed.
                            Some(key) => {
                                pending.insert(key, event.response);
                            }
                            None => {
                                let _ = event.response.send(Ok(None));
                            }
                        },
                        Err(err) => {
                            let copy = io::Error::new(err.kind(), err.to_string());
                            *last_error.lock().unwrap() = Some(MuxError::Io(copy));
                            running.store(false, Ordering::SeqCst);
                            let _ = event.response.send(Err(MuxError::Io(err)));
                        }
                    }
                }
            },

            _ = tokio::time::sleep_until(heart_at) => {
                let count = heart_count.fetch_add(1, Ordering::SeqCst) + 1;
                let (payload, next_at) = conn.heartbeat(false, count);
                heart_at = next_at;
                if let Some(msg) = payload {
                    if let Err(err) = conn.write(msg).await {
                        *last_error.lock().unwrap() = Some(MuxError::Io(err));
                        running.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    // Unblock the reader, then drain whatever it already produced: a late
    // event may still match a pending request. Errors here are the echo of
    // our own close and are not recorded.
    conn.close().await;
    while let Some(event) = recv_rx.recv().await {
        if let Some(msg) = event.msg {
            let _ = correlate(&mut pending, msg);
        }
    }

    let unresolved = pending.len();
    if unresolved > 0 {
        debug!("mux scheduler exiting with {} unresolved requests", unresolved);
    }
    for (_, slot) in pending.drain() {
        let _ = slot.send(Err(MuxError::ConnectionClosed));
    }

    // Queued sends that will never be written.
    send_rx.close();
    while let Ok(event) = send_rx.try_recv() {
        let _ = event.response.send(Err(MuxError::ConnectionClosed));
    }
}
