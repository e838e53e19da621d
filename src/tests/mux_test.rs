//! Mux client scenarios over an in-memory connection

use crate::error::MuxError;
use crate::mux::{MuxClient, MuxConn, MuxMessage};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestMsg {
    key: Option<u64>,
    body: String,
}

impl TestMsg {
    fn keyed(key: u64, body: &str) -> Self {
        TestMsg {
            key: Some(key),
            body: body.to_string(),
        }
    }

    fn plain(body: &str) -> Self {
        TestMsg {
            key: None,
            body: body.to_string(),
        }
    }
}

impl MuxMessage for TestMsg {
    type Key = u64;

    fn key(&self) -> Option<u64> {
        self.key
    }
}

/// In-memory connection: the test injects inbound traffic and observes
/// everything the client writes or routes to `handle`.
struct TestConn {
    incoming: Mutex<mpsc::UnboundedReceiver<io::Result<TestMsg>>>,
    closer: mpsc::UnboundedSender<io::Result<TestMsg>>,
    written: mpsc::UnboundedSender<TestMsg>,
    handled: mpsc::UnboundedSender<TestMsg>,
    fail_writes: Arc<AtomicBool>,
    heartbeat_period: Option<Duration>,
}

struct TestDriver {
    inject: mpsc::UnboundedSender<io::Result<TestMsg>>,
    written: mpsc::UnboundedReceiver<TestMsg>,
    handled: mpsc::UnboundedReceiver<TestMsg>,
    fail_writes: Arc<AtomicBool>,
}

fn test_conn(heartbeat_period: Option<Duration>) -> (TestConn, TestDriver) {
    let (inject_tx, inject_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (handled_tx, handled_rx) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));

    let conn = TestConn {
        incoming: Mutex::new(inject_rx),
        closer: inject_tx.clone(),
        written: written_tx,
        handled: handled_tx,
        fail_writes: Arc::clone(&fail_writes),
        heartbeat_period,
    };
    let driver = TestDriver {
        inject: inject_tx,
        written: written_rx,
        handled: handled_rx,
        fail_writes,
    };

    (conn, driver)
}

impl MuxConn for TestConn {
    type Msg = TestMsg;

    async fn read(&self) -> io::Result<TestMsg> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(result) => result,
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "test conn exhausted",
            )),
        }
    }

    async fn write(&self, msg: TestMsg) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        self.written
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "observer gone"))
    }

    async fn close(&self) {
        // Unblocks the reader, like closing a socket would.
        let _ = self.closer.send(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "connection closed",
        )));
    }

    async fn handle(&self, msg: TestMsg) -> Option<TestMsg> {
        let reply = (msg.body == "ping").then(|| TestMsg::plain("pong"));
        let _ = self.handled.send(msg);
        reply
    }

    fn heartbeat(&self, connect: bool, count: u64) -> (Option<TestMsg>, Instant) {
        match self.heartbeat_period {
            Some(period) => {
                let payload = (!connect).then(|| TestMsg::plain(&format!("hb-{}", count)));
                (payload, Instant::now() + period)
            }
            None => (None, Instant::now() + Duration::from_secs(60)),
        }
    }
}

async fn wait_until_stopped<C: MuxConn>(client: &MuxClient<C>) {
    timeout(Duration::from_secs(5), async {
        while client.is_running() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client did not stop");
}

#[tokio::test]
async fn requests_are_matched_by_correlation_key() {
    let (conn, mut driver) = test_conn(None);
    let client = Arc::new(MuxClient::new(conn));

    let r42 = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request(TestMsg::keyed(42, "ask-42")).await })
    };
    let r43 = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request(TestMsg::keyed(43, "ask-43")).await })
    };

    // Both requests hit the wire before any reply exists.
    let mut keys = vec![
        driver.written.recv().await.unwrap().key.unwrap(),
        driver.written.recv().await.unwrap().key.unwrap(),
    ];
    keys.sort_unstable();
    assert_eq!(keys, vec![42, 43]);

    // Replies arrive out of order; each resolves its own request.
    driver
        .inject
        .send(Ok(TestMsg::keyed(43, "answer-43")))
        .unwrap();
    driver
        .inject
        .send(Ok(TestMsg::keyed(42, "answer-42")))
        .unwrap();

    let reply = r42.await.unwrap().unwrap().unwrap();
    assert_eq!(reply, TestMsg::keyed(42, "answer-42"));
    let reply = r43.await.unwrap().unwrap().unwrap();
    assert_eq!(reply, TestMsg::keyed(43, "answer-43"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn keyless_request_degrades_to_fire_and_forget() {
    let (conn, mut driver) = test_conn(None);
    let client = MuxClient::new(conn);

    let outcome = client.request(TestMsg::plain("fire")).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(driver.written.recv().await.unwrap(), TestMsg::plain("fire"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn write_never_registers_a_pending_request() {
    let (conn, mut driver) = test_conn(None);
    let client = MuxClient::new(conn);

    client.write(TestMsg::keyed(7, "oneway")).await.unwrap();
    assert_eq!(
        driver.written.recv().await.unwrap(),
        TestMsg::keyed(7, "oneway")
    );

    // A reply keyed like the write is unsolicited and goes to handle.
    driver.inject.send(Ok(TestMsg::keyed(7, "stray"))).unwrap();
    assert_eq!(
        driver.handled.recv().await.unwrap(),
        TestMsg::keyed(7, "stray")
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn unsolicited_push_is_handled_and_its_reply_written_back() {
    let (conn, mut driver) = test_conn(None);
    let client = MuxClient::new(conn);

    driver.inject.send(Ok(TestMsg::plain("ping"))).unwrap();

    assert_eq!(driver.handled.recv().await.unwrap(), TestMsg::plain("ping"));
    assert_eq!(driver.written.recv().await.unwrap(), TestMsg::plain("pong"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn read_error_fails_all_pending_requests_and_close_reports_it() {
    let (conn, mut driver) = test_conn(None);
    let client = Arc::new(MuxClient::new(conn));

    let r1 = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request(TestMsg::keyed(1, "first")).await })
    };
    let r2 = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request(TestMsg::keyed(2, "second")).await })
    };
    driver.written.recv().await.unwrap();
    driver.written.recv().await.unwrap();

    driver
        .inject
        .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")))
        .unwrap();

    let err = r1.await.unwrap().unwrap_err();
    assert!(matches!(err, MuxError::ConnectionClosed));
    let err = r2.await.unwrap().unwrap_err();
    assert!(matches!(err, MuxError::ConnectionClosed));

    let err = client.close().await.unwrap_err();
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn write_error_is_terminal_for_the_client() {
    let (conn, driver) = test_conn(None);
    let client = MuxClient::new(conn);

    driver.fail_writes.store(true, Ordering::SeqCst);

    let err = client.write(TestMsg::plain("doomed")).await.unwrap_err();
    assert!(matches!(err, MuxError::Io(_)));

    wait_until_stopped(&client).await;
    let err = client.write(TestMsg::plain("after")).await.unwrap_err();
    assert!(matches!(
        err,
        MuxError::NotConnected | MuxError::ConnectionClosed
    ));
}

#[tokio::test]
async fn reset_is_rejected_while_running_and_revives_a_dead_client() {
    let (conn, driver) = test_conn(None);
    let client = MuxClient::new(conn);

    let (standby, _standby_driver) = test_conn(None);
    let err = client.reset(standby).await.unwrap_err();
    assert!(matches!(err, MuxError::AlreadyConnected));

    // Kill the first connection, then swap in a fresh one.
    driver
        .inject
        .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")))
        .unwrap();
    wait_until_stopped(&client).await;

    let (fresh, mut fresh_driver) = test_conn(None);
    client.reset(fresh).await.unwrap();
    assert!(client.is_running());

    let outcome = client.request(TestMsg::plain("hello-again")).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(
        fresh_driver.written.recv().await.unwrap(),
        TestMsg::plain("hello-again")
    );

    // The old connection's error does not outlive the reset.
    client.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_leaves_the_client_unusable() {
    let (conn, _driver) = test_conn(None);
    let client = MuxClient::new(conn);

    client.close().await.unwrap();
    client.close().await.unwrap();

    let err = client.write(TestMsg::plain("late")).await.unwrap_err();
    assert!(matches!(err, MuxError::NotConnected));
    let err = client.request(TestMsg::keyed(1, "late")).await.unwrap_err();
    assert!(matches!(err, MuxError::NotConnected));
}

#[tokio::test]
async fn heartbeats_follow_the_connection_schedule() {
    let (conn, mut driver) = test_conn(Some(Duration::from_millis(50)));
    let client = MuxClient::new(conn);

    let first = timeout(Duration::from_secs(2), driver.written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, TestMsg::plain("hb-1"));

    let second = timeout(Duration::from_secs(2), driver.written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, TestMsg::plain("hb-2"));

    client.close().await.unwrap();
}
