//! Tunnel server: agent pool and dial orchestration

use crate::error::Error;
use crate::message::{ControlPacket, Method};
use crate::pump::pump;
use crate::session::Session;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;

/// Window for reading the first control frame on an incoming channel
pub const INTAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Window for the agent dial round-trip
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The tunnel server.
///
/// Accepts incoming WebSocket channels, classifies each by its first control
/// frame, keeps registered agent sessions in a FIFO pool and serves
/// [`dial`](TunnelServer::dial) calls by borrowing a pooled agent. Every
/// pooled session is used at most once: popping removes it permanently.
pub struct TunnelServer<S> {
    sessions: Mutex<VecDeque<Session<S>>>,
}

impl<S> TunnelServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a server with an empty pool
    pub fn new() -> Self {
        TunnelServer {
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Handle a freshly accepted channel.
    ///
    /// Reads exactly one control frame within [`INTAKE_TIMEOUT`] and routes
    /// the channel: agent registrations join the pool, client dialouts get a
    /// dedicated task, anything else is closed. Intake failures are logged
    /// and never surface to the pool.
    pub async fn on_connection(self: Arc<Self>, ws: WebSocketStream<S>) {
        let mut session = Session::new(0, ws);

        let packet = match timeout(INTAKE_TIMEOUT, session.read_packet()).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(err)) => {
                debug!("intake read failed: {}", err);
                session.close().await;
                return;
            }
            Err(_) => {
                debug!("intake timed out waiting for first frame");
                session.close().await;
                return;
            }
        };

        match packet.method {
            Method::RegisterAgent => {
                session.id = packet.id;
                debug!("registered agent {}", packet.id);
                self.sessions.lock().unwrap().push_back(session);
            }
            Method::ClientDialRequest => {
                tokio::spawn(async move {
                    self.handle_client_dialout(session, packet).await;
                });
            }
            other => {
                warn!("unexpected first frame method {:?}, closing", other);
                session.close().await;
            }
        }
    }

    fn pop_session(&self) -> Option<Session<S>> {
        self.sessions.lock().unwrap().pop_front()
    }

    /// Borrow a pooled agent and have it dial `network://address`.
    ///
    /// Pops the oldest registration, runs the dial round-trip within
    /// [`HANDSHAKE_TIMEOUT`] and returns the session as a raw byte stream.
    /// Callers wanting a shorter deadline wrap the returned future in
    /// `tokio::time::timeout`; abandoning it closes the borrowed session.
    /// Fails with [`Error::NoConnection`] when the pool is empty, and with
    /// [`Error::DialFailed`] carrying the agent's error text when the agent
    /// could not reach the target.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Session<S>, Error> {
        let mut session = self.pop_session().ok_or(Error::NoConnection)?;

        let request = ControlPacket::dial_request(session.id, network, address);
        let result = timeout(HANDSHAKE_TIMEOUT, async {
            session.write_packet(&request).await?;
            session.read_packet().await
        })
        .await;

        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                session.close().await;
                return Err(err);
            }
            Err(_) => {
                session.close().await;
                return Err(Error::HandshakeTimeout);
            }
        };

        if reply.method != Method::AgentDialSuccess || reply.error.is_some() {
            session.close().await;
            return Err(Error::DialFailed(
                reply.error.unwrap_or_else(|| "dial failed".to_string()),
            ));
        }

        Ok(session)
    }

    /// Service a client dialout on its own task: run the inner dial, report
    /// the outcome on the requesting channel, then bridge the two sessions.
    async fn handle_client_dialout(
        self: Arc<Self>,
        mut client: Session<S>,
        packet: ControlPacket,
    ) {
        let network = packet.network.as_deref().unwrap_or("tcp");
        let address = packet.address.as_deref().unwrap_or_default();

        let mut agent = match self.dial(network, address).await {
            Ok(agent) => agent,
            Err(err) => {
                debug!("client dialout {} failed: {}", packet.id, err);
                let reply = ControlPacket::client_dial_error(packet.id, err.to_string());
                let _ = client.write_packet(&reply).await;
                client.close().await;
                return;
            }
        };

        let reply = ControlPacket::client_dial_success(packet.id);
        if client.write_packet(&reply).await.is_err() {
            client.close().await;
            agent.close().await;
            return;
        }

        pump(client, agent).await;
    }

    /// Number of agent sessions currently pooled.
    ///
    /// Racy by nature against concurrent registration and dialing; useful for
    /// status reporting only.
    pub fn connection_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Drain the pool and close every session. Idempotent.
    pub async fn close_all(&self) {
        let drained: Vec<Session<S>> = self.sessions.lock().unwrap().drain(..).collect();
        for mut session in drained {
            session.close().await;
        }
    }
}

impl<S> Default for TunnelServer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
