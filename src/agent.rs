//! Call-home agent that services dial instructions

use crate::message::{next_id, ControlPacket, Method};
use crate::pump::pump;
use crate::session::Session;
use log::{debug, info};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Delay before reconnecting after a failed or serviced channel
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// An outbound-only participant. It dials the tunnel server, registers, and
/// blocks until the server instructs it to open a TCP connection; the
/// instruction channel then becomes the tunnel itself.
pub struct Agent {
    /// Correlation id sent with every registration
    pub id: i64,
}

impl Agent {
    pub fn new() -> Self {
        Agent { id: next_id() }
    }

    /// Maintain a registration on the server and service dial instructions.
    ///
    /// Each channel carries exactly one control round-trip: register, wait
    /// for the dial instruction, then hand the channel to a dedicated task
    /// that dials the target and bridges. The loop immediately reconnects so
    /// a fresh registration is available while the previous dial is served.
    ///
    /// Runs until the returned future is dropped. Connection failures retry
    /// with [`RECONNECT_DELAY`] backoff; instruction failures reconnect
    /// immediately.
    pub async fn run(&self, server_url: &str) {
        loop {
            let ws = match connect_async(server_url).await {
                Ok((ws, _)) => ws,
                Err(err) => {
                    debug!("agent {}: server connect failed: {}", self.id, err);
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let mut session = Session::new(self.id, ws);

            if let Err(err) = session.write_packet(&ControlPacket::register(self.id)).await {
                debug!("agent {}: registration failed: {}", self.id, err);
                session.close().await;
                continue;
            }

            let packet = match session.read_packet().await {
                Ok(packet) => packet,
                Err(err) => {
                    debug!("agent {}: instruction read failed: {}", self.id, err);
                    session.close().await;
                    continue;
                }
            };

            if packet.method != Method::AgentDialRequest {
                debug!(
                    "agent {}: unexpected instruction {:?}, reconnecting",
                    self.id, packet.method
                );
                session.close().await;
                continue;
            }

            let network = packet.network.unwrap_or_else(|| "tcp".to_string());
            let address = packet.address.unwrap_or_default();
            let id = self.id;

            // Serve the dial on its own task so the loop can re-register.
            tokio::spawn(dial_and_bridge(id, session, network, address));
        }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

/// Dial the instructed target and bridge it to the instruction channel.
///
/// Dial failures are reported back with a best-effort error frame before the
/// channel is closed.
async fn dial_and_bridge(
    id: i64,
    mut session: Session<MaybeTlsStream<TcpStream>>,
    network: String,
    address: String,
) {
    if network != "tcp" {
        let reply = ControlPacket::dial_error(id, format!("unsupported network: {}", network));
        let _ = session.write_packet(&reply).await;
        session.close().await;
        return;
    }

    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(err) => {
            let reply = ControlPacket::dial_error(id, err.to_string());
            let _ = session.write_packet(&reply).await;
            session.close().await;
            return;
        }
    };

    if session.write_packet(&ControlPacket::dial_success(id)).await.is_err() {
        session.close().await;
        return;
    }

    info!("agent {}: bridging {}", id, address);
    pump(session, stream).await;
}
