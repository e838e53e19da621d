//! Gateway dialer: reach a target through the server's agent pool

use crate::error::Error;
use crate::message::{next_id, ControlPacket, Method};
use crate::session::Session;
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// A remote user of the tunnel server.
///
/// Each [`dial`](Client::dial) opens its own channel to the server, asks it
/// to reach the target through a pooled agent, and on success returns the
/// channel as a raw byte stream. The resulting path chains through the
/// server: client channel, borrowed agent channel, agent's local TCP target.
pub struct Client {
    /// Correlation id sent with every dialout request
    pub id: i64,

    /// WebSocket address of the tunnel server
    pub server_url: String,
}

impl Client {
    pub fn new(server_url: impl Into<String>) -> Self {
        Client {
            id: next_id(),
            server_url: server_url.into(),
        }
    }

    /// Open a tunnel to `network://address` through the server.
    ///
    /// Callers enforce a deadline by wrapping the future in
    /// `tokio::time::timeout`; abandonment closes the channel. Fails with
    /// [`Error::DialFailed`] carrying the server's error text when the
    /// server cannot complete the dialout.
    pub async fn dial(
        &self,
        network: &str,
        address: &str,
    ) -> Result<Session<MaybeTlsStream<TcpStream>>, Error> {
        let (ws, _) = connect_async(self.server_url.as_str()).await?;
        let mut session = Session::new(self.id, ws);

        let request = ControlPacket::client_dial_request(self.id, network, address);
        if let Err(err) = session.write_packet(&request).await {
            session.close().await;
            return Err(err);
        }

        let reply = match session.read_packet().await {
            Ok(reply) => reply,
            Err(err) => {
                session.close().await;
                return Err(err);
            }
        };

        if reply.method != Method::ClientDialSuccess {
            debug!("client {}: dialout rejected: {:?}", self.id, reply.error);
            session.close().await;
            return Err(Error::DialFailed(
                reply.error.unwrap_or_else(|| "dial failed".to_string()),
            ));
        }

        Ok(session)
    }
}
