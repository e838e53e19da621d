//! Shared helpers for the scenario tests

use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;

/// An in-memory WebSocket pair; returns (client side, server side).
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);

    let (client, server) = tokio::join!(
        tokio_tungstenite::client_async("ws://local.test/", client_io),
        tokio_tungstenite::accept_async(server_io),
    );

    (
        client.expect("client handshake").0,
        server.expect("server handshake"),
    )
}
