//! Bidirectional byte bridge between two established streams

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer size per pump direction; one read becomes at most one frame
/// on a message-channel endpoint.
pub const PUMP_BUFFER_SIZE: usize = 32 * 1024;

/// Copy bytes between two streams until either side closes.
///
/// Runs both directions concurrently. When one direction ends, by EOF or by
/// any read/write error, the other is abandoned and both endpoints are
/// dropped, which closes them and unblocks any read still pending on the
/// peer. Cancelling the returned future has the same effect. Byte order is
/// preserved within each direction; nothing is claimed across directions.
///
/// There is no application-level flow control here: backpressure comes from
/// the endpoints themselves.
pub async fn pump<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let a_to_b = async {
        let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match read_a.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if write_b.write_all(&buffer[..n]).await.is_err() {
                        break;
                    }
                    if write_b.flush().await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    trace!("pump read failed: {}", err);
                    break;
                }
            }
        }
        let _ = write_b.shutdown().await;
    };

    let b_to_a = async {
        let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match read_b.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if write_a.write_all(&buffer[..n]).await.is_err() {
                        break;
                    }
                    if write_a.flush().await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    trace!("pump read failed: {}", err);
                    break;
                }
            }
        }
        let _ = write_a.shutdown().await;
    };

    // Either direction ending tears the whole bridge down; the drop of both
    // halves closes the endpoints.
    tokio::select! {
        _ = a_to_b => {}
        _ = b_to_a => {}
    }
}
