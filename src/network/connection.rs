//! Per-socket reader and writer workers.
//!
//! Each session gets one reader and one writer task. The reader decodes
//! lines into messages and forwards them to the dispatcher; the writer
//! drains a bounded outbound queue. Neither ever touches shared state.

use std::time::Duration;

use futures_util::StreamExt;
use petrel_proto::Message;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

use crate::event::{ConnId, Event};

/// Outbound queue depth per connection. Deep enough that it only fills
/// when the peer has stopped reading; overflow is a terminal condition.
pub const SEND_QUEUE_LEN: usize = 32 * 1024;

/// How long a writer pauses after a write error before closing, giving
/// the reader a chance to drain whatever the peer still sent.
const WRITE_ERROR_LINGER: Duration = Duration::from_secs(5);

/// Create the outbound queue for a connection. The sender goes to the
/// dispatcher (which enqueues with `try_send`), the receiver to
/// [`spawn`].
pub fn outbound_queue() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    mpsc::channel(SEND_QUEUE_LEN)
}

/// Spawn the reader and writer for an established stream.
///
/// The caller must have announced the connection to the dispatcher
/// already; the reader starts producing message events immediately. When
/// the dispatcher drops its sender the writer drains out and closes the
/// socket.
pub fn spawn<S>(
    stream: S,
    conn: ConnId,
    events: mpsc::Sender<Event>,
    mut shutdown: broadcast::Receiver<()>,
    dead_time: Duration,
    outbound: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut rx = outbound;

    // Reader: line in, event out. A line over the protocol limit or a
    // read deadline both end the connection.
    tokio::spawn(async move {
        let codec = LinesCodec::new_with_max_length(petrel_proto::MAX_LINE_LEN);
        let mut lines = FramedRead::new(read_half, codec);

        loop {
            let line = match tokio::time::timeout(dead_time, lines.next()).await {
                Ok(Some(Ok(line))) => line,
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    debug!(conn = %conn, "overlong line, dropping connection");
                    break;
                }
                Ok(Some(Err(e))) => {
                    debug!(conn = %conn, error = %e, "read error");
                    break;
                }
                // EOF or deadline.
                Ok(None) => break,
                Err(_) => {
                    debug!(conn = %conn, "read deadline expired");
                    break;
                }
            };

            let msg: Message = match line.parse() {
                Ok(msg) => msg,
                // Empty lines are tolerated; anything else malformed is not.
                Err(petrel_proto::ParseError::Empty) => continue,
                Err(e) => {
                    debug!(conn = %conn, error = %e, "unparseable line");
                    break;
                }
            };

            trace!(conn = %conn, msg = %msg, "received");
            if events
                .send(Event::MessageFromClient { conn, msg })
                .await
                .is_err()
            {
                break;
            }
        }

        let _ = events.send(Event::DeadClient { conn }).await;
        debug!(conn = %conn, "reader done");
    });

    // Writer: drains the outbound queue until the dispatcher drops the
    // sender or shutdown is broadcast.
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            let line = match msg.encode() {
                Ok(line) => line,
                Err(e) => {
                    debug!(conn = %conn, error = %e, "dropping unencodable message");
                    continue;
                }
            };

            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                debug!(conn = %conn, error = %e, "write error");
                tokio::time::sleep(WRITE_ERROR_LINGER).await;
                break;
            }
        }

        let _ = write_half.shutdown().await;
        debug!(conn = %conn, "writer done");
    });
}
