use std::time::Duration;

use entry_core::ResponseMessage;
use tokio::sync::oneshot;
use tracing::trace;

use crate::relay::ClientWriter;

/// Default spacing between PING frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Sends a PING every `interval` until `stop` fires.
///
/// Write failures are ignored: the beacon only keeps idle proxies from timing
/// the socket out, the relay loops are the ones that notice a dead client.
pub async fn run_heartbeat(writer: ClientWriter, interval: Duration, mut stop: oneshot::Receiver<()>) {
    let ping = ResponseMessage::ping();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = ticker.tick() => {
                // a client that stops reading can park the send forever
                tokio::select! {
                    _ = &mut stop => return,
                    sent = writer.send(&ping) => {
                        if let Err(err) = sent {
                            trace!(error = %err, "heartbeat write failed");
                        }
                    }
                }
            }
        }
    }
}
