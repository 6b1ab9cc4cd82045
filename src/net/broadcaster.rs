use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::message::Message;
use crate::metrics::Stats;
use crate::queue::MessageQueue;
use crate::registry::ClientRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Writes `msg` to every client registered at the time of the call.
/// Returns the number of successful deliveries.
pub fn broadcast(registry: &ClientRegistry, msg: &Message, stats: &Stats) -> usize {
    // Snapshot under the lock, write without it
    let recipients = registry.snapshot();
    let mut delivered = 0;
    for record in recipients {
        match record.send(msg.as_bytes()) {
            Ok(()) => {
                delivered += 1;
                Stats::bump(&stats.deliveries);
            }
            Err(e) => {
                // The client's own worker sees the closed socket and departs
                warn!(?e, client = %record.id, addr = %record.addr, "TCP write error");
                Stats::bump(&stats.write_failures);
                record.shutdown();
            }
        }
    }
    delivered
}

/// Drains the queue and fans every message out until `halt` is set.
pub fn run_broadcaster(
    queue: Arc<MessageQueue>,
    registry: Arc<ClientRegistry>,
    stats: Arc<Stats>,
    halt: Arc<AtomicBool>,
) -> Result<()> {
    while !halt.load(Ordering::Relaxed) {
        let Some(msg) = queue.dequeue_timeout(POLL_INTERVAL)? else {
            continue;
        };
        Stats::bump(&stats.messages_out);
        let delivered = broadcast(&registry, &msg, &stats);
        debug!(bytes = msg.len(), delivered, "Broadcast");
    }
    Ok(())
}
