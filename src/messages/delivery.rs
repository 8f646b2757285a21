//! Reply delivery coordinator.
//!
//! A single background task drains the global [`DeliveryQueue`] and hands
//! replies to the mesh transport. Consecutive send attempts, across every
//! destination and trigger, are at least `spacing` apart. A failed send keeps
//! its place at the head of the queue until its attempt budget runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::logging::preview;
use crate::messages::queue::DeliveryQueue;
use crate::messages::transport::MeshTransport;

/// Minimum gap between two transmissions on the shared radio channel
pub const DEFAULT_SPACING: Duration = Duration::from_secs(30);

/// Total attempts per reply, first send included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Idle wake-up, in case a notification is missed
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pacing and retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    pub spacing: Duration,
    pub max_attempts: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            spacing: DEFAULT_SPACING,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Run the delivery coordinator until shutdown.
///
/// Anything still queued at shutdown stays in the queue.
pub async fn delivery_loop(
    queue: Arc<DeliveryQueue>,
    transport: Arc<dyn MeshTransport>,
    settings: DeliverySettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_attempts = settings.max_attempts.max(1);
    let mut last_attempt: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if queue.is_empty() {
            tokio::select! {
                _ = queue.notifier().notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
            continue;
        }

        if let Some(last) = last_attempt {
            let ready_at = last + settings.spacing;
            if Instant::now() < ready_at {
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        // Evictions may have emptied the queue while we waited
        let Some(mut envelope) = queue.pop() else {
            continue;
        };

        last_attempt = Some(Instant::now());
        let attempt = envelope.attempts + 1;
        match transport.send(envelope.destination, &envelope.text).await {
            Ok(()) => {
                queue.record_sent();
                info!(
                    id = %envelope.id,
                    node = %envelope.destination,
                    trigger_id = envelope.trigger_id.as_deref().unwrap_or("-"),
                    sequence = envelope.sequence,
                    batch_size = envelope.batch_size,
                    attempt,
                    "reply sent"
                );
            }
            Err(e) => {
                envelope.mark_failed(e.to_string());
                if envelope.can_retry(max_attempts) {
                    queue.record_retry();
                    warn!(
                        id = %envelope.id,
                        node = %envelope.destination,
                        attempt,
                        max_attempts,
                        error = %e,
                        "reply send failed, will retry"
                    );
                    queue.push_front(envelope);
                } else {
                    queue.record_dropped();
                    warn!(
                        id = %envelope.id,
                        node = %envelope.destination,
                        attempts = envelope.attempts,
                        error = %e,
                        text = %preview(&envelope.text, 40),
                        "reply dropped after exhausting attempts"
                    );
                }
            }
        }
    }

    debug!(pending = queue.len(), "delivery loop stopped");
}
