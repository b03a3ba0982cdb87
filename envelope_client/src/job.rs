// job.rs: fixed-interval sender
use std::time::Duration;

use chrono::Utc;
use envelope_core::SecureClient;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn periodic_message(client_id: &str, millis: i64) -> String {
    format!("Mensagem do cliente {client_id} - {millis}")
}

/// Sends one timestamped message per tick, the first immediately. A failed
/// send is logged and the next tick proceeds. Resolves to the number of
/// successful exchanges once `count` is reached or `shutdown` fires.
pub fn spawn_periodic_sender(
    client: SecureClient,
    every: Duration,
    client_id: String,
    count: Option<u64>,
    shutdown: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut tick = time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0u64;
        let mut delivered = 0u64;
        loop {
            if count.is_some_and(|n| attempts >= n) {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            attempts += 1;
            let message = periodic_message(&client_id, Utc::now().timestamp_millis());
            // a slow exchange still yields to shutdown
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = client.send(&message) => match result {
                    Ok(reply) => {
                        delivered += 1;
                        info!(%reply, "server replied");
                    }
                    Err(e) => warn!(error = %e, attempt = attempts, "periodic send failed"),
                }
            }
        }
        info!(attempts, delivered, "periodic sender stopped");
        delivered
    })
}
