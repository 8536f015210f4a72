use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use super::config::Config;
use super::connection::ConnectionState;
use crate::protocol::{self, ClientCommand};

/// Tracks liveness of the status feed via periodic probes.
///
/// The monitor runs only while the connection is `Connected` and stops as
/// soon as the state leaves it. By default a missing acknowledgment is only
/// recorded; enforcement is opt-in via [`Config::heartbeat_timeout`].
#[derive(Debug)]
pub struct HeartbeatMonitor {
    last_ack_tx: watch::Sender<Option<Instant>>,
}

impl HeartbeatMonitor {
    pub(crate) fn new() -> Self {
        let (last_ack_tx, _) = watch::channel(None);
        Self { last_ack_tx }
    }

    /// Record a probe acknowledgment. Updates even while the probe loop is
    /// not running, so acknowledgments are never lost to a disabled loop.
    pub(crate) fn record_ack(&self) {
        _ = self.last_ack_tx.send_replace(Some(Instant::now()));
    }

    /// When the most recent acknowledgment arrived, if any arrived this
    /// process lifetime.
    #[must_use]
    pub fn last_ack(&self) -> Option<Instant> {
        *self.last_ack_tx.borrow()
    }

    /// Spawn the probe loop for one session.
    ///
    /// Probes are written through `outbound`, the session's sender channel.
    /// With an enforced deadline, a missed acknowledgment is signalled on
    /// `stale_tx` and the loop ends; the session loop turns that into an
    /// abnormal close. Returns `None` when the probe interval is zero
    /// (heartbeat disabled).
    pub(crate) fn start(
        &self,
        config: &Config,
        outbound: mpsc::UnboundedSender<String>,
        state_rx: watch::Receiver<ConnectionState>,
        stale_tx: mpsc::UnboundedSender<()>,
    ) -> Option<JoinHandle<()>> {
        if config.heartbeat_interval.is_zero() {
            return None;
        }

        let mut ack_rx = self.last_ack_tx.subscribe();
        let probe_period = config.heartbeat_interval;
        let ack_deadline = config.heartbeat_timeout;

        Some(tokio::spawn(async move {
            let mut probe_interval = interval(probe_period);
            // The first tick completes immediately; consume it so probing
            // starts one interval after the connection opens.
            probe_interval.tick().await;

            loop {
                probe_interval.tick().await;

                if !state_rx.borrow().is_connected() {
                    break;
                }

                // Mark the current acknowledgment as seen before probing so
                // changed() cannot fire on a stale one.
                drop(ack_rx.borrow_and_update());

                let Ok(probe) = protocol::encode(&ClientCommand::ping()) else {
                    break;
                };
                if outbound.send(probe).is_err() {
                    // Session loop has terminated
                    break;
                }

                let Some(deadline) = ack_deadline else {
                    continue;
                };

                match timeout(deadline, ack_rx.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        // Channel closed, connection is terminating
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(
                            ?deadline,
                            "heartbeat timeout: no acknowledgment within deadline"
                        );
                        _ = stale_tx.send(());
                        break;
                    }
                }
            }
        }))
    }
}
