use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::relay::{Relay, RelayOutcome};
use crate::store::{FetchPending, MarkProcessed};

/// A continuously running background trigger driving a [`Relay`].
///
/// Holds the handle to the spawned loop; the loop stays alive as long as
/// the `Trigger` exists or until the cancellation token fires.
pub struct Trigger {
    _handle: JoinHandle<()>,
}

/// Builder for creating a [`Trigger`].
pub struct TriggerBuilder {
    interval: Duration,
}

impl TriggerBuilder {
    /// Create a new `TriggerBuilder` firing at the specified interval.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start the trigger in the background.
    ///
    /// Each tick runs one [`Relay::execute`] cycle and awaits it before
    /// the next tick is honored, so runs never overlap. Ticks that fall
    /// due while a run is still in flight are skipped entirely, not
    /// queued. A failed run is logged and the loop carries on; the failed
    /// batch stays pending and is naturally retried on a later tick.
    pub fn start<D, B>(self, relay: Arc<Relay<D, B>>, cancel: CancellationToken) -> Trigger
    where
        D: FetchPending + MarkProcessed + Send + Sync + 'static,
        B: Broker + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match relay.execute(cancel.clone()).await {
                            Ok(RelayOutcome::Skipped) => {
                                tracing::debug!("relay run already in flight, tick skipped");
                            }
                            Ok(RelayOutcome::Idle) => {
                                tracing::debug!("no pending envelopes");
                            }
                            Ok(RelayOutcome::Completed { published, failed }) => {
                                tracing::debug!(published, failed, "relay run finished");
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "relay run failed, batch left pending");
                            }
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });

        Trigger { _handle: handle }
    }
}
