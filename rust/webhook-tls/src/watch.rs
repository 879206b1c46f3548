//! Long-lived, restartable subscription to a single Kubernetes object

use std::{cmp::min, future::Future, time::Duration};

use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::store::{self, ObjectStore};

/// Delay between reconnection attempts after the watch failed, doubling up to `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl WatchBackoff {
    fn next_delay(&self, current: Duration) -> Duration {
        min(current.saturating_mul(2), self.max)
    }
}

/// Feeds every observed version of the object `name` into `on_update` until `cancel` fires.
///
/// Transient watch failures are retried with `backoff`. The subscription only ends early with
/// an error if the store error is fatal (the API server rejecting our credentials), or if
/// `on_update` itself fails.
pub async fn watch_object<K, E, F, Fut>(
    store: &dyn ObjectStore<K>,
    name: &str,
    backoff: WatchBackoff,
    cancel: &CancellationToken,
    mut on_update: F,
) -> Result<(), E>
where
    K: Send + Sync,
    E: From<store::Error>,
    F: FnMut(K) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let mut delay = backoff.initial;
    loop {
        let mut events = store.watch(name);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.next() => event,
            };
            match event {
                Some(Ok(obj)) => {
                    delay = backoff.initial;
                    on_update(obj).await?;
                }
                Some(Err(err)) if err.is_fatal() => {
                    error!(
                        object = name,
                        error = &err as &dyn std::error::Error,
                        "watch failed permanently"
                    );
                    return Err(err.into());
                }
                Some(Err(err)) => {
                    warn!(
                        object = name,
                        error = &err as &dyn std::error::Error,
                        retry_in = ?delay,
                        "watch failed, backing off"
                    );
                    if sleep_or_cancel(delay, cancel).await {
                        return Ok(());
                    }
                    delay = backoff.next_delay(delay);
                }
                None => {
                    debug!(object = name, "watch stream ended, resubscribing");
                    break;
                }
            }
        }
        if sleep_or_cancel(delay, cancel).await {
            return Ok(());
        }
        delay = backoff.next_delay(delay);
    }
}

/// Sleeps for `duration`, returning `true` if `cancel` fired first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
