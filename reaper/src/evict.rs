//! Evicts a single Pod, retrying while a PodDisruptionBudget holds it in place.
//!
//! Evictions are used rather than deletions so that PodDisruptionBudgets (PDBs) are respected.
use crate::cancel::CancelListener;
use crate::settings::Settings;
use models::cluster::{ClusterGateway, EvictionResponse, PodSnapshot};

use snafu::{ensure, ResultExt};
use std::convert::TryFrom;
use tokio::time::{sleep, Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{event, instrument, Level};

// When waiting for a PodDisruptionBudget to be satisfied we stall for a fixed rate between eviction attempts.
// `kubectl drain` similarly waits 5 seconds between eviction attempts.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// After an eviction is accepted, we poll for the Pod's deletion with exponential backoff: 500ms, 1s, 2s, ...
const CONFIRMATION_BACKOFF_BASE_MILLIS: u64 = 2;
const CONFIRMATION_BACKOFF_FACTOR: u64 = 250;
const CONFIRMATION_MAX_DELAY: Duration = Duration::from_secs(20);

/// The module-wide result type.
type Result<T> = std::result::Result<T, evict_error::Error>;

/// The grace period to request when evicting `pod`: the Pod's own, if it asks for less than `default`.
pub fn effective_grace_period(pod: &PodSnapshot, default: Duration) -> u32 {
    let default_seconds = u32::try_from(default.as_secs()).unwrap_or(u32::MAX);
    match pod.termination_grace_period_seconds {
        Some(seconds) if seconds < i64::from(default_seconds) => {
            u32::try_from(seconds.max(0)).unwrap_or(0)
        }
        _ => default_seconds,
    }
}

fn confirmation_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(CONFIRMATION_BACKOFF_BASE_MILLIS)
        .factor(CONFIRMATION_BACKOFF_FACTOR)
        .max_delay(CONFIRMATION_MAX_DELAY)
        .map(jitter)
}

#[derive(Clone)]
pub struct PodEvictor<G: ClusterGateway> {
    gateway: G,
    graceful_termination_default: Duration,
    post_eviction_wait_timeout: Duration,
}

impl<G: ClusterGateway> PodEvictor<G> {
    pub fn new(gateway: G, settings: &Settings) -> Self {
        PodEvictor {
            gateway,
            graceful_termination_default: settings.graceful_termination_default,
            post_eviction_wait_timeout: settings.post_eviction_wait_timeout,
        }
    }

    /// Evicts `pod`, returning once the Pod is known to be gone.
    ///
    /// A 429 (TOO_MANY_REQUESTS) response means we must wait for a PodDisruptionBudget to be satisfied. Those are
    /// retried indefinitely; only `cancel` ends the wait. It's possible for an eviction to become stuck this way due
    /// to PDBs that cannot be satisfied with the current cluster resources. The drain's deadline bounds that.
    /// See https://kubernetes.io/docs/tasks/administer-cluster/safely-drain-node/#stuck-evictions for details.
    ///
    /// `cancel` is checked before every attempt and interrupts any request or wait in progress.
    #[instrument(skip(self, pod, cancel), fields(pod = %pod.qualified_name()), err(level = "debug"))]
    pub async fn evict(&self, pod: &PodSnapshot, mut cancel: CancelListener) -> Result<()> {
        let grace_period_seconds =
            effective_grace_period(pod, self.graceful_termination_default);

        loop {
            ensure!(
                !cancel.is_raised(),
                evict_error::CancelledSnafu {
                    pod_name: pod.qualified_name(),
                }
            );

            event!(Level::INFO, grace_period_seconds, "Attempting to evict Pod.");
            let response = tokio::select! {
                response = self.gateway.evict_pod(&pod.namespace, &pod.name, grace_period_seconds) => {
                    response.context(evict_error::RejectedSnafu {
                        pod_name: pod.qualified_name(),
                    })?
                }
                _ = cancel.raised() => {
                    return evict_error::CancelledSnafu {
                        pod_name: pod.qualified_name(),
                    }
                    .fail();
                }
            };

            match response {
                EvictionResponse::NotFound => {
                    event!(Level::INFO, "Pod no longer exists; eviction complete.");
                    return Ok(());
                }
                EvictionResponse::Accepted => {
                    event!(Level::INFO, "Eviction accepted. Waiting for the Pod to be deleted.");
                    return self.confirm_deletion(pod, cancel).await;
                }
                EvictionResponse::TooManyRequests => {
                    event!(
                        Level::WARN,
                        "Too many requests when creating Eviction. This is likely due to respecting a Pod Disruption Budget. Retrying in {:.2}s.",
                        EVICTION_RETRY_INTERVAL.as_secs_f64()
                    );
                    tokio::select! {
                        _ = sleep(EVICTION_RETRY_INTERVAL) => {},
                        _ = cancel.raised() => {},
                    }
                }
            }
        }
    }

    /// Polls until the evicted Pod is gone, or `post_eviction_wait_timeout` passes.
    ///
    /// A Pod with the same name but a different uid is a replacement, so the evicted one is gone.
    async fn confirm_deletion(&self, pod: &PodSnapshot, mut cancel: CancelListener) -> Result<()> {
        let start_time = Instant::now();
        let mut delays = confirmation_backoff();

        loop {
            ensure!(
                !cancel.is_raised(),
                evict_error::CancelledSnafu {
                    pod_name: pod.qualified_name(),
                }
            );

            let lookup = tokio::select! {
                lookup = self.gateway.get_pod(&pod.namespace, &pod.name) => lookup,
                _ = cancel.raised() => {
                    return evict_error::CancelledSnafu {
                        pod_name: pod.qualified_name(),
                    }
                    .fail();
                }
            };
            match lookup {
                Ok(None) => {
                    event!(Level::INFO, "Pod deleted.");
                    return Ok(());
                }
                Ok(Some(current)) if is_replacement(pod, &current) => {
                    event!(Level::INFO, "Pod was replaced by a new instance; original deleted.");
                    return Ok(());
                }
                Ok(Some(_)) => {
                    event!(Level::DEBUG, "Pod not yet deleted.");
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        error = %err,
                        "Could not determine if Pod has been deleted."
                    );
                }
            }

            let elapsed = start_time.elapsed();
            ensure!(
                elapsed < self.post_eviction_wait_timeout,
                evict_error::UnconfirmedSnafu {
                    pod_name: pod.qualified_name(),
                    max_wait: self.post_eviction_wait_timeout,
                }
            );

            let delay = delays
                .next()
                .unwrap_or(CONFIRMATION_MAX_DELAY)
                .min(self.post_eviction_wait_timeout - elapsed);
            tokio::select! {
                _ = sleep(delay) => {},
                _ = cancel.raised() => {},
            }
        }
    }
}

fn is_replacement(evicted: &PodSnapshot, current: &PodSnapshot) -> bool {
    matches!(
        (evicted.uid.as_ref(), current.uid.as_ref()),
        (Some(evicted_uid), Some(current_uid)) if evicted_uid != current_uid
    )
}

pub mod evict_error {
    use models::cluster::ClusterError;
    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// The API refused the eviction for a reason other than a disruption budget. Not retried.
        Rejected {
            source: ClusterError,
            pod_name: String,
        },

        #[snafu(display("Eviction of Pod '{}' was cancelled", pod_name))]
        Cancelled { pod_name: String },

        #[snafu(display(
            "Eviction of Pod '{}' was accepted, but the Pod was not deleted in the time allocated ({:.2}s)",
            pod_name,
            max_wait.as_secs_f64()
        ))]
        /// The API accepted the eviction, but we could not confirm the Pod went away.
        Unconfirmed { pod_name: String, max_wait: Duration },
    }

    impl Error {
        pub fn is_cancellation(&self) -> bool {
            matches!(self, Self::Cancelled { .. })
        }
    }
}
