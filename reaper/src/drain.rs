//! Drains a Node of its evictable Pods, similar to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side: the Pods on a Node are listed, filtered, and evicted one by one.
//! Cordoning is not handled here; the harvest protocol does it before calling in.
use crate::cancel::{CancelListener, CancelSignal};
use crate::evict::{evict_error::Error as EvictionError, PodEvictor};
use crate::guard::EvictionGuard;
use crate::settings::Settings;
use models::cluster::{ClusterGateway, PodSnapshot};

use snafu::{ensure, ResultExt};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tracing::{event, instrument, Instrument, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, drain_error::Error>;

type EvictionTasks = JoinSet<std::result::Result<(), EvictionError>>;

// Once a drain is abandoned, cancelled evictions have this long to return before they are aborted.
const CANCELLATION_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Evicts every Pod the guard allows from a Node, all at once, under a single deadline.
#[derive(Clone)]
pub struct DrainCoordinator<G: ClusterGateway + 'static> {
    gateway: G,
    guard: EvictionGuard<G>,
    evictor: PodEvictor<G>,
    eviction_timeout: Duration,
    dry_run: bool,
}

impl<G: ClusterGateway + 'static> DrainCoordinator<G> {
    pub fn new(gateway: G, settings: &Settings) -> Self {
        DrainCoordinator {
            guard: EvictionGuard::new(gateway.clone(), settings),
            evictor: PodEvictor::new(gateway.clone(), settings),
            gateway,
            eviction_timeout: settings.eviction_timeout,
            dry_run: settings.dry_run,
        }
    }

    /// Drains `node_name`.
    ///
    /// The drain fails on the first eviction that fails, when `eviction_timeout` passes with evictions outstanding,
    /// or when `leadership` is revoked. In each case the remaining evictions are cancelled and awaited for up to
    /// `CANCELLATION_GRACE_PERIOD`, then aborted, so no eviction is still running once this returns.
    #[instrument(skip(self, leadership), err)]
    pub async fn drain(&self, node_name: &str, leadership: &CancelListener) -> Result<()> {
        if self.dry_run {
            event!(Level::INFO, "Dry run: not draining Node.");
            return Ok(());
        }

        let targets = self.find_target_pods(node_name).await?;
        ensure!(
            !leadership.is_raised(),
            drain_error::LeadershipLostSnafu { node_name }
        );

        event!(
            Level::INFO,
            pod_count = targets.len(),
            "Evicting Pods from Node."
        );

        let cancel = CancelSignal::new();
        let mut evictions = EvictionTasks::new();
        for pod in targets {
            let evictor = self.evictor.clone();
            let listener = cancel.listener();
            evictions.spawn(async move { evictor.evict(&pod, listener).await }.in_current_span());
        }

        let outcome = self
            .await_evictions(&mut evictions, node_name, leadership.clone())
            .await;

        if outcome.is_err() {
            cancel.raise();
            if timeout(CANCELLATION_GRACE_PERIOD, wind_down(&mut evictions))
                .await
                .is_err()
            {
                event!(
                    Level::WARN,
                    remaining = evictions.len(),
                    "Evictions did not stop after cancellation; aborting them."
                );
                evictions.shutdown().await;
            }
        }

        outcome
    }

    /// Lists the Pods on `node_name` that the guard allows us to evict.
    async fn find_target_pods(&self, node_name: &str) -> Result<Vec<PodSnapshot>> {
        let pods = self
            .gateway
            .list_pods(node_name)
            .await
            .context(drain_error::ListPodsSnafu { node_name })?;

        let mut targets = Vec::with_capacity(pods.len());
        for pod in pods {
            if self
                .guard
                .may_evict(&pod)
                .await
                .context(drain_error::GuardSnafu { node_name })?
            {
                targets.push(pod);
            }
        }
        Ok(targets)
    }

    /// Waits for every eviction to succeed, returning early on the first failure, the deadline, or lost leadership.
    async fn await_evictions(
        &self,
        evictions: &mut EvictionTasks,
        node_name: &str,
        mut leadership: CancelListener,
    ) -> Result<()> {
        let deadline = sleep(self.eviction_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = evictions.join_next() => match joined {
                    None => {
                        event!(Level::INFO, "All evictions complete.");
                        return Ok(());
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(source))) => {
                        return Err(source).context(drain_error::EvictionSnafu { node_name });
                    }
                    Some(Err(source)) => {
                        return Err(source).context(drain_error::EvictionTaskSnafu { node_name });
                    }
                },
                _ = &mut deadline => {
                    return drain_error::TimeoutSnafu {
                        node_name,
                        timeout: self.eviction_timeout,
                    }
                    .fail();
                }
                _ = leadership.raised() => {
                    return drain_error::LeadershipLostSnafu { node_name }.fail();
                }
            }
        }
    }
}

/// Awaits every cancelled eviction. Failures other than the cancellation itself are logged.
async fn wind_down(evictions: &mut EvictionTasks) {
    while let Some(joined) = evictions.join_next().await {
        if let Ok(Err(err)) = joined {
            if !err.is_cancellation() {
                event!(Level::WARN, error = %err, "Eviction failed while the drain was being abandoned.");
            }
        }
    }
}

pub mod drain_error {
    use crate::evict::evict_error;
    use crate::guard::guard_error;
    use models::cluster::ClusterError;
    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to find Pods to drain on Node '{}': '{}'", node_name, source))]
        ListPods {
            source: ClusterError,
            node_name: String,
        },

        #[snafu(display("Unable to select Pods to drain on Node '{}': '{}'", node_name, source))]
        Guard {
            source: guard_error::Error,
            node_name: String,
        },

        #[snafu(display(
            "Pods on Node '{}' were not evicted in the time allocated ({:.2}s)",
            node_name,
            timeout.as_secs_f64()
        ))]
        Timeout { node_name: String, timeout: Duration },

        #[snafu(display("Failed to drain Node '{}': '{}'", node_name, source))]
        Eviction {
            source: evict_error::Error,
            node_name: String,
        },

        #[snafu(display("Eviction task for Node '{}' did not complete: '{}'", node_name, source))]
        EvictionTask {
            source: tokio::task::JoinError,
            node_name: String,
        },

        #[snafu(display("Leadership was lost while draining Node '{}'", node_name))]
        LeadershipLost { node_name: String },
    }
}
