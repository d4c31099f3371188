//! Walks a single Node through mark, cordon, delay and drain.
//!
//! A harvested Node is left cordoned and empty. Deleting it is left to whoever owns the Node's lifecycle.
use crate::cancel::CancelListener;
use crate::drain::DrainCoordinator;
use crate::settings::Settings;
use models::cluster::ClusterGateway;

use serde::Serialize;
use snafu::ResultExt;
use std::fmt;
use tokio::time::{sleep, Duration};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{event, instrument, Level};

// Marking a Node is idempotent, so failures are retried with exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const NUM_RETRIES: usize = 5;

/// The module-wide result type.
type Result<T> = std::result::Result<T, harvest_error::Error>;

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(NUM_RETRIES)
}

/// The step of the harvest protocol a Node was in when it failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HarvestStage {
    Mark,
    Cordon,
    Delay,
    Drain,
}

impl fmt::Display for HarvestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            HarvestStage::Mark => "mark",
            HarvestStage::Cordon => "cordon",
            HarvestStage::Delay => "delay",
            HarvestStage::Drain => "drain",
        };
        write!(f, "{}", stage)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum HarvestOutcome {
    Succeeded,
    Failed { stage: HarvestStage, reason: String },
}

impl HarvestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HarvestOutcome::Succeeded)
    }
}

#[derive(Clone)]
pub struct Harvester<G: ClusterGateway + 'static> {
    gateway: G,
    drainer: DrainCoordinator<G>,
    delay_after_cordon: Duration,
    dry_run: bool,
}

impl<G: ClusterGateway + 'static> Harvester<G> {
    pub fn new(gateway: G, settings: &Settings) -> Self {
        Harvester {
            drainer: DrainCoordinator::new(gateway.clone(), settings),
            gateway,
            delay_after_cordon: settings.delay_after_cordon,
            dry_run: settings.dry_run,
        }
    }

    /// Harvests `node_name`. Failures are reported in the outcome, never raised.
    pub async fn harvest(&self, node_name: &str, leadership: &CancelListener) -> HarvestOutcome {
        match self.run_protocol(node_name, leadership).await {
            Ok(()) => {
                event!(Level::INFO, node = node_name, "Node harvested.");
                HarvestOutcome::Succeeded
            }
            Err(err) => HarvestOutcome::Failed {
                stage: err.stage(),
                reason: err.to_string(),
            },
        }
    }

    #[instrument(skip(self, leadership), err)]
    async fn run_protocol(&self, node_name: &str, leadership: &CancelListener) -> Result<()> {
        self.mark(node_name).await?;
        self.cordon(node_name).await?;
        self.wait_after_cordon(node_name, leadership.clone()).await?;
        self.drainer
            .drain(node_name, leadership)
            .await
            .context(harvest_error::DrainSnafu { node_name })
    }

    async fn mark(&self, node_name: &str) -> Result<()> {
        if self.dry_run {
            event!(Level::INFO, "Dry run: not marking Node for harvest.");
            return Ok(());
        }

        let gateway = &self.gateway;
        Retry::spawn(retry_strategy(), || async move {
            gateway.mark_for_drain(node_name).await.map_err(|err| {
                event!(Level::WARN, error = %err, "Unable to mark Node for harvest.");
                err
            })
        })
        .await
        .context(harvest_error::MarkSnafu { node_name })
    }

    async fn cordon(&self, node_name: &str) -> Result<()> {
        if self.dry_run {
            event!(Level::INFO, "Dry run: not cordoning Node.");
            return Ok(());
        }

        self.gateway
            .cordon(node_name)
            .await
            .context(harvest_error::CordonSnafu { node_name })
    }

    /// Gives workloads a head start on the cordon before they are evicted.
    async fn wait_after_cordon(&self, node_name: &str, mut leadership: CancelListener) -> Result<()> {
        if self.dry_run || self.delay_after_cordon.is_zero() {
            return Ok(());
        }

        event!(
            Level::INFO,
            "Waiting {:.2}s before draining Node.",
            self.delay_after_cordon.as_secs_f64()
        );
        tokio::select! {
            _ = sleep(self.delay_after_cordon) => Ok(()),
            _ = leadership.raised() => harvest_error::LeadershipLostSnafu { node_name }.fail(),
        }
    }
}

pub mod harvest_error {
    use super::HarvestStage;
    use crate::drain::drain_error;
    use models::cluster::ClusterError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to mark Node '{}' for harvest: '{}'", node_name, source))]
        Mark {
            source: ClusterError,
            node_name: String,
        },

        #[snafu(display("Unable to cordon Node '{}': '{}'", node_name, source))]
        Cordon {
            source: ClusterError,
            node_name: String,
        },

        #[snafu(display("Leadership was lost before draining Node '{}'", node_name))]
        LeadershipLost { node_name: String },

        #[snafu(display("{}", source))]
        Drain {
            source: drain_error::Error,
            node_name: String,
        },
    }

    impl Error {
        pub fn stage(&self) -> HarvestStage {
            match self {
                Error::Mark { .. } => HarvestStage::Mark,
                Error::Cordon { .. } => HarvestStage::Cordon,
                Error::LeadershipLost { .. } => HarvestStage::Delay,
                Error::Drain { .. } => HarvestStage::Drain,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::guard::tests::api_error;
    use models::cluster::{ClusterError, EvictionResponse, MockClusterGateway, PodSnapshot};
    use mockall::Sequence;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn settings() -> Settings {
        Settings {
            delay_after_cordon: Duration::from_secs(60),
            eviction_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    fn harvester_with(
        settings: &Settings,
        setup: impl FnOnce(&mut MockClusterGateway),
    ) -> Harvester<Arc<MockClusterGateway>> {
        let mut gateway = MockClusterGateway::new();
        setup(&mut gateway);
        Harvester::new(Arc::new(gateway), settings)
    }

    fn mark_failure(node_name: &str) -> ClusterError {
        ClusterError::MarkNode {
            source: api_error(409),
            node_name: node_name.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn steps_run_in_order_with_the_post_cordon_delay() {
        let harvester = harvester_with(&settings(), |gateway| {
            let mut seq = Sequence::new();
            gateway
                .expect_mark_for_drain()
                .withf(|node_name: &str| node_name == "node-a")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            gateway
                .expect_cordon()
                .withf(|node_name: &str| node_name == "node-a")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            gateway
                .expect_list_pods()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(vec![PodSnapshot::new("web", "web-0")]));
            gateway
                .expect_evict_pod()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(EvictionResponse::NotFound));
        });

        let started = Instant::now();
        let outcome = harvester.harvest("node-a", &CancelListener::never()).await;

        assert_eq!(outcome, HarvestOutcome::Succeeded);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn marking_is_retried() {
        let harvester = harvester_with(&settings(), |gateway| {
            let mut seq = Sequence::new();
            gateway
                .expect_mark_for_drain()
                .times(2)
                .in_sequence(&mut seq)
                .returning(|node_name| Err(mark_failure(node_name)));
            gateway
                .expect_mark_for_drain()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
            gateway.expect_cordon().times(1).returning(|_| Ok(()));
            gateway.expect_list_pods().times(1).returning(|_| Ok(vec![]));
        });

        let outcome = harvester.harvest("node-a", &CancelListener::never()).await;
        assert!(outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn marking_gives_up_and_the_node_is_left_untouched() {
        let harvester = harvester_with(&settings(), |gateway| {
            gateway
                .expect_mark_for_drain()
                .times(NUM_RETRIES + 1)
                .returning(|node_name| Err(mark_failure(node_name)));
            gateway.expect_cordon().never();
        });

        let outcome = harvester.harvest("node-a", &CancelListener::never()).await;
        assert!(matches!(
            outcome,
            HarvestOutcome::Failed { stage: HarvestStage::Mark, .. }
        ));
    }

    #[tokio::test]
    async fn cordon_failures_are_not_retried() {
        let harvester = harvester_with(&settings(), |gateway| {
            gateway.expect_mark_for_drain().times(1).returning(|_| Ok(()));
            gateway.expect_cordon().times(1).returning(|node_name| {
                Err(ClusterError::CordonNode {
                    source: api_error(403),
                    node_name: node_name.to_string(),
                })
            });
            gateway.expect_list_pods().never();
        });

        let outcome = harvester.harvest("node-a", &CancelListener::never()).await;
        match outcome {
            HarvestOutcome::Failed { stage, reason } => {
                assert_eq!(stage, HarvestStage::Cordon);
                assert!(reason.contains("node-a"), "{}", reason);
            }
            other => panic!("expected a cordon failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_leadership_ends_the_delay_early() {
        let harvester = harvester_with(&settings(), |gateway| {
            gateway.expect_mark_for_drain().returning(|_| Ok(()));
            gateway.expect_cordon().returning(|_| Ok(()));
            gateway.expect_list_pods().never();
        });
        let leadership = CancelSignal::new();
        let listener = leadership.listener();

        let started = Instant::now();
        let harvest = tokio::spawn(async move { harvester.harvest("node-a", &listener).await });
        sleep(Duration::from_secs(10)).await;
        leadership.raise();

        let outcome = harvest.await.unwrap();
        assert!(matches!(
            outcome,
            HarvestOutcome::Failed { stage: HarvestStage::Delay, .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn dry_run_makes_no_cluster_calls() {
        let settings = Settings {
            dry_run: true,
            ..settings()
        };
        let harvester = harvester_with(&settings, |_| {});

        let outcome = harvester.harvest("node-a", &CancelListener::never()).await;
        assert_eq!(outcome, HarvestOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_failures_leave_the_node_cordoned() {
        let settings = Settings {
            delay_after_cordon: Duration::ZERO,
            ..settings()
        };
        let harvester = harvester_with(&settings, |gateway| {
            gateway.expect_mark_for_drain().returning(|_| Ok(()));
            gateway.expect_cordon().times(1).returning(|_| Ok(()));
            gateway
                .expect_list_pods()
                .returning(|_| Ok(vec![PodSnapshot::new("web", "web-0")]));
            gateway
                .expect_evict_pod()
                .returning(|_, _, _| Ok(EvictionResponse::TooManyRequests));
        });

        let outcome = harvester.harvest("node-a", &CancelListener::never()).await;
        match outcome {
            HarvestOutcome::Failed { stage, reason } => {
                assert_eq!(stage, HarvestStage::Drain);
                assert!(reason.contains("time allocated"), "{}", reason);
            }
            other => panic!("expected a drain failure, got {:?}", other),
        }
    }

    #[test]
    fn outcomes_serialize_with_their_stage() {
        let outcome = HarvestOutcome::Failed {
            stage: HarvestStage::Cordon,
            reason: "forbidden".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"result": "failed", "stage": "cordon", "reason": "forbidden"})
        );
        assert_eq!(
            serde_json::to_value(HarvestOutcome::Succeeded).unwrap(),
            serde_json::json!({"result": "succeeded"})
        );
    }
}
