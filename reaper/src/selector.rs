//! Chooses which Nodes to harvest in a pass.
use crate::settings::Settings;
use models::cluster::{ClusterGateway, NodeSnapshot};

use serde::Serialize;
use snafu::ResultExt;
use std::collections::HashSet;
use std::convert::TryFrom;
use tracing::{event, instrument, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, selector_error::Error>;

/// Nodes chosen in a pass, in the order they were considered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Selection {
    /// Nodes to harvest.
    pub reap: Vec<String>,
    /// Nodes that would have been harvested, but host a deal-breaker Pod.
    pub passover: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.reap.is_empty() && self.passover.is_empty()
    }
}

/// How many of `node_count` Nodes may be harvested in one pass.
///
/// The fraction is rounded down, then clamped so that at least `min_nodes` remain and at most
/// `max_nodes_delete` are taken.
pub fn harvest_target(node_count: usize, settings: &Settings) -> usize {
    let node_count = i64::try_from(node_count).unwrap_or(i64::MAX);
    let min_nodes = i64::from(settings.min_nodes);
    let max_nodes_delete = i64::from(settings.max_nodes_delete);

    let mut target = (settings.fraction_nodes_to_delete * node_count as f64).floor() as i64;
    if node_count - target < min_nodes {
        target = node_count - min_nodes;
    }
    if target > max_nodes_delete {
        target = max_nodes_delete;
    }
    usize::try_from(target).unwrap_or(0)
}

#[derive(Clone)]
pub struct NodeSelector<G: ClusterGateway> {
    gateway: G,
    settings: Settings,
}

impl<G: ClusterGateway> NodeSelector<G> {
    pub fn new(gateway: G, settings: &Settings) -> Self {
        NodeSelector {
            gateway,
            settings: settings.clone(),
        }
    }

    /// Picks the oldest Nodes, up to the harvest target, skipping Nodes that host a deal-breaker Pod.
    ///
    /// Nothing is mutated here. A failed query fails the whole selection.
    #[instrument(skip(self), err)]
    pub async fn select(&self) -> Result<Selection> {
        let nodes = self
            .gateway
            .list_nodes(&self.settings.node_label_selector)
            .await
            .context(selector_error::ListNodesSnafu)?;

        // Stable, so Nodes created at the same instant keep their listed order.
        let mut candidates: Vec<&NodeSnapshot> = nodes.iter().collect();
        candidates.sort_by_key(|node| node.created);
        let mut seen = HashSet::new();
        candidates.retain(|node| seen.insert(node.name.as_str()));

        let target = harvest_target(candidates.len(), &self.settings);
        event!(
            Level::INFO,
            node_count = candidates.len(),
            target,
            "Computed harvest target."
        );

        let mut selection = Selection::default();
        if target == 0 {
            return Ok(selection);
        }

        for node in candidates {
            if selection.reap.len() == target {
                break;
            }

            if self.hosts_deal_breaker(&node.name).await? {
                event!(
                    Level::INFO,
                    node = %node.name,
                    "Passing over Node: it hosts a deal-breaker Pod."
                );
                selection.passover.push(node.name.clone());
            } else {
                selection.reap.push(node.name.clone());
            }
        }

        event!(
            Level::INFO,
            reap = ?selection.reap,
            passover = ?selection.passover,
            "Selected Nodes for harvest."
        );
        Ok(selection)
    }

    async fn hosts_deal_breaker(&self, node_name: &str) -> Result<bool> {
        let selector = &self.settings.deal_breaker_pod_selector;
        if selector.is_empty() {
            return Ok(false);
        }

        self.gateway
            .has_pods_matching(node_name, selector)
            .await
            .context(selector_error::DealBreakerQuerySnafu { node_name })
    }
}

pub mod selector_error {
    use models::cluster::ClusterError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list Nodes: '{}'", source))]
        ListNodes { source: ClusterError },

        #[snafu(display(
            "Unable to check Node '{}' for deal-breaker Pods: '{}'",
            node_name,
            source
        ))]
        DealBreakerQuery {
            source: ClusterError,
            node_name: String,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::tests::api_error;
    use chrono::{Duration, TimeZone, Utc};
    use models::cluster::{ClusterError, MockClusterGateway};
    use std::sync::Arc;

    /// `count` Nodes named `node-<age rank>`, where `node-0` is the oldest, listed newest first.
    fn cluster(count: usize) -> Vec<NodeSnapshot> {
        let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .rev()
            .map(|rank| {
                NodeSnapshot::new(
                    format!("node-{}", rank),
                    epoch + Duration::minutes(rank as i64),
                )
            })
            .collect()
    }

    fn scenario_settings() -> Settings {
        Settings {
            fraction_nodes_to_delete: 0.1,
            min_nodes: 18,
            max_nodes_delete: 5,
            ..Default::default()
        }
    }

    fn selector_with(
        settings: &Settings,
        setup: impl FnOnce(&mut MockClusterGateway),
    ) -> NodeSelector<Arc<MockClusterGateway>> {
        let mut gateway = MockClusterGateway::new();
        setup(&mut gateway);
        NodeSelector::new(Arc::new(gateway), settings)
    }

    #[test]
    fn target_respects_both_bounds() {
        for node_count in 0..60 {
            for min_nodes in 1..8 {
                for max_nodes_delete in 0..6 {
                    for fraction in [0.0, 0.05, 0.1, 0.5, 0.99] {
                        let settings = Settings {
                            min_nodes,
                            max_nodes_delete,
                            fraction_nodes_to_delete: fraction,
                            ..Default::default()
                        };
                        let target = harvest_target(node_count, &settings);

                        assert!(target <= max_nodes_delete as usize);
                        assert!(target <= node_count);
                        if node_count >= min_nodes as usize {
                            assert!(node_count - target >= min_nodes as usize);
                        } else {
                            assert_eq!(target, 0);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn target_examples() {
        assert_eq!(harvest_target(20, &scenario_settings()), 2);
        assert_eq!(harvest_target(0, &scenario_settings()), 0);
        // 5% of 100 is 5, but only 2 may go per pass.
        assert_eq!(harvest_target(100, &Settings::default()), 2);
        // 5% of 10 rounds down to nothing.
        assert_eq!(harvest_target(10, &Settings::default()), 0);
    }

    #[tokio::test]
    async fn oldest_nodes_are_reaped_first() {
        let selector = selector_with(&scenario_settings(), |gateway| {
            gateway
                .expect_list_nodes()
                .times(1)
                .returning(|_| Ok(cluster(20)));
            // No deal-breaker selector, so no Pod queries.
            gateway.expect_has_pods_matching().never();
        });

        let selection = selector.select().await.unwrap();
        assert_eq!(selection.reap, vec!["node-0", "node-1"]);
        assert!(selection.passover.is_empty());
    }

    #[tokio::test]
    async fn nodes_hosting_deal_breakers_are_passed_over() {
        let settings = Settings {
            deal_breaker_pod_selector: "app=singleton".to_string(),
            ..scenario_settings()
        };
        let selector = selector_with(&settings, |gateway| {
            gateway.expect_list_nodes().returning(|_| Ok(cluster(20)));
            gateway
                .expect_has_pods_matching()
                .withf(|_: &str, selector: &str| selector == "app=singleton")
                .times(3)
                .returning(|node_name, _| Ok(node_name == "node-0"));
        });

        let selection = selector.select().await.unwrap();
        assert_eq!(selection.passover, vec!["node-0"]);
        assert_eq!(selection.reap, vec!["node-1", "node-2"]);
    }

    #[tokio::test]
    async fn equal_creation_times_keep_listed_order() {
        let settings = Settings {
            min_nodes: 1,
            max_nodes_delete: 2,
            fraction_nodes_to_delete: 0.5,
            ..Default::default()
        };
        let selector = selector_with(&settings, |gateway| {
            gateway.expect_list_nodes().returning(|_| {
                let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
                Ok(vec![
                    NodeSnapshot::new("zeta", created),
                    NodeSnapshot::new("alpha", created),
                    NodeSnapshot::new("mu", created),
                    NodeSnapshot::new("beta", created),
                ])
            });
        });

        let selection = selector.select().await.unwrap();
        assert_eq!(selection.reap, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn duplicate_listings_are_considered_once() {
        let settings = Settings {
            min_nodes: 1,
            max_nodes_delete: 3,
            fraction_nodes_to_delete: 0.9,
            ..Default::default()
        };
        let selector = selector_with(&settings, |gateway| {
            gateway.expect_list_nodes().returning(|_| {
                let mut nodes = cluster(3);
                nodes.push(nodes[2].clone());
                Ok(nodes)
            });
        });

        // Three distinct Nodes: the target is floor(0.9 * 3), not floor(0.9 * 4).
        let selection = selector.select().await.unwrap();
        assert_eq!(selection.reap, vec!["node-0", "node-1"]);
    }

    #[tokio::test]
    async fn duplicate_listings_do_not_raise_the_target() {
        let settings = Settings {
            min_nodes: 3,
            max_nodes_delete: 3,
            fraction_nodes_to_delete: 0.5,
            ..Default::default()
        };
        let selector = selector_with(&settings, |gateway| {
            gateway.expect_list_nodes().returning(|_| {
                let mut nodes = cluster(3);
                nodes.push(nodes[0].clone());
                Ok(nodes)
            });
            gateway.expect_has_pods_matching().never();
        });

        let selection = selector.select().await.unwrap();
        assert!(selection.is_empty());
    }

    #[tokio::test]
    async fn small_clusters_are_left_alone() {
        let settings = Settings {
            node_label_selector: "pool=batch".to_string(),
            ..scenario_settings()
        };
        let selector = selector_with(&settings, |gateway| {
            gateway
                .expect_list_nodes()
                .withf(|label_selector: &str| label_selector == "pool=batch")
                .times(1)
                .returning(|_| Ok(cluster(18)));
        });

        let selection = selector.select().await.unwrap();
        assert!(selection.is_empty());
    }

    #[tokio::test]
    async fn empty_cluster_selects_nothing() {
        let selector = selector_with(&scenario_settings(), |gateway| {
            gateway.expect_list_nodes().returning(|_| Ok(vec![]));
        });

        assert_eq!(selector.select().await.unwrap(), Selection::default());
    }

    #[tokio::test]
    async fn deal_breaker_query_failures_abort_the_selection() {
        let settings = Settings {
            deal_breaker_pod_selector: "app=singleton".to_string(),
            ..scenario_settings()
        };
        let selector = selector_with(&settings, |gateway| {
            gateway.expect_list_nodes().returning(|_| Ok(cluster(20)));
            gateway
                .expect_has_pods_matching()
                .times(1)
                .returning(|node_name, _| {
                    Err(ClusterError::ListPods {
                        source: api_error(500),
                        node_name: node_name.to_string(),
                    })
                });
        });

        let result = selector.select().await;
        assert!(matches!(
            result,
            Err(selector_error::Error::DealBreakerQuery { ref node_name, .. }) if node_name == "node-0"
        ));
    }

    #[tokio::test]
    async fn node_listing_failures_abort_the_selection() {
        let selector = selector_with(&scenario_settings(), |gateway| {
            gateway.expect_list_nodes().returning(|_| {
                Err(ClusterError::ListNodes {
                    source: api_error(500),
                    label_selector: String::new(),
                })
            });
        });

        assert!(matches!(
            selector.select().await,
            Err(selector_error::Error::ListNodes { .. })
        ));
    }
}
