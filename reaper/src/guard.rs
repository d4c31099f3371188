use crate::settings::Settings;
use models::cluster::{ClusterGateway, ControllerKind, ControllerPresence, PodSnapshot};

use snafu::ResultExt;
use tracing::{event, instrument, Level};

/// Decides, Pod by Pod, whether a drain may evict it.
///
/// Kubectl by default will not evict Pods under some criteria without further instruction. We skip:
/// * DaemonSet Pods, while the DaemonSet exists. The DaemonSet controller ignores cordons and would
///   immediately reschedule them. Pods whose DaemonSet is gone are orphans and are evicted.
/// * StatefulSet Pods under the same rule, when `protect_stateful_sets` is set.
/// * Mirror Pods. These are the API server's view of static Pods and cannot be evicted.
///
/// Controller lookups are never cached: the guard is asked once per Pod per drain attempt.
#[derive(Clone)]
pub struct EvictionGuard<G: ClusterGateway> {
    gateway: G,
    protect_stateful_sets: bool,
}

impl<G: ClusterGateway> EvictionGuard<G> {
    pub fn new(gateway: G, settings: &Settings) -> Self {
        EvictionGuard {
            gateway,
            protect_stateful_sets: settings.protect_stateful_sets,
        }
    }

    fn is_protected_kind(&self, kind: ControllerKind) -> bool {
        match kind {
            ControllerKind::DaemonSet => true,
            ControllerKind::StatefulSet => self.protect_stateful_sets,
        }
    }

    /// Returns whether `pod` may be evicted. A failed controller lookup is an error, never a yes.
    #[instrument(skip(self, pod), fields(pod = %pod.qualified_name()), err)]
    pub async fn may_evict(&self, pod: &PodSnapshot) -> Result<bool, guard_error::Error> {
        if pod.mirror {
            event!(Level::INFO, "Not draining Pod: Pod is a static Mirror Pod");
            return Ok(false);
        }

        let (kind, controller) = match pod.controller.as_ref().and_then(|controller| {
            controller
                .known_kind()
                .filter(|kind| self.is_protected_kind(*kind))
                .map(|kind| (kind, controller))
        }) {
            Some(protected) => protected,
            None => return Ok(true),
        };

        let presence = self
            .gateway
            .get_controller(&pod.namespace, &controller.name, kind)
            .await
            .context(guard_error::ControllerLookupSnafu {
                pod_name: pod.qualified_name(),
            })?;

        match presence {
            ControllerPresence::Present => {
                event!(
                    Level::INFO,
                    controller = %controller.name,
                    "Not draining Pod: Pod is member of a {}",
                    kind
                );
                Ok(false)
            }
            ControllerPresence::Absent => {
                event!(
                    Level::INFO,
                    controller = %controller.name,
                    "Pod's {} no longer exists; treating it as evictable",
                    kind
                );
                Ok(true)
            }
        }
    }
}

pub mod guard_error {
    use models::cluster::ClusterError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "Unable to determine whether Pod '{}' may be evicted: '{}'",
            pod_name,
            source
        ))]
        ControllerLookup {
            source: ClusterError,
            pod_name: String,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use models::cluster::{ClusterError, MockClusterGateway};
    use std::sync::Arc;

    /// An API error as the gateway would surface it.
    pub(crate) fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the server could not complete the request".to_string(),
            reason: "InternalError".to_string(),
            code,
        })
    }

    fn lookup_failure() -> ClusterError {
        ClusterError::GetController {
            source: api_error(500),
            kind: ControllerKind::DaemonSet,
            namespace: "logging".to_string(),
            name: "fluentd".to_string(),
        }
    }

    fn guard_with(
        settings: &Settings,
        setup: impl FnOnce(&mut MockClusterGateway),
    ) -> EvictionGuard<Arc<MockClusterGateway>> {
        let mut gateway = MockClusterGateway::new();
        setup(&mut gateway);
        EvictionGuard::new(Arc::new(gateway), settings)
    }

    fn daemon_set_pod() -> PodSnapshot {
        PodSnapshot::new("logging", "fluentd-x7k2p").with_controller("DaemonSet", "fluentd")
    }

    #[tokio::test]
    async fn unowned_and_ordinary_pods_are_evictable_without_lookups() {
        // The mock has no expectations, so any gateway call would panic.
        let guard = guard_with(&Settings::default(), |_| {});

        let bare = PodSnapshot::new("default", "debug-shell");
        let replica =
            PodSnapshot::new("web", "web-5d8f7-abcde").with_controller("ReplicaSet", "web-5d8f7");
        let stateful =
            PodSnapshot::new("db", "postgres-0").with_controller("StatefulSet", "postgres");

        assert!(guard.may_evict(&bare).await.unwrap());
        assert!(guard.may_evict(&replica).await.unwrap());
        assert!(guard.may_evict(&stateful).await.unwrap());
    }

    #[tokio::test]
    async fn daemon_set_pods_are_kept_while_the_daemon_set_exists() {
        let guard = guard_with(&Settings::default(), |gateway| {
            gateway
                .expect_get_controller()
                .withf(|namespace: &str, name: &str, kind: &ControllerKind| {
                    namespace == "logging" && name == "fluentd" && *kind == ControllerKind::DaemonSet
                })
                .times(1)
                .returning(|_, _, _| Ok(ControllerPresence::Present));
        });

        assert!(!guard.may_evict(&daemon_set_pod()).await.unwrap());
    }

    #[tokio::test]
    async fn orphaned_daemon_set_pods_are_evictable() {
        let guard = guard_with(&Settings::default(), |gateway| {
            gateway
                .expect_get_controller()
                .times(1)
                .returning(|_, _, _| Ok(ControllerPresence::Absent));
        });

        assert!(guard.may_evict(&daemon_set_pod()).await.unwrap());
    }

    #[tokio::test]
    async fn lookup_errors_are_surfaced() {
        let guard = guard_with(&Settings::default(), |gateway| {
            gateway
                .expect_get_controller()
                .times(1)
                .returning(|_, _, _| Err(lookup_failure()));
        });

        let result = guard.may_evict(&daemon_set_pod()).await;
        assert!(matches!(
            result,
            Err(guard_error::Error::ControllerLookup { ref pod_name, .. }) if pod_name == "logging/fluentd-x7k2p"
        ));
    }

    #[tokio::test]
    async fn stateful_sets_are_protected_when_configured() {
        let settings = Settings {
            protect_stateful_sets: true,
            ..Default::default()
        };
        let guard = guard_with(&settings, |gateway| {
            gateway
                .expect_get_controller()
                .withf(|_: &str, name: &str, kind: &ControllerKind| {
                    name == "postgres" && *kind == ControllerKind::StatefulSet
                })
                .times(1)
                .returning(|_, _, _| Ok(ControllerPresence::Present));
        });

        let pod = PodSnapshot::new("db", "postgres-0").with_controller("StatefulSet", "postgres");
        assert!(!guard.may_evict(&pod).await.unwrap());
    }

    #[tokio::test]
    async fn mirror_pods_are_never_evicted() {
        let guard = guard_with(&Settings::default(), |_| {});
        let pod = PodSnapshot {
            mirror: true,
            ..PodSnapshot::new("kube-system", "kube-proxy-node-a")
        };

        assert!(!guard.may_evict(&pod).await.unwrap());
    }
}
