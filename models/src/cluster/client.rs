use super::error::{self, Result};
use super::{
    ControllerKind, ControllerPresence, EvictionResponse, NodeSnapshot, PodSnapshot,
};
use crate::constants::{HARVEST_REQUESTED_ANNOTATION, POD_NODE_NAME_FIELD, REAPER};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use snafu::ResultExt;
use std::convert::TryFrom;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_TOO_MANY_REQUESTS: u16 = 429;

#[async_trait]
/// A trait providing the narrow set of cluster operations the reaper needs. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
///
/// Implementations are shared by concurrently running eviction tasks, so they must be safe for concurrent use.
pub trait ClusterGateway: Clone + Sized + Send + Sync {
    /// List the Nodes matching `label_selector`. An empty selector matches every Node.
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeSnapshot>>;
    /// List every Pod bound to the given Node, across all namespaces.
    async fn list_pods(&self, node_name: &str) -> Result<Vec<PodSnapshot>>;
    /// Whether any Pod bound to the given Node matches `label_selector`.
    async fn has_pods_matching(&self, node_name: &str, label_selector: &str) -> Result<bool>;
    /// Look up an owning controller by kind.
    async fn get_controller(
        &self,
        namespace: &str,
        name: &str,
        kind: ControllerKind,
    ) -> Result<ControllerPresence>;
    /// Mark the given Node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon(&self, node_name: &str) -> Result<()>;
    /// Record on the Node that it has been chosen for harvest. Writing the mark twice is harmless.
    async fn mark_for_drain(&self, node_name: &str) -> Result<()>;
    /// Request eviction of a Pod. Responses other than those in `EvictionResponse` are errors.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<EvictionResponse>;
    /// Fetch a Pod, returning `None` if it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ClusterGateway for use in tests.
    pub ClusterGateway {}
    #[async_trait]
    impl ClusterGateway for ClusterGateway {
        async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeSnapshot>>;
        async fn list_pods(&self, node_name: &str) -> Result<Vec<PodSnapshot>>;
        async fn has_pods_matching(&self, node_name: &str, label_selector: &str) -> Result<bool>;
        async fn get_controller(
            &self,
            namespace: &str,
            name: &str,
            kind: ControllerKind,
        ) -> Result<ControllerPresence>;
        async fn cordon(&self, node_name: &str) -> Result<()>;
        async fn mark_for_drain(&self, node_name: &str) -> Result<()>;
        async fn evict_pod(
            &self,
            namespace: &str,
            name: &str,
            grace_period_seconds: u32,
        ) -> Result<EvictionResponse>;
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>>;
    }

    impl Clone for ClusterGateway {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ClusterGateway for Arc<T>
where
    T: ClusterGateway,
{
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeSnapshot>> {
        (**self).list_nodes(label_selector).await
    }

    async fn list_pods(&self, node_name: &str) -> Result<Vec<PodSnapshot>> {
        (**self).list_pods(node_name).await
    }

    async fn has_pods_matching(&self, node_name: &str, label_selector: &str) -> Result<bool> {
        (**self).has_pods_matching(node_name, label_selector).await
    }

    async fn get_controller(
        &self,
        namespace: &str,
        name: &str,
        kind: ControllerKind,
    ) -> Result<ControllerPresence> {
        (**self).get_controller(namespace, name, kind).await
    }

    async fn cordon(&self, node_name: &str) -> Result<()> {
        (**self).cordon(node_name).await
    }

    async fn mark_for_drain(&self, node_name: &str) -> Result<()> {
        (**self).mark_for_drain(node_name).await
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<EvictionResponse> {
        (**self)
            .evict_pod(namespace, name, grace_period_seconds)
            .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>> {
        (**self).get_pod(namespace, name).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ClusterGateway` trait backed by the Kubernetes API. This implementation will
/// almost certainly be used in any case that isn't a unit test.
pub struct K8SClusterGateway {
    k8s_client: kube::client::Client,
}

impl K8SClusterGateway {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SClusterGateway { k8s_client }
    }

    fn pods_on_node(&self, node_name: &str) -> (Api<Pod>, ListParams) {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        let params =
            ListParams::default().fields(&format!("{}={}", POD_NODE_NAME_FIELD, node_name));
        (pods, params)
    }
}

#[async_trait]
impl ClusterGateway for K8SClusterGateway {
    #[instrument(skip(self), err)]
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeSnapshot>> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }

        let node_list = nodes.list(&params).await.context(error::ListNodesSnafu {
            label_selector,
        })?;
        event!(Level::DEBUG, count = node_list.items.len(), "Fetched nodes.");

        node_list
            .items
            .into_iter()
            .map(NodeSnapshot::try_from)
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn list_pods(&self, node_name: &str) -> Result<Vec<PodSnapshot>> {
        let (pods, params) = self.pods_on_node(node_name);
        pods.list(&params)
            .await
            .context(error::ListPodsSnafu { node_name })?
            .items
            .into_iter()
            .map(PodSnapshot::try_from)
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn has_pods_matching(&self, node_name: &str, label_selector: &str) -> Result<bool> {
        let (pods, params) = self.pods_on_node(node_name);
        let matching = pods
            .list(&params.labels(label_selector).limit(1))
            .await
            .context(error::ListPodsSnafu { node_name })?;

        Ok(!matching.items.is_empty())
    }

    #[instrument(skip(self), err)]
    async fn get_controller(
        &self,
        namespace: &str,
        name: &str,
        kind: ControllerKind,
    ) -> Result<ControllerPresence> {
        let found = match kind {
            ControllerKind::DaemonSet => {
                Api::<DaemonSet>::namespaced(self.k8s_client.clone(), namespace)
                    .get_opt(name)
                    .await
                    .map(|daemon_set| daemon_set.is_some())
            }
            ControllerKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(self.k8s_client.clone(), namespace)
                    .get_opt(name)
                    .await
                    .map(|stateful_set| stateful_set.is_some())
            }
        }
        .context(error::GetControllerSnafu {
            kind,
            namespace,
            name,
        })?;

        Ok(if found {
            ControllerPresence::Present
        } else {
            ControllerPresence::Absent
        })
    }

    #[instrument(skip(self), err)]
    async fn cordon(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .cordon(node_name)
            .await
            .context(error::CordonNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn mark_for_drain(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        let mut annotations = serde_json::Map::new();
        annotations.insert(
            HARVEST_REQUESTED_ANNOTATION.to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        let params = PatchParams {
            field_manager: Some(REAPER.to_string()),
            ..Default::default()
        };

        nodes
            .patch(node_name, &params, &Patch::Merge(&patch))
            .await
            .context(error::MarkNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<EvictionResponse> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..Default::default()
            }),
            ..Default::default()
        };

        match pods.evict(name, &params).await {
            Ok(_) => Ok(EvictionResponse::Accepted),
            Err(kube::Error::Api(response)) if response.code == HTTP_NOT_FOUND => {
                Ok(EvictionResponse::NotFound)
            }
            Err(kube::Error::Api(response)) if response.code == HTTP_TOO_MANY_REQUESTS => {
                Ok(EvictionResponse::TooManyRequests)
            }
            Err(source) => Err(source).context(error::EvictPodSnafu {
                namespace,
                pod_name: name,
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        pods.get_opt(name)
            .await
            .context(error::GetPodSnafu {
                namespace,
                pod_name: name,
            })?
            .map(PodSnapshot::try_from)
            .transpose()
    }
}
