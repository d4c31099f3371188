use super::ControllerKind;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to list Nodes matching '{}': '{}'", label_selector, source))]
    ListNodes {
        source: kube::Error,
        label_selector: String,
    },

    #[snafu(display("Unable to list Pods on Node '{}': '{}'", node_name, source))]
    ListPods {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display(
        "Unable to look up {} '{}' in namespace '{}': '{}'",
        kind,
        name,
        namespace,
        source
    ))]
    GetController {
        source: kube::Error,
        kind: ControllerKind,
        namespace: String,
        name: String,
    },

    #[snafu(display("Unable to cordon Node '{}': '{}'", node_name, source))]
    CordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to mark Node '{}' for harvest: '{}'", node_name, source))]
    MarkNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display(
        "Unable to create eviction for Pod '{}/{}': '{}'",
        namespace,
        pod_name,
        source
    ))]
    EvictPod {
        source: kube::Error,
        namespace: String,
        pod_name: String,
    },

    #[snafu(display("Unable to get Pod '{}/{}': '{}'", namespace, pod_name, source))]
    GetPod {
        source: kube::Error,
        namespace: String,
        pod_name: String,
    },

    #[snafu(display("{} object from the API is missing '{}'", kind, field))]
    InvalidObject {
        kind: &'static str,
        field: &'static str,
    },
}
