/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! reaper_domain {
    () => {
        "node-reaper.io"
    };
    ($s:literal) => {
        concat!(reaper_domain!(), "/", $s)
    };
}

/// Field manager recorded on the reaper's writes.
pub const REAPER: &str = "node-reaper";

// Annotation keys
/// Written to a Node once it has been chosen for harvest. The value is the RFC 3339 time of the mark.
pub const HARVEST_REQUESTED_ANNOTATION: &str = reaper_domain!("harvest-requested");

// Well-known Kubernetes names
/// Present on the API server's read-only copy of a static Pod.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const DAEMON_SET_KIND: &str = "DaemonSet";
pub const STATEFUL_SET_KIND: &str = "StatefulSet";

/// Field selector key used to find the Pods bound to a Node.
pub const POD_NODE_NAME_FIELD: &str = "spec.nodeName";
