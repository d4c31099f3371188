//! Cluster-facing types shared by the node reaper: the `ClusterGateway` capability trait and its
//! Kubernetes implementation, Node and Pod snapshots, well-known names, and logging setup.
pub mod cluster;
pub mod constants;
pub mod telemetry;
