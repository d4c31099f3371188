//! The cluster-facing view used by the reaper: immutable snapshots of Nodes and Pods, and the
//! `ClusterGateway` capability trait through which all reads and mutations flow.
mod client;
mod error;

pub use self::client::*;
pub use self::error::Error as ClusterError;
use self::error::{Error, Result};

use crate::constants::{DAEMON_SET_KIND, MIRROR_POD_ANNOTATION, STATEFUL_SET_KIND};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;

/// A point-in-time view of a cluster Node, read once per pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
    pub unschedulable: bool,
}

impl NodeSnapshot {
    pub fn new<S: Into<String>>(name: S, created: DateTime<Utc>) -> Self {
        NodeSnapshot {
            name: name.into(),
            created,
            labels: BTreeMap::new(),
            unschedulable: false,
        }
    }
}

impl TryFrom<Node> for NodeSnapshot {
    type Error = Error;

    fn try_from(node: Node) -> Result<Self> {
        let name = node.metadata.name.ok_or(Error::InvalidObject {
            kind: "Node",
            field: "metadata.name",
        })?;
        let created = node
            .metadata
            .creation_timestamp
            .ok_or(Error::InvalidObject {
                kind: "Node",
                field: "metadata.creationTimestamp",
            })?
            .0;

        Ok(NodeSnapshot {
            name,
            created,
            labels: node.metadata.labels.unwrap_or_default(),
            unschedulable: node
                .spec
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false),
        })
    }
}

/// The kinds of owning controller the reaper knows how to look up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Runs exactly one replica on every eligible Node and ignores cordons.
    DaemonSet,
    StatefulSet,
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DaemonSet => DAEMON_SET_KIND,
            Self::StatefulSet => STATEFUL_SET_KIND,
        }
    }

    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            DAEMON_SET_KIND => Some(Self::DaemonSet),
            STATEFUL_SET_KIND => Some(Self::StatefulSet),
            _ => None,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The managing controller of a Pod, taken from the owner reference marked `controller: true`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRef {
    pub kind: String,
    pub name: String,
}

impl ControllerRef {
    /// Returns the kind as a `ControllerKind` when it is one the reaper treats specially.
    pub fn known_kind(&self) -> Option<ControllerKind> {
        ControllerKind::from_kind(&self.kind)
    }
}

/// A point-in-time view of a Pod, read fresh for each drain attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub controller: Option<ControllerRef>,
    pub termination_grace_period_seconds: Option<i64>,
    pub mirror: bool,
}

impl PodSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        PodSnapshot {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_controller<S: Into<String>>(mut self, kind: S, name: S) -> Self {
        self.controller = Some(ControllerRef {
            kind: kind.into(),
            name: name.into(),
        });
        self
    }

    /// `namespace/name`, used for log fields and error messages.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl TryFrom<Pod> for PodSnapshot {
    type Error = Error;

    fn try_from(pod: Pod) -> Result<Self> {
        let metadata = pod.metadata;
        let name = metadata.name.ok_or(Error::InvalidObject {
            kind: "Pod",
            field: "metadata.name",
        })?;
        let controller = metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .find(|reference| reference.controller == Some(true))
            .map(|reference| ControllerRef {
                kind: reference.kind,
                name: reference.name,
            });
        let mirror = metadata
            .annotations
            .as_ref()
            .map_or(false, |annotations| {
                annotations.contains_key(MIRROR_POD_ANNOTATION)
            });

        Ok(PodSnapshot {
            name,
            namespace: metadata.namespace.unwrap_or_else(|| "default".to_string()),
            uid: metadata.uid,
            controller,
            termination_grace_period_seconds: pod
                .spec
                .and_then(|spec| spec.termination_grace_period_seconds),
            mirror,
        })
    }
}

/// Result of looking up a Pod's owning controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerPresence {
    Present,
    Absent,
}

/// Classified response to an eviction request. Any response not listed here is surfaced as an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvictionResponse {
    /// The API accepted the eviction. The Pod may still be terminating.
    Accepted,
    /// The Pod no longer exists.
    NotFound,
    /// Eviction is currently refused, typically to honor a PodDisruptionBudget.
    TooManyRequests,
}
