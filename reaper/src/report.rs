//! The result of one reaper pass, as handed to whoever notifies operators.
use crate::harvest::HarvestOutcome;
use crate::selector::Selection;

use serde::Serialize;
use std::fmt::Display;

const MESSAGE_PREFIX: &str = "Node-Reaper";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node: String,
    #[serde(flatten)]
    pub outcome: HarvestOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub reap: Vec<String>,
    pub passover: Vec<String>,
    /// One entry per Node the pass attempted, in harvest order.
    pub outcomes: Vec<NodeOutcome>,
    /// Set when leadership was lost during the pass.
    pub interrupted: bool,
}

impl RunReport {
    pub fn new(selection: Selection) -> Self {
        RunReport {
            reap: selection.reap,
            passover: selection.passover,
            ..Default::default()
        }
    }

    pub fn record(&mut self, node: &str, outcome: HarvestOutcome) {
        self.outcomes.push(NodeOutcome {
            node: node.to_string(),
            outcome,
        });
    }

    pub fn harvested(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|result| result.outcome.is_success())
            .map(|result| result.node.as_str())
            .collect()
    }

    /// True if every selected Node was harvested.
    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.outcomes.iter().all(|result| result.outcome.is_success())
    }

    /// A one-line summary for operators.
    pub fn message(&self) -> String {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|result| match &result.outcome {
                HarvestOutcome::Succeeded => None,
                HarvestOutcome::Failed { stage, reason } => {
                    Some(format!("{} failed at {}: {}", result.node, stage, reason))
                }
            })
            .collect();

        let summary = if !failures.is_empty() {
            format!(
                "error harvesting nodes (harvested {:?}): {}",
                self.harvested(),
                failures.join("; ")
            )
        } else if self.interrupted {
            format!(
                "leadership lost after harvesting nodes {:?}",
                self.harvested()
            )
        } else {
            format!("successfully harvested nodes {:?}", self.harvested())
        };
        format!("{}: {}", MESSAGE_PREFIX, summary)
    }
}

/// A one-line summary for a pass that failed before harvesting anything.
pub fn failure_message(err: &impl Display) -> String {
    format!("{}: error {}", MESSAGE_PREFIX, err)
}
