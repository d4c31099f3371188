use crate::cancel::CancelListener;
use crate::error::{self, Result};
use crate::harvest::{HarvestOutcome, Harvester};
use crate::report::RunReport;
use crate::selector::NodeSelector;
use crate::settings::Settings;
use models::cluster::ClusterGateway;

use snafu::ResultExt;
use tracing::{event, instrument, Level};

/// Runs reaper passes: select Nodes once, then harvest them one at a time.
///
/// The reaper assumes it is only run while its caller holds leadership. Losing it is signalled through the
/// `leadership` listener given to each pass.
#[derive(Clone)]
pub struct Reaper<G: ClusterGateway + 'static> {
    selector: NodeSelector<G>,
    harvester: Harvester<G>,
}

impl<G: ClusterGateway + 'static> Reaper<G> {
    pub fn new(gateway: G, settings: &Settings) -> Self {
        Reaper {
            selector: NodeSelector::new(gateway.clone(), settings),
            harvester: Harvester::new(gateway, settings),
        }
    }

    /// Runs a single pass.
    ///
    /// A failed Node does not stop the pass; its failure is recorded and the next Node is harvested.
    /// Once `leadership` is raised no further Node is started.
    #[instrument(skip(self, leadership), err)]
    pub async fn run_pass(&self, leadership: CancelListener) -> Result<RunReport> {
        if leadership.is_raised() {
            event!(Level::WARN, "Leadership lost before the pass began.");
            return Ok(RunReport {
                interrupted: true,
                ..Default::default()
            });
        }

        let selection = self
            .selector
            .select()
            .await
            .context(error::SelectionSnafu)?;
        let mut report = RunReport::new(selection);

        for node_name in report.reap.clone() {
            if leadership.is_raised() {
                event!(
                    Level::WARN,
                    node = %node_name,
                    "Leadership lost; not starting further harvests."
                );
                break;
            }

            let outcome = self.harvester.harvest(&node_name, &leadership).await;
            if let HarvestOutcome::Failed { stage, reason } = &outcome {
                event!(
                    Level::ERROR,
                    node = %node_name,
                    %stage,
                    %reason,
                    "Failed to harvest Node."
                );
            }
            report.record(&node_name, outcome);
        }

        report.interrupted = leadership.is_raised();
        Ok(report)
    }
}
