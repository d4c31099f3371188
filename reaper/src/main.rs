use reaper::{cancel::CancelSignal, report, settings::Settings, Reaper};

use models::{cluster::K8SClusterGateway, telemetry};

use snafu::{ensure, ResultExt};
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, reaper_error::Error>;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(reaper_error::TelemetryInitSnafu)?;

    let settings = Settings::from_environment().context(reaper_error::SettingsSnafu)?;
    event!(Level::INFO, ?settings, "Loaded settings.");

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(reaper_error::ClientCreateSnafu)?;
    let reaper = Reaper::new(K8SClusterGateway::new(k8s_client), &settings);

    // Leadership is held for as long as the process is not asked to stop.
    let leadership = CancelSignal::new();
    let listener = leadership.listener();
    tokio::spawn(async move {
        shutdown_requested().await;
        event!(Level::WARN, "Shutdown requested; giving up leadership.");
        leadership.raise();
    });

    let report = match reaper.run_pass(listener).await {
        Ok(report) => report,
        Err(err) => {
            event!(Level::ERROR, message = %report::failure_message(&err));
            return Err(err).context(reaper_error::PassSnafu);
        }
    };

    let report_json = serde_json::to_string(&report).context(reaper_error::ReportSerializeSnafu)?;
    let message = report.message();
    if report.succeeded() {
        event!(Level::INFO, report = %report_json, "{}", message);
    } else {
        event!(Level::ERROR, report = %report_json, "{}", message);
    }
    ensure!(report.succeeded(), reaper_error::HarvestFailedSnafu { message });

    Ok(())
}

/// Completes on SIGINT, or SIGTERM where the platform has it.
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
                return;
            }
            Err(err) => {
                event!(Level::WARN, error = %err, "Unable to listen for SIGTERM.");
            }
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        event!(Level::WARN, error = %err, "Unable to listen for SIGINT.");
        std::future::pending::<()>().await;
    }
}

pub mod reaper_error {
    use models::telemetry;
    use reaper::settings::settings_error;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },

        #[snafu(display("Unable to load settings: '{}'", source))]
        Settings { source: settings_error::Error },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Reaper pass failed: '{}'", source))]
        Pass { source: reaper::Error },

        #[snafu(display("Unable to serialize run report: '{}'", source))]
        ReportSerialize { source: serde_json::Error },

        #[snafu(display("{}", message))]
        HarvestFailed { message: String },
    }
}
