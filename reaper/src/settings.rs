use snafu::ResultExt;
use std::env;
use std::str::FromStr;
use tokio::time::Duration;
use validator::{Validate, ValidationError};

// Defines the env variable names read at startup.
const MIN_NODES_ENV_VAR: &str = "MIN_NODES";
const MAX_NODES_DELETE_ENV_VAR: &str = "MAX_NODES_DELETE";
const HARVEST_FRACTION_ENV_VAR: &str = "HARVEST_FRACTION";
const NODE_SELECTOR_ENV_VAR: &str = "NODE_SELECTOR";
const DEAL_BREAKER_POD_SELECTOR_ENV_VAR: &str = "DEAL_BREAKER_POD_SELECTOR";
const EVICTION_TIMEOUT_ENV_VAR: &str = "EVICTION_TIMEOUT_SECONDS";
const TERMINATION_GRACE_PERIOD_ENV_VAR: &str = "TERMINATION_GRACE_PERIOD_SECONDS";
const POST_EVICTION_WAIT_TIMEOUT_ENV_VAR: &str = "POST_EVICTION_WAIT_TIMEOUT_SECONDS";
const DRAIN_DELAY_ENV_VAR: &str = "DRAIN_DELAY_SECONDS";
const DRY_RUN_ENV_VAR: &str = "DRY_RUN";
const PROTECT_STATEFUL_SETS_ENV_VAR: &str = "PROTECT_STATEFUL_SETS";

const DEFAULT_MIN_NODES: u32 = 3;
const DEFAULT_MAX_NODES_DELETE: u32 = 2;
const DEFAULT_HARVEST_FRACTION: f64 = 0.05;
const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(60);
const DEFAULT_POST_EVICTION_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_DRAIN_DELAY: Duration = Duration::from_secs(60);

/// The module-wide result type.
type Result<T> = std::result::Result<T, settings_error::Error>;

/// Process-wide reaper configuration. Built once at startup, validated, and then only ever read.
#[derive(Clone, Debug, PartialEq, Validate)]
#[validate(schema(function = "validate_fraction", skip_on_field_errors = false))]
pub struct Settings {
    /// The reaper never harvests if doing so would leave fewer than this many Nodes.
    #[validate(range(min = 1))]
    pub min_nodes: u32,
    /// Upper bound on Nodes harvested in one pass.
    pub max_nodes_delete: u32,
    /// Share of the selected Nodes to harvest per pass, in `[0, 1)`.
    pub fraction_nodes_to_delete: f64,
    /// Restricts which Nodes are considered. Empty means every Node.
    pub node_label_selector: String,
    /// Pods matching this selector veto harvesting the Node they run on. Empty means no veto.
    pub deal_breaker_pod_selector: String,
    /// Deadline for all evictions of a single Node's drain.
    pub eviction_timeout: Duration,
    /// Grace period given to evicted Pods that don't ask for a shorter one.
    pub graceful_termination_default: Duration,
    /// How long to wait for an accepted eviction to actually remove its Pod.
    pub post_eviction_wait_timeout: Duration,
    /// Pause between cordoning a Node and draining it.
    pub delay_after_cordon: Duration,
    pub dry_run: bool,
    /// Treat StatefulSet Pods like DaemonSet Pods: only evict them once their controller is gone.
    pub protect_stateful_sets: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            min_nodes: DEFAULT_MIN_NODES,
            max_nodes_delete: DEFAULT_MAX_NODES_DELETE,
            fraction_nodes_to_delete: DEFAULT_HARVEST_FRACTION,
            node_label_selector: String::new(),
            deal_breaker_pod_selector: String::new(),
            eviction_timeout: DEFAULT_EVICTION_TIMEOUT,
            graceful_termination_default: DEFAULT_TERMINATION_GRACE_PERIOD,
            post_eviction_wait_timeout: DEFAULT_POST_EVICTION_WAIT_TIMEOUT,
            delay_after_cordon: DEFAULT_DRAIN_DELAY,
            dry_run: false,
            protect_stateful_sets: false,
        }
    }
}

fn validate_fraction(settings: &Settings) -> std::result::Result<(), ValidationError> {
    // Written so that NaN is rejected too.
    if settings.fraction_nodes_to_delete >= 0.0 && settings.fraction_nodes_to_delete < 1.0 {
        Ok(())
    } else {
        Err(ValidationError::new("fraction_nodes_to_delete_out_of_range"))
    }
}

impl Settings {
    /// Reads settings from the process environment, falling back to defaults for unset variables.
    pub fn from_environment() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads settings through `lookup`, which returns the raw value of a variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let seconds = |name: &'static str, default: Duration| -> Result<Duration> {
            parse_or(&lookup, name, default.as_secs()).map(Duration::from_secs)
        };

        Settings {
            min_nodes: parse_or(&lookup, MIN_NODES_ENV_VAR, defaults.min_nodes)?,
            max_nodes_delete: parse_or(&lookup, MAX_NODES_DELETE_ENV_VAR, defaults.max_nodes_delete)?,
            fraction_nodes_to_delete: parse_or(
                &lookup,
                HARVEST_FRACTION_ENV_VAR,
                defaults.fraction_nodes_to_delete,
            )?,
            node_label_selector: lookup(NODE_SELECTOR_ENV_VAR).unwrap_or_default(),
            deal_breaker_pod_selector: lookup(DEAL_BREAKER_POD_SELECTOR_ENV_VAR)
                .unwrap_or_default(),
            eviction_timeout: seconds(EVICTION_TIMEOUT_ENV_VAR, defaults.eviction_timeout)?,
            graceful_termination_default: seconds(
                TERMINATION_GRACE_PERIOD_ENV_VAR,
                defaults.graceful_termination_default,
            )?,
            post_eviction_wait_timeout: seconds(
                POST_EVICTION_WAIT_TIMEOUT_ENV_VAR,
                defaults.post_eviction_wait_timeout,
            )?,
            delay_after_cordon: seconds(DRAIN_DELAY_ENV_VAR, defaults.delay_after_cordon)?,
            dry_run: parse_or(&lookup, DRY_RUN_ENV_VAR, defaults.dry_run)?,
            protect_stateful_sets: parse_or(
                &lookup,
                PROTECT_STATEFUL_SETS_ENV_VAR,
                defaults.protect_stateful_sets,
            )?,
        }
        .validated()
    }

    /// Checks the cross-field bounds, consuming and returning the settings if they hold.
    pub fn validated(self) -> Result<Self> {
        self.validate().context(settings_error::InvalidSnafu)?;
        Ok(self)
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(settings_error::ParseVariableSnafu {
                variable: name,
                value,
            }),
    }
}

pub mod settings_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Invalid settings: {}", source))]
        Invalid { source: validator::ValidationErrors },

        #[snafu(display(
            "Unable to parse environment variable '{}={}': '{}'",
            variable,
            value,
            source
        ))]
        ParseVariable {
            source: Box<dyn std::error::Error + Send + Sync>,
            variable: String,
            value: String,
        },
    }
}
