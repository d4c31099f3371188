use crate::selector::selector_error;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end a pass before any Node is harvested. Per-Node failures are recorded in the
/// `RunReport` instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to select Nodes to harvest: '{}'", source))]
    Selection { source: selector_error::Error },
}
