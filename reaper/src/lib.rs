mod error;
mod reaper;

pub mod cancel;
pub mod drain;
pub mod evict;
pub mod guard;
pub mod harvest;
pub mod report;
pub mod selector;
pub mod settings;

pub use crate::error::Error;
pub use crate::reaper::Reaper;
