//! Error types for scan-pilot-core

use thiserror::Error;

/// Errors returned when extracting an error message from plugin logs
#[derive(Error, Debug)]
pub enum ErrParseError {
    /// No pattern set registered for the plugin
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    /// The log stream could not be read to the end
    #[error("failed to read plugin logs: {0}")]
    Read(#[from] std::io::Error),

    /// None of the known failure shapes were found
    #[error("no error message found in {0} logs")]
    NoMatch(String),
}

/// Errors returned when computing the next run of a cron expression
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Expression could not be parsed
    #[error("invalid schedule {expr:?}: {source}")]
    Parse {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    /// Expression never fires again
    #[error("schedule {0:?} has no upcoming run")]
    Exhausted(String),
}
