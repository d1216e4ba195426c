use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use anyhow::Error;
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(
    display(
        "failed to {}serialize message {} station daemon",
        if *deserialize { "de" } else { "" },
        if *deserialize { "from" } else { "to" },
    ),
    visibility(pub(crate)),
)]
pub struct SerializeError {
    source: serde_json::Error,
    pub deserialize: bool,
}

/// An error raised inside the daemon while serving a request.
#[derive(Debug, Snafu, Clone, Serialize, Deserialize)]
#[snafu(display("{message}"), visibility(pub(crate)))]
pub struct RemoteError {
    message: Arc<str>,
}

impl RemoteError {
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for RemoteError {
    fn from(value: Error) -> Self {
        let msg = format!("{value:#}");

        RemoteError { message: msg.into() }
    }
}
