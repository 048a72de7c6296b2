use gateway_api::{CacheError, ClientError};
use relay_types::RelayError;

use crate::checks::CheckError;

/// Errors the front door turns into HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    GatewayTimeout(String),
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Forbidden(_) => 403,
            GatewayError::GatewayTimeout(_) => 504,
        }
    }
}

/// Why a single network attempt did not produce a response.
///
/// Only [`AttemptError::Relay`] is charged to a node; every variant leaves the
/// request eligible for another attempt or the fallback.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Relay(RelayError),
    #[error("could not obtain a session: {0}")]
    Session(ClientError),
    #[error("session doesn't have any available nodes")]
    NoAvailableNodes,
    #[error("{label} check failure; using fallbacks")]
    Check {
        label: &'static str,
        #[source]
        source: CheckError,
    },
    #[error("Sync / chain check failure; using fallbacks")]
    NoNodePassedChecks,
    #[error("node selection returned no node")]
    NoNodeSelected,
    #[error("session cache unavailable: {0}")]
    Cache(#[from] CacheError),
}
