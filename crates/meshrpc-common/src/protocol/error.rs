//! Error taxonomy shared by every MeshRPC crate.
//!
//! Every failure a caller can observe is one of these variants. The cluster
//! invoker decides what to do with a failed attempt solely through
//! [`MeshrpcError::is_retryable`]:
//!
//! | Class | Variants | Retried |
//! |---|---|---|
//! | Transient | `Transport`, `Timeout`, `EndpointUnavailable`, `RateLimited`, `Io` | yes |
//! | No endpoint | `NoAvailableEndpoint` | no |
//! | Business rejection | `Rejected` | no |
//! | Exhausted | `RetriesExhausted` | terminal |

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshrpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("No available endpoint for service {0}")]
    NoAvailableEndpoint(String),

    /// The remote explicitly refused the business call.
    #[error("Remote rejected call (code {code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("All {attempts} attempts failed, last error: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<MeshrpcError>,
    },

    #[error("Directory destroyed for service {0}")]
    DirectoryDestroyed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshrpcError {
    /// Whether a failed attempt may be retried against another endpoint.
    ///
    /// Only failures that say nothing about the business outcome qualify:
    /// the endpoint could not be reached, did not answer in time, or the call
    /// was refused admission locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshrpcError::Transport(_)
                | MeshrpcError::Timeout(_)
                | MeshrpcError::EndpointUnavailable(_)
                | MeshrpcError::RateLimited { .. }
                | MeshrpcError::Io(_)
        )
    }

    /// The last underlying failure for an exhausted call, `self` otherwise.
    pub fn root_cause(&self) -> &MeshrpcError {
        match self {
            MeshrpcError::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshrpcError>;
