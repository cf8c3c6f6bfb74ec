use thiserror::Error;

/// Errors surfaced by the pairing, inference and conversation layers.
///
/// Every variant carries a message that is safe to show to the user as-is.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssistError {
    /// Scanned code is not a usable pairing payload. The user must rescan.
    #[error("Invalid pairing code: {0}")]
    InvalidPayload(String),
    /// Association with the local network failed, timed out or was lost.
    #[error("Could not join network: {0}")]
    NetworkJoinFailed(String),
    /// Connect/read/write failure against the remote server, or a non-2xx reply.
    #[error("Connection error: {0}")]
    Transport(String),
    /// The active backend cannot handle the request (e.g. media on the local model).
    #[error("{0}")]
    CapabilityUnsupported(String),
    /// The server sent data that could not be decoded.
    #[error("Malformed response from server: {0}")]
    Decode(String),
    /// The server accepted the request but failed while generating.
    #[error("The server could not finish the reply: {0}")]
    Generation(String),
    #[error("Not connected to a server. Pair with the desktop or enter its address first.")]
    NotConnected,
    #[error("{0}")]
    BackendUnavailable(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("On-device model failed: {0}")]
    LocalInference(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl AssistError {
    /// Wraps an infrastructure error from the persistence layer.
    pub fn storage(err: anyhow::Error) -> Self {
        AssistError::Storage(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for AssistError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AssistError::Decode(err.to_string())
        } else {
            AssistError::Transport(err.to_string())
        }
    }
}

pub type Result<T, E = AssistError> = std::result::Result<T, E>;
