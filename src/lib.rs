// Declare the modules
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod network;
pub mod pairing;
pub mod prompts;
pub mod session;
pub mod state;
pub mod storage;

pub use api::{RemoteInferenceClient, StreamToken, TokenStream};
pub use backend::{Backend, BackendSelector, LocalEngine};
pub use config::ClientConfig;
pub use error::{AssistError, Result};
pub use models::{BackendKind, ConnectionState, Endpoint, Message};
pub use network::{LocalNetworkJoiner, NetworkPlatform, NmcliPlatform};
pub use pairing::PairingPayload;
pub use prompts::PromptProfile;
pub use session::{ConversationSession, SessionEvent, StopHandle};
pub use state::AppState;
pub use storage::{ConversationStore, StorageManager};

/// Installs the `env_logger` backend, defaulting to `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    if let Err(e) = env_logger::Builder::from_env(env).try_init() {
        eprintln!("Logger already initialised: {}", e);
    }
}
