use thiserror::Error;

/// Failures surfaced by the coordinator core.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to allocate {kind} socket: {source}")]
    Allocation {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch sandbox: {0}")]
    SandboxLaunch(#[source] std::io::Error),
    #[error("failed to stop sandbox: {0}")]
    SandboxStop(#[source] std::io::Error),
    #[error("signaling failure: {0}")]
    Signaling(String),
    #[error("malformed peer payload: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Transport(#[source] std::io::Error),
}
