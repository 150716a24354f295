use thiserror::Error;

/// Identity provider call failed. Never retried mid-flow; the periodic
/// refresh retries on its next tick.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity provider rejected {operation}: {kind}: {message}")]
    Provider {
        operation: &'static str,
        kind: String,
        message: String,
    },
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity provider response missing {0}")]
    MissingField(&'static str),
    #[error("device verifier generation failed: {0}")]
    Verifier(String),
}

/// Directory service call failed. Propagates to the setup sequence.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory returned status {status} for {path}")]
    Status { status: u16, path: String },
    #[error("account has no houses")]
    NoHouse,
}

/// Broker connect, publish or subscribe failure.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("broker not connected")]
    NotConnected,
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("broker disconnect failed: {0}")]
    Disconnect(String),
    #[error("no credential available for broker connection")]
    NoCredential,
}

/// A sample older than the last recorded point of its integrator.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("sample at {timestamp} precedes last recorded point at {last_timestamp}")]
pub struct OutOfOrderSample {
    pub timestamp: f64,
    pub last_timestamp: f64,
}

/// Anything that ends the session worker's setup or command loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("session worker stopped: {0}")]
    WorkerStopped(&'static str),
}
