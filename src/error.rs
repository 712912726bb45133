use thiserror::Error;

#[derive(Error, Debug)]
pub enum DreamError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Instance not ready: {0}")]
    InstanceNotReady(String),

    #[error("Cloud provider error: {0}")]
    Provider(String),

    #[error("Worker request failed: {0}")]
    Worker(#[from] reqwest::Error),

    #[error("Worker returned HTTP status {0}")]
    WorkerStatus(u16),

    #[error("Gave up liveness checks, try again later")]
    LivenessRetry,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("TLS material error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DreamError>;
