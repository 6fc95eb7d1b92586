use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("unknown remote method: {0}")]
    UnknownMethod(String),

    #[error("unauthorized call to secured method: {0}")]
    Unauthorized(String),

    #[error("worker is already running a task: {0}")]
    WorkerBusy(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("not connected to master")]
    NotConnected,

    #[error("remote call timed out: {0}")]
    CallTimeout(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("login rejected by master")]
    LoginRejected,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("malformed job record: {0}")]
    MalformedRecord(String),
}

impl MeshError {
    /// Stable code carried in error replies so the caller can map a failure
    /// back to a typed variant on its side of the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            MeshError::UnknownMethod(_) => "unknown_method",
            MeshError::Unauthorized(_) => "unauthorized",
            MeshError::WorkerBusy(_) => "worker_busy",
            MeshError::TaskNotFound(_) => "task_not_found",
            _ => "error",
        }
    }

    /// Reconstruct a typed error from a wire code and message.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "unknown_method" => MeshError::UnknownMethod(message),
            "unauthorized" => MeshError::Unauthorized(message),
            "worker_busy" => MeshError::WorkerBusy(message),
            "task_not_found" => MeshError::TaskNotFound(message),
            _ => MeshError::Remote(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
