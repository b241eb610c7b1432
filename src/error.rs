use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Load probe returned illegal load {load} for node {node_id}")]
    NegativeLoad { node_id: Uuid, load: f64 },

    #[error("No candidate nodes supplied for task session {0}")]
    EmptyCandidates(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("Failed to deliver message to node {node_id}: {reason}")]
    Delivery { node_id: Uuid, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Job queue at capacity")]
    QueueFull,

    #[error("Fail-over attempts exhausted for job {0}")]
    FailoverExhausted(Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PlacementError>;
