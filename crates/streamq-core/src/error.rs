use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("unknown serialization backend tag: {0}")]
    UnknownBackend(String),

    #[error("serialization backend tag already registered: {0}")]
    DuplicateTag(String),

    #[error("serialization backend tag must not be empty")]
    EmptyBackendTag,

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task name already registered: {0}")]
    DuplicateTaskName(String),

    #[error("failed to encode task arguments: {0}")]
    Encode(String),

    #[error("failed to decode task body: {0}")]
    Decode(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("broker error: {0}")]
    Broker(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
