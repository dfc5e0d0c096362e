use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushgError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid topic path: {0}")]
    InvalidPath(String),

    #[error("malformed message: {0}")]
    InvalidMessage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("route channel is full, route is closed")]
    ChannelFull,

    #[error("route queue is full, route is closed")]
    QueueFull,

    #[error("route is invalid, channel is closed")]
    InvalidRoute,

    #[error("duplicate subscription: {0}")]
    DuplicateSubscription(String),

    #[error("module {0} is stopping")]
    ModuleStopping(String),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("storage is almost full")]
    StorageAlmostFull,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("send retries exhausted")]
    RetryFailed,

    #[error("sms message too long")]
    SmsTooLong,

    #[error("invalid sender address")]
    InvalidSender,

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown errors: [{}]", .0.join("; "))]
    Aggregate(Vec<String>),
}

pub type Result<T> = std::result::Result<T, PushgError>;
