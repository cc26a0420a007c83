#[derive(thiserror::Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
