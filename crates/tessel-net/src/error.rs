use thiserror::Error;

use tessel_shared::CodecError;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Swarm command channel closed")]
    ChannelClosed,

    /// Nobody is subscribed to the topic, the frame went nowhere.
    #[error("No subscribers on topic {0}")]
    NoSubscribers(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug)]
pub enum QueryError {
    /// The local index could not be searched.
    #[error("Local search failed: {0}")]
    Source(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
