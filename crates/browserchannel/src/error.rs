/// Unified error type for the crate.
///
/// The HTTP handler maps protocol-level variants to status codes; transport
/// failures stay internal and surface to the application only as stream
/// closure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel has been closed and no longer accepts operations.
    #[error("channel closed")]
    Closed,

    /// The channel's bounded operation queue is saturated; the array was
    /// dropped.
    #[error("channel queue full")]
    QueueFull,

    /// A session id string that is not empty and not 32 hex characters.
    #[error("invalid session id string")]
    InvalidSessionId,

    /// A forward-channel map batch that cannot be decoded.
    #[error("bad map batch")]
    BadMap,

    /// A forward-channel body larger than the 10 MiB cap.
    #[error("body too large")]
    BodyTooLarge,

    /// The back channel buffer is full or the client went away.
    #[error("back channel write failed")]
    BackChannelWrite,
}
