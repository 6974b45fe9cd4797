/// Failure modes observable by the daemons and their clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Framing or wire-version violation on a stream.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Malformed payload or identifier inside a well-framed message.
    #[error("decode: {0}")]
    Decode(String),

    /// Unknown VM or console identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// Budget exhausted, no tap available, or FIFO setup failed.
    #[error("resource: {0}")]
    Resource(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A hypervisor child exited with the given status.
    #[error("child exited with status {0}")]
    ChildExit(i32),
}

pub type Result<T> = std::result::Result<T, Error>;
