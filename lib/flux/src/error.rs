use std::io;

/// Error kinds that can cross a module boundary in the core. Everything else is handled
/// locally at the site that produced it (a session closes itself, a tick logs and continues).
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("transient io error: {0}")]
    TransientIo(#[from] io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("backpressure: {0}")]
    Backpressure(&'static str),

    #[error("pool exhausted: {0}")]
    PoolExhaustion(&'static str),

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("tick failed: {0}")]
    TickFailure(String),

    #[error("timer misuse: {0}")]
    TimerMisuse(&'static str),

    #[error("database failure: {0}")]
    DatabaseFailure(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
