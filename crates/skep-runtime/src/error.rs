use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such service: {0:#010x}")]
    UnknownService(u32),

    #[error("unique name '{0}' already registered")]
    DuplicateUniqueName(String),

    #[error("unique name '{0}' not found")]
    UniqueNameNotFound(String),

    #[error("worker {0} is not running")]
    WorkerUnavailable(u8),

    #[error("service type '{0}' is not registered")]
    UnknownServiceType(String),

    #[error("service '{0}' failed to initialize: {1}")]
    ServiceInit(String, String),

    #[error("fd table exhausted on worker {0}")]
    FdExhausted(u8),

    #[error("no such connection: {0:#010x}")]
    UnknownFd(u32),

    #[error("read already pending on fd {0:#010x}")]
    ReadPending(u32),

    #[error("send queue overflow on fd {0:#010x}")]
    SendQueueOverflow(u32),

    #[error("allocation of {requested} bytes exceeds memory limit of {limit} bytes")]
    MemLimit { requested: u64, limit: u64 },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] skep_protocol::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
