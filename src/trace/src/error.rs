use thiserror::Error;

pub trait TraceableError: std::error::Error {
    fn metric_label(&self) -> String;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("std::io::Error: {0}")]
    StdIo(#[from] std::io::Error),

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to install subscriber: {0}")]
    Init(#[source] tracing_subscriber::util::TryInitError),
}
