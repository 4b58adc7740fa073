use std::{io, time::Duration};

use thiserror::Error;

use super::wire::MessageType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("message of {0} bytes exceeds the frame limit")]
    MessageLengthOverflowed(usize),
    #[error("received an empty message")]
    EmptyMessage,
    #[error("unknown message tag {0:#04x}")]
    UnknownMessageType(u8),
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),
    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("compression failed: {0}")]
    Compression(#[source] io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("upload of model {0} does not match its digest")]
    DigestMismatch(String),
    #[error("model {model_id} could not be installed: {reason}")]
    ModelInstall { model_id: String, reason: String },
    #[error("model {0} is not installed")]
    UnknownModel(String),
    #[error("worker rejected the model upload: {0}")]
    InitRejected(String),
    #[error("task {index} of the batch failed: {reason}")]
    TaskFailed { index: usize, reason: String },
    #[error("worker returned {received} trajectories for a batch of {sent}")]
    BatchSizeMismatch { sent: usize, received: usize },
    #[error("no tokio runtime is running")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
