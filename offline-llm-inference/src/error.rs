//! Error taxonomy of the inference runtime.
//!
//! Load-time failures are reported as [`ModelLoadError`], tokenizer failures as
//! [`TokenizationError`] and everything that happens after a model is loaded as
//! [`InferenceError`]. Cancellation is not an error: it is reported as a
//! completion reason of a generation stream.

use std::path::PathBuf;

use crate::configuration::{Quantization, QuantizationHint};
use crate::tokenizer::TokenId;

/// Failure to turn a file on disk into a usable model.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid magic number in {path}: expected {expected:#x}, got {actual:#x}")]
    BadMagic { path: PathBuf, expected: u32, actual: u32 },

    #[error("unsupported model file version in {path}: expected {expected}, got {actual}")]
    VersionMismatch { path: PathBuf, expected: i32, actual: i32 },

    #[error("model file {path} is truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { path: PathBuf, expected: u64, actual: u64 },

    #[error("invalid model header in {path}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("invalid vocabulary table in {path}: {reason}")]
    InvalidVocabulary { path: PathBuf, reason: String },

    #[error("model {path} is quantized as {actual}, but {expected} was requested")]
    QuantizationMismatch { path: PathBuf, expected: QuantizationHint, actual: Quantization },

    #[error("failed to allocate {bytes} bytes while loading {path}")]
    Allocation { path: PathBuf, bytes: usize },

    #[error("failed to build inference thread pool: {0}")]
    ThreadPool(String),
}

/// Failure to map between text and tokens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizationError {
    #[error("character {ch:?} at byte offset {offset} is not covered by the vocabulary")]
    UnknownCharacter { ch: char, offset: usize },

    #[error("token id {0} is outside of the vocabulary")]
    InvalidToken(TokenId),

    #[error("invalid UTF-8 byte sequence {bytes:02x?}")]
    InvalidUtf8 { bytes: Vec<u8> },
}

/// Failure of an operation on a loaded model or one of its sessions.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("context window exceeded: position {position} does not fit into {context_window} slots")]
    ContextOverflow { position: usize, context_window: usize },

    #[error(transparent)]
    Tokenization(#[from] TokenizationError),

    #[error("forward pass failed at position {position}: {reason}")]
    Engine { position: usize, reason: String },

    #[error("invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("session is generating")]
    SessionBusy,

    #[error("session is unusable after a failed generation: {reason}")]
    SessionFailed { reason: String },

    #[error("session is closed")]
    SessionClosed,

    #[error("failed to allocate {bytes} bytes for the execution context")]
    Allocation { bytes: usize },

    #[error("generation worker failed: {0}")]
    Worker(String),
}

pub type Result<T, E = InferenceError> = std::result::Result<T, E>;
