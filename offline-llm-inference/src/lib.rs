//! On-device inference runtime for decoder-only language models.
//!
//! A model file is loaded once into a [`ModelHandle`]; each [`Session`] owns an
//! execution context on that model and produces text as a pull-based
//! [`GenerationStream`]:
//!
//! ```no_run
//! use offline_llm_inference::{GenerationParams, LoadConfig, Session, StreamEvent, load_model};
//!
//! let handle = load_model("model.bin", LoadConfig::default())?;
//! let session = Session::open(&handle)?;
//!
//! for event in session.generate("Once upon a time", GenerationParams::default())? {
//!     match event {
//!         StreamEvent::Increment(increment) => print!("{}", increment.text),
//!         StreamEvent::Finished(completion) => println!("\n{:?}", completion.reason),
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod configuration;
mod context;
mod error;
mod generation;
mod handle;
mod layers;
mod models;
mod sampler;
mod session;
mod tensor;
mod tokenizer;
mod utils;

pub mod checkpoint;
pub mod ffi;

pub use crate::configuration::{
    Architecture, DEFAULT_THREAD_COUNT, HEADER_SIZE, LoadConfig, LoadConfigBuilder, MODEL_MAGIC, MODEL_VERSION,
    ModelConfig, Quantization, QuantizationHint, SCALE_ALIGNMENT, WEIGHT_ALIGNMENT,
};
pub use crate::context::{ExecutionContext, XorShiftRng};
pub use crate::error::{InferenceError, ModelLoadError, Result, TokenizationError};
pub use crate::generation::{
    Completion, CompletionReason, GenerationParams, GenerationParamsBuilder, GenerationStats, Phase, TextIncrement,
    TruncationPolicy,
};
pub use crate::handle::{ModelHandle, ModelInfo, load_model};
pub use crate::models::{Model, ModelBuilder};
pub use crate::sampler::{Sampler, SamplingParams};
pub use crate::session::{CancellationToken, GenerationStream, STREAM_CAPACITY, Session, StreamEvent, TimeoutGuard};
pub use crate::tokenizer::{StreamDecoder, TokenId, Tokenizer};
