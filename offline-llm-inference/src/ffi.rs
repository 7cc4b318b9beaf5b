//! C ABI over models, sessions and generation streams.
//!
//! Objects are opaque heap handles owned by the caller and released with the
//! matching `olm_*_free`/`olm_unload_model`/`olm_close_session` call. Every
//! entry point accepts null pointers. Failures return null or a negative code
//! and leave a message for [`olm_last_error`] on the calling thread.

use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use crate::configuration::{LoadConfig, Quantization, QuantizationHint};
use crate::error::InferenceError;
use crate::generation::{Completion, CompletionReason, GenerationParams, TruncationPolicy};
use crate::handle::{ModelHandle, load_model};
use crate::sampler::SamplingParams;
use crate::session::{GenerationStream, Session, StreamEvent};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

pub const OLM_OK: i32 = 0;
pub const OLM_ERROR: i32 = -1;

/// Quantization hint accepting any file. Other hints use the file's ids: 0 = F32, 1 = Q8_0.
pub const OLM_QUANTIZATION_ANY: i32 = -1;
pub const OLM_QUANTIZATION_F32: i32 = 0;
pub const OLM_QUANTIZATION_Q8_0: i32 = 1;

/// Loaded model.
pub struct OlmModel {
    handle: ModelHandle,
}

/// Open session.
pub struct OlmSession {
    session: Session,
}

/// Generation in progress.
pub struct OlmStream {
    stream: GenerationStream,
    completion: Option<Completion>,
}

/// How a generation ended, as seen through the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OlmCompletion {
    /// The stream has not finished yet.
    Pending = 0,
    StopSequence = 1,
    EndOfSequence = 2,
    MaxTokens = 3,
    ContextFull = 4,
    Cancelled = 5,
    Failed = 6,
}

impl From<&CompletionReason> for OlmCompletion {
    fn from(reason: &CompletionReason) -> Self {
        match reason {
            CompletionReason::StopSequence => OlmCompletion::StopSequence,
            CompletionReason::EndOfSequence => OlmCompletion::EndOfSequence,
            CompletionReason::MaxTokens => OlmCompletion::MaxTokens,
            CompletionReason::ContextFull => OlmCompletion::ContextFull,
            CompletionReason::Cancelled => OlmCompletion::Cancelled,
            CompletionReason::Failed(_) => OlmCompletion::Failed,
        }
    }
}

/// Generation parameters; obtain defaults from [`olm_generation_params_default`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OlmGenerationParams {
    pub temperature: f32,
    /// Zero disables top-k filtering.
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub repeat_last_n: u32,
    pub max_new_tokens: u32,
    /// Array of `n_stop_sequences` NUL-terminated UTF-8 strings, may be null.
    pub stop_sequences: *const *const c_char,
    pub n_stop_sequences: usize,
    pub use_seed: bool,
    pub seed: u64,
    pub add_bos: bool,
    pub stream_batch: u32,
    /// Drop the oldest tokens instead of failing when the window is full.
    pub keep_recent: bool,
    /// Zero means no timeout.
    pub timeout_ms: u64,
}

impl Default for OlmGenerationParams {
    fn default() -> Self {
        let params = GenerationParams::default();
        let sampling = &params.sampling;
        Self {
            temperature: sampling.temperature,
            top_k: sampling.top_k as u32,
            top_p: sampling.top_p,
            repetition_penalty: sampling.repetition_penalty,
            repeat_last_n: sampling.repeat_last_n as u32,
            max_new_tokens: params.max_new_tokens as u32,
            stop_sequences: ptr::null(),
            n_stop_sequences: 0,
            use_seed: false,
            seed: 0,
            add_bos: params.add_bos,
            stream_batch: params.stream_batch as u32,
            keep_recent: params.truncation == TruncationPolicy::KeepRecent,
            timeout_ms: 0,
        }
    }
}

impl OlmGenerationParams {
    /// # Safety
    /// `stop_sequences` must point to `n_stop_sequences` valid C strings or be null.
    unsafe fn to_params(&self) -> Result<GenerationParams, InferenceError> {
        let mut stop_sequences = Vec::with_capacity(self.n_stop_sequences);
        if !self.stop_sequences.is_null() {
            // SAFETY: guaranteed by the caller.
            let raw = unsafe { std::slice::from_raw_parts(self.stop_sequences, self.n_stop_sequences) };
            for &stop in raw {
                // SAFETY: null entries are rejected by `read_str`, others are valid C strings.
                let stop = unsafe { read_str(stop) }.map_err(InferenceError::InvalidParams)?;
                stop_sequences.push(stop.to_string());
            }
        }

        let params = GenerationParams {
            sampling: SamplingParams {
                temperature: self.temperature,
                top_k: self.top_k as usize,
                top_p: self.top_p,
                repetition_penalty: self.repetition_penalty,
                repeat_last_n: self.repeat_last_n as usize,
            },
            max_new_tokens: self.max_new_tokens as usize,
            stop_sequences,
            seed: self.use_seed.then_some(self.seed),
            add_bos: self.add_bos,
            stream_batch: self.stream_batch as usize,
            truncation: if self.keep_recent { TruncationPolicy::KeepRecent } else { TruncationPolicy::Disabled },
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
        };
        params.validate()?;

        Ok(params)
    }
}

fn set_last_error(err: impl Display) {
    let message = err.to_string().replace('\0', " ");
    log::debug!("ffi error: {message}");
    LAST_ERROR.with(|last| *last.borrow_mut() = CString::new(message).ok());
}

/// Runs `f`, turning errors and panics into `fallback` plus a last error message.
fn guarded<T, E: Display>(fallback: T, f: impl FnOnce() -> Result<T, E>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            set_last_error(err);
            fallback
        }
        Err(_) => {
            set_last_error("internal panic");
            fallback
        }
    }
}

/// # Safety
/// `value` must be null or point to a NUL-terminated string.
unsafe fn read_str<'a>(value: *const c_char) -> Result<&'a str, String> {
    if value.is_null() {
        return Err("null string".to_string());
    }
    // SAFETY: guaranteed by the caller.
    unsafe { CStr::from_ptr(value) }.to_str().map_err(|err| format!("string is not valid UTF-8: {err}"))
}

/// Interior NULs cannot cross the boundary and are dropped.
fn into_c_string(value: String) -> Result<*mut c_char, String> {
    CString::new(value.replace('\0', "")).map(CString::into_raw).map_err(|err| err.to_string())
}

/// Loads a model file. Zero `context_window` or `thread_count` selects the default;
/// `quantization` is one of the `OLM_QUANTIZATION_*` hints.
///
/// # Safety
/// `path` must be null or a NUL-terminated UTF-8 string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_load_model(
    path: *const c_char,
    context_window: u32,
    thread_count: u32,
    quantization: i32,
) -> *mut OlmModel {
    guarded(ptr::null_mut(), || {
        // SAFETY: guaranteed by the caller.
        let path = unsafe { read_str(path) }?;
        let hint = match quantization {
            OLM_QUANTIZATION_ANY => QuantizationHint::Any,
            id => QuantizationHint::Exact(
                Quantization::from_id(id).ok_or_else(|| format!("unknown quantization hint {id}"))?,
            ),
        };
        let config = LoadConfig::builder()
            .context_window(Some(context_window as usize))
            .thread_count(Some(thread_count as usize))
            .quantization_hint(Some(hint))
            .build();
        let handle = load_model(path, config).map_err(|err| err.to_string())?;
        Ok::<_, String>(Box::into_raw(Box::new(OlmModel { handle })))
    })
}

/// Unloads the model and releases the handle. Open sessions fail afterwards.
///
/// # Safety
/// `model` must be null or a handle returned by [`olm_load_model`] that was not released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_unload_model(model: *mut OlmModel) {
    if model.is_null() {
        return;
    }
    // SAFETY: guaranteed by the caller.
    let model = unsafe { Box::from_raw(model) };
    model.handle.unload();
}

/// Whether the model behind the handle is still loaded; false for null.
///
/// # Safety
/// `model` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_model_is_loaded(model: *const OlmModel) -> bool {
    // SAFETY: guaranteed by the caller.
    unsafe { model.as_ref() }.is_some_and(|model| model.handle.is_loaded())
}

/// Model summary as a JSON object; release with [`olm_string_free`].
///
/// # Safety
/// `model` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_model_info(model: *const OlmModel) -> *mut c_char {
    guarded(ptr::null_mut(), || {
        // SAFETY: guaranteed by the caller.
        let model = unsafe { model.as_ref() }.ok_or("null model")?;
        let info = model.handle.info().ok_or("model is not loaded")?;
        into_c_string(info.to_json().map_err(|err| err.to_string())?)
    })
}

/// # Safety
/// `model` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_open_session(model: *const OlmModel) -> *mut OlmSession {
    guarded(ptr::null_mut(), || {
        // SAFETY: guaranteed by the caller.
        let model = unsafe { model.as_ref() }.ok_or("null model")?;
        let session = Session::open(&model.handle).map_err(|err| err.to_string())?;
        Ok::<_, String>(Box::into_raw(Box::new(OlmSession { session })))
    })
}

/// Closes and releases a session. Fails, keeping the session, while it is generating.
///
/// # Safety
/// `session` must be null or a live session handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_close_session(session: *mut OlmSession) -> i32 {
    if session.is_null() {
        return OLM_OK;
    }
    guarded(OLM_ERROR, || {
        // SAFETY: guaranteed by the caller.
        unsafe { &*session }.session.close()?;
        // SAFETY: the pointer came from `Box::into_raw` and is released once.
        drop(unsafe { Box::from_raw(session) });
        Ok::<_, InferenceError>(OLM_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn olm_generation_params_default() -> OlmGenerationParams {
    OlmGenerationParams::default()
}

/// Starts a generation; `params` may be null for defaults.
///
/// # Safety
/// `session` must be null or a live session handle, `prompt` null or a
/// NUL-terminated string and `params` null or a valid parameter block.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_generate(
    session: *const OlmSession,
    prompt: *const c_char,
    params: *const OlmGenerationParams,
) -> *mut OlmStream {
    guarded(ptr::null_mut(), || {
        // SAFETY: guaranteed by the caller.
        let session = unsafe { session.as_ref() }.ok_or("null session")?;
        // SAFETY: guaranteed by the caller.
        let prompt = unsafe { read_str(prompt) }?;
        // SAFETY: guaranteed by the caller.
        let params = match unsafe { params.as_ref() } {
            // SAFETY: guaranteed by the caller.
            Some(params) => unsafe { params.to_params() }.map_err(|err| err.to_string())?,
            None => GenerationParams::default(),
        };

        let stream = session.session.generate(prompt, params).map_err(|err| err.to_string())?;
        Ok::<_, String>(Box::into_raw(Box::new(OlmStream { stream, completion: None })))
    })
}

/// Blocks for the next piece of text; release it with [`olm_string_free`].
///
/// Returns null once the stream has finished; [`olm_stream_completion`] then
/// tells why.
///
/// # Safety
/// `stream` must be null or a live stream handle used from one thread at a time.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_stream_next(stream: *mut OlmStream) -> *mut c_char {
    guarded(ptr::null_mut(), || {
        // SAFETY: guaranteed by the caller.
        let stream = unsafe { stream.as_mut() }.ok_or("null stream")?;

        match stream.stream.next() {
            Some(StreamEvent::Increment(increment)) => into_c_string(increment.text),
            Some(StreamEvent::Finished(completion)) => {
                if let CompletionReason::Failed(err) = &completion.reason {
                    set_last_error(err);
                }
                stream.completion = Some(completion);
                Ok(ptr::null_mut())
            }
            None => Ok(ptr::null_mut()),
        }
    })
}

/// Completion reason, [`OlmCompletion::Pending`] until [`olm_stream_next`] returned null.
///
/// # Safety
/// `stream` must be null or a live stream handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_stream_completion(stream: *const OlmStream) -> OlmCompletion {
    // SAFETY: guaranteed by the caller.
    match unsafe { stream.as_ref() }.and_then(|stream| stream.completion.as_ref()) {
        Some(completion) => OlmCompletion::from(&completion.reason),
        None => OlmCompletion::Pending,
    }
}

/// Requests cancellation of one generation.
///
/// # Safety
/// `stream` must be null or a live stream handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_stream_cancel(stream: *const OlmStream) {
    // SAFETY: guaranteed by the caller.
    if let Some(stream) = unsafe { stream.as_ref() } {
        stream.stream.cancel();
    }
}

/// Releases a stream, cancelling the generation if it is still running.
///
/// # Safety
/// `stream` must be null or a stream handle that was not released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_stream_free(stream: *mut OlmStream) {
    if !stream.is_null() {
        // SAFETY: the pointer came from `Box::into_raw` and is released once.
        drop(unsafe { Box::from_raw(stream) });
    }
}

/// Cancels whatever the session is generating.
///
/// # Safety
/// `session` must be null or a live session handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_cancel(session: *const OlmSession) {
    // SAFETY: guaranteed by the caller.
    if let Some(session) = unsafe { session.as_ref() } {
        session.session.cancel();
    }
}

/// Message of the last failure on this thread, or null.
///
/// The pointer stays valid until the next failing call on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn olm_last_error() -> *const c_char {
    LAST_ERROR.with(|last| last.borrow().as_ref().map_or(ptr::null(), |message| message.as_ptr()))
}

/// Releases a string returned by this library.
///
/// # Safety
/// `value` must be null or a string returned by this library that was not released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn olm_string_free(value: *mut c_char) {
    if !value.is_null() {
        // SAFETY: the pointer came from `CString::into_raw`.
        drop(unsafe { CString::from_raw(value) });
    }
}
