//! Sessions and the streaming bridge.
//!
//! Each [`Session::generate`] call moves the session's execution context into a
//! dedicated worker thread. The worker streams increments through a bounded
//! channel and puts the context back before sending the terminal event, so a
//! caller that has seen [`StreamEvent::Finished`] can immediately start the next
//! turn.
//!
//! ```text
//! ┌──────────┐  generate   ┌──────────────────┐   StreamEvent    ┌──────────────────┐
//! │  Caller  │ ──────────> │  Worker thread   │ ───────────────> │ GenerationStream │
//! │          │             │  owns the        │  bounded(32)     │  (Iterator)      │
//! │          │ <────────── │  context         │                  │                  │
//! └──────────┘   cancel    └──────────────────┘                  └──────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::context::{ExecutionContext, XorShiftRng};
use crate::error::{InferenceError, Result};
use crate::generation::{Completion, CompletionReason, GenerationParams, GenerationStats, Generator, TextIncrement};
use crate::handle::ModelHandle;
use crate::models::Model;

/// Maximum increments buffered between the worker and the caller.
pub const STREAM_CAPACITY: usize = 32;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Cooperative cancellation flag of one generation.
///
/// Checked between tokens; a forward pass in progress always completes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels this token once `timeout` elapses, unless the returned guard is dropped first.
    pub fn cancel_after(&self, timeout: Duration) -> TimeoutGuard {
        let (disarm, disarmed) = bounded::<()>(0);
        let token = self.clone();

        let spawned = thread::Builder::new().name("olm-timeout".into()).spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(timeout) {
                log::info!("generation timed out after {timeout:?}, cancelling");
                token.cancel();
            }
        });

        if let Err(err) = spawned {
            log::warn!("failed to start the timeout timer: {err}");
        }

        TimeoutGuard { _disarm: disarm }
    }
}

/// Disarms a pending timeout when dropped.
#[derive(Debug)]
pub struct TimeoutGuard {
    _disarm: Sender<()>,
}

/// Event delivered by a [`GenerationStream`].
#[derive(Debug)]
pub enum StreamEvent {
    Increment(TextIncrement),
    /// Always the last event of a stream.
    Finished(Completion),
}

/// Pull-based stream of one generation.
///
/// Yields increments in emission order followed by exactly one
/// [`StreamEvent::Finished`]. Dropping the stream cancels the generation.
#[derive(Debug)]
pub struct GenerationStream {
    receiver: Receiver<StreamEvent>,
    token: CancellationToken,
    finished: bool,
}

impl GenerationStream {
    /// Requests cancellation; increments already emitted stay valid.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drains the stream, concatenating every increment.
    pub fn collect_text(self) -> (String, Completion) {
        let mut text = String::new();
        for event in self {
            match event {
                StreamEvent::Increment(increment) => text.push_str(&increment.text),
                StreamEvent::Finished(completion) => return (text, completion),
            }
        }

        // The iterator always ends with a completion.
        let reason = CompletionReason::Failed(InferenceError::Worker("stream ended without completion".into()));
        (text, Completion { reason, stats: GenerationStats::default() })
    }
}

impl Iterator for GenerationStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let event = self.receiver.recv().unwrap_or_else(|_| {
            StreamEvent::Finished(Completion {
                reason: CompletionReason::Failed(InferenceError::Worker("generation worker stopped unexpectedly".into())),
                stats: GenerationStats::default(),
            })
        });

        if matches!(event, StreamEvent::Finished(_)) {
            self.finished = true;
        }

        Some(event)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.finished {
            self.token.cancel();
        }
    }
}

/// Ownership state of a session's execution context.
#[derive(Debug)]
enum Slot {
    Idle(Box<ExecutionContext>),
    /// A worker owns the context.
    Generating,
    Failed(String),
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the slot as failed if the worker exits without handing the context back.
struct SlotGuard {
    slot: Arc<Mutex<Slot>>,
    restored: bool,
}

impl SlotGuard {
    fn restore(mut self, state: Slot) {
        *lock(&self.slot) = state;
        self.restored = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.restored {
            *lock(&self.slot) = Slot::Failed("generation worker panicked".into());
        }
    }
}

/// One conversation with a loaded model.
///
/// Owns an execution context; at most one generation runs at a time.
#[derive(Debug)]
pub struct Session {
    id: u64,
    handle: ModelHandle,
    model: Arc<Model>,
    slot: Arc<Mutex<Slot>>,
    current: Mutex<Option<CancellationToken>>,
}

impl Session {
    /// Allocates a context on the handle's model.
    pub fn open(handle: &ModelHandle) -> Result<Self> {
        let model = handle.model()?;
        let ctx = model.new_context(XorShiftRng::from_clock())?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!("opened session {id} with a window of {}", ctx.context_window());

        Ok(Self {
            id,
            handle: handle.clone(),
            model,
            slot: Arc::new(Mutex::new(Slot::Idle(Box::new(ctx)))),
            current: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Starts generating a continuation of `prompt` on a worker thread.
    ///
    /// Fails immediately, without emitting anything, when the model was unloaded,
    /// the parameters are invalid or the session is not idle.
    pub fn generate(&self, prompt: &str, params: GenerationParams) -> Result<GenerationStream> {
        params.validate()?;

        if !self.handle.is_loaded() {
            return Err(InferenceError::ModelNotLoaded);
        }

        let mut ctx = self.take_context()?;

        let tokenizer = self.model.tokenizer();
        let will_add_bos = params.add_bos && ctx.is_empty() && tokenizer.bos_token_id().is_some();
        if prompt.is_empty() && ctx.pending().is_none() && !will_add_bos {
            *lock(&self.slot) = Slot::Idle(ctx);
            return Err(InferenceError::InvalidParams("prompt is empty and there is nothing to continue".into()));
        }

        let token = CancellationToken::new();
        *lock(&self.current) = Some(token.clone());

        let timeout = params.timeout.map(|timeout| token.cancel_after(timeout));
        let (sender, receiver) = bounded(STREAM_CAPACITY);

        let guard = SlotGuard { slot: self.slot.clone(), restored: false };
        let model = self.model.clone();
        let worker_token = token.clone();
        let prompt = prompt.to_string();
        let id = self.id;

        let spawned = thread::Builder::new().name(format!("session-{id}")).spawn(move || {
            let _timeout = timeout;

            let completion = Generator::new(&model, &mut ctx, &params, &worker_token)
                .run(&prompt, &mut |increment| sender.send(StreamEvent::Increment(increment)).is_ok());

            match &completion.reason {
                CompletionReason::Failed(err) => {
                    drop(ctx);
                    guard.restore(Slot::Failed(err.to_string()));
                }
                _ => guard.restore(Slot::Idle(ctx)),
            }

            if sender.send(StreamEvent::Finished(completion)).is_err() {
                log::debug!("session {id}: stream dropped before completion");
            }
        });

        match spawned {
            Ok(_) => Ok(GenerationStream { receiver, token, finished: false }),
            Err(err) => {
                // The closure, context included, is gone with the failed spawn.
                *lock(&self.slot) = Slot::Failed(format!("failed to spawn worker: {err}"));
                Err(InferenceError::Worker(err.to_string()))
            }
        }
    }

    fn take_context(&self) -> Result<Box<ExecutionContext>> {
        let mut slot = lock(&self.slot);
        match std::mem::replace(&mut *slot, Slot::Generating) {
            Slot::Idle(ctx) => Ok(ctx),
            other => {
                let err = Self::unavailable(&other);
                *slot = other;
                Err(err)
            }
        }
    }

    fn unavailable(slot: &Slot) -> InferenceError {
        match slot {
            Slot::Idle(_) | Slot::Generating => InferenceError::SessionBusy,
            Slot::Failed(reason) => InferenceError::SessionFailed { reason: reason.clone() },
            Slot::Closed => InferenceError::SessionClosed,
        }
    }

    /// Cancels the running generation, if any.
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.current).as_ref() {
            token.cancel();
        }
    }

    /// Releases the execution context. Closing twice is allowed.
    pub fn close(&self) -> Result<()> {
        let mut slot = lock(&self.slot);
        if matches!(*slot, Slot::Generating) {
            return Err(InferenceError::SessionBusy);
        }
        *slot = Slot::Closed;
        log::debug!("closed session {}", self.id);
        Ok(())
    }

    /// Starts a new conversation on the same context.
    pub fn reset(&self) -> Result<()> {
        match &mut *lock(&self.slot) {
            Slot::Idle(ctx) => {
                ctx.reset();
                Ok(())
            }
            other => Err(Self::unavailable(other)),
        }
    }

    /// Number of positions currently used in the context.
    pub fn position(&self) -> Result<usize> {
        match &*lock(&self.slot) {
            Slot::Idle(ctx) => Ok(ctx.position()),
            other => Err(Self::unavailable(other)),
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(*lock(&self.slot), Slot::Generating)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A running worker keeps the context alive until it notices.
        self.cancel();
    }
}
