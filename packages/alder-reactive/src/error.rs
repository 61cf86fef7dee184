//! Engine error kinds.

use std::any::Any;
use std::panic;

use thiserror::Error;

/// Errors raised by the reactive engine.
///
/// These are delivered as panics carrying a typed payload, so tests and host
/// error reporters can distinguish them by downcasting:
///
/// ```
/// # use alder_reactive::*;
/// use std::panic::{catch_unwind, AssertUnwindSafe};
///
/// let state = create_signal(0);
/// let bad = create_memo(move || {
///     state.set(1); // writes are not allowed while a memo computes
///     state.get()
/// });
/// let err = catch_unwind(AssertUnwindSafe(|| bad.get())).unwrap_err();
/// assert_eq!(
///     err.downcast_ref::<ReactiveError>(),
///     Some(&ReactiveError::WriteInsideMemo)
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A memo depends on itself directly or transitively, or a batch kept
    /// feeding itself new writes past the iteration limit.
    #[error("cyclic reactive dependency")]
    Cycle,
    /// A signal write happened while a memo was computing.
    #[error("cannot write to a signal while a memo is computing")]
    WriteInsideMemo,
}

/// Raise an engine error as a typed panic.
pub(crate) fn raise(err: ReactiveError) -> ! {
    panic::panic_any(err)
}

/// A panic captured out of a memo compute closure.
///
/// Typed engine errors survive capture intact so that re-raises keep their
/// kind; arbitrary payloads are preserved as their message.
pub(crate) enum CapturedPanic {
    Engine(ReactiveError),
    Message(String),
}

impl CapturedPanic {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<ReactiveError>() {
            Ok(err) => Self::Engine(*err),
            Err(payload) => match payload.downcast::<String>() {
                Ok(msg) => Self::Message(*msg),
                Err(payload) => match payload.downcast::<&'static str>() {
                    Ok(msg) => Self::Message((*msg).to_string()),
                    Err(_) => Self::Message("memo compute closure panicked".to_string()),
                },
            },
        }
    }

    pub fn reraise(&self) -> ! {
        match self {
            Self::Engine(err) => panic::panic_any(*err),
            Self::Message(msg) => panic::panic_any(msg.clone()),
        }
    }
}
