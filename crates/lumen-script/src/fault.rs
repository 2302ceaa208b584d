//! Faults raised by script code, caught at the native/managed boundary.
//!
//! Nothing that goes wrong inside a managed call unwinds into the frame loop:
//! every call returns `Result<_, ScriptFault>`, and the fault is logged with
//! its message and stack trace by [`ScriptFault::report`].

use crate::handle::Generation;

/// What kind of failure a [`ScriptFault`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The script trapped (unreachable, division by zero, out-of-bounds
    /// access, ...).
    Trap,
    /// The call exhausted its fuel budget.
    OutOfFuel,
    /// The call used a handle from another load generation.
    StaleHandle,
    /// The call could not be made (signature mismatch, missing export, host
    /// error).
    Runtime,
}

/// A failure raised while running script code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("script fault in {method}: {message}")]
pub struct ScriptFault {
    /// Qualified name of the method that was running.
    pub method: String,
    pub kind: FaultKind,
    pub message: String,
    /// Script-side stack trace, one frame per line. Empty when unavailable.
    pub stack_trace: String,
}

impl ScriptFault {
    pub(crate) fn runtime(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            kind: FaultKind::Runtime,
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    pub(crate) fn stale(
        method: impl Into<String>,
        handle: Generation,
        current: Generation,
    ) -> Self {
        Self {
            method: method.into(),
            kind: FaultKind::StaleHandle,
            message: format!("handle from {handle} used in {current}"),
            stack_trace: String::new(),
        }
    }

    /// Classify an error returned by a wasmtime call.
    pub(crate) fn from_call_error(method: &str, error: anyhow::Error, fuel_budget: u64) -> Self {
        let stack_trace = error
            .downcast_ref::<wasmtime::WasmBacktrace>()
            .map(|bt| bt.to_string())
            .unwrap_or_default();

        // The trap may be the error itself or somewhere in its context chain.
        let trap = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<wasmtime::Trap>())
            .copied();

        let (kind, message) = match trap {
            Some(wasmtime::Trap::OutOfFuel) => (
                FaultKind::OutOfFuel,
                format!("script ran out of fuel (budget: {fuel_budget} units)"),
            ),
            Some(trap) => (FaultKind::Trap, trap.to_string()),
            None => (FaultKind::Runtime, format!("{error:#}")),
        };

        Self {
            method: method.to_owned(),
            kind,
            message,
            stack_trace,
        }
    }

    /// Log the fault: message first, then the stack trace.
    pub fn report(&self) {
        tracing::error!(method = %self.method, kind = ?self.kind, "script fault: {}", self.message);
        if !self.stack_trace.is_empty() {
            tracing::error!(method = %self.method, "script stack trace:\n{}", self.stack_trace);
        }
    }
}
