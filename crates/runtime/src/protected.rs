//! Protected calls and the error model.
//!
//! The original design recovers from errors with a chain of long-jump
//! buffers; the Rust rendition makes every fallible VM operation return
//! `Result` and lets `?` unwind the native frames. What survives the
//! translation unchanged is the bookkeeping: a protected call snapshots
//! the frame count, the stack top and the to-be-closed watermark, and on
//! error it runs the to-be-closed slots over the unwound interval (in
//! reverse registration order, with the error object as argument),
//! truncates the frames, and delivers the error value where the caller
//! can see it. The message handler runs before any of that, while the
//! erroring frames are still intact, so it can build a traceback.

use crate::state::State;
use crate::value::Value;

/// Outcome classes of a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Type errors, bad indices, missing metamethods, undefined globals,
    /// zero divisors, calls of non-callables.
    RuntimeErr,
    /// Bad source; only the compiler raises this.
    SyntaxErr,
    /// Allocation failed even after an emergency collection.
    MemErr,
    /// An error was raised while a message handler was running.
    ErrErr,
}

/// An in-flight error: a status class plus the error object itself.
#[derive(Debug, Clone)]
pub struct Error {
    pub status: Status,
    pub value: Value,
}

impl Error {
    pub fn runtime(value: Value) -> Self {
        Error { status: Status::RuntimeErr, value }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the error object usually needs the heap to render; callers that
        // have a state use `State::error_message` instead
        match self.status {
            Status::Ok => write!(f, "no error"),
            Status::RuntimeErr => write!(f, "runtime error"),
            Status::SyntaxErr => write!(f, "syntax error"),
            Status::MemErr => write!(f, "memory error"),
            Status::ErrErr => write!(f, "error while handling error"),
        }
    }
}

impl std::error::Error for Error {}

/// Snapshot of the recoverable part of the thread, taken by a protected
/// call before it runs its body.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    pub frames: usize,
    pub top: usize,
    pub tbc: usize,
    pub ncalls: usize,
}

impl State {
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            frames: self.main.frames.len(),
            top: self.top(),
            tbc: self.main.tbc.len(),
            ncalls: self.main.ncalls,
        }
    }

    /// Unwind to a checkpoint after an error: run the to-be-closed slots
    /// on the interval being abandoned, drop the dead frames, restore the
    /// stack top. A `__close` that itself errors is reported through the
    /// warning hook and replaces the propagating error, per the close
    /// error contract.
    pub(crate) fn unwind_to(&mut self, cp: Checkpoint, err: Error) -> Error {
        let err = match self.close_tbc_down_to(cp.tbc, cp.top, err.value) {
            Ok(()) => err,
            Err(close_err) => close_err,
        };
        self.close_upvalues(cp.top);
        self.main.frames.truncate(cp.frames);
        self.main.stack.truncate(cp.top);
        self.main.ncalls = cp.ncalls;
        err
    }

    /// Human-readable message of an error object.
    pub fn error_message(&self, e: &Error) -> String {
        self.error_to_display(e)
    }

    pub(crate) fn error_to_display(&self, e: &Error) -> String {
        match e.value {
            Value::Obj(r) => {
                if let Some(s) = self.gs.heap.try_str(r) {
                    s.as_str().to_string()
                } else {
                    format!("{} (error object)", self.gs.heap.kind(r).type_name())
                }
            }
            Value::Nil => e.to_string(),
            Value::Bool(b) => format!("{b}"),
            Value::Int(i) => format!("{i}"),
            Value::Float(f) => format!("{f}"),
            _ => e.to_string(),
        }
    }

    /// Raise a runtime error whose object is an interned message string.
    pub(crate) fn rt_error(&mut self, msg: &str) -> Error {
        let s = self.gs.heap.intern_str(msg);
        Error::runtime(Value::Obj(s))
    }

    /// The shared memory-error object; reporting it allocates nothing.
    pub(crate) fn mem_error(&self) -> Error {
        Error { status: Status::MemErr, value: Value::Obj(self.gs.memerr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_error_reuses_the_fixed_string() {
        let st = State::new();
        let a = st.mem_error();
        let b = st.mem_error();
        assert_eq!(a.status, Status::MemErr);
        match (a.value, b.value) {
            (Value::Obj(x), Value::Obj(y)) => assert_eq!(x, y),
            _ => panic!("memory error must carry the fixed string"),
        }
        assert_eq!(st.error_message(&a), "out of memory");
    }
}
