//! Cript Compiler
//!
//! Source text in, closure on the runtime stack out. The pipeline is a
//! tokenizer ([`lexer`]), a single-pass Pratt parser ([`parser`]) and a
//! per-function emitter ([`emit`]); prototypes and interned strings are
//! allocated straight into the runtime heap, anchored in its temp roots
//! until the finished closure is reachable from the stack.
//!
//! ```rust
//! use cript_runtime::State;
//!
//! let mut st = State::new();
//! criptc::load_str(&mut st, "return 1 + 2 * 3;", "demo").unwrap();
//! st.call(0, 1).unwrap();
//! assert_eq!(st.to_int(-1), Some(7));
//! ```

use std::path::Path;

use cript_runtime::{Error, State, Status, Value};

pub mod lexer;

mod emit;
mod parser;

/// A compile-time failure: the offending line and a message. Never
/// recoverable except by fixing the source and re-invoking the parser.
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub line: u32,
    pub msg: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.msg)
    }
}

impl std::error::Error for SyntaxError {}

impl SyntaxError {
    /// Convert into a runtime error object carrying `name:line: msg`.
    pub fn into_error(self, st: &mut State, chunk_name: &str) -> Error {
        let msg = format!("{}:{}: {}", chunk_name, self.line, self.msg);
        let s = st.heap_mut().intern_str(&msg);
        Error { status: Status::SyntaxErr, value: Value::Obj(s) }
    }
}

/// Compile `source` and push the resulting closure. On failure nothing
/// is pushed and the syntax error comes back as an [`Error`].
pub fn load_str(st: &mut State, source: &str, chunk_name: &str) -> Result<(), Error> {
    let mark = st.heap().temp_mark();
    let compiled = parser::Parser::new(st, source, chunk_name).and_then(|p| p.parse_chunk());
    let res = match compiled {
        Ok(proto) => {
            tracing::debug!(chunk = chunk_name, "compiled");
            let cl = st.heap_mut().new_closure(proto, Vec::new());
            st.push_value(Value::Obj(cl))
        }
        Err(e) => {
            tracing::debug!(chunk = chunk_name, line = e.line, "compile failed");
            Err(e.into_error(st, chunk_name))
        }
    };
    st.heap_mut().temp_release(mark);
    res
}

/// Compile the contents of a file; the chunk name is the path itself.
pub fn load_file(st: &mut State, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        let s = st.heap_mut().intern_str(&format!("cannot read {}: {e}", path.display()));
        Error { status: Status::RuntimeErr, value: Value::Obj(s) }
    })?;
    let name = path.display().to_string();
    load_str(st, &text, &name)
}

/// Compile and run `source` with no arguments, keeping all results on
/// the stack.
pub fn do_str(st: &mut State, source: &str, chunk_name: &str) -> Result<(), Error> {
    load_str(st, source, chunk_name)?;
    st.call(0, cript_runtime::MULTRET)
}

/// Compile and run a file.
pub fn do_file(st: &mut State, path: impl AsRef<Path>) -> Result<(), Error> {
    load_file(st, &path)?;
    st.call(0, cript_runtime::MULTRET)
}
