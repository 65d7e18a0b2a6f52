//! Cript Core: shared atoms for the Cript bytecode engine
//!
//! This crate holds the pieces both the compiler and the runtime need to
//! agree on, and nothing else:
//!
//! - `opcode`: the instruction set, operand widths and per-opcode stack
//!   effects
//! - `code`: instruction operand encoding and the sparse line-info table
//! - `hash`: seeded byte hashing and the per-variant value mixes
//! - `mem`: allocation accounting (total bytes + collector debt)
//! - `limits`: operand and recursion bounds
//!
//! Everything that touches values, objects or state lives in
//! `cript-runtime`; everything that touches source text lives in
//! `cript-compiler`.

pub mod code;
pub mod hash;
pub mod limits;
pub mod mem;
pub mod opcode;

pub use code::{LineInfo, get_u24, put_u24};
pub use hash::{hash_bytes, hash_float, hash_handle, hash_int, make_seed};
pub use mem::MemStats;
pub use opcode::OpCode;
