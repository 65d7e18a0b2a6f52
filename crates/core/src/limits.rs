//! Operand and recursion bounds shared by the compiler and the VM.

/// Largest value of a short (1-byte) instruction argument.
pub const MAX_SHORT_ARG: u32 = u8::MAX as u32;

/// Largest value of a long (3-byte) instruction argument.
pub const MAX_LONG_ARG: u32 = (1 << 24) - 1;

/// Largest forward or backward jump offset (24-bit operand).
pub const MAX_JUMP: u32 = MAX_LONG_ARG;

/// Maximum number of constants in one function prototype.
pub const MAX_CONSTANTS: usize = MAX_LONG_ARG as usize;

/// Maximum number of active local variables per function.
pub const MAX_LOCALS: usize = 250;

/// Maximum number of upvalues per function.
pub const MAX_UPVALUES: usize = MAX_SHORT_ARG as usize;

/// Maximum number of parameters in a function definition.
pub const MAX_PARAMS: usize = 200;

/// Default cap on the value stack, in slots.
pub const MAX_STACK: usize = 1_000_000;

/// Slots kept in reserve above the stack limit so that a stack-overflow
/// error can still be raised and formatted.
pub const STACK_RESERVE: usize = 32;

/// Default cap on nested native/interpreter re-entries before a
/// "C stack overflow" error is raised.
pub const MAX_CCALLS: usize = 200;

/// Minimum slots the host API guarantees to a native function.
pub const MIN_API_STACK: usize = 20;
