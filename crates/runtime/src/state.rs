//! Interpreter state: one global state per embed, one main thread.
//!
//! The global state owns the heap, the registry, the pre-interned
//! metamethod names and the hooks; the thread owns the value stack, the
//! call frames, the open-upvalue list and the to-be-closed slots. There
//! are no process-level globals anywhere: everything hangs off the
//! [`State`] the embedder created.

use std::rc::Rc;

use bitflags::bitflags;
use cript_core::hash::make_seed;
use cript_core::limits::{MAX_CCALLS, MAX_STACK};

use crate::config::Config;
use crate::heap::Heap;
use crate::meta::{MM_COUNT, Mm};
use crate::object::{Chunk, GcRef, ObjData, StrBits, Upvalue, Vmt};
use crate::protected::{Error, Status};
use crate::value::Value;

/// Registry slot reserved for the main thread.
pub const RIDX_MAINTHREAD: i64 = 0;
/// Registry slot holding the globals table.
pub const RIDX_GLOBALS: i64 = 1;

/// Reserved words, pre-interned and tagged at state creation so the
/// lexer's keyword check is a bit test away.
pub const KEYWORDS: [&str; 24] = [
    "and", "break", "case", "class", "const", "continue", "default", "else", "false", "fixed",
    "fn", "for", "if", "in", "local", "nil", "or", "return", "self", "static", "super", "switch",
    "true", "while",
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameStatus: u8 {
        /// Native callee.
        const CCALL     = 1 << 0;
        /// Script callee.
        const SCRIPT    = 1 << 1;
        /// Running a `__gc` finalizer.
        const FINALIZER = 1 << 2;
        /// Entered from a hook (message handler, `__close`).
        const HOOK      = 1 << 3;
        /// Frame was reused by a tail call.
        const TAILCALL  = 1 << 4;
        /// Constructor frame: on return, the receiver replaces the
        /// results.
        const CTOR      = 1 << 5;
    }
}

/// One activation record.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stack slot of the callee; local 0 of script frames.
    pub(crate) base: usize,
    /// Saved program counter (script frames; next instruction).
    pub(crate) pc: usize,
    /// Running chunk, shared out of the prototype so the dispatch loop
    /// never borrows the heap.
    pub(crate) chunk: Option<Rc<Chunk>>,
    /// The value actually invoked (differs from `stack[base]` for bound
    /// methods and constructors, where that slot holds the receiver).
    pub(crate) callee: Value,
    /// Results the caller expects; -1 means "all of them".
    pub(crate) want: i32,
    /// Extra arguments collected by `VarargPrep`.
    pub(crate) varargs: Vec<Value>,
    pub(crate) status: FrameStatus,
}

/// Thread state: stack, frames, open upvalues, to-be-closed slots.
#[derive(Debug, Default)]
pub struct Thread {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    /// Open upvalues ordered by strictly descending stack slot.
    pub(crate) open_upvals: Vec<GcRef>,
    /// To-be-closed stack slots in registration order.
    pub(crate) tbc: Vec<usize>,
    /// Native/interpreter re-entry depth.
    pub(crate) ncalls: usize,
}

/// Global (per-embed) state.
pub struct GlobalState {
    pub(crate) heap: Heap,
    pub(crate) registry: GcRef,
    pub(crate) globals: GcRef,
    pub(crate) mm_names: [GcRef; MM_COUNT],
    pub(crate) base_vmts: [Option<Box<Vmt>>; BASE_TYPES],
    /// Shared "out of memory" message; raising it never allocates.
    pub(crate) memerr: GcRef,
    pub(crate) warn_hook: Option<Box<dyn FnMut(&str)>>,
    pub(crate) panic_hook: Option<fn(&State, &Error)>,
    pub(crate) config: Config,
}

/// Number of base types that can carry a per-type virtual-method table.
pub const BASE_TYPES: usize = 8;

/// Per-base-type vmt slot for a primitive value. Heap objects are
/// classified by kind in `State::get_mm`; instances, userdata and
/// classes never get here because they carry their own tables.
pub(crate) fn base_type_index(v: Value) -> usize {
    match v {
        Value::Nil => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Obj(_) => BASE_STR,
        Value::Light(_) => 4,
        Value::CFn(_) => BASE_FUNCTION,
    }
}

pub(crate) const BASE_STR: usize = 3;
pub(crate) const BASE_FUNCTION: usize = 5;
pub(crate) const BASE_TABLE: usize = 6;
pub(crate) const BASE_ARRAY: usize = 7;

/// The embeddable interpreter: global state plus the main thread.
pub struct State {
    pub(crate) gs: GlobalState,
    pub(crate) main: Thread,
}

impl State {
    pub fn new() -> Self {
        State::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let config = config.clamped();
        let mut heap = Heap::new(make_seed());
        heap.gc.pause = config.gc_pause;
        heap.gc.step_mul = config.gc_step_mul;
        heap.gc.step_size = config.gc_step_size;

        // pre-intern and pin the fixed strings before anything can run
        let mm_names: [GcRef; MM_COUNT] = std::array::from_fn(|i| {
            let r = heap.intern_fixed(Mm::from_index(i).unwrap().name());
            let s = match &mut heap.get_mut(r).data {
                ObjData::Str(s) => s,
                _ => unreachable!(),
            };
            s.bits.insert(StrBits::MM_NAME);
            s.extra = i as u8;
            r
        });
        for kw in KEYWORDS {
            let r = heap.intern_fixed(kw);
            if let ObjData::Str(s) = &mut heap.get_mut(r).data {
                s.bits.insert(StrBits::KEYWORD);
            }
        }
        let memerr = heap.intern_fixed("out of memory");

        let registry = heap.new_table(4);
        let globals = heap.new_table(16);
        heap.table_set(registry, Value::Int(RIDX_MAINTHREAD), Value::Nil);
        heap.table_set(registry, Value::Int(RIDX_GLOBALS), Value::Obj(globals));

        State {
            gs: GlobalState {
                heap,
                registry,
                globals,
                mm_names,
                base_vmts: std::array::from_fn(|_| None),
                memerr,
                warn_hook: None,
                panic_hook: None,
                config,
            },
            main: Thread::default(),
        }
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.gs.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.gs.heap
    }

    pub fn config(&self) -> &Config {
        &self.gs.config
    }

    /* ---------------- stack primitives ---------------- */

    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.main.stack.len()
    }

    pub(crate) fn push(&mut self, v: Value) -> Result<(), Error> {
        if self.main.stack.len() >= self.max_stack() {
            return Err(self.stack_overflow());
        }
        self.main.stack.push(v);
        Ok(())
    }

    /// Push without the limit check; only for error-reporting paths that
    /// run inside the reserved zone.
    pub(crate) fn push_reserve(&mut self, v: Value) {
        debug_assert!(
            self.main.stack.len() < self.max_stack() + cript_core::limits::STACK_RESERVE
        );
        self.main.stack.push(v);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.main.stack.pop().expect("value stack underflow")
    }

    #[inline]
    pub(crate) fn pop_n(&mut self, n: usize) {
        let len = self.main.stack.len();
        debug_assert!(n <= len);
        self.main.stack.truncate(len - n);
    }

    #[inline]
    pub(crate) fn peek(&self, depth: usize) -> Value {
        self.main.stack[self.main.stack.len() - 1 - depth]
    }

    #[inline]
    pub(crate) fn set_slot(&mut self, slot: usize, v: Value) {
        self.main.stack[slot] = v;
    }

    #[inline]
    pub(crate) fn slot(&self, slot: usize) -> Value {
        self.main.stack[slot]
    }

    pub(crate) fn ensure_stack(&mut self, extra: usize) -> Result<(), Error> {
        if self.main.stack.len() + extra > self.max_stack() {
            return Err(self.stack_overflow());
        }
        self.main.stack.reserve(extra);
        Ok(())
    }

    fn max_stack(&self) -> usize {
        self.gs.config.max_stack.min(MAX_STACK)
    }

    pub(crate) fn max_ccalls(&self) -> usize {
        self.gs.config.max_ccalls.min(MAX_CCALLS)
    }

    fn stack_overflow(&mut self) -> Error {
        // formatting happens inside the reserved zone, so interning the
        // message cannot overflow again
        let s = self.gs.heap.intern_str("stack overflow");
        Error { status: Status::RuntimeErr, value: Value::Obj(s) }
    }

    /* ---------------- globals ---------------- */

    pub fn globals(&self) -> GcRef {
        self.gs.globals
    }

    pub fn registry(&self) -> GcRef {
        self.gs.registry
    }

    pub(crate) fn mm_name(&self, mm: Mm) -> GcRef {
        self.gs.mm_names[mm as usize]
    }

    /* ---------------- open upvalues ---------------- */

    /// Find the open upvalue for `slot`, creating (and list-inserting) it
    /// on first capture. The list stays strictly descending by slot, so
    /// at most one open upvalue exists per slot.
    pub(crate) fn find_or_create_upvalue(&mut self, slot: usize) -> GcRef {
        let mut insert_at = self.main.open_upvals.len();
        for (i, &u) in self.main.open_upvals.iter().enumerate() {
            match self.gs.heap.upvalue(u).open_slot() {
                Some(s) if s == slot => return u,
                Some(s) if s < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let u = self.gs.heap.new_upvalue_open(slot);
        self.main.open_upvals.insert(insert_at, u);
        u
    }

    /// Close every open upvalue at or above `level`: unlink it and move
    /// the stack value into the upvalue itself.
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        while let Some(&u) = self.main.open_upvals.first() {
            let slot = match self.gs.heap.upvalue(u).open_slot() {
                Some(s) => s,
                None => {
                    self.main.open_upvals.remove(0);
                    continue;
                }
            };
            if slot < level {
                break;
            }
            let v = self.main.stack[slot];
            *self.gs.heap.upvalue_mut(u) = Upvalue::Closed(v);
            self.gs.heap.barrier_forward(u, v);
            self.main.open_upvals.remove(0);
        }
    }

    /// Read through an upvalue, open or closed.
    pub(crate) fn upvalue_value(&self, u: GcRef) -> Value {
        match self.gs.heap.upvalue(u) {
            Upvalue::Open(slot) => self.main.stack[*slot],
            Upvalue::Closed(v) => *v,
        }
    }

    pub(crate) fn upvalue_assign(&mut self, u: GcRef, v: Value) {
        match self.gs.heap.upvalue(u) {
            Upvalue::Open(slot) => {
                let slot = *slot;
                self.main.stack[slot] = v;
            }
            Upvalue::Closed(_) => self.gs.heap.upvalue_store(u, v),
        }
    }

    /* ---------------- GC roots ---------------- */

    pub(crate) fn mark_roots(&mut self) {
        let heap = &mut self.gs.heap;
        for i in 0..self.main.stack.len() {
            heap.mark_value(self.main.stack[i]);
        }
        for f in &self.main.frames {
            heap.mark_value(f.callee);
            for &v in &f.varargs {
                heap.mark_value(v);
            }
        }
        for &u in &self.main.open_upvals {
            heap.mark_object(u);
        }
        let temps = heap.temp_roots.clone();
        for v in temps {
            heap.mark_value(v);
        }
        heap.mark_object(self.gs.registry);
        heap.mark_object(self.gs.globals);
        for &r in &self.gs.mm_names {
            heap.mark_object(r);
        }
        for vmt in self.gs.base_vmts.iter().flatten() {
            for &v in &vmt.0 {
                heap.mark_value(v);
            }
        }
        heap.mark_object(self.gs.memerr);
    }

    /* ---------------- hooks ---------------- */

    pub fn set_warn_hook(&mut self, hook: Option<Box<dyn FnMut(&str)>>) {
        self.gs.warn_hook = hook;
    }

    pub fn set_panic_hook(&mut self, hook: Option<fn(&State, &Error)>) {
        self.gs.panic_hook = hook;
    }

    pub fn warn(&mut self, msg: &str) {
        match &mut self.gs.warn_hook {
            Some(hook) => hook(msg),
            None => tracing::warn!(target: "cript", "{msg}"),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_holds_globals() {
        let st = State::new();
        let g = st.gs.heap.table_get(st.gs.registry, Value::Int(RIDX_GLOBALS));
        assert!(matches!(g, Value::Obj(r) if r == st.gs.globals));
    }

    #[test]
    fn mm_names_are_fixed_and_tagged() {
        let st = State::new();
        for (i, &r) in st.gs.mm_names.iter().enumerate() {
            let s = st.gs.heap.str_(r);
            assert!(s.bits.contains(StrBits::MM_NAME));
            assert_eq!(s.extra as usize, i);
        }
    }

    #[test]
    fn upvalue_list_stays_descending_and_unique() {
        let mut st = State::new();
        st.main.stack = vec![Value::Int(0); 10];
        let a = st.find_or_create_upvalue(3);
        let b = st.find_or_create_upvalue(7);
        let c = st.find_or_create_upvalue(5);
        let again = st.find_or_create_upvalue(3);
        assert_eq!(a, again);
        let slots: Vec<usize> = st
            .main
            .open_upvals
            .iter()
            .map(|&u| st.gs.heap.upvalue(u).open_slot().unwrap())
            .collect();
        assert_eq!(slots, vec![7, 5, 3]);
        let _ = (b, c);
    }

    #[test]
    fn closing_moves_values_off_the_stack() {
        let mut st = State::new();
        st.main.stack = vec![Value::Int(10), Value::Int(11), Value::Int(12)];
        let u = st.find_or_create_upvalue(2);
        st.close_upvalues(1);
        assert!(st.main.open_upvals.is_empty());
        assert!(matches!(st.upvalue_value(u), Value::Int(12)));
        // writes now hit the closed slot, not the stack
        st.upvalue_assign(u, Value::Int(99));
        assert!(matches!(st.upvalue_value(u), Value::Int(99)));
        assert!(matches!(st.main.stack[2], Value::Int(12)));
    }
}
