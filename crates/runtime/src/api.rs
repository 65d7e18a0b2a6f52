//! The host API.
//!
//! Embedders and native functions talk to the interpreter through stack
//! manipulation, the way the original C interface does: values are
//! addressed by an index into the current call window: `0..` from the
//! bottom (the first argument of a native call), negative from the top
//! (`-1` is the top value). Natives receive their arguments in the
//! window, push their results, and return how many they pushed.

use crate::heap::Heap;
use crate::meta::Mm;
use crate::object::{GcRef, ObjData, ObjKind, StrBits, Vmt};
use crate::protected::{Error, Status};
use crate::state::{FrameStatus, State};
use crate::value::{CFunction, Value};

/// Stack index: absolute from the window bottom when non-negative,
/// relative to the top when negative.
pub type Index = i32;

/// Coarse value classification for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Table,
    Array,
    Function,
    Class,
    Instance,
    UserData,
    Light,
}

impl TypeTag {
    pub const fn name(self) -> &'static str {
        match self {
            TypeTag::Nil => "nil",
            TypeTag::Bool => "boolean",
            TypeTag::Int | TypeTag::Float => "number",
            TypeTag::Str => "string",
            TypeTag::Table => "table",
            TypeTag::Array => "array",
            TypeTag::Function => "function",
            TypeTag::Class => "class",
            TypeTag::Instance => "instance",
            TypeTag::UserData => "userdata",
            TypeTag::Light => "lightuserdata",
        }
    }
}

fn tag_of(heap: &Heap, v: Value) -> TypeTag {
    match v {
        Value::Nil => TypeTag::Nil,
        Value::Bool(_) => TypeTag::Bool,
        Value::Int(_) => TypeTag::Int,
        Value::Float(_) => TypeTag::Float,
        Value::Light(_) => TypeTag::Light,
        Value::CFn(_) => TypeTag::Function,
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::Str => TypeTag::Str,
            ObjKind::Table => TypeTag::Table,
            ObjKind::Array => TypeTag::Array,
            ObjKind::Class => TypeTag::Class,
            ObjKind::Instance => TypeTag::Instance,
            ObjKind::UserData => TypeTag::UserData,
            ObjKind::Closure | ObjKind::CClosure | ObjKind::BoundMethod | ObjKind::Proto => {
                TypeTag::Function
            }
            ObjKind::Upvalue => TypeTag::Nil,
        },
    }
}

impl State {
    /* ---------------- window addressing ---------------- */

    /// Bottom of the current window: the first argument of the running
    /// native call, or the stack bottom outside of any call.
    fn win_base(&self) -> usize {
        match self.main.frames.last() {
            Some(f) if f.status.contains(FrameStatus::CCALL) => f.base + 1,
            _ => 0,
        }
    }

    /// Number of values in the current window.
    pub fn get_top(&self) -> usize {
        self.top() - self.win_base()
    }

    /// Number of arguments the running native call received.
    pub fn nargs(&self) -> usize {
        self.get_top()
    }

    fn resolve(&self, idx: Index) -> Option<usize> {
        let base = self.win_base();
        let top = self.top();
        let abs = if idx < 0 {
            top.checked_sub(idx.unsigned_abs() as usize)?
        } else {
            base + idx as usize
        };
        (abs >= base && abs < top).then_some(abs)
    }

    /// Value at an index; nil when the index is outside the window
    /// (absent optional arguments read as nil).
    pub fn value_at(&self, idx: Index) -> Value {
        self.resolve(idx).map_or(Value::Nil, |i| self.main.stack[i])
    }

    pub fn type_of(&self, idx: Index) -> TypeTag {
        tag_of(&self.gs.heap, self.value_at(idx))
    }

    /* ---------------- pushing ---------------- */

    pub fn push_nil(&mut self) -> Result<(), Error> {
        self.push(Value::Nil)
    }

    pub fn push_bool(&mut self, b: bool) -> Result<(), Error> {
        self.push(Value::Bool(b))
    }

    pub fn push_int(&mut self, i: i64) -> Result<(), Error> {
        self.push(Value::Int(i))
    }

    pub fn push_float(&mut self, f: f64) -> Result<(), Error> {
        self.push(Value::Float(f))
    }

    pub fn push_string(&mut self, s: &str) -> Result<(), Error> {
        let r = self.gs.heap.intern_str(s);
        self.push(Value::Obj(r))
    }

    pub fn push_bytes(&mut self, b: &[u8]) -> Result<(), Error> {
        let r = self.gs.heap.intern(b);
        self.push(Value::Obj(r))
    }

    pub fn push_cfunction(&mut self, f: CFunction) -> Result<(), Error> {
        self.push(Value::CFn(f))
    }

    /// Pop `nup` values and bind them as the upvalues of a new native
    /// closure.
    pub fn push_cclosure(&mut self, f: CFunction, nup: usize) -> Result<(), Error> {
        debug_assert!(nup <= self.get_top());
        let first = self.top() - nup;
        let upvals: Vec<Value> = self.main.stack[first..].to_vec();
        self.pop_n(nup);
        let r = self.gs.heap.new_cclosure(f, upvals);
        self.push(Value::Obj(r))
    }

    pub fn push_light(&mut self, p: *mut ()) -> Result<(), Error> {
        self.push(Value::Light(p))
    }

    /// Push an arbitrary value the host already holds (a handle from
    /// [`State::intern`], something read with [`State::value_at`]).
    pub fn push_value(&mut self, v: Value) -> Result<(), Error> {
        self.push(v)
    }

    pub fn push_value_at(&mut self, idx: Index) -> Result<(), Error> {
        let v = self.value_at(idx);
        self.push(v)
    }

    /* ---------------- stack shaping ---------------- */

    pub fn pop_values(&mut self, n: usize) {
        self.pop_n(n.min(self.get_top()));
    }

    /// Grow (with nils) or shrink the window to exactly `n` values.
    pub fn set_top_to(&mut self, n: usize) -> Result<(), Error> {
        let want = self.win_base() + n;
        while self.top() < want {
            self.push(Value::Nil)?;
        }
        self.main.stack.truncate(want);
        Ok(())
    }

    pub fn remove_at(&mut self, idx: Index) {
        if let Some(i) = self.resolve(idx) {
            self.main.stack.remove(i);
        }
    }

    pub fn insert_at(&mut self, idx: Index) {
        if let Some(i) = self.resolve(idx) {
            let v = self.pop();
            self.main.stack.insert(i, v);
        }
    }

    pub fn replace_at(&mut self, idx: Index) {
        if let Some(i) = self.resolve(idx) {
            let v = self.pop();
            self.main.stack[i] = v;
        }
    }

    /* ---------------- reading ---------------- */

    pub fn to_bool(&self, idx: Index) -> bool {
        self.value_at(idx).is_truthy()
    }

    /// Integer view: integers directly, floats when exact.
    pub fn to_int(&self, idx: Index) -> Option<i64> {
        self.value_at(idx).as_int_exact()
    }

    pub fn to_float(&self, idx: Index) -> Option<f64> {
        self.value_at(idx).as_number().map(|n| n.as_f64())
    }

    pub fn to_str(&self, idx: Index) -> Option<&str> {
        match self.value_at(idx) {
            Value::Obj(r) => self.gs.heap.try_str(r).map(|s| s.as_str()),
            _ => None,
        }
    }

    pub fn to_bytes(&self, idx: Index) -> Option<&[u8]> {
        match self.value_at(idx) {
            Value::Obj(r) => self.gs.heap.try_str(r).map(|s| &*s.bytes),
            _ => None,
        }
    }

    /* ---------------- checked getters ---------------- */

    pub fn check_int(&mut self, idx: Index) -> Result<i64, Error> {
        self.to_int(idx).ok_or_else(|| self.arg_type_error(idx, "number"))
    }

    pub fn check_float(&mut self, idx: Index) -> Result<f64, Error> {
        self.to_float(idx).ok_or_else(|| self.arg_type_error(idx, "number"))
    }

    pub fn check_str(&mut self, idx: Index) -> Result<String, Error> {
        let s = self.to_str(idx).map(str::to_string);
        s.ok_or_else(|| self.arg_type_error(idx, "string"))
    }

    pub fn check_type(&mut self, idx: Index, want: TypeTag) -> Result<Value, Error> {
        let v = self.value_at(idx);
        if tag_of(&self.gs.heap, v) == want {
            Ok(v)
        } else {
            Err(self.arg_type_error(idx, want.name()))
        }
    }

    fn arg_type_error(&mut self, idx: Index, want: &str) -> Error {
        let got = self.value_at(idx).type_name(&self.gs.heap);
        let n = if idx >= 0 { idx + 1 } else { self.get_top() as i32 + idx + 1 };
        self.rt_error(&format!("bad argument #{n}: expected {want}, got {got}"))
    }

    /// Raise an error with the value at the top of the stack as the
    /// error object.
    pub fn error_top(&mut self) -> Error {
        let v = self.pop();
        Error::runtime(v)
    }

    pub fn error_msg(&mut self, msg: &str) -> Error {
        self.rt_error(msg)
    }

    /* ---------------- tables, arrays, objects ---------------- */

    pub fn create_table(&mut self, hint: usize) -> Result<(), Error> {
        let t = self.gs.heap.new_table(hint);
        self.push(Value::Obj(t))
    }

    pub fn create_array(&mut self, hint: usize) -> Result<(), Error> {
        let a = self.gs.heap.new_array(hint);
        self.push(Value::Obj(a))
    }

    /// `t[k] = v` where `k` and `v` are the two topmost values
    /// (metamethod-honoring).
    pub fn set_table(&mut self, idx: Index) -> Result<(), Error> {
        let obj = self.value_at(idx);
        let val = self.pop();
        let key = self.pop();
        self.index_set(obj, key, val)
    }

    /// Replace the key at the top with `t[k]` (metamethod-honoring).
    pub fn get_table(&mut self, idx: Index) -> Result<(), Error> {
        let obj = self.value_at(idx);
        let key = self.pop();
        let v = self.index_get(obj, key)?;
        self.push(v)
    }

    pub fn set_field(&mut self, idx: Index, name: &str) -> Result<(), Error> {
        let obj = self.value_at(idx);
        let key = Value::Obj(self.gs.heap.intern_str(name));
        let val = self.pop();
        self.index_set(obj, key, val)
    }

    pub fn get_field(&mut self, idx: Index, name: &str) -> Result<(), Error> {
        let obj = self.value_at(idx);
        let key = Value::Obj(self.gs.heap.intern_str(name));
        let v = self.index_get(obj, key)?;
        self.push(v)
    }

    /// Raw table iteration: push the key and value of the first entry at
    /// or after `cursor`, returning the cursor for the next call. Each
    /// live entry is seen exactly once; order is unspecified.
    pub fn table_next(&mut self, idx: Index, cursor: usize) -> Result<Option<usize>, Error> {
        let t = match self.value_at(idx) {
            Value::Obj(r) if self.gs.heap.kind(r) == ObjKind::Table => r,
            _ => return Err(self.arg_type_error(idx, "table")),
        };
        match self.gs.heap.table(t).next_entry(cursor) {
            Some((slot, k, v)) => {
                self.push(k)?;
                self.push(v)?;
                Ok(Some(slot + 1))
            }
            None => Ok(None),
        }
    }

    pub fn len_at(&mut self, idx: Index) -> Result<i64, Error> {
        let v = self.value_at(idx);
        match v {
            Value::Obj(r) => match &self.gs.heap.get(r).data {
                ObjData::Str(s) => Ok(s.len() as i64),
                ObjData::Array(a) => Ok(a.len() as i64),
                ObjData::Table(t) => Ok(t.len() as i64),
                _ => Err(self.arg_type_error(idx, "string, array or table")),
            },
            _ => Err(self.arg_type_error(idx, "string, array or table")),
        }
    }

    /// Apply a binary operator to the two topmost values (metamethods
    /// included), replacing them with the result.
    pub fn arith_op(&mut self, op: cript_core::opcode::BinOp) -> Result<(), Error> {
        let b = self.pop();
        let a = self.pop();
        let v = self.arith(op, a, b)?;
        self.push(v)
    }

    /// Concatenate the `n` topmost values into one string.
    pub fn concat(&mut self, n: usize) -> Result<(), Error> {
        if n == 0 {
            return self.push_string("");
        }
        let first = self.top() - n;
        let mut acc = self.main.stack[first];
        for i in 1..n {
            let next = self.main.stack[first + i];
            acc = self.concat_values(acc, next)?;
        }
        self.pop_n(n);
        self.push(acc)
    }

    pub fn tostring_at(&mut self, idx: Index) -> Result<String, Error> {
        let v = self.value_at(idx);
        self.tostring_value(v)
    }

    /* ---------------- globals and registration ---------------- */

    pub fn get_global(&mut self, name: &str) -> Result<(), Error> {
        let key = Value::Obj(self.gs.heap.intern_str(name));
        let v = self.gs.heap.table_get(self.gs.globals, key);
        self.push(v)
    }

    pub fn set_global(&mut self, name: &str) -> Result<(), Error> {
        let key = Value::Obj(self.gs.heap.intern_str(name));
        let v = self.pop();
        self.gs.heap.table_set(self.gs.globals, key, v);
        Ok(())
    }

    /// Register one native function as a global.
    pub fn register(&mut self, name: &str, f: CFunction) -> Result<(), Error> {
        self.push_cfunction(f)?;
        self.set_global(name)
    }

    /// Build a module table from a function list and leave it on the
    /// stack.
    pub fn register_lib(&mut self, funcs: &[(&str, CFunction)]) -> Result<(), Error> {
        self.create_table(funcs.len())?;
        for &(name, f) in funcs {
            let t = self.value_at(-1);
            let key = Value::Obj(self.gs.heap.intern_str(name));
            if let Value::Obj(tr) = t {
                self.gs.heap.table_set(tr, key, Value::CFn(f));
            }
        }
        Ok(())
    }

    /* ---------------- userdata ---------------- */

    pub fn new_userdata_api(&mut self, size: usize, nuvalues: usize) -> Result<(), Error> {
        let u = self.gs.heap.new_userdata(size, nuvalues);
        self.push(Value::Obj(u))
    }

    pub fn userdata_bytes_mut(&mut self, idx: Index) -> Result<&mut [u8], Error> {
        match self.value_at(idx) {
            Value::Obj(r) if self.gs.heap.kind(r) == ObjKind::UserData => {
                Ok(&mut self.gs.heap.userdata_mut(r).data)
            }
            _ => Err(self.arg_type_error(idx, "userdata")),
        }
    }

    pub fn get_user_value(&mut self, idx: Index, i: usize) -> Result<(), Error> {
        match self.value_at(idx) {
            Value::Obj(r) if self.gs.heap.kind(r) == ObjKind::UserData => {
                let v = self.gs.heap.userdata(r).user_values.get(i).copied();
                self.push(v.unwrap_or(Value::Nil))
            }
            _ => Err(self.arg_type_error(idx, "userdata")),
        }
    }

    pub fn set_user_value(&mut self, idx: Index, i: usize) -> Result<(), Error> {
        match self.value_at(idx) {
            Value::Obj(r) if self.gs.heap.kind(r) == ObjKind::UserData => {
                let v = self.pop();
                if i >= self.gs.heap.userdata(r).user_values.len() {
                    return Err(self.rt_error("user value index out of range"));
                }
                self.gs.heap.userdata_set_uv(r, i, v);
                Ok(())
            }
            _ => Err(self.arg_type_error(idx, "userdata")),
        }
    }

    /// Pop a function and install it as a metamethod for a whole base
    /// type (all numbers, all strings, ...). Object kinds with
    /// per-instance tables (instances, userdata, classes) are rejected.
    pub fn set_base_mm(&mut self, tag: TypeTag, mm: Mm) -> Result<(), Error> {
        let idx = match tag {
            TypeTag::Nil => 0,
            TypeTag::Bool => 1,
            TypeTag::Int | TypeTag::Float => 2,
            TypeTag::Str => crate::state::BASE_STR,
            TypeTag::Light => 4,
            TypeTag::Function => crate::state::BASE_FUNCTION,
            TypeTag::Table => crate::state::BASE_TABLE,
            TypeTag::Array => crate::state::BASE_ARRAY,
            TypeTag::Instance | TypeTag::UserData | TypeTag::Class => {
                return Err(self.rt_error("type carries its own metamethod table"));
            }
        };
        let f = self.pop();
        self.gs.base_vmts[idx]
            .get_or_insert_with(|| Box::new(Vmt::default()))
            .set(mm, f);
        Ok(())
    }

    /// Pop a function and install it as a metamethod of the userdata.
    pub fn set_userdata_mm(&mut self, idx: Index, mm: Mm) -> Result<(), Error> {
        match self.value_at(idx) {
            Value::Obj(r) if self.gs.heap.kind(r) == ObjKind::UserData => {
                let f = self.pop();
                let u = self.gs.heap.userdata_mut(r);
                u.vmt.get_or_insert_with(|| Box::new(Vmt::default())).set(mm, f);
                self.gs.heap.barrier_forward(r, f);
                Ok(())
            }
            _ => Err(self.arg_type_error(idx, "userdata")),
        }
    }

    /* ---------------- native upvalues ---------------- */

    /// Receiver of the running native call: the value in the callee
    /// slot. For a native installed as a metamethod this is the object
    /// the operation was invoked on; for a plain call it is the
    /// function value itself.
    pub fn receiver(&self) -> Value {
        match self.main.frames.last() {
            Some(f) => self.main.stack[f.base],
            None => Value::Nil,
        }
    }

    /// Upvalue `i` of the running native closure.
    pub fn upvalue(&self, i: usize) -> Value {
        match self.main.frames.last() {
            Some(f) => match f.callee.as_obj() {
                Some(r) if self.gs.heap.kind(r) == ObjKind::CClosure => {
                    self.gs.heap.cclosure(r).upvals.get(i).copied().unwrap_or(Value::Nil)
                }
                _ => Value::Nil,
            },
            None => Value::Nil,
        }
    }

    /* ---------------- registry ---------------- */

    pub fn registry_get(&mut self, key: i64) -> Result<(), Error> {
        let v = self.gs.heap.table_get(self.gs.registry, Value::Int(key));
        self.push(v)
    }

    pub fn registry_set(&mut self, key: i64) -> Result<(), Error> {
        let v = self.pop();
        self.gs.heap.table_set(self.gs.registry, Value::Int(key), v);
        Ok(())
    }

    /* ---------------- collector control ---------------- */

    pub fn gc_stop(&mut self) {
        self.gs.heap.gc.stop();
    }

    pub fn gc_restart(&mut self) {
        self.gs.heap.gc.restart();
    }

    /// Run a full collection cycle now.
    pub fn gc_collect(&mut self) {
        self.gc_full(false);
    }

    /// Emergency collection for embedders under memory pressure; the
    /// `stopem` guard makes reentrant emergencies no-ops.
    pub fn gc_emergency(&mut self) {
        self.gc_full(true);
    }

    /// Total bytes the heap believes are live.
    pub fn gc_count(&self) -> usize {
        self.gs.heap.total_bytes()
    }

    pub fn gc_set_pause(&mut self, pause: u32) {
        self.gs.heap.gc.pause = pause.clamp(50, 1000);
    }

    pub fn gc_set_step_mul(&mut self, mul: u32) {
        self.gs.heap.gc.step_mul = mul.clamp(10, 10_000);
    }

    pub fn gc_set_step_size(&mut self, size: u32) {
        self.gs.heap.gc.step_size = size.clamp(1024, 1 << 20);
    }

    /* ---------------- misc ---------------- */

    /// Interned-string handle for host code that wants identity
    /// comparisons.
    pub fn intern(&mut self, s: &str) -> GcRef {
        self.gs.heap.intern_str(s)
    }

    /// True when the string at `idx` is a reserved keyword.
    pub fn is_keyword(&self, idx: Index) -> bool {
        match self.value_at(idx) {
            Value::Obj(r) => self
                .gs
                .heap
                .try_str(r)
                .is_some_and(|s| s.bits.contains(StrBits::KEYWORD)),
            _ => false,
        }
    }

    /// Protected call taking the message handler from a stack index.
    pub fn pcall_with_handler(&mut self, nargs: usize, want: i32, msgh: Index) -> Status {
        let h = self.value_at(msgh);
        let h = if h.is_nil() { None } else { Some(h) };
        self.pcall(nargs, want, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_indexing_absolute_and_relative() {
        let mut st = State::new();
        st.push_int(10).unwrap();
        st.push_int(20).unwrap();
        st.push_int(30).unwrap();
        assert_eq!(st.get_top(), 3);
        assert_eq!(st.to_int(0), Some(10));
        assert_eq!(st.to_int(-1), Some(30));
        assert_eq!(st.to_int(-3), Some(10));
        assert!(st.to_int(5).is_none());
        st.pop_values(1);
        assert_eq!(st.to_int(-1), Some(20));
    }

    #[test]
    fn globals_roundtrip() {
        let mut st = State::new();
        st.push_int(7).unwrap();
        st.set_global("answer").unwrap();
        st.get_global("answer").unwrap();
        assert_eq!(st.to_int(-1), Some(7));
    }

    #[test]
    fn native_functions_run_through_call() {
        fn add(st: &mut State) -> Result<usize, Error> {
            let a = st.check_int(0)?;
            let b = st.check_int(1)?;
            st.push_int(a + b)?;
            Ok(1)
        }
        let mut st = State::new();
        st.push_cfunction(add).unwrap();
        st.push_int(2).unwrap();
        st.push_int(40).unwrap();
        st.call(2, 1).unwrap();
        assert_eq!(st.to_int(-1), Some(42));
    }

    #[test]
    fn cclosure_upvalues_are_reachable() {
        fn counter(st: &mut State) -> Result<usize, Error> {
            let v = st.upvalue(0);
            st.push(v)?;
            Ok(1)
        }
        let mut st = State::new();
        st.push_int(99).unwrap();
        st.push_cclosure(counter, 1).unwrap();
        st.call(0, 1).unwrap();
        assert_eq!(st.to_int(-1), Some(99));
    }

    #[test]
    fn pcall_catches_native_errors() {
        fn boom(st: &mut State) -> Result<usize, Error> {
            Err(st.error_msg("boom"))
        }
        let mut st = State::new();
        st.push_cfunction(boom).unwrap();
        let status = st.pcall(0, 0, None);
        assert_eq!(status, Status::RuntimeErr);
        assert_eq!(st.to_str(-1), Some("boom"));
    }

    #[test]
    fn concat_coerces_numbers() {
        let mut st = State::new();
        st.push_string("x=").unwrap();
        st.push_int(4).unwrap();
        st.concat(2).unwrap();
        assert_eq!(st.to_str(-1), Some("x=4"));
    }
}
