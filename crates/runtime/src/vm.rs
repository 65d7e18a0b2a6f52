//! The bytecode interpreter.
//!
//! Dispatch is a single `match` over the opcode byte inside the hot loop.
//! The running chunk is held through an `Rc` clone taken at frame entry,
//! so the loop reads code without borrowing the heap; the program counter
//! lives in a local and is written back to the frame before anything that
//! can call out (calls, metamethods, to-be-closed handlers, errors), which
//! is also what keeps error positions and tracebacks accurate.
//!
//! The call protocol: the callee sits at `base`, arguments above it, and
//! results land at `base` again, adjusted to what the caller asked for
//! (`want`, -1 meaning "all of them"). Script frames treat `base` as local
//! slot 0, which holds the function itself for plain calls and the
//! receiver for bound-method, constructor and `__call` dispatch.

use std::rc::Rc;

use cript_core::code::get_u24;
use cript_core::limits::STACK_RESERVE;
use cript_core::opcode::{BinOp, OpCode};

use crate::meta::Mm;
use crate::object::{Chunk, GcRef, ObjData, ObjKind};
use crate::protected::{Error, Status};
use crate::state::{Frame, FrameStatus, State, base_type_index};
use crate::value::{Number, Value};

/// Result-count request meaning "everything the callee returns".
pub const MULTRET: i32 = -1;

/// Outcome of primitive (metamethod-free) arithmetic.
enum Prim {
    Val(Value),
    /// Some operand is not numeric; dispatch the metamethod.
    NoNum,
}

/// Integer shift following the shift-count rules: counts past the word
/// width produce zero, negative counts shift the other way.
fn shift_left(a: i64, n: i64) -> i64 {
    if n < 0 {
        if n <= -64 { 0 } else { ((a as u64) >> -n) as i64 }
    } else if n >= 64 {
        0
    } else {
        ((a as u64) << n) as i64
    }
}

/// Primitive arithmetic on two values. `Err` is a domain error message
/// (zero divisor, fractional operand of a bitwise op); `NoNum` asks for
/// metamethod dispatch instead.
fn arith_prim(op: BinOp, a: Value, b: Value) -> Result<Prim, &'static str> {
    use BinOp::*;
    if matches!(op, Shl | Shr | BAnd | BOr | BXor) {
        // bitwise wants integers; floats convert only when exact
        let (x, y) = match (a.as_int_exact(), b.as_int_exact()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                if a.as_number().is_some() && b.as_number().is_some() {
                    return Err("number has no integer representation");
                }
                return Ok(Prim::NoNum);
            }
        };
        let v = match op {
            Shl => shift_left(x, y),
            Shr => shift_left(x, y.wrapping_neg()),
            BAnd => x & y,
            BOr => x | y,
            BXor => x ^ y,
            _ => unreachable!(),
        };
        return Ok(Prim::Val(Value::Int(v)));
    }
    let (x, y) = match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Ok(Prim::NoNum),
    };
    let v = match (op, x, y) {
        // integer + - * wrap modulo 2^64
        (Add, Number::Int(i), Number::Int(j)) => Value::Int(i.wrapping_add(j)),
        (Sub, Number::Int(i), Number::Int(j)) => Value::Int(i.wrapping_sub(j)),
        (Mul, Number::Int(i), Number::Int(j)) => Value::Int(i.wrapping_mul(j)),
        // division always goes to float
        (Div, x, y) => Value::Float(x.as_f64() / y.as_f64()),
        // power is always floating point
        (Pow, x, y) => Value::Float(x.as_f64().powf(y.as_f64())),
        (Mod, Number::Int(i), Number::Int(j)) => {
            if j == 0 {
                return Err("attempt to perform 'n % 0'");
            }
            // result follows the divisor's sign
            let r = i.wrapping_rem(j);
            Value::Int(if r != 0 && (r ^ j) < 0 { r + j } else { r })
        }
        (Mod, x, y) => {
            let (xf, yf) = (x.as_f64(), y.as_f64());
            let r = xf - (xf / yf).floor() * yf;
            Value::Float(r)
        }
        (Add, x, y) => Value::Float(x.as_f64() + y.as_f64()),
        (Sub, x, y) => Value::Float(x.as_f64() - y.as_f64()),
        (Mul, x, y) => Value::Float(x.as_f64() * y.as_f64()),
        (Concat, ..) | (Shl | Shr | BAnd | BOr | BXor, ..) => unreachable!(),
    };
    Ok(Prim::Val(v))
}

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return true;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return false;
    }
    let g = f.floor();
    i < g as i64 || (i == g as i64 && f > g)
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return false;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return true;
    }
    let c = f.ceil();
    (c as i64) < i || (c as i64 == i && f < c)
}

/// Numeric `<` with exact mixed int/float semantics.
fn num_lt(x: Number, y: Number) -> bool {
    match (x, y) {
        (Number::Int(i), Number::Int(j)) => i < j,
        (Number::Float(a), Number::Float(b)) => a < b,
        (Number::Int(i), Number::Float(b)) => int_lt_float(i, b),
        (Number::Float(a), Number::Int(j)) => float_lt_int(a, j),
    }
}

fn num_le(x: Number, y: Number) -> bool {
    match (x, y) {
        (Number::Int(i), Number::Int(j)) => i <= j,
        (Number::Float(a), Number::Float(b)) => a <= b,
        // i <= f  <=>  not (f < i)
        (Number::Int(i), Number::Float(b)) => !float_lt_int(b, i),
        (Number::Float(a), Number::Int(j)) => !int_lt_float(j, a),
    }
}

/// Number-to-string coercion used by concat and to-string conversion.
pub(crate) fn number_to_string(n: Number) -> String {
    match n {
        Number::Int(i) => i.to_string(),
        Number::Float(f) => {
            if f.is_nan() {
                "nan".to_string()
            } else if f.is_infinite() {
                if f < 0.0 { "-inf".to_string() } else { "inf".to_string() }
            } else if f == f.trunc() && f.abs() < 1e15 {
                format!("{f:.1}")
            } else {
                format!("{f}")
            }
        }
    }
}

impl State {
    /* ================= public call surface ================= */

    /// Call the value below `nargs` arguments on the stack. Unprotected:
    /// an error unwinds out to the embedder, consulting the panic hook on
    /// the way.
    pub fn call(&mut self, nargs: usize, want: i32) -> Result<(), Error> {
        let base = self.top() - nargs - 1;
        match self.call_at(base, want, FrameStatus::empty()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(hook) = self.gs.panic_hook {
                    hook(self, &e);
                }
                Err(e)
            }
        }
    }

    /// Protected call: on error the stack is restored to the call point,
    /// to-be-closed slots over the unwound interval run, and the error
    /// value is pushed where the results would have been.
    pub fn pcall(&mut self, nargs: usize, want: i32, msgh: Option<Value>) -> Status {
        let base = self.top() - nargs - 1;
        let mut cp = self.checkpoint();
        cp.top = base;
        match self.call_at(base, want, FrameStatus::empty()) {
            Ok(()) => Status::Ok,
            Err(e) => {
                // the message handler sees the error while the erroring
                // frames are still intact, so it can build a traceback
                let e = match msgh {
                    Some(h) => self.run_message_handler(h, e),
                    None => e,
                };
                let e = self.unwind_to(cp, e);
                self.push_reserve(e.value);
                e.status
            }
        }
    }

    fn run_message_handler(&mut self, handler: Value, e: Error) -> Error {
        let cp = self.checkpoint();
        let res: Result<Value, Error> = (|| {
            self.push(handler)?;
            self.push(e.value)?;
            let base = self.top() - 2;
            self.call_at(base, 1, FrameStatus::HOOK)?;
            Ok(self.pop())
        })();
        match res {
            Ok(v) => Error { status: e.status, value: v },
            Err(inner) => {
                let inner = self.unwind_to(cp, inner);
                drop(inner);
                let s = self.gs.heap.intern_str("error in error handling");
                Error { status: Status::ErrErr, value: Value::Obj(s) }
            }
        }
    }

    /// Call `__gc` on `obj` for the collector, in a protected context
    /// marked as a finalizer frame; the object is the receiver.
    pub(crate) fn call_finalizer(&mut self, f: Value, obj: Value) -> Result<(), Error> {
        let cp = self.checkpoint();
        match self.call_mm(f, obj, &[], 0, FrameStatus::FINALIZER) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.unwind_to(cp, e)),
        }
    }

    /// Internal unprotected call: dispatch and, if a script frame was
    /// pushed, run it to completion.
    pub(crate) fn call_at(
        &mut self,
        base: usize,
        want: i32,
        extra: FrameStatus,
    ) -> Result<(), Error> {
        let func = self.slot(base);
        if self.dispatch_call(base, func, want, extra)? {
            // re-entering the dispatch loop consumes real (Rust) stack,
            // unlike the in-loop call path, so it counts as a C call
            self.main.ncalls += 1;
            let level = self.main.frames.len();
            let res = self.execute(level);
            self.main.ncalls -= 1;
            res?;
        }
        Ok(())
    }

    /* ================= call dispatch ================= */

    /// Begin a call of `func` with the window at `base` (receiver or the
    /// function itself in `stack[base]`, arguments above). Returns true
    /// when a script frame was pushed and the dispatch loop must run it.
    fn dispatch_call(
        &mut self,
        base: usize,
        func: Value,
        want: i32,
        extra: FrameStatus,
    ) -> Result<bool, Error> {
        if self.main.ncalls >= self.max_ccalls() {
            return Err(self.rt_error("C stack overflow"));
        }
        match func {
            Value::CFn(f) => {
                self.call_native(base, f, func, want, extra)?;
                Ok(false)
            }
            Value::Obj(r) => match self.gs.heap.kind(r) {
                ObjKind::Closure => {
                    self.push_script_frame(base, func, r, want, extra)?;
                    Ok(true)
                }
                ObjKind::CClosure => {
                    let f = self.gs.heap.cclosure(r).f;
                    self.call_native(base, f, func, want, extra)?;
                    Ok(false)
                }
                ObjKind::Class => self.dispatch_construct(base, r, want, extra),
                ObjKind::BoundMethod => {
                    let bm = self.gs.heap.bound_method(r);
                    let (receiver, method) = (bm.receiver, bm.method);
                    self.set_slot(base, receiver);
                    self.dispatch_call(base, method, want, extra)
                }
                ObjKind::Instance | ObjKind::UserData => {
                    let mm = self.get_mm(func, Mm::Call);
                    if mm.is_nil() {
                        Err(self.call_type_error(func))
                    } else {
                        // the callable stays in slot 0 as the receiver
                        self.dispatch_call(base, mm, want, extra)
                    }
                }
                _ => Err(self.call_type_error(func)),
            },
            _ => Err(self.call_type_error(func)),
        }
    }

    /// Native call: frame push, invocation, result adjustment, frame
    /// pop. Constructor frames deliver the receiver instead of whatever
    /// the native `__init` returned.
    fn call_native(
        &mut self,
        base: usize,
        f: crate::value::CFunction,
        callee: Value,
        want: i32,
        extra: FrameStatus,
    ) -> Result<(), Error> {
        self.main.ncalls += 1;
        self.main.frames.push(Frame {
            base,
            pc: 0,
            chunk: None,
            callee,
            want,
            varargs: Vec::new(),
            status: FrameStatus::CCALL | extra,
        });
        let res = f(self);
        self.main.frames.pop();
        self.main.ncalls -= 1;
        let n = res?;
        if extra.contains(FrameStatus::CTOR) {
            // slot(base) still holds the receiver; the results above it
            // are dropped
            self.main.stack.truncate(base + 1);
            self.adjust_results(base, 1, want);
        } else {
            self.finish_native(base, n, want);
        }
        Ok(())
    }

    fn call_type_error(&mut self, func: Value) -> Error {
        let t = func.type_name(&self.gs.heap);
        self.rt_error(&format!("attempt to call a {t} value"))
    }

    /// Constructor call: make the instance, run `__init` with the
    /// instance as receiver, and hand the instance (never `__init`'s
    /// return values) to the caller.
    fn dispatch_construct(
        &mut self,
        base: usize,
        class: GcRef,
        want: i32,
        extra: FrameStatus,
    ) -> Result<bool, Error> {
        let nargs = self.top() - base - 1;
        let inst = self.gs.heap.new_instance(class);
        // the callee slot becomes the receiver, which also anchors the
        // newborn instance
        self.set_slot(base, Value::Obj(inst));
        let init = self.gs.heap.class_get_mm(class, Mm::Init);
        if init.is_nil() {
            if nargs > 0 {
                return Err(self.rt_error(&format!(
                    "class has no '__init' but was called with {nargs} argument(s)"
                )));
            }
            self.main.stack.truncate(base + 1);
            self.adjust_results(base, 1, want);
            return Ok(false);
        }
        self.dispatch_call(base, init, want, extra | FrameStatus::CTOR)
    }

    fn push_script_frame(
        &mut self,
        base: usize,
        func: Value,
        clref: GcRef,
        want: i32,
        extra: FrameStatus,
    ) -> Result<(), Error> {
        let proto = self.gs.heap.closure(clref).proto;
        let chunk = Rc::clone(&self.gs.heap.proto(proto).chunk);
        let arity = chunk.arity as usize;
        let nargs = self.top() - base - 1;
        if !chunk.is_vararg {
            // fixed-arity adjustment happens at call time; vararg
            // functions run VarargPrep as their first instruction instead
            if nargs > arity {
                self.main.stack.truncate(base + 1 + arity);
            } else {
                for _ in nargs..arity {
                    self.push(Value::Nil)?;
                }
            }
        }
        self.ensure_stack(chunk.max_stack as usize + STACK_RESERVE)?;
        tracing::trace!(base, depth = self.main.frames.len(), "script call");
        self.main.frames.push(Frame {
            base,
            pc: 0,
            chunk: Some(chunk),
            callee: func,
            want,
            varargs: Vec::new(),
            status: FrameStatus::SCRIPT | extra,
        });
        Ok(())
    }

    /// Move the `n` results a native callee pushed down over the callee
    /// slot and adjust them to `want`.
    fn finish_native(&mut self, base: usize, n: usize, want: i32) {
        let first = self.top() - n;
        for i in 0..n {
            let v = self.main.stack[first + i];
            self.main.stack[base + i] = v;
        }
        self.main.stack.truncate(base + n);
        self.adjust_results(base, n, want);
    }

    fn adjust_results(&mut self, base: usize, got: usize, want: i32) {
        if want == MULTRET {
            debug_assert_eq!(self.top(), base + got);
            return;
        }
        let want = want as usize;
        if got < want {
            for _ in got..want {
                self.push_reserve(Value::Nil);
            }
        } else {
            self.main.stack.truncate(base + want);
        }
    }

    /* ================= metamethods ================= */

    /// Virtual-method lookup for a value: instances go through their
    /// class, userdata through their own table, everything else through
    /// the per-base-type tables.
    pub(crate) fn get_mm(&self, v: Value, mm: Mm) -> Value {
        let idx = if let Value::Obj(r) = v {
            match &self.gs.heap.get(r).data {
                ObjData::Instance(i) => return self.gs.heap.class_get_mm(i.class, mm),
                ObjData::UserData(u) => {
                    return u.vmt.as_ref().map_or(Value::Nil, |t| t.get(mm));
                }
                ObjData::Class(c) => {
                    return c.vmt.as_ref().map_or(Value::Nil, |t| t.get(mm));
                }
                ObjData::Str(_) => crate::state::BASE_STR,
                ObjData::Table(_) => crate::state::BASE_TABLE,
                ObjData::Array(_) => crate::state::BASE_ARRAY,
                _ => crate::state::BASE_FUNCTION,
            }
        } else {
            base_type_index(v)
        };
        self.gs.base_vmts[idx].as_ref().map_or(Value::Nil, |t| t.get(mm))
    }

    /// Invoke a metamethod with the method calling convention: the
    /// receiver occupies the callee slot (it becomes `self`), the
    /// operands follow as arguments.
    pub(crate) fn call_mm(
        &mut self,
        f: Value,
        receiver: Value,
        args: &[Value],
        want: i32,
        extra: FrameStatus,
    ) -> Result<(), Error> {
        self.push(receiver)?;
        for &a in args {
            self.push(a)?;
        }
        let base = self.top() - 1 - args.len();
        if self.dispatch_call(base, f, want, extra)? {
            self.main.ncalls += 1;
            let level = self.main.frames.len();
            let res = self.execute(level);
            self.main.ncalls -= 1;
            res?;
        }
        Ok(())
    }

    /// Binary metamethod dispatch: left operand first, then right; typed
    /// error when neither declares the slot.
    fn call_mm_binary(&mut self, mm: Mm, a: Value, b: Value) -> Result<Value, Error> {
        let mut f = self.get_mm(a, mm);
        let mut receiver = a;
        if f.is_nil() {
            f = self.get_mm(b, mm);
            receiver = b;
        }
        if f.is_nil() {
            let (ta, tb) = (a.type_name(&self.gs.heap), b.type_name(&self.gs.heap));
            let name = mm.name();
            return Err(self.rt_error(&format!(
                "attempt to perform arithmetic/comparison ('{name}') on a {ta} and a {tb}"
            )));
        }
        self.call_mm(f, receiver, &[a, b], 1, FrameStatus::empty())?;
        Ok(self.pop())
    }

    fn call_mm_unary(&mut self, mm: Mm, a: Value) -> Result<Value, Error> {
        let f = self.get_mm(a, mm);
        if f.is_nil() {
            let ta = a.type_name(&self.gs.heap);
            let name = mm.name();
            return Err(self.rt_error(&format!("attempt to perform '{name}' on a {ta} value")));
        }
        self.call_mm(f, a, &[a], 1, FrameStatus::empty())?;
        Ok(self.pop())
    }

    /* ================= primitives with fallback ================= */

    pub(crate) fn arith(&mut self, op: BinOp, a: Value, b: Value) -> Result<Value, Error> {
        if op == BinOp::Concat {
            return self.concat_values(a, b);
        }
        match arith_prim(op, a, b) {
            Ok(Prim::Val(v)) => Ok(v),
            Ok(Prim::NoNum) => self.call_mm_binary(Mm::for_binop(op), a, b),
            Err(msg) => Err(self.rt_error(msg)),
        }
    }

    pub(crate) fn concat_values(&mut self, a: Value, b: Value) -> Result<Value, Error> {
        let sa = self.coerce_to_str(a);
        let sb = self.coerce_to_str(b);
        match (sa, sb) {
            (Some(x), Some(y)) => {
                let mut bytes = Vec::with_capacity(x.len() + y.len());
                bytes.extend_from_slice(&x);
                bytes.extend_from_slice(&y);
                let s = self.gs.heap.intern(&bytes);
                Ok(Value::Obj(s))
            }
            _ => self.call_mm_binary(Mm::Concat, a, b),
        }
    }

    /// Strings stay themselves; numbers coerce. Everything else asks for
    /// the `__concat` metamethod.
    fn coerce_to_str(&self, v: Value) -> Option<Vec<u8>> {
        match v {
            Value::Obj(r) => self.gs.heap.try_str(r).map(|s| s.bytes.to_vec()),
            Value::Int(_) | Value::Float(_) => {
                Some(number_to_string(v.as_number().unwrap()).into_bytes())
            }
            _ => None,
        }
    }

    /// `==` with `__eq` fallback for two instances or two userdata.
    pub(crate) fn eq_values(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        if Value::raw_eq(a, b) {
            return Ok(true);
        }
        let both_inst = matches!(
            (a.as_obj().map(|r| self.gs.heap.kind(r)), b.as_obj().map(|r| self.gs.heap.kind(r))),
            (Some(ObjKind::Instance), Some(ObjKind::Instance))
                | (Some(ObjKind::UserData), Some(ObjKind::UserData))
        );
        if !both_inst {
            return Ok(false);
        }
        let mut f = self.get_mm(a, Mm::Eq);
        let mut receiver = a;
        if f.is_nil() {
            f = self.get_mm(b, Mm::Eq);
            receiver = b;
        }
        if f.is_nil() {
            return Ok(false);
        }
        self.call_mm(f, receiver, &[a, b], 1, FrameStatus::empty())?;
        Ok(self.pop().is_truthy())
    }

    pub(crate) fn lt_values(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(num_lt(x, y));
        }
        if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
            if let (Some(sx), Some(sy)) = (self.gs.heap.try_str(x), self.gs.heap.try_str(y)) {
                return Ok(sx.bytes < sy.bytes);
            }
        }
        Ok(self.call_mm_binary(Mm::Lt, a, b)?.is_truthy())
    }

    pub(crate) fn le_values(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(num_le(x, y));
        }
        if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
            if let (Some(sx), Some(sy)) = (self.gs.heap.try_str(x), self.gs.heap.try_str(y)) {
                return Ok(sx.bytes <= sy.bytes);
            }
        }
        Ok(self.call_mm_binary(Mm::Le, a, b)?.is_truthy())
    }

    /* ================= indexing ================= */

    pub(crate) fn index_get(&mut self, obj: Value, key: Value) -> Result<Value, Error> {
        let r = match obj {
            Value::Obj(r) => r,
            _ => {
                let t = obj.type_name(&self.gs.heap);
                return Err(self.rt_error(&format!("attempt to index a {t} value")));
            }
        };
        match self.gs.heap.kind(r) {
            ObjKind::Table => Ok(self.gs.heap.table_get(r, key)),
            ObjKind::Array => match key.as_int_exact() {
                Some(i) => Ok(self.gs.heap.array(r).get(i)),
                None => Err(self.rt_error("array index must be an integer")),
            },
            ObjKind::Instance => {
                if let Some(v) = self.gs.heap.instance_get_field(r, key) {
                    return Ok(v);
                }
                // fields shadow methods; methods bind their receiver
                let class = self.gs.heap.instance(r).class;
                let m = self.class_method(class, key);
                if !m.is_nil() {
                    let bm = self.gs.heap.new_bound_method(obj, m);
                    return Ok(Value::Obj(bm));
                }
                let mm = self.get_mm(obj, Mm::GetIdx);
                if mm.is_nil() {
                    return Ok(Value::Nil);
                }
                self.call_mm(mm, obj, &[key], 1, FrameStatus::empty())?;
                Ok(self.pop())
            }
            ObjKind::Class => {
                // method lookup on the class itself yields the unbound
                // closure
                Ok(self.class_method(r, key))
            }
            ObjKind::UserData => {
                let mm = self.get_mm(obj, Mm::GetIdx);
                if mm.is_nil() {
                    return Err(self.rt_error("attempt to index a userdata value"));
                }
                self.call_mm(mm, obj, &[key], 1, FrameStatus::empty())?;
                Ok(self.pop())
            }
            k => {
                let t = k.type_name();
                Err(self.rt_error(&format!("attempt to index a {t} value")))
            }
        }
    }

    fn class_method(&self, class: GcRef, key: Value) -> Value {
        let khash = key.hash(&self.gs.heap);
        self.gs.heap.class(class).methods.get(key, khash).unwrap_or(Value::Nil)
    }

    pub(crate) fn index_set(&mut self, obj: Value, key: Value, val: Value) -> Result<(), Error> {
        let r = match obj {
            Value::Obj(r) => r,
            _ => {
                let t = obj.type_name(&self.gs.heap);
                return Err(self.rt_error(&format!("attempt to index a {t} value")));
            }
        };
        match self.gs.heap.kind(r) {
            ObjKind::Table => {
                if key.is_nil() {
                    return Err(self.rt_error("table index is nil"));
                }
                if matches!(key, Value::Float(f) if f.is_nan()) {
                    return Err(self.rt_error("table index is NaN"));
                }
                self.gs.heap.table_set(r, key, val);
                Ok(())
            }
            ObjKind::Array => match key.as_int_exact() {
                Some(i) => {
                    let res = self.gs.heap.array_set(r, i, val);
                    res.map_err(|e| self.rt_error(&e.to_string()))
                }
                None => Err(self.rt_error("array index must be an integer")),
            },
            ObjKind::Instance => {
                let mm = self.get_mm(obj, Mm::SetIdx);
                if mm.is_nil() {
                    self.gs.heap.instance_set_field(r, key, val);
                    return Ok(());
                }
                self.call_mm(mm, obj, &[key, val], 0, FrameStatus::empty())
            }
            ObjKind::UserData => {
                let mm = self.get_mm(obj, Mm::SetIdx);
                if mm.is_nil() {
                    return Err(self.rt_error("attempt to index a userdata value"));
                }
                self.call_mm(mm, obj, &[key, val], 0, FrameStatus::empty())
            }
            k => {
                let t = k.type_name();
                Err(self.rt_error(&format!("attempt to index a {t} value")))
            }
        }
    }

    fn len_value(&mut self, v: Value) -> Result<Value, Error> {
        if let Value::Obj(r) = v {
            match &self.gs.heap.get(r).data {
                ObjData::Str(s) => return Ok(Value::Int(s.len() as i64)),
                ObjData::Array(a) => return Ok(Value::Int(a.len() as i64)),
                ObjData::Table(t) => return Ok(Value::Int(t.len() as i64)),
                _ => {}
            }
        }
        let t = v.type_name(&self.gs.heap);
        Err(self.rt_error(&format!("attempt to get length of a {t} value")))
    }

    /* ================= to-be-closed ================= */

    /// `Tbc` opcode: register a slot. Nil and false register nothing; a
    /// value without `__close` is a runtime error at registration time.
    pub(crate) fn tbc_register(&mut self, slot: usize) -> Result<(), Error> {
        let v = self.main.stack[slot];
        if matches!(v, Value::Nil | Value::Bool(false)) {
            return Ok(());
        }
        if self.get_mm(v, Mm::Close).is_nil() {
            let t = v.type_name(&self.gs.heap);
            return Err(self.rt_error(&format!(
                "variable marked <close> got a non-closable {t} value"
            )));
        }
        self.main.tbc.push(slot);
        Ok(())
    }

    /// Close to-be-closed slots at or above `level`, newest first, each
    /// receiving (value, errval). On the error path (`unwinding`), a
    /// close error is warned about and replaces the propagating error;
    /// on the normal path it propagates immediately.
    pub(crate) fn close_tbc(
        &mut self,
        level: usize,
        errval: Value,
        unwinding: bool,
    ) -> Result<(), Error> {
        let mut pending: Option<Error> = None;
        while let Some(&slot) = self.main.tbc.last() {
            if slot < level {
                break;
            }
            self.main.tbc.pop();
            let v = self.main.stack[slot];
            let mm = self.get_mm(v, Mm::Close);
            if mm.is_nil() {
                continue;
            }
            let res = self.call_mm(mm, v, &[errval], 0, FrameStatus::HOOK);
            if let Err(e) = res {
                if unwinding {
                    let msg = self.error_to_display(&e);
                    self.warn(&format!("error in __close metamethod: {msg}"));
                    pending = Some(e);
                } else {
                    return Err(e);
                }
            }
        }
        match pending {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close the unwound interval during error recovery: everything
    /// registered after the checkpoint and living at or above the saved
    /// top.
    pub(crate) fn close_tbc_down_to(
        &mut self,
        tbc_mark: usize,
        level: usize,
        errval: Value,
    ) -> Result<(), Error> {
        let res = self.close_tbc(level, errval, true);
        // anything still registered above the watermark is gone with the
        // unwound stack interval
        if self.main.tbc.len() > tbc_mark {
            self.main.tbc.truncate(tbc_mark);
        }
        res
    }

    /// Normal-path close of both upvalues and to-be-closed slots.
    pub(crate) fn close_level(&mut self, level: usize) -> Result<(), Error> {
        self.close_tbc(level, Value::Nil, false)?;
        self.close_upvalues(level);
        Ok(())
    }

    /* ================= the dispatch loop ================= */

    /// Run script frames until fewer than `level` remain.
    pub(crate) fn execute(&mut self, level: usize) -> Result<(), Error> {
        'reentry: loop {
            let fi = self.main.frames.len() - 1;
            let frame = &self.main.frames[fi];
            debug_assert!(frame.status.contains(FrameStatus::SCRIPT));
            let chunk = Rc::clone(frame.chunk.as_ref().expect("script frame without chunk"));
            let base = frame.base;
            let mut pc = frame.pc;
            let code: &[u8] = &chunk.code;

            macro_rules! read_s {
                () => {{
                    let v = code[pc];
                    pc += 1;
                    v
                }};
            }
            macro_rules! read_l {
                () => {{
                    let v = get_u24(code, pc);
                    pc += 3;
                    v
                }};
            }
            macro_rules! sync_pc {
                () => {
                    self.main.frames[fi].pc = pc
                };
            }
            loop {
                // collector safe point: everything live is rooted here
                if self.gs.heap.mem.debt() > 0 {
                    sync_pc!();
                    self.gc_step();
                }

                let insn_pc = pc;

                macro_rules! vm_try {
                    ($e:expr) => {
                        match $e {
                            Ok(v) => v,
                            Err(err) => {
                                sync_pc!();
                                return Err(self.decorate_error(&chunk, insn_pc, err));
                            }
                        }
                    };
                }
                let op = match OpCode::try_from(code[pc]) {
                    Ok(op) => op,
                    Err(_) => {
                        sync_pc!();
                        return Err(self.rt_error("corrupt bytecode"));
                    }
                };
                pc += 1;

                match op {
                    OpCode::True => vm_try!(self.push(Value::Bool(true))),
                    OpCode::False => vm_try!(self.push(Value::Bool(false))),
                    OpCode::Nil => vm_try!(self.push(Value::Nil)),
                    OpCode::NilN => {
                        let n = read_l!() as usize;
                        vm_try!(self.ensure_stack(n));
                        for _ in 0..n {
                            vm_try!(self.push(Value::Nil));
                        }
                    }
                    OpCode::Const => {
                        let k = read_s!() as usize;
                        vm_try!(self.push(chunk.constants[k]));
                    }
                    OpCode::ConstL => {
                        let k = read_l!() as usize;
                        vm_try!(self.push(chunk.constants[k]));
                    }
                    OpCode::ConstI => {
                        let mag = read_l!() as i64;
                        let sign = read_s!();
                        let v = if sign == 0 { -mag } else { mag };
                        vm_try!(self.push(Value::Int(v)));
                    }
                    OpCode::ConstF => {
                        let mag = read_l!() as i64;
                        let sign = read_s!();
                        let v = if sign == 0 { -(mag as f64) } else { mag as f64 };
                        vm_try!(self.push(Value::Float(v)));
                    }

                    OpCode::VarargPrep => {
                        let arity = read_l!() as usize;
                        let nargs = self.top() - base - 1;
                        if nargs > arity {
                            let split = base + 1 + arity;
                            let extra: Vec<Value> = self.main.stack.drain(split..).collect();
                            self.main.frames[fi].varargs = extra;
                        } else {
                            for _ in nargs..arity {
                                vm_try!(self.push(Value::Nil));
                            }
                        }
                    }
                    OpCode::Vararg => {
                        let n = read_l!() as usize;
                        let varargs = self.main.frames[fi].varargs.clone();
                        let count = if n == 0 { varargs.len() } else { n - 1 };
                        vm_try!(self.ensure_stack(count));
                        for i in 0..count {
                            let v = varargs.get(i).copied().unwrap_or(Value::Nil);
                            vm_try!(self.push(v));
                        }
                    }

                    OpCode::Closure => {
                        let pi = read_l!() as usize;
                        vm_try!(self.make_closure(&chunk, base, pi));
                    }
                    OpCode::NewArray => {
                        let s = read_s!();
                        let hint = if s == 0 { 0 } else { 1usize << (s - 1) };
                        let a = self.gs.heap.new_array(hint);
                        vm_try!(self.push(Value::Obj(a)));
                    }
                    OpCode::NewTable => {
                        let s = read_s!();
                        let hint = if s == 0 { 0 } else { 1usize << (s - 1) };
                        let t = self.gs.heap.new_table(hint);
                        vm_try!(self.push(Value::Obj(t)));
                    }
                    OpCode::NewClass => {
                        let name = self.gs.heap.intern_str("");
                        let c = self.gs.heap.new_class(name);
                        vm_try!(self.push(Value::Obj(c)));
                    }
                    OpCode::Method => {
                        let k = read_l!() as usize;
                        let method = self.pop();
                        let class = self.peek(0);
                        let name = vm_try!(self.constant_str(&chunk, k));
                        match class.as_obj() {
                            Some(c) if self.gs.heap.kind(c) == ObjKind::Class => {
                                self.gs.heap.class_add_method(c, name, method);
                            }
                            _ => {
                                vm_try!(Err(self.rt_error("'method' target is not a class")))
                            }
                        }
                    }
                    OpCode::SetMm => {
                        let s = read_s!() as usize;
                        let method = self.pop();
                        let class = self.peek(0);
                        let mm = Mm::from_index(s).expect("bad metamethod slot");
                        match class.as_obj() {
                            Some(c) if self.gs.heap.kind(c) == ObjKind::Class => {
                                self.gs.heap.class_set_mm(c, mm, method);
                            }
                            _ => {
                                vm_try!(Err(self.rt_error("metamethod target is not a class")))
                            }
                        }
                    }
                    OpCode::Inherit => {
                        let class = self.pop();
                        let sup = self.peek(0);
                        vm_try!(self.inherit(sup, class));
                    }
                    OpCode::SetArray => {
                        let first = read_l!() as i64;
                        let count = read_s!() as usize;
                        let aref = match self.peek(count).as_obj() {
                            Some(r) if self.gs.heap.kind(r) == ObjKind::Array => r,
                            _ => {
                                vm_try!(Err(self.rt_error("'setarray' target is not an array")))
                            }
                        };
                        let start = self.top() - count;
                        for i in 0..count {
                            let v = self.main.stack[start + i];
                            vm_try!(
                                self.gs
                                    .heap
                                    .array_set(aref, first + i as i64, v)
                                    .map_err(|e| self.rt_error(&e.to_string()))
                            );
                        }
                        self.pop_n(count);
                    }

                    OpCode::Pop => {
                        self.pop();
                    }
                    OpCode::PopN => {
                        let n = read_l!() as usize;
                        self.pop_n(n);
                    }

                    OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
                    | OpCode::Pow | OpCode::Shl | OpCode::Shr | OpCode::BAnd | OpCode::BOr
                    | OpCode::BXor | OpCode::Concat => {
                        let b = self.pop();
                        let a = self.pop();
                        let binop = bin_of(op);
                        sync_pc!();
                        let v = vm_try!(self.arith(binop, a, b));
                        vm_try!(self.push(v));
                    }

                    OpCode::AddK | OpCode::SubK | OpCode::MulK | OpCode::DivK | OpCode::ModK
                    | OpCode::PowK | OpCode::ShlK | OpCode::ShrK | OpCode::BAndK
                    | OpCode::BOrK | OpCode::BXorK => {
                        let k = read_l!() as usize;
                        let rhs = chunk.constants[k];
                        let a = self.peek(0);
                        let binop = bin_of_k(op);
                        match arith_prim(binop, a, rhs) {
                            Ok(Prim::Val(v)) => {
                                let t = self.top() - 1;
                                self.set_slot(t, v);
                                // skip the paired MBin
                                pc += 1 + OpCode::MBin.operand_len();
                            }
                            Ok(Prim::NoNum) => {
                                // materialize the constant; MBin follows
                                vm_try!(self.push(rhs));
                            }
                            Err(msg) => vm_try!(Err(self.rt_error(msg))),
                        }
                    }

                    OpCode::AddI | OpCode::SubI | OpCode::MulI | OpCode::DivI | OpCode::ModI
                    | OpCode::PowI | OpCode::ShlI | OpCode::ShrI | OpCode::BAndI
                    | OpCode::BOrI | OpCode::BXorI => {
                        let mag = read_l!() as i64;
                        let sign = read_s!();
                        let imm = Value::Int(if sign == 0 { -mag } else { mag });
                        let a = self.peek(0);
                        let binop = bin_of_i(op);
                        match arith_prim(binop, a, imm) {
                            Ok(Prim::Val(v)) => {
                                let t = self.top() - 1;
                                self.set_slot(t, v);
                                pc += 1 + OpCode::MBin.operand_len();
                            }
                            Ok(Prim::NoNum) => {
                                vm_try!(self.push(imm));
                            }
                            Err(msg) => vm_try!(Err(self.rt_error(msg))),
                        }
                    }

                    OpCode::MBin => {
                        let s = read_s!();
                        let binop = BinOp::try_from(s).expect("bad mbin operand");
                        let b = self.pop();
                        let a = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.arith(binop, a, b));
                        vm_try!(self.push(v));
                    }

                    OpCode::Not => {
                        let v = self.pop();
                        vm_try!(self.push(Value::Bool(!v.is_truthy())));
                    }
                    OpCode::Unm => {
                        let v = self.pop();
                        sync_pc!();
                        let out = match v {
                            Value::Int(i) => Value::Int(i.wrapping_neg()),
                            Value::Float(f) => Value::Float(-f),
                            _ => vm_try!(self.call_mm_unary(Mm::Unm, v)),
                        };
                        vm_try!(self.push(out));
                    }
                    OpCode::BNot => {
                        let v = self.pop();
                        sync_pc!();
                        let out = match v.as_int_exact() {
                            Some(i) => Value::Int(!i),
                            None => vm_try!(self.call_mm_unary(Mm::BNot, v)),
                        };
                        vm_try!(self.push(out));
                    }
                    OpCode::Len => {
                        let v = self.pop();
                        sync_pc!();
                        let out = vm_try!(self.len_value(v));
                        vm_try!(self.push(out));
                    }

                    OpCode::Eq => {
                        let s = read_s!();
                        let b = self.pop();
                        let a = self.pop();
                        sync_pc!();
                        let eq = vm_try!(self.eq_values(a, b));
                        vm_try!(self.push(Value::Bool(eq == (s != 0))));
                    }
                    OpCode::Lt => {
                        let b = self.pop();
                        let a = self.pop();
                        sync_pc!();
                        let r = vm_try!(self.lt_values(a, b));
                        vm_try!(self.push(Value::Bool(r)));
                    }
                    OpCode::Le => {
                        let b = self.pop();
                        let a = self.pop();
                        sync_pc!();
                        let r = vm_try!(self.le_values(a, b));
                        vm_try!(self.push(Value::Bool(r)));
                    }
                    OpCode::Gt => {
                        let b = self.pop();
                        let a = self.pop();
                        sync_pc!();
                        let r = vm_try!(self.lt_values(b, a));
                        vm_try!(self.push(Value::Bool(r)));
                    }
                    OpCode::Ge => {
                        let b = self.pop();
                        let a = self.pop();
                        sync_pc!();
                        let r = vm_try!(self.le_values(b, a));
                        vm_try!(self.push(Value::Bool(r)));
                    }
                    OpCode::EqK => {
                        let k = read_l!() as usize;
                        let s = read_s!();
                        let a = self.peek(0);
                        let eq = Value::raw_eq(a, chunk.constants[k]);
                        let t = self.top() - 1;
                        self.set_slot(t, Value::Bool(eq == (s != 0)));
                    }
                    OpCode::EqI => {
                        let mag = read_l!() as i64;
                        let sign = read_s!();
                        let s2 = read_s!();
                        let imm = Value::Int(if sign == 0 { -mag } else { mag });
                        let a = self.peek(0);
                        let eq = Value::raw_eq(a, imm);
                        let t = self.top() - 1;
                        self.set_slot(t, Value::Bool(eq == (s2 != 0)));
                    }
                    OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
                        let mag = read_l!() as i64;
                        let sign = read_s!();
                        let imm = Value::Int(if sign == 0 { -mag } else { mag });
                        let a = self.peek(0);
                        sync_pc!();
                        let r = match op {
                            OpCode::LtI => vm_try!(self.lt_values(a, imm)),
                            OpCode::LeI => vm_try!(self.le_values(a, imm)),
                            OpCode::GtI => vm_try!(self.lt_values(imm, a)),
                            OpCode::GeI => vm_try!(self.le_values(imm, a)),
                            _ => unreachable!(),
                        };
                        let t = self.top() - 1;
                        self.set_slot(t, Value::Bool(r));
                    }
                    OpCode::EqPreserve => {
                        let b = self.pop();
                        let a = self.peek(0);
                        vm_try!(self.push(Value::Bool(Value::raw_eq(a, b))));
                    }

                    OpCode::Jmp => {
                        let off = read_l!() as usize;
                        pc += off;
                    }
                    OpCode::JmpS => {
                        let off = read_l!() as usize;
                        pc -= off;
                    }
                    OpCode::Test => {
                        let off = read_l!() as usize;
                        let s = read_s!();
                        if self.peek(0).is_truthy() == (s != 0) {
                            pc += off;
                        }
                    }
                    OpCode::TestOrPop => {
                        let off = read_l!() as usize;
                        let s = read_s!();
                        if self.peek(0).is_truthy() == (s != 0) {
                            pc += off;
                        } else {
                            self.pop();
                        }
                    }
                    OpCode::TestAndPop => {
                        let off = read_l!() as usize;
                        let s = read_s!();
                        if self.peek(0).is_truthy() == (s != 0) {
                            pc += off;
                            self.pop();
                        }
                    }
                    OpCode::TestPop => {
                        let off = read_l!() as usize;
                        let s = read_s!();
                        if self.pop().is_truthy() == (s != 0) {
                            pc += off;
                        }
                    }

                    OpCode::Call => {
                        let rel = read_l!() as usize;
                        let nres = read_l!();
                        let want = nres as i32 - 1;
                        let cbase = base + rel;
                        sync_pc!();
                        let func = self.slot(cbase);
                        if vm_try!(self.dispatch_call(cbase, func, want, FrameStatus::empty())) {
                            continue 'reentry;
                        }
                    }
                    OpCode::TailCall => {
                        let rel = read_l!() as usize;
                        let b = base + rel;
                        sync_pc!();
                        vm_try!(self.close_tbc(base, Value::Nil, false));
                        self.close_upvalues(base);
                        let n = self.top() - b;
                        for i in 0..n {
                            let v = self.main.stack[b + i];
                            self.main.stack[base + i] = v;
                        }
                        self.main.stack.truncate(base + n);
                        let want = self.main.frames[fi].want;
                        self.main.frames.pop();
                        let func = self.slot(base);
                        // the old frame is gone; on error there is no pc
                        // left to sync
                        match self.dispatch_call(base, func, want, FrameStatus::TAILCALL) {
                            Ok(true) => continue 'reentry,
                            Ok(false) => {
                                // native tail-callee already delivered
                                // its results to the caller
                                if self.main.frames.len() < level {
                                    return Ok(());
                                }
                                continue 'reentry;
                            }
                            Err(err) => {
                                return Err(self.decorate_error(&chunk, insn_pc, err));
                            }
                        }
                    }
                    OpCode::Ret => {
                        let rel = read_l!() as usize;
                        let nres = read_l!();
                        let close = read_s!();
                        sync_pc!();
                        if close != 0 {
                            vm_try!(self.close_tbc(base, Value::Nil, false));
                        }
                        // upvalues captured from an enclosing scope may
                        // be open on a path the compiler could not see
                        // (a return inside a loop that captured on an
                        // earlier iteration); closing is a no-op when
                        // the list is empty
                        self.close_upvalues(base);
                        let first = base + rel;
                        let got =
                            if nres == 0 { self.top() - first } else { nres as usize - 1 };
                        let frame = self.main.frames[fi].clone();
                        if frame.status.contains(FrameStatus::CTOR) {
                            // constructors return their receiver
                            let receiver = self.slot(base);
                            self.main.stack.truncate(base);
                            self.main.stack.push(receiver);
                            self.adjust_results(base, 1, frame.want);
                        } else {
                            for i in 0..got {
                                let v = self.main.stack[first + i];
                                self.main.stack[base + i] = v;
                            }
                            self.main.stack.truncate(base + got);
                            self.adjust_results(base, got, frame.want);
                        }
                        self.main.frames.pop();
                        if self.main.frames.len() < level {
                            return Ok(());
                        }
                        continue 'reentry;
                    }

                    OpCode::ForPrep => {
                        let _b = read_l!();
                        let off = read_l!() as usize;
                        pc += off;
                    }
                    OpCode::ForCall => {
                        let rel = read_l!() as usize;
                        let nvars = read_l!() as usize;
                        let fb = base + rel;
                        sync_pc!();
                        // discard the previous iteration's loop variables
                        vm_try!(self.close_tbc(fb + 3, Value::Nil, false));
                        self.close_upvalues(fb + 3);
                        self.main.stack.truncate(fb + 3);
                        let (f, s, c) =
                            (self.slot(fb), self.slot(fb + 1), self.slot(fb + 2));
                        vm_try!(self.push(f));
                        vm_try!(self.push(s));
                        vm_try!(self.push(c));
                        if vm_try!(self.dispatch_call(
                            fb + 3,
                            f,
                            nvars as i32,
                            FrameStatus::empty()
                        )) {
                            continue 'reentry;
                        }
                    }
                    OpCode::ForLoop => {
                        let rel = read_l!() as usize;
                        let off = read_l!() as usize;
                        let fb = base + rel;
                        let control = self.slot(fb + 3);
                        if control.is_nil() {
                            // loop ends; drop the dead loop variables
                            self.main.stack.truncate(fb + 3);
                        } else {
                            self.set_slot(fb + 2, control);
                            pc -= off;
                        }
                    }

                    OpCode::GetLocal => {
                        let i = read_l!() as usize;
                        let v = self.slot(base + i);
                        vm_try!(self.push(v));
                    }
                    OpCode::SetLocal => {
                        let i = read_l!() as usize;
                        let v = self.pop();
                        self.set_slot(base + i, v);
                    }
                    OpCode::GetUval => {
                        let i = read_l!() as usize;
                        let u = vm_try!(self.frame_upvalue(fi, i));
                        let v = self.upvalue_value(u);
                        vm_try!(self.push(v));
                    }
                    OpCode::SetUval => {
                        let i = read_l!() as usize;
                        let u = vm_try!(self.frame_upvalue(fi, i));
                        let v = self.pop();
                        self.upvalue_assign(u, v);
                    }
                    OpCode::Close => {
                        let l = read_l!() as usize;
                        sync_pc!();
                        vm_try!(self.close_level(base + l));
                    }
                    OpCode::Tbc => {
                        let l = read_l!() as usize;
                        sync_pc!();
                        vm_try!(self.tbc_register(base + l));
                    }

                    OpCode::GetGlobal => {
                        let k = read_l!() as usize;
                        let name = vm_try!(self.constant_str(&chunk, k));
                        let v = self.gs.heap.table_get(self.gs.globals, Value::Obj(name));
                        if v.is_nil() {
                            let n = self.gs.heap.str_text(name).to_string();
                            vm_try!(Err(self.rt_error(&format!("undefined global '{n}'"))));
                        }
                        vm_try!(self.push(v));
                    }
                    OpCode::SetGlobal => {
                        let k = read_l!() as usize;
                        let name = vm_try!(self.constant_str(&chunk, k));
                        let v = self.pop();
                        self.gs.heap.table_set(self.gs.globals, Value::Obj(name), v);
                    }

                    OpCode::GetIndex => {
                        let key = self.pop();
                        let obj = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.index_get(obj, key));
                        vm_try!(self.push(v));
                    }
                    OpCode::SetIndex => {
                        let val = self.pop();
                        let key = self.pop();
                        let obj = self.pop();
                        sync_pc!();
                        vm_try!(self.index_set(obj, key, val));
                    }
                    OpCode::GetIndexStr | OpCode::GetProperty => {
                        let k = read_l!() as usize;
                        let name = vm_try!(self.constant_str(&chunk, k));
                        let obj = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.index_get(obj, Value::Obj(name)));
                        vm_try!(self.push(v));
                    }
                    OpCode::SetIndexStr | OpCode::SetProperty => {
                        let k = read_l!() as usize;
                        let name = vm_try!(self.constant_str(&chunk, k));
                        let val = self.pop();
                        let obj = self.pop();
                        sync_pc!();
                        vm_try!(self.index_set(obj, Value::Obj(name), val));
                    }
                    OpCode::GetIndexInt => {
                        let i = read_l!() as i64;
                        let obj = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.index_get(obj, Value::Int(i)));
                        vm_try!(self.push(v));
                    }
                    OpCode::SetIndexInt => {
                        let i = read_l!() as i64;
                        let val = self.pop();
                        let obj = self.pop();
                        sync_pc!();
                        vm_try!(self.index_set(obj, Value::Int(i), val));
                    }

                    OpCode::GetSup => {
                        let k = read_l!() as usize;
                        let name = vm_try!(self.constant_str(&chunk, k));
                        let sup = self.pop();
                        let inst = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.super_lookup(inst, sup, Value::Obj(name)));
                        vm_try!(self.push(v));
                    }
                    OpCode::GetSupIdx => {
                        let key = self.pop();
                        let sup = self.pop();
                        let inst = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.super_lookup(inst, sup, key));
                        vm_try!(self.push(v));
                    }
                    OpCode::GetSupIdxStr => {
                        let k = read_l!() as usize;
                        let name = vm_try!(self.constant_str(&chunk, k));
                        let sup = self.pop();
                        let inst = self.pop();
                        sync_pc!();
                        let v = vm_try!(self.super_lookup(inst, sup, Value::Obj(name)));
                        vm_try!(self.push(v));
                    }
                }
            }
        }
    }

    /* ================= loop helpers ================= */

    /// Attach source:line to a plain runtime message raised at `pc`.
    /// Errors that already carry a position (from a deeper frame) and
    /// non-string error objects pass through untouched.
    fn decorate_error(&mut self, chunk: &Chunk, pc: usize, err: Error) -> Error {
        if err.status != Status::RuntimeErr {
            return err;
        }
        if let Value::Obj(r) = err.value {
            if let Some(s) = self.gs.heap.try_str(r) {
                let msg = s.as_str().to_string();
                let src = self.gs.heap.str_text(chunk.source).to_string();
                if !msg.starts_with(&format!("{src}:")) {
                    let line = chunk.lines.lookup(pc as u32);
                    let dec = self.gs.heap.intern_str(&format!("{src}:{line}: {msg}"));
                    return Error { status: err.status, value: Value::Obj(dec) };
                }
            }
        }
        err
    }

    fn constant_str(&mut self, chunk: &Chunk, k: usize) -> Result<GcRef, Error> {
        match chunk.constants[k] {
            Value::Obj(r) if self.gs.heap.kind(r) == ObjKind::Str => Ok(r),
            _ => Err(self.rt_error("corrupt bytecode: constant is not a string")),
        }
    }

    fn frame_upvalue(&mut self, fi: usize, i: usize) -> Result<GcRef, Error> {
        let callee = self.main.frames[fi].callee;
        match callee.as_obj() {
            Some(r) if self.gs.heap.kind(r) == ObjKind::Closure => {
                Ok(self.gs.heap.closure(r).upvals[i])
            }
            _ => Err(self.rt_error("upvalue access outside a script closure")),
        }
    }

    /// `Closure p`: instantiate the nested prototype, capturing upvalues
    /// per its descriptor table from the current frame.
    fn make_closure(&mut self, chunk: &Chunk, base: usize, pi: usize) -> Result<(), Error> {
        let proto = chunk.protos[pi];
        let descs = Rc::clone(&self.gs.heap.proto(proto).chunk);
        let fi = self.main.frames.len() - 1;
        let mut upvals = Vec::with_capacity(descs.upvals.len());
        for d in &descs.upvals {
            let u = if d.in_stack {
                self.find_or_create_upvalue(base + d.index as usize)
            } else {
                self.frame_upvalue(fi, d.index as usize)?
            };
            upvals.push(u);
        }
        let cl = self.gs.heap.new_closure(proto, upvals);
        self.push(Value::Obj(cl))
    }

    fn inherit(&mut self, sup: Value, class: Value) -> Result<(), Error> {
        let supref = match sup.as_obj() {
            Some(r) if self.gs.heap.kind(r) == ObjKind::Class => r,
            _ => {
                let t = sup.type_name(&self.gs.heap);
                return Err(self.rt_error(&format!("can only inherit from a class, got {t}")));
            }
        };
        let clref = match class.as_obj() {
            Some(r) if self.gs.heap.kind(r) == ObjKind::Class => r,
            _ => return Err(self.rt_error("'inherit' target is not a class")),
        };
        // copy-down inheritance: methods and metamethods present at
        // inheritance time are copied; later monkey-patching of the
        // superclass does not retrofit subclasses
        let methods: Vec<(Value, Value)> = self.gs.heap.class(supref).methods.iter().collect();
        for (k, v) in methods {
            if let Value::Obj(name) = k {
                self.gs.heap.class_add_method(clref, name, v);
            }
        }
        let sup_vmt: Option<Vec<(usize, Value)>> = self.gs.heap.class(supref).vmt.as_ref().map(
            |vmt| {
                vmt.0
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| !v.is_nil())
                    .map(|(i, v)| (i, *v))
                    .collect()
            },
        );
        if let Some(entries) = sup_vmt {
            for (i, v) in entries {
                self.gs.heap.class_set_mm(clref, Mm::from_index(i).unwrap(), v);
            }
        }
        Ok(())
    }

    fn super_lookup(&mut self, inst: Value, sup: Value, key: Value) -> Result<Value, Error> {
        let supref = match sup.as_obj() {
            Some(r) if self.gs.heap.kind(r) == ObjKind::Class => r,
            _ => return Err(self.rt_error("'super' is not a class")),
        };
        let m = self.class_method(supref, key);
        if m.is_nil() {
            let n = match key.as_obj().and_then(|r| self.gs.heap.try_str(r)) {
                Some(s) => s.as_str().to_string(),
                None => "?".to_string(),
            };
            return Err(self.rt_error(&format!("no method '{n}' in superclass")));
        }
        let bm = self.gs.heap.new_bound_method(inst, m);
        Ok(Value::Obj(bm))
    }

    /// To-string conversion honoring `__tostring`.
    pub fn tostring_value(&mut self, v: Value) -> Result<String, Error> {
        match v {
            Value::Nil => Ok("nil".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Int(_) | Value::Float(_) => Ok(number_to_string(v.as_number().unwrap())),
            Value::Light(p) => Ok(format!("lightuserdata: {p:p}")),
            Value::CFn(f) => Ok(format!("function: {:p}", f as usize as *const ())),
            Value::Obj(r) => {
                if let Some(s) = self.gs.heap.try_str(r) {
                    return Ok(s.as_str().to_string());
                }
                let mm = self.get_mm(v, Mm::ToString);
                if !mm.is_nil() {
                    self.call_mm(mm, v, &[], 1, FrameStatus::empty())?;
                    let out = self.pop();
                    return self.tostring_value(out);
                }
                Ok(format!("{}: 0x{:08x}", self.gs.heap.kind(r).type_name(), r.index()))
            }
        }
    }
}

/// Compile-time constant folding, sharing the VM's exact arithmetic.
/// Domain errors (zero divisor, inexact bitwise operand) fold to `None`
/// and stay runtime errors; concat needs the interner, so it never
/// folds here.
pub fn const_fold(op: BinOp, a: Value, b: Value) -> Option<Value> {
    if op == BinOp::Concat {
        return None;
    }
    match arith_prim(op, a, b) {
        Ok(Prim::Val(v)) => Some(v),
        _ => None,
    }
}

const fn bin_of(op: OpCode) -> BinOp {
    match op {
        OpCode::Add => BinOp::Add,
        OpCode::Sub => BinOp::Sub,
        OpCode::Mul => BinOp::Mul,
        OpCode::Div => BinOp::Div,
        OpCode::Mod => BinOp::Mod,
        OpCode::Pow => BinOp::Pow,
        OpCode::Shl => BinOp::Shl,
        OpCode::Shr => BinOp::Shr,
        OpCode::BAnd => BinOp::BAnd,
        OpCode::BOr => BinOp::BOr,
        OpCode::BXor => BinOp::BXor,
        OpCode::Concat => BinOp::Concat,
        _ => unreachable!(),
    }
}

const fn bin_of_k(op: OpCode) -> BinOp {
    match op {
        OpCode::AddK => BinOp::Add,
        OpCode::SubK => BinOp::Sub,
        OpCode::MulK => BinOp::Mul,
        OpCode::DivK => BinOp::Div,
        OpCode::ModK => BinOp::Mod,
        OpCode::PowK => BinOp::Pow,
        OpCode::ShlK => BinOp::Shl,
        OpCode::ShrK => BinOp::Shr,
        OpCode::BAndK => BinOp::BAnd,
        OpCode::BOrK => BinOp::BOr,
        OpCode::BXorK => BinOp::BXor,
        _ => unreachable!(),
    }
}

const fn bin_of_i(op: OpCode) -> BinOp {
    match op {
        OpCode::AddI => BinOp::Add,
        OpCode::SubI => BinOp::Sub,
        OpCode::MulI => BinOp::Mul,
        OpCode::DivI => BinOp::Div,
        OpCode::ModI => BinOp::Mod,
        OpCode::PowI => BinOp::Pow,
        OpCode::ShlI => BinOp::Shl,
        OpCode::ShrI => BinOp::Shr,
        OpCode::BAndI => BinOp::BAnd,
        OpCode::BOrI => BinOp::BOr,
        OpCode::BXorI => BinOp::BXor,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_wraps() {
        match arith_prim(BinOp::Add, Value::Int(i64::MAX), Value::Int(1)).unwrap() {
            Prim::Val(Value::Int(v)) => assert_eq!(v, i64::MIN),
            _ => panic!("expected wrapped int"),
        }
        match arith_prim(BinOp::Mul, Value::Int(i64::MAX), Value::Int(2)).unwrap() {
            Prim::Val(Value::Int(v)) => assert_eq!(v, -2),
            _ => panic!("expected wrapped int"),
        }
    }

    #[test]
    fn division_promotes_to_float() {
        match arith_prim(BinOp::Div, Value::Int(7), Value::Int(2)).unwrap() {
            Prim::Val(Value::Float(f)) => assert_eq!(f, 3.5),
            _ => panic!("int / int must be a float"),
        }
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        let check = |a: i64, b: i64, want: i64| {
            match arith_prim(BinOp::Mod, Value::Int(a), Value::Int(b)).unwrap() {
                Prim::Val(Value::Int(v)) => assert_eq!(v, want, "{a} % {b}"),
                _ => panic!("expected int"),
            }
        };
        check(5, 3, 2);
        check(-5, 3, 1);
        check(5, -3, -1);
        check(-5, -3, -2);
    }

    #[test]
    fn modulo_by_zero_is_a_domain_error() {
        assert!(arith_prim(BinOp::Mod, Value::Int(1), Value::Int(0)).is_err());
    }

    #[test]
    fn bitwise_accepts_exact_floats_only() {
        match arith_prim(BinOp::BAnd, Value::Float(6.0), Value::Int(3)).unwrap() {
            Prim::Val(Value::Int(v)) => assert_eq!(v, 2),
            _ => panic!("expected int"),
        }
        assert!(arith_prim(BinOp::BAnd, Value::Float(6.5), Value::Int(3)).is_err());
    }

    #[test]
    fn shifts_saturate_past_word_width() {
        assert_eq!(shift_left(1, 70), 0);
        assert_eq!(shift_left(1, -70), 0);
        assert_eq!(shift_left(-1, -1), i64::MAX); // logical shift
        assert_eq!(shift_left(1, 3), 8);
    }

    #[test]
    fn mixed_comparison_is_exact_at_the_edge() {
        // 2^63 as f64 equals 2^63 exactly; i64::MAX is 2^63-1
        assert!(num_lt(Number::Int(i64::MAX), Number::Float(9.3e18)));
        assert!(!num_lt(Number::Float(9.3e18), Number::Int(i64::MAX)));
        assert!(num_lt(Number::Int(3), Number::Float(3.5)));
        assert!(!num_lt(Number::Int(4), Number::Float(3.5)));
        assert!(num_le(Number::Float(3.0), Number::Int(3)));
        assert!(!num_lt(Number::Float(f64::NAN), Number::Int(0)));
        assert!(!num_lt(Number::Int(0), Number::Float(f64::NAN)));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(Number::Int(42)), "42");
        assert_eq!(number_to_string(Number::Float(2.0)), "2.0");
        assert_eq!(number_to_string(Number::Float(2.5)), "2.5");
        assert_eq!(number_to_string(Number::Float(f64::NAN)), "nan");
    }
}
