//! Code emission: the per-function compiler state.
//!
//! A [`FuncState`] owns the chunk under construction, the active-local
//! array, the upvalue descriptor table, and a simulated stack pointer
//! that mirrors, emit by emit, what the VM's stack pointer will be at
//! that program counter; the high-water mark becomes the prototype's
//! `max_stack`. Expressions flow through [`Exp`] descriptors and are
//! materialized onto the stack at the last possible moment, which is
//! where constant-versus-immediate operand selection and the peephole
//! forms happen.

use std::collections::HashMap;

use cript_core::code::{LineInfo, put_u24};
use cript_core::limits::{MAX_CONSTANTS, MAX_JUMP, MAX_LOCALS, MAX_SHORT_ARG, MAX_UPVALUES};
use cript_core::opcode::OpCode;

use cript_runtime::{Chunk, GcRef, LocalVar, UpvalDesc, Value, VarKind};

use crate::SyntaxError;

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FnKind {
    /// Top-level chunk.
    Script,
    Function,
    Method,
    /// `__init`; return statements may not carry values.
    Init,
}

#[derive(Debug)]
pub(crate) struct LocalSlot {
    pub name: GcRef,
    /// Scope depth, or -1 while the initializer is still running.
    pub depth: i32,
    pub kind: VarKind,
    pub captured: bool,
}

/// A pending jump: where its offset operand lives and how many operand
/// bytes trail it (the Test family carries a short arg after the
/// offset, `ForPrep` none).
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpAt {
    pub at: usize,
    pub trailing: u8,
}

/// A loop or switch that `break` (and for loops, `continue`) can target.
#[derive(Debug)]
pub(crate) struct ControlCtx {
    pub is_loop: bool,
    /// Jumps waiting to be patched to the exit point.
    pub breaks: Vec<JumpAt>,
    /// `continue` jumps waiting for a target (generic for loops patch
    /// these at the loop end).
    pub continues: Vec<JumpAt>,
    /// Known continue target (while: loop start; C-style for: the step
    /// clause), if already emitted.
    pub continue_target: Option<usize>,
    /// Stack level a `break`/`continue` unwinds to before jumping.
    pub sp: u32,
}

/// Expression descriptor: where a value currently lives, so emission can
/// be deferred until the context is known (read, write, call, fold).
#[derive(Debug, Clone, Copy)]
pub(crate) enum ExpKind {
    /// No value (empty expression slot).
    Void,
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(GcRef),
    /// Active local; payload is the frame slot.
    Local(u32, VarKind),
    Upval(u32, VarKind),
    Global(GcRef),
    /// Object and key already on the stack.
    Indexed,
    /// Object on the stack, string-constant key.
    IndexedStr(GcRef),
    /// Object on the stack, integer-constant key.
    IndexedInt(i64),
    /// Object on the stack, `.name` access (instance-aware opcode).
    Dot(GcRef),
    /// Receiver, superclass and key on the stack.
    SuperIdx,
    /// Receiver and superclass on the stack, `super.name` access.
    SuperStr(GcRef),
    /// Receiver and superclass on the stack, `super["name"]` access.
    SuperIdxStr(GcRef),
    /// Call emitted; the payload locates its result-count operand so a
    /// consumer can re-patch how many values it produces.
    Call(usize),
    /// Vararg push emitted; the payload locates its count operand.
    Vararg(usize),
    /// Value already discharged onto the stack.
    Pushed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Exp {
    pub kind: ExpKind,
    pub line: u32,
}

impl Exp {
    pub fn new(kind: ExpKind, line: u32) -> Exp {
        Exp { kind, line }
    }

    /// Literal view, for folding and the constant-operand forms.
    pub fn as_literal(&self) -> Option<Value> {
        match self.kind {
            ExpKind::Nil => Some(Value::Nil),
            ExpKind::True => Some(Value::Bool(true)),
            ExpKind::False => Some(Value::Bool(false)),
            ExpKind::Int(i) => Some(Value::Int(i)),
            ExpKind::Float(f) => Some(Value::Float(f)),
            ExpKind::Str(s) => Some(Value::Obj(s)),
            _ => None,
        }
    }

    pub fn is_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }
}

pub(crate) struct FuncState {
    pub chunk: Chunk,
    pub kind: FnKind,
    pub locals: Vec<LocalSlot>,
    pub scope_depth: u32,
    /// Simulated VM stack pointer, in slots above the frame base.
    pub sp: u32,
    /// Set when any local is captured or marked to-be-closed; returns
    /// then carry the close flag.
    pub needs_close: bool,
    pub ctrl: Vec<ControlCtx>,
    kints: HashMap<i64, u32>,
    kfloats: HashMap<u64, u32>,
    kstrs: HashMap<GcRef, u32>,
}

impl FuncState {
    /// `slot0_name` names the reserved frame slot 0: `self` in methods,
    /// the empty string elsewhere (the callee itself occupies it).
    pub fn new(source: GcRef, slot0_name: GcRef, kind: FnKind, defline: u32) -> FuncState {
        let mut fs = FuncState {
            chunk: Chunk {
                arity: 0,
                is_vararg: matches!(kind, FnKind::Script),
                max_stack: 1,
                code: Vec::new(),
                constants: Vec::new(),
                lines: LineInfo::new(),
                upvals: Vec::new(),
                locals: Vec::new(),
                protos: Vec::new(),
                source,
                defline,
                deflastline: defline,
            },
            kind,
            locals: Vec::new(),
            scope_depth: 0,
            sp: 1,
            needs_close: false,
            ctrl: Vec::new(),
            kints: HashMap::new(),
            kfloats: HashMap::new(),
            kstrs: HashMap::new(),
        };
        fs.locals.push(LocalSlot { name: slot0_name, depth: 0, kind: VarKind::Const, captured: false });
        fs
    }

    pub fn error(&self, line: u32, msg: impl Into<String>) -> SyntaxError {
        SyntaxError { line, msg: msg.into() }
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.chunk.code.len()
    }

    pub fn adjust_sp(&mut self, delta: i32) {
        let sp = self.sp as i32 + delta;
        debug_assert!(sp >= 0, "compile-time stack underflow");
        self.sp = sp as u32;
        if self.sp > self.chunk.max_stack {
            self.chunk.max_stack = self.sp;
        }
    }

    /* ---------------- raw emission ---------------- */

    pub fn emit_op(&mut self, op: OpCode, line: u32) {
        let pc = self.pc() as u32;
        self.chunk.lines.record(pc, line);
        self.chunk.code.push(op.into());
        if let Some(d) = op.stack_effect() {
            self.adjust_sp(d);
        }
    }

    pub fn emit_s(&mut self, v: u8) {
        self.chunk.code.push(v);
    }

    pub fn emit_l(&mut self, v: u32) {
        debug_assert!(v <= cript_core::limits::MAX_LONG_ARG);
        let at = self.chunk.code.len();
        self.chunk.code.extend_from_slice(&[0, 0, 0]);
        put_u24(&mut self.chunk.code, at, v);
    }

    pub fn emit_op_l(&mut self, op: OpCode, l: u32, line: u32) {
        self.emit_op(op, line);
        self.emit_l(l);
    }

    pub fn emit_op_s(&mut self, op: OpCode, s: u8, line: u32) {
        self.emit_op(op, line);
        self.emit_s(s);
    }

    /* ---------------- constants ---------------- */

    pub fn add_const(&mut self, v: Value, line: u32) -> Result<u32, SyntaxError> {
        let found = match v {
            Value::Int(i) => self.kints.get(&i).copied(),
            Value::Float(f) => self.kfloats.get(&f.to_bits()).copied(),
            Value::Obj(r) => self.kstrs.get(&r).copied(),
            _ => None,
        };
        if let Some(k) = found {
            return Ok(k);
        }
        if self.chunk.constants.len() >= MAX_CONSTANTS {
            return Err(self.error(line, "too many constants in one function"));
        }
        let k = self.chunk.constants.len() as u32;
        self.chunk.constants.push(v);
        match v {
            Value::Int(i) => {
                self.kints.insert(i, k);
            }
            Value::Float(f) => {
                self.kfloats.insert(f.to_bits(), k);
            }
            Value::Obj(r) => {
                self.kstrs.insert(r, k);
            }
            _ => {}
        }
        Ok(k)
    }

    /// Push a constant-pool value, short or long operand as needed.
    pub fn emit_const(&mut self, v: Value, line: u32) -> Result<u32, SyntaxError> {
        let k = self.add_const(v, line)?;
        if k <= MAX_SHORT_ARG {
            self.emit_op_s(OpCode::Const, k as u8, line);
        } else {
            self.emit_op_l(OpCode::ConstL, k, line);
        }
        Ok(k)
    }

    /// Push an integer, preferring the immediate form.
    pub fn emit_int(&mut self, i: i64, line: u32) -> Result<(), SyntaxError> {
        if let Some((mag, sign)) = imm24(i) {
            self.emit_op(OpCode::ConstI, line);
            self.emit_l(mag);
            self.emit_s(sign);
        } else {
            self.emit_const(Value::Int(i), line)?;
        }
        Ok(())
    }

    pub fn emit_float(&mut self, f: f64, line: u32) -> Result<(), SyntaxError> {
        if f == f.trunc() && f.is_finite() {
            if let Some((mag, sign)) = imm24(f as i64) {
                self.emit_op(OpCode::ConstF, line);
                self.emit_l(mag);
                self.emit_s(sign);
                return Ok(());
            }
        }
        self.emit_const(Value::Float(f), line)?;
        Ok(())
    }

    /* ---------------- jumps ---------------- */

    /// Emit a forward jump with a placeholder offset. The short
    /// argument, when the opcode has one, follows the offset.
    pub fn emit_jump(&mut self, op: OpCode, s: Option<u8>, line: u32) -> JumpAt {
        self.emit_op(op, line);
        let at = self.chunk.code.len();
        self.emit_l(0);
        if let Some(s) = s {
            self.emit_s(s);
        }
        JumpAt { at, trailing: u8::from(s.is_some()) }
    }

    pub fn patch_jump(&mut self, j: JumpAt) -> Result<(), SyntaxError> {
        self.patch_jump_to(j, self.pc())
    }

    pub fn patch_jump_to(&mut self, j: JumpAt, target: usize) -> Result<(), SyntaxError> {
        // the offset is relative to the pc after the whole instruction
        let after = j.at + 3 + j.trailing as usize;
        let off = target
            .checked_sub(after)
            .expect("forward jump patched to an earlier target");
        if off > MAX_JUMP as usize {
            let line = self.chunk.lines.lookup(j.at as u32);
            return Err(self.error(line, "control structure too long (jump out of range)"));
        }
        put_u24(&mut self.chunk.code, j.at, off as u32);
        Ok(())
    }

    /// Emit a backward jump to an already-emitted target.
    pub fn emit_loop_to(&mut self, target: usize, line: u32) -> Result<(), SyntaxError> {
        self.emit_op(OpCode::JmpS, line);
        let after = self.chunk.code.len() + 3;
        let off = after - target;
        if off > MAX_JUMP as usize {
            return Err(self.error(line, "loop body too long (jump out of range)"));
        }
        self.emit_l(off as u32);
        Ok(())
    }

    /* ---------------- locals and upvalues ---------------- */

    pub fn declare_local(
        &mut self,
        name: GcRef,
        kind: VarKind,
        line: u32,
    ) -> Result<u32, SyntaxError> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(self.error(line, "too many local variables in one function"));
        }
        self.locals.push(LocalSlot { name, depth: -1, kind, captured: false });
        Ok(self.locals.len() as u32 - 1)
    }

    /// Close the declaration: the local becomes visible at the current
    /// depth (its initializer can no longer see it).
    pub fn define_local(&mut self) {
        self.define_locals(1);
    }

    /// Define the `n` most recently declared locals at once (a
    /// multi-name `local` declaration shares one initializer list).
    pub fn define_locals(&mut self, n: usize) {
        let depth = self.scope_depth as i32;
        let len = self.locals.len();
        for l in &mut self.locals[len - n..] {
            l.depth = depth;
        }
    }

    /// Backwards scan of the active locals; the index is the frame slot.
    pub fn resolve_local(&self, name: GcRef) -> Option<(u32, VarKind, bool)> {
        for (i, l) in self.locals.iter().enumerate().rev() {
            if l.name == name {
                return Some((i as u32, l.kind, l.depth >= 0));
            }
        }
        None
    }

    pub fn add_upvalue(
        &mut self,
        name: GcRef,
        index: u32,
        in_stack: bool,
        kind: VarKind,
        line: u32,
    ) -> Result<u32, SyntaxError> {
        for (i, u) in self.chunk.upvals.iter().enumerate() {
            if u.index == index && u.in_stack == in_stack {
                return Ok(i as u32);
            }
        }
        if self.chunk.upvals.len() >= MAX_UPVALUES {
            return Err(self.error(line, "too many upvalues in one function"));
        }
        self.chunk.upvals.push(UpvalDesc { name, index, in_stack, kind });
        Ok(self.chunk.upvals.len() as u32 - 1)
    }

    /// Record the live range of a local that just left scope.
    pub fn debug_local(&mut self, name: GcRef, start_pc: u32) {
        self.chunk.locals.push(LocalVar { name, start_pc, end_pc: self.pc() as u32 });
    }
}

/// Immediate-form encoding of an integer: 24-bit magnitude plus a sign
/// byte (0 negative, 1 positive).
pub(crate) fn imm24(i: i64) -> Option<(u32, u8)> {
    let mag = i.unsigned_abs();
    if mag <= cript_core::limits::MAX_LONG_ARG as u64 {
        Some((mag as u32, u8::from(i >= 0)))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cript_runtime::State;

    fn fs(st: &mut State) -> FuncState {
        let src = st.heap_mut().intern_str("test");
        let anon = st.heap_mut().intern_str("");
        FuncState::new(src, anon, FnKind::Script, 1)
    }

    #[test]
    fn sp_tracking_records_high_water() {
        let mut st = State::new();
        let mut f = fs(&mut st);
        f.emit_op(OpCode::True, 1);
        f.emit_op(OpCode::True, 1);
        f.emit_op(OpCode::Add, 1);
        assert_eq!(f.sp, 2); // frame slot 0 + one result
        assert_eq!(f.chunk.max_stack, 3);
    }

    #[test]
    fn constants_dedup() {
        let mut st = State::new();
        let mut f = fs(&mut st);
        let a = f.add_const(Value::Int(7), 1).unwrap();
        let b = f.add_const(Value::Int(7), 1).unwrap();
        let c = f.add_const(Value::Int(8), 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let s = st.heap_mut().intern_str("x");
        let d = f.add_const(Value::Obj(s), 1).unwrap();
        let e = f.add_const(Value::Obj(s), 1).unwrap();
        assert_eq!(d, e);
    }

    #[test]
    fn jump_patching_computes_offsets() {
        let mut st = State::new();
        let mut f = fs(&mut st);
        let j = f.emit_jump(OpCode::Jmp, None, 1);
        f.emit_op(OpCode::True, 1);
        f.emit_op(OpCode::Pop, 1);
        f.patch_jump(j).unwrap();
        // Jmp operand starts at 1; lands after True+Pop
        assert_eq!(cript_core::get_u24(&f.chunk.code, j.at), 2);

        // a Test-family jump accounts for its trailing short arg
        let t = f.emit_jump(OpCode::TestPop, Some(0), 1);
        f.emit_op(OpCode::True, 1);
        f.patch_jump(t).unwrap();
        assert_eq!(cript_core::get_u24(&f.chunk.code, t.at), 1);
    }

    #[test]
    fn imm24_bounds() {
        assert_eq!(imm24(5), Some((5, 1)));
        assert_eq!(imm24(-5), Some((5, 0)));
        assert_eq!(imm24(0xFF_FFFF), Some((0xFF_FFFF, 1)));
        assert_eq!(imm24(0x100_0000), None);
    }
}
