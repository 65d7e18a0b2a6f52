//! The Pratt parser and statement compiler.
//!
//! Single pass: every construct emits bytecode into the current
//! [`FuncState`] as it is parsed. Each token owns a prefix rule, an
//! infix rule and a precedence; expression descriptors ([`Exp`]) defer
//! materialization so literal folding, the constant/immediate operand
//! forms and short-circuit jumps can be chosen at the moment the value
//! is actually needed.
//!
//! Assignment is not an expression. The expression-statement parser
//! detects `=` (and `,` lists) after a complete expression and rewrites
//! the pending "get" descriptor into its "set" counterpart; anywhere
//! else `=` is a syntax error.

use cript_core::code::put_u24;
use cript_core::limits::MAX_PARAMS;
use cript_core::opcode::{BinOp, OpCode};

use cript_runtime::meta::Mm;
use cript_runtime::vm::const_fold;
use cript_runtime::{GcRef, State, Value, VarKind};

use crate::SyntaxError;
use crate::emit::{ControlCtx, Exp, ExpKind, FnKind, FuncState, imm24};
use crate::lexer::{Lexer, Token, TokenKind};

/// Binding power, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Prec {
    None = 0,
    Assign,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    BOr,
    BXor,
    BAnd,
    Shift,
    Concat,
    Term,
    Factor,
    Power,
    Unary,
    Call,
}

impl Prec {
    fn one_higher(self) -> Prec {
        use Prec::*;
        match self {
            None => Assign,
            Assign => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => BOr,
            BOr => BXor,
            BXor => BAnd,
            BAnd => Shift,
            Shift => Concat,
            Concat => Term,
            Term => Factor,
            Factor => Power,
            Power => Unary,
            Unary => Call,
            Call => Call,
        }
    }
}

/// Infix binding power of a token.
fn infix_prec(kind: TokenKind) -> Prec {
    use TokenKind::*;
    match kind {
        Or => Prec::Or,
        And => Prec::And,
        EqEq | BangEq => Prec::Equality,
        Less | LessEq | Greater | GreaterEq => Prec::Comparison,
        Pipe => Prec::BOr,
        Caret => Prec::BXor,
        Amp => Prec::BAnd,
        Shl | Shr => Prec::Shift,
        DotDot => Prec::Concat,
        Plus | Minus => Prec::Term,
        Star | Slash | Percent => Prec::Factor,
        StarStar => Prec::Power,
        LParen | Dot | LBracket => Prec::Call,
        Question => Prec::Ternary,
        _ => Prec::None,
    }
}

/// Number of values a table-constructor batch flushes at once.
const ARRAY_FLUSH: usize = 64;

struct ClassCtx {
    has_super: bool,
}

pub(crate) struct Parser<'s> {
    lex: Lexer<'s>,
    st: &'s mut State,
    cur: Token,
    prev: Token,
    fns: Vec<FuncState>,
    classes: Vec<ClassCtx>,
    source: GcRef,
}

impl<'s> Parser<'s> {
    pub fn new(st: &'s mut State, text: &'s str, chunk_name: &str) -> Result<Self, SyntaxError> {
        let source = st.heap_mut().intern_str(chunk_name);
        let anon = st.heap_mut().intern_str("");
        let mut lex = Lexer::new(text);
        let first = lex.next_token(st)?;
        let fs = FuncState::new(source, anon, FnKind::Script, 1);
        Ok(Parser {
            lex,
            st,
            cur: first,
            prev: first,
            fns: vec![fs],
            classes: Vec::new(),
            source,
        })
    }

    /// Compile the whole chunk and return its prototype, anchored in the
    /// heap's temp roots by the caller.
    pub fn parse_chunk(mut self) -> Result<GcRef, SyntaxError> {
        // the top-level chunk collects script arguments as varargs
        let fs = self.fs();
        fs.emit_op_l(OpCode::VarargPrep, 0, 1);
        while !self.check(TokenKind::Eof) {
            self.declaration()?;
        }
        let line = self.cur.line;
        self.emit_implicit_return(line);
        let fs = self.fns.pop().expect("chunk function state");
        let mut chunk = fs.chunk;
        chunk.deflastline = line;
        let proto = self.st.heap_mut().new_proto(chunk);
        self.st.heap_mut().temp_push(Value::Obj(proto));
        Ok(proto)
    }

    /* ---------------- plumbing ---------------- */

    #[inline]
    fn fs(&mut self) -> &mut FuncState {
        self.fns.last_mut().expect("no active function state")
    }

    fn error(&self, msg: impl Into<String>) -> SyntaxError {
        SyntaxError { line: self.prev.line, msg: msg.into() }
    }

    fn error_at_cur(&self, msg: impl Into<String>) -> SyntaxError {
        SyntaxError { line: self.cur.line, msg: msg.into() }
    }

    fn advance(&mut self) -> Result<(), SyntaxError> {
        self.prev = self.cur;
        self.cur = self.lex.next_token(self.st)?;
        Ok(())
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> Result<bool, SyntaxError> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), SyntaxError> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(self.error_at_cur(format!("expected {what}")))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<GcRef, SyntaxError> {
        if self.check(TokenKind::Identifier) {
            self.advance()?;
            Ok(self.prev.str_payload())
        } else {
            Err(self.error_at_cur(format!("expected {what}")))
        }
    }

    fn text_of(&self, s: GcRef) -> String {
        self.st.heap().str_text(s).to_string()
    }

    /* ---------------- expression discharge ---------------- */

    /// Materialize an expression as exactly one value on the stack.
    fn discharge(&mut self, e: Exp) -> Result<(), SyntaxError> {
        let line = e.line;
        match e.kind {
            ExpKind::Void => return Err(self.error("expected expression")),
            ExpKind::Nil => self.fs().emit_op(OpCode::Nil, line),
            ExpKind::True => self.fs().emit_op(OpCode::True, line),
            ExpKind::False => self.fs().emit_op(OpCode::False, line),
            ExpKind::Int(i) => self.fs().emit_int(i, line)?,
            ExpKind::Float(f) => self.fs().emit_float(f, line)?,
            ExpKind::Str(s) => {
                self.fs().emit_const(Value::Obj(s), line)?;
            }
            ExpKind::Local(slot, _) => self.fs().emit_op_l(OpCode::GetLocal, slot, line),
            ExpKind::Upval(idx, _) => self.fs().emit_op_l(OpCode::GetUval, idx, line),
            ExpKind::Global(name) => {
                let k = self.fs().add_const(Value::Obj(name), line)?;
                self.fs().emit_op_l(OpCode::GetGlobal, k, line);
            }
            ExpKind::Indexed => self.fs().emit_op(OpCode::GetIndex, line),
            ExpKind::IndexedStr(s) => {
                let k = self.fs().add_const(Value::Obj(s), line)?;
                self.fs().emit_op_l(OpCode::GetIndexStr, k, line);
            }
            ExpKind::IndexedInt(i) => {
                self.fs().emit_op_l(OpCode::GetIndexInt, i as u32, line);
            }
            ExpKind::Dot(s) => {
                let k = self.fs().add_const(Value::Obj(s), line)?;
                self.fs().emit_op_l(OpCode::GetProperty, k, line);
            }
            ExpKind::SuperStr(s) => {
                let k = self.fs().add_const(Value::Obj(s), line)?;
                self.fs().emit_op_l(OpCode::GetSup, k, line);
            }
            ExpKind::SuperIdxStr(s) => {
                let k = self.fs().add_const(Value::Obj(s), line)?;
                self.fs().emit_op_l(OpCode::GetSupIdxStr, k, line);
            }
            ExpKind::SuperIdx => self.fs().emit_op(OpCode::GetSupIdx, line),
            ExpKind::Call(_) | ExpKind::Vararg(_) | ExpKind::Pushed => {}
        }
        Ok(())
    }

    /// Emit the "set" counterpart of a get descriptor; the value to
    /// store is on top of the stack, above any pending operands.
    fn emit_store(&mut self, target: Exp) -> Result<(), SyntaxError> {
        let line = target.line;
        match target.kind {
            ExpKind::Local(slot, kind) => {
                if matches!(kind, VarKind::Const | VarKind::Static) {
                    return Err(self.error("cannot assign to a const variable"));
                }
                self.fs().emit_op_l(OpCode::SetLocal, slot, line);
            }
            ExpKind::Upval(idx, kind) => {
                if matches!(kind, VarKind::Const | VarKind::Static) {
                    return Err(self.error("cannot assign to a const variable"));
                }
                self.fs().emit_op_l(OpCode::SetUval, idx, line);
            }
            ExpKind::Global(name) => {
                let k = self.fs().add_const(Value::Obj(name), line)?;
                self.fs().emit_op_l(OpCode::SetGlobal, k, line);
            }
            ExpKind::Indexed => self.fs().emit_op(OpCode::SetIndex, line),
            ExpKind::IndexedStr(s) => {
                let k = self.fs().add_const(Value::Obj(s), line)?;
                self.fs().emit_op_l(OpCode::SetIndexStr, k, line);
            }
            ExpKind::IndexedInt(i) => {
                self.fs().emit_op_l(OpCode::SetIndexInt, i as u32, line);
            }
            ExpKind::Dot(s) => {
                let k = self.fs().add_const(Value::Obj(s), line)?;
                self.fs().emit_op_l(OpCode::SetProperty, k, line);
            }
            _ => return Err(self.error("invalid assignment target")),
        }
        Ok(())
    }

    /* ---------------- name resolution ---------------- */

    fn resolve_name(&mut self, name: GcRef) -> Result<ExpKind, SyntaxError> {
        let top = self.fns.len() - 1;
        if let Some((slot, kind, defined)) = self.fns[top].resolve_local(name) {
            if !defined {
                let n = self.text_of(name);
                return Err(self.error(format!(
                    "cannot read local '{n}' in its own initializer"
                )));
            }
            return Ok(ExpKind::Local(slot, kind));
        }
        if top == 0 {
            return Ok(ExpKind::Global(name));
        }
        match self.resolve_upvalue(top, name)? {
            Some((idx, kind)) => Ok(ExpKind::Upval(idx, kind)),
            None => Ok(ExpKind::Global(name)),
        }
    }

    /// Walk outward through enclosing function states; the first hit
    /// creates descriptor-table entries all the way back in.
    fn resolve_upvalue(
        &mut self,
        fs_idx: usize,
        name: GcRef,
    ) -> Result<Option<(u32, VarKind)>, SyntaxError> {
        debug_assert!(fs_idx > 0);
        let parent = fs_idx - 1;
        let line = self.prev.line;
        if let Some((slot, kind, defined)) = self.fns[parent].resolve_local(name) {
            if defined {
                self.fns[parent].locals[slot as usize].captured = true;
                self.fns[parent].needs_close = true;
                let idx = self.fns[fs_idx].add_upvalue(name, slot, true, kind, line)?;
                return Ok(Some((idx, kind)));
            }
        }
        if parent == 0 {
            return Ok(None);
        }
        match self.resolve_upvalue(parent, name)? {
            Some((pidx, kind)) => {
                let idx = self.fns[fs_idx].add_upvalue(name, pidx, false, kind, line)?;
                Ok(Some((idx, kind)))
            }
            None => Ok(None),
        }
    }

    /* ---------------- expressions ---------------- */

    fn expression(&mut self) -> Result<Exp, SyntaxError> {
        self.parse_precedence(Prec::Or)
    }

    fn parse_precedence(&mut self, prec: Prec) -> Result<Exp, SyntaxError> {
        self.advance()?;
        let mut e = self.prefix()?;
        while infix_prec(self.cur.kind) >= prec && infix_prec(self.cur.kind) != Prec::None {
            self.advance()?;
            e = self.infix(e)?;
        }
        Ok(e)
    }

    fn prefix(&mut self) -> Result<Exp, SyntaxError> {
        use TokenKind::*;
        let line = self.prev.line;
        let kind = match self.prev.kind {
            Nil => ExpKind::Nil,
            True => ExpKind::True,
            False => ExpKind::False,
            Int => match self.prev.payload {
                crate::lexer::Payload::Int(i) => ExpKind::Int(i),
                _ => unreachable!(),
            },
            Float => match self.prev.payload {
                crate::lexer::Payload::Float(f) => ExpKind::Float(f),
                _ => unreachable!(),
            },
            Str => ExpKind::Str(self.prev.str_payload()),
            Identifier => {
                let name = self.prev.str_payload();
                self.resolve_name(name)?
            }
            SelfKw => {
                if self.classes.is_empty() {
                    return Err(self.error("cannot use 'self' outside of a class"));
                }
                let name = self.st.heap_mut().intern_str("self");
                match self.resolve_name(name)? {
                    ExpKind::Global(_) => {
                        return Err(self.error("cannot use 'self' outside of a method"));
                    }
                    k => k,
                }
            }
            Super => return self.super_expr(),
            Minus => {
                let operand = self.parse_precedence(Prec::Unary)?;
                return self.unary_arith(operand, line, OpCode::Unm);
            }
            Bang => {
                let operand = self.parse_precedence(Prec::Unary)?;
                self.discharge(operand)?;
                self.fs().emit_op(OpCode::Not, line);
                ExpKind::Pushed
            }
            Tilde => {
                let operand = self.parse_precedence(Prec::Unary)?;
                return self.unary_arith(operand, line, OpCode::BNot);
            }
            Hash => {
                let operand = self.parse_precedence(Prec::Unary)?;
                self.discharge(operand)?;
                self.fs().emit_op(OpCode::Len, line);
                ExpKind::Pushed
            }
            LParen => {
                let inner = self.expression()?;
                self.expect(RParen, "')' after expression")?;
                // parenthesizing truncates multiple results to one and
                // makes the expression non-assignable
                self.discharge(inner)?;
                ExpKind::Pushed
            }
            LBracket => return self.array_literal(line),
            LBrace => return self.table_literal(line),
            Fn => {
                self.function_body(FnKind::Function, line)?;
                ExpKind::Pushed
            }
            Ellipsis => {
                if !self.fs().chunk.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                self.fs().emit_op(OpCode::Vararg, line);
                let at = self.fs().pc();
                self.fs().emit_l(2); // one value
                self.fs().adjust_sp(1);
                ExpKind::Vararg(at)
            }
            Question => return Err(self.error("the ternary operator is not supported")),
            _ => return Err(self.error("expected expression")),
        };
        Ok(Exp::new(kind, line))
    }

    fn unary_arith(&mut self, operand: Exp, line: u32, op: OpCode) -> Result<Exp, SyntaxError> {
        // fold literal operands
        match (op, operand.kind) {
            (OpCode::Unm, ExpKind::Int(i)) => {
                return Ok(Exp::new(ExpKind::Int(i.wrapping_neg()), line));
            }
            (OpCode::Unm, ExpKind::Float(f)) => {
                return Ok(Exp::new(ExpKind::Float(-f), line));
            }
            (OpCode::BNot, ExpKind::Int(i)) => {
                return Ok(Exp::new(ExpKind::Int(!i), line));
            }
            _ => {}
        }
        self.discharge(operand)?;
        self.fs().emit_op(op, line);
        Ok(Exp::new(ExpKind::Pushed, line))
    }

    fn infix(&mut self, lhs: Exp) -> Result<Exp, SyntaxError> {
        use TokenKind::*;
        let line = self.prev.line;
        match self.prev.kind {
            Plus => self.binary(lhs, BinOp::Add, line),
            Minus => self.binary(lhs, BinOp::Sub, line),
            Star => self.binary(lhs, BinOp::Mul, line),
            Slash => self.binary(lhs, BinOp::Div, line),
            Percent => self.binary(lhs, BinOp::Mod, line),
            StarStar => self.binary(lhs, BinOp::Pow, line),
            Shl => self.binary(lhs, BinOp::Shl, line),
            Shr => self.binary(lhs, BinOp::Shr, line),
            Amp => self.binary(lhs, BinOp::BAnd, line),
            Pipe => self.binary(lhs, BinOp::BOr, line),
            Caret => self.binary(lhs, BinOp::BXor, line),
            DotDot => self.binary(lhs, BinOp::Concat, line),
            EqEq => self.comparison(lhs, EqEq, line),
            BangEq => self.comparison(lhs, BangEq, line),
            Less => self.comparison(lhs, Less, line),
            LessEq => self.comparison(lhs, LessEq, line),
            Greater => self.comparison(lhs, Greater, line),
            GreaterEq => self.comparison(lhs, GreaterEq, line),
            And => self.logical(lhs, true, line),
            Or => self.logical(lhs, false, line),
            LParen => self.call(lhs, line),
            Dot => {
                self.discharge(lhs)?;
                let name = self.expect_ident("property name after '.'")?;
                Ok(Exp::new(ExpKind::Dot(name), line))
            }
            LBracket => {
                self.discharge(lhs)?;
                let key = self.expression()?;
                self.expect(RBracket, "']' after index")?;
                match key.kind {
                    ExpKind::Str(s) => Ok(Exp::new(ExpKind::IndexedStr(s), line)),
                    ExpKind::Int(i) if i >= 0 && imm24(i).is_some() => {
                        Ok(Exp::new(ExpKind::IndexedInt(i), line))
                    }
                    _ => {
                        self.discharge(key)?;
                        Ok(Exp::new(ExpKind::Indexed, line))
                    }
                }
            }
            Question => Err(self.error("the ternary operator is not supported")),
            _ => unreachable!("token without infix rule"),
        }
    }

    /// Binary arithmetic/concat with folding and the K/I peephole
    /// forms. A literal left operand is pushed eagerly and rewound if
    /// the whole expression folds.
    fn binary(&mut self, lhs: Exp, op: BinOp, line: u32) -> Result<Exp, SyntaxError> {
        let lhs_lit = lhs.as_literal();
        let rewind_pc = self.fs().pc();
        self.discharge(lhs)?;
        let after_lhs = self.fs().pc();

        let next = if op == BinOp::Pow || op == BinOp::Concat {
            // right associative
            infix_prec_of_binop(op)
        } else {
            infix_prec_of_binop(op).one_higher()
        };
        let rhs = self.parse_precedence(next)?;

        if let (Some(a), Some(b)) = (lhs_lit, rhs.as_literal()) {
            if self.fs().pc() == after_lhs {
                if let Some(v) = const_fold(op, a, b) {
                    let fs = self.fs();
                    fs.chunk.code.truncate(rewind_pc);
                    fs.chunk.lines.rewind_to(rewind_pc as u32);
                    fs.adjust_sp(-1);
                    let kind = match v {
                        Value::Int(i) => ExpKind::Int(i),
                        Value::Float(f) => ExpKind::Float(f),
                        _ => unreachable!("arithmetic folds to numbers"),
                    };
                    return Ok(Exp::new(kind, line));
                }
            }
        }

        // immediate / constant right operand, with the paired MBin for
        // metamethod fallback
        match rhs.kind {
            ExpKind::Int(i) => {
                if let (Some(iop), Some((mag, sign))) = (OpCode::i_form(op), imm24(i)) {
                    let fs = self.fs();
                    fs.emit_op(iop, line);
                    fs.emit_l(mag);
                    fs.emit_s(sign);
                    fs.emit_op_s(OpCode::MBin, op.into(), line);
                    // the pair nets to "replace top"
                    fs.adjust_sp(1);
                    return Ok(Exp::new(ExpKind::Pushed, line));
                }
                if let Some(kop) = OpCode::k_form(op) {
                    let k = self.fs().add_const(Value::Int(i), line)?;
                    let fs = self.fs();
                    fs.emit_op_l(kop, k, line);
                    fs.emit_op_s(OpCode::MBin, op.into(), line);
                    fs.adjust_sp(1);
                    return Ok(Exp::new(ExpKind::Pushed, line));
                }
            }
            ExpKind::Float(f) => {
                if let Some(kop) = OpCode::k_form(op) {
                    let k = self.fs().add_const(Value::Float(f), line)?;
                    let fs = self.fs();
                    fs.emit_op_l(kop, k, line);
                    fs.emit_op_s(OpCode::MBin, op.into(), line);
                    fs.adjust_sp(1);
                    return Ok(Exp::new(ExpKind::Pushed, line));
                }
            }
            _ => {}
        }
        self.discharge(rhs)?;
        self.fs().emit_op(OpCode::bin_form(op), line);
        Ok(Exp::new(ExpKind::Pushed, line))
    }

    fn comparison(&mut self, lhs: Exp, tok: TokenKind, line: u32) -> Result<Exp, SyntaxError> {
        use TokenKind::*;
        self.discharge(lhs)?;
        let rhs = self.parse_precedence(infix_prec(tok).one_higher())?;
        // immediate forms for integer right operands
        if let ExpKind::Int(i) = rhs.kind {
            if let Some((mag, sign)) = imm24(i) {
                let fs = self.fs();
                match tok {
                    EqEq | BangEq => {
                        fs.emit_op(OpCode::EqI, line);
                        fs.emit_l(mag);
                        fs.emit_s(sign);
                        fs.emit_s(u8::from(tok == EqEq));
                    }
                    Less => {
                        fs.emit_op(OpCode::LtI, line);
                        fs.emit_l(mag);
                        fs.emit_s(sign);
                    }
                    LessEq => {
                        fs.emit_op(OpCode::LeI, line);
                        fs.emit_l(mag);
                        fs.emit_s(sign);
                    }
                    Greater => {
                        fs.emit_op(OpCode::GtI, line);
                        fs.emit_l(mag);
                        fs.emit_s(sign);
                    }
                    GreaterEq => {
                        fs.emit_op(OpCode::GeI, line);
                        fs.emit_l(mag);
                        fs.emit_s(sign);
                    }
                    _ => unreachable!(),
                }
                return Ok(Exp::new(ExpKind::Pushed, line));
            }
        }
        // constant form for equality against any literal
        if matches!(tok, EqEq | BangEq) {
            if let Some(v) = rhs.as_literal() {
                let k = self.fs().add_const(v, line)?;
                let fs = self.fs();
                fs.emit_op(OpCode::EqK, line);
                fs.emit_l(k);
                fs.emit_s(u8::from(tok == EqEq));
                return Ok(Exp::new(ExpKind::Pushed, line));
            }
        }
        self.discharge(rhs)?;
        let op = match tok {
            EqEq | BangEq => OpCode::Eq,
            Less => OpCode::Lt,
            LessEq => OpCode::Le,
            Greater => OpCode::Gt,
            GreaterEq => OpCode::Ge,
            _ => unreachable!(),
        };
        if op == OpCode::Eq {
            self.fs().emit_op_s(OpCode::Eq, u8::from(tok == EqEq), line);
        } else {
            self.fs().emit_op(op, line);
        }
        Ok(Exp::new(ExpKind::Pushed, line))
    }

    /// Short-circuit and/or: keep the deciding value, otherwise pop it
    /// and take the right operand's value.
    fn logical(&mut self, lhs: Exp, is_and: bool, line: u32) -> Result<Exp, SyntaxError> {
        self.discharge(lhs)?;
        let s = u8::from(!is_and);
        let j = self.fs().emit_jump(OpCode::TestOrPop, Some(s), line);
        self.fs().adjust_sp(-1);
        let prec = if is_and { Prec::And } else { Prec::Or };
        let rhs = self.parse_precedence(prec.one_higher())?;
        self.discharge(rhs)?;
        self.fs().patch_jump(j)?;
        Ok(Exp::new(ExpKind::Pushed, line))
    }

    /// Call: the callee is already the topmost value; arguments follow.
    fn call(&mut self, callee: Exp, line: u32) -> Result<Exp, SyntaxError> {
        self.discharge(callee)?;
        let base_rel = self.fs().sp - 1;
        let mut last: Option<Exp> = None;
        if !self.check(TokenKind::RParen) {
            loop {
                if let Some(prev) = last.take() {
                    self.discharge(prev)?;
                }
                let arg = self.expression()?;
                last = Some(arg);
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after arguments")?;
        if let Some(arg) = last {
            // a trailing call/vararg argument keeps all its results
            if arg.is_multret() {
                self.set_returns_all(&arg);
            } else {
                self.discharge(arg)?;
            }
        }
        let fs = self.fs();
        fs.emit_op(OpCode::Call, line);
        fs.emit_l(base_rel);
        let nres_at = fs.pc();
        fs.emit_l(2); // one result unless the context re-patches
        fs.sp = base_rel;
        fs.adjust_sp(1);
        Ok(Exp::new(ExpKind::Call(nres_at), line))
    }

    /// Re-patch a call or vararg expression to produce all results.
    fn set_returns_all(&mut self, e: &Exp) {
        match e.kind {
            ExpKind::Call(at) | ExpKind::Vararg(at) => {
                put_u24(&mut self.fs().chunk.code, at, 0);
            }
            _ => unreachable!("not a multi-result expression"),
        }
    }

    /// Re-patch a call/vararg to produce exactly `n` results.
    fn set_returns(&mut self, e: &Exp, n: u32) {
        match e.kind {
            ExpKind::Call(at) | ExpKind::Vararg(at) => {
                put_u24(&mut self.fs().chunk.code, at, n + 1);
                let fs = self.fs();
                // one result was accounted when the call was emitted
                fs.adjust_sp(n as i32 - 1);
            }
            _ => unreachable!("not a multi-result expression"),
        }
    }

    fn super_expr(&mut self) -> Result<Exp, SyntaxError> {
        let line = self.prev.line;
        match self.classes.last() {
            None => return Err(self.error("cannot use 'super' outside of a class")),
            Some(c) if !c.has_super => {
                return Err(self.error("cannot use 'super' in a class with no superclass"));
            }
            Some(_) => {}
        }
        let self_name = self.st.heap_mut().intern_str("self");
        let self_exp = match self.resolve_name(self_name)? {
            ExpKind::Global(_) => {
                return Err(self.error("cannot use 'super' outside of a method"));
            }
            k => Exp::new(k, line),
        };
        self.discharge(self_exp)?;
        let super_name = self.st.heap_mut().intern_str("super");
        let super_exp = match self.resolve_name(super_name)? {
            ExpKind::Global(_) => {
                return Err(self.error("cannot use 'super' outside of a method"));
            }
            k => Exp::new(k, line),
        };
        self.discharge(super_exp)?;
        if self.matches(TokenKind::Dot)? {
            let name = self.expect_ident("method name after 'super.'")?;
            Ok(Exp::new(ExpKind::SuperStr(name), line))
        } else if self.matches(TokenKind::LBracket)? {
            let key = self.expression()?;
            self.expect(TokenKind::RBracket, "']' after super index")?;
            if let ExpKind::Str(s) = key.kind {
                Ok(Exp::new(ExpKind::SuperIdxStr(s), line))
            } else {
                self.discharge(key)?;
                Ok(Exp::new(ExpKind::SuperIdx, line))
            }
        } else {
            Err(self.error_at_cur("expected '.' or '[' after 'super'"))
        }
    }

    fn array_literal(&mut self, line: u32) -> Result<Exp, SyntaxError> {
        self.fs().emit_op_s(OpCode::NewArray, 0, line);
        let mut index: i64 = 0;
        let mut pending: usize = 0;
        while !self.check(TokenKind::RBracket) {
            let e = self.expression()?;
            self.discharge(e)?;
            pending += 1;
            if pending == ARRAY_FLUSH {
                self.flush_array(index, pending, line);
                index += pending as i64;
                pending = 0;
            }
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']' after array elements")?;
        if pending > 0 {
            self.flush_array(index, pending, line);
        }
        Ok(Exp::new(ExpKind::Pushed, line))
    }

    fn flush_array(&mut self, first: i64, count: usize, line: u32) {
        let fs = self.fs();
        fs.emit_op(OpCode::SetArray, line);
        fs.emit_l(first as u32);
        fs.emit_s(count as u8);
        fs.adjust_sp(-(count as i32));
    }

    fn table_literal(&mut self, line: u32) -> Result<Exp, SyntaxError> {
        self.fs().emit_op_s(OpCode::NewTable, 0, line);
        let table_slot = self.fs().sp - 1;
        while !self.check(TokenKind::RBrace) {
            if self.matches(TokenKind::LBracket)? {
                // [expr] = value
                let kline = self.cur.line;
                self.fs().emit_op_l(OpCode::GetLocal, table_slot, kline);
                let key = self.expression()?;
                self.discharge(key)?;
                self.expect(TokenKind::RBracket, "']' after table key")?;
                self.expect(TokenKind::Eq, "'=' after table key")?;
                let val = self.expression()?;
                self.discharge(val)?;
                self.fs().emit_op(OpCode::SetIndex, line);
            } else {
                let name = self.expect_ident("field name in table literal")?;
                self.expect(TokenKind::Eq, "'=' after field name")?;
                let fline = self.prev.line;
                self.fs().emit_op_l(OpCode::GetLocal, table_slot, fline);
                let val = self.expression()?;
                self.discharge(val)?;
                let k = self.fs().add_const(Value::Obj(name), line)?;
                self.fs().emit_op_l(OpCode::SetIndexStr, k, line);
            }
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}' after table literal")?;
        Ok(Exp::new(ExpKind::Pushed, line))
    }

    /* ---------------- declarations ---------------- */

    fn declaration(&mut self) -> Result<(), SyntaxError> {
        use TokenKind::*;
        if self.matches(Local)? {
            self.local_declaration(VarKind::Regular)
        } else if self.matches(Const)? || self.matches(Fixed)? {
            self.named_const_declaration(VarKind::Const)
        } else if self.matches(Static)? {
            self.named_const_declaration(VarKind::Static)
        } else if self.matches(Fn)? {
            self.fn_declaration()
        } else if self.matches(Class)? {
            self.class_declaration()
        } else {
            self.statement()
        }
    }

    /// `local a [<attrib>] [, b ...] [= exprlist] ;`
    fn local_declaration(&mut self, default_kind: VarKind) -> Result<(), SyntaxError> {
        let mut names: Vec<(GcRef, VarKind)> = Vec::new();
        loop {
            let name = self.expect_ident("variable name")?;
            let mut kind = default_kind;
            if self.matches(TokenKind::Less)? {
                let attr = self.expect_ident("attribute name in '<...>'")?;
                kind = match self.text_of(attr).as_str() {
                    "close" => VarKind::Close,
                    "const" => VarKind::Const,
                    other => {
                        return Err(self.error(format!("unknown variable attribute '{other}'")));
                    }
                };
                self.expect(TokenKind::Greater, "'>' after attribute")?;
            }
            names.push((name, kind));
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        if names.iter().filter(|(_, k)| *k == VarKind::Close).count() > 0 && names.len() > 1 {
            return Err(self.error("a <close> variable must be declared alone"));
        }
        let line = self.prev.line;
        for &(name, kind) in &names {
            self.fs().declare_local(name, kind, line)?;
        }
        let nvars = names.len();
        if self.matches(TokenKind::Eq)? {
            self.exprlist_adjusted(nvars)?;
        } else {
            if names.iter().any(|(_, k)| *k == VarKind::Close) {
                return Err(self.error("a <close> variable needs an initial value"));
            }
            let fs = self.fs();
            if nvars == 1 {
                fs.emit_op(OpCode::Nil, line);
            } else {
                fs.emit_op_l(OpCode::NilN, nvars as u32, line);
                fs.adjust_sp(nvars as i32);
            }
        }
        self.expect(TokenKind::Semicolon, "';' after variable declaration")?;
        self.fs().define_locals(nvars);
        // to-be-closed registration happens after the slot holds its value
        if let Some(&(_, VarKind::Close)) = names.first() {
            let slot = self.fs().sp - 1;
            self.fs().emit_op_l(OpCode::Tbc, slot, line);
            self.fs().needs_close = true;
        }
        Ok(())
    }

    /// `const NAME = expr;` (also `fixed`/`static`): a single immutable
    /// binding, local to the enclosing scope.
    fn named_const_declaration(&mut self, kind: VarKind) -> Result<(), SyntaxError> {
        let name = self.expect_ident("constant name")?;
        let line = self.prev.line;
        self.fs().declare_local(name, kind, line)?;
        self.expect(TokenKind::Eq, "'=' after constant name")?;
        let e = self.expression()?;
        self.discharge(e)?;
        self.expect(TokenKind::Semicolon, "';' after constant declaration")?;
        self.fs().define_local();
        Ok(())
    }

    /// Comma expression list adjusted to exactly `want` values.
    fn exprlist_adjusted(&mut self, want: usize) -> Result<(), SyntaxError> {
        let mut count = 0usize;
        let mut last;
        loop {
            let e = self.expression()?;
            count += 1;
            last = Some(e);
            if !self.matches(TokenKind::Comma)? {
                break;
            }
            self.discharge(last.take().unwrap())?;
        }
        let last = last.expect("expression list cannot be empty");
        let line = last.line;
        if count < want && last.is_multret() {
            self.set_returns(&last, (want - count + 1) as u32);
            return Ok(());
        }
        self.discharge(last)?;
        if count < want {
            let missing = (want - count) as u32;
            let fs = self.fs();
            if missing == 1 {
                fs.emit_op(OpCode::Nil, line);
            } else {
                fs.emit_op_l(OpCode::NilN, missing, line);
                fs.adjust_sp(missing as i32);
            }
        } else if count > want {
            let extra = (count - want) as u32;
            let fs = self.fs();
            if extra == 1 {
                fs.emit_op(OpCode::Pop, line);
            } else {
                fs.emit_op_l(OpCode::PopN, extra, line);
                fs.adjust_sp(-(extra as i32));
            }
        }
        Ok(())
    }

    fn fn_declaration(&mut self) -> Result<(), SyntaxError> {
        let name = self.expect_ident("function name")?;
        let line = self.prev.line;
        if self.fns.len() == 1 && self.fs().scope_depth == 0 {
            // top level: a global function
            self.function_body(FnKind::Function, line)?;
            let k = self.fs().add_const(Value::Obj(name), line)?;
            self.fs().emit_op_l(OpCode::SetGlobal, k, line);
        } else {
            // local function; declare first so the body can recurse
            self.fs().declare_local(name, VarKind::Regular, line)?;
            self.fs().define_local();
            self.function_body(FnKind::Function, line)?;
        }
        Ok(())
    }

    /// Parse `(params) { body }` into a nested prototype and emit the
    /// `Closure` instruction in the enclosing function.
    fn function_body(&mut self, kind: FnKind, line: u32) -> Result<(), SyntaxError> {
        let slot0 = if matches!(kind, FnKind::Method | FnKind::Init) {
            self.st.heap_mut().intern_str("self")
        } else {
            self.st.heap_mut().intern_str("")
        };
        self.fns.push(FuncState::new(self.source, slot0, kind, line));
        self.expect(TokenKind::LParen, "'(' before parameters")?;
        let mut arity = 0u32;
        let mut is_vararg = false;
        if !self.check(TokenKind::RParen) {
            loop {
                if self.matches(TokenKind::Ellipsis)? {
                    is_vararg = true;
                    break;
                }
                let pname = self.expect_ident("parameter name")?;
                let pline = self.prev.line;
                if arity as usize >= MAX_PARAMS {
                    return Err(self.error("too many parameters"));
                }
                self.fs().declare_local(pname, VarKind::Regular, pline)?;
                self.fs().define_local();
                arity += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters")?;
        {
            let fs = self.fs();
            fs.chunk.arity = arity;
            fs.chunk.is_vararg = is_vararg;
            // parameters occupy the slots above the callee
            fs.adjust_sp(arity as i32);
            if is_vararg {
                fs.emit_op_l(OpCode::VarargPrep, arity, line);
            }
        }
        self.expect(TokenKind::LBrace, "'{' before function body")?;
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration()?;
        }
        self.expect(TokenKind::RBrace, "'}' after function body")?;
        let end_line = self.prev.line;
        self.emit_implicit_return(end_line);
        let mut fs = self.fns.pop().expect("function state");
        fs.chunk.deflastline = end_line;
        let chunk = fs.chunk;
        let proto = self.st.heap_mut().new_proto(chunk);
        self.st.heap_mut().temp_push(Value::Obj(proto));
        let parent = self.fs();
        let pi = parent.chunk.protos.len() as u32;
        parent.chunk.protos.push(proto);
        parent.emit_op_l(OpCode::Closure, pi, line);
        Ok(())
    }

    fn emit_implicit_return(&mut self, line: u32) {
        let fs = self.fs();
        let first = fs.sp;
        let close = u8::from(fs.needs_close);
        fs.emit_op(OpCode::Ret, line);
        fs.emit_l(first);
        fs.emit_l(1); // zero results
        fs.emit_s(close);
    }

    fn class_declaration(&mut self) -> Result<(), SyntaxError> {
        let name = self.expect_ident("class name")?;
        let line = self.prev.line;
        let is_global = self.fns.len() == 1 && self.fs().scope_depth == 0;

        self.fs().emit_op(OpCode::NewClass, line);
        if is_global {
            let k = self.fs().add_const(Value::Obj(name), line)?;
            self.fs().emit_op_l(OpCode::SetGlobal, k, line);
        } else {
            self.fs().declare_local(name, VarKind::Regular, line)?;
            self.fs().define_local();
        }

        let has_super = self.matches(TokenKind::Colon)?;
        self.classes.push(ClassCtx { has_super });
        if has_super {
            // scope for the hidden 'super' local that methods capture
            self.begin_scope();
            let sup = self.expression()?;
            self.discharge(sup)?;
            let super_name = self.st.heap_mut().intern_str("super");
            self.fs().declare_local(super_name, VarKind::Const, line)?;
            self.fs().define_local();
            let reload = self.resolve_name(name)?;
            self.discharge(Exp::new(reload, line))?;
            self.fs().emit_op(OpCode::Inherit, line);
        }

        // class back on top for the method definitions
        let reload = self.resolve_name(name)?;
        self.discharge(Exp::new(reload, line))?;

        self.expect(TokenKind::LBrace, "'{' before class body")?;
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let mname = self.expect_ident("method name")?;
            let mline = self.prev.line;
            let text = self.text_of(mname);
            let mm = Mm::from_name(&text);
            let kind = if mm == Some(Mm::Init) { FnKind::Init } else { FnKind::Method };
            self.function_body(kind, mline)?;
            match mm {
                Some(slot) => self.fs().emit_op_s(OpCode::SetMm, slot as u8, mline),
                None => {
                    let k = self.fs().add_const(Value::Obj(mname), mline)?;
                    self.fs().emit_op_l(OpCode::Method, k, mline);
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}' after class body")?;
        self.fs().emit_op(OpCode::Pop, line);
        if has_super {
            self.end_scope(line)?;
        }
        self.classes.pop();
        Ok(())
    }

    /* ---------------- statements ---------------- */

    fn statement(&mut self) -> Result<(), SyntaxError> {
        use TokenKind::*;
        if self.matches(If)? {
            self.if_statement()
        } else if self.matches(While)? {
            self.while_statement()
        } else if self.matches(For)? {
            self.for_statement()
        } else if self.matches(Switch)? {
            self.switch_statement()
        } else if self.matches(Return)? {
            self.return_statement()
        } else if self.matches(Break)? {
            self.break_statement()
        } else if self.matches(Continue)? {
            self.continue_statement()
        } else if self.matches(LBrace)? {
            self.begin_scope();
            self.block()?;
            let line = self.prev.line;
            self.end_scope(line)
        } else if self.matches(Semicolon)? {
            Ok(())
        } else {
            self.expr_statement()
        }
    }

    fn block(&mut self) -> Result<(), SyntaxError> {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration()?;
        }
        self.expect(TokenKind::RBrace, "'}' after block")
    }

    fn begin_scope(&mut self) {
        self.fs().scope_depth += 1;
    }

    /// Exit a scope: pop its locals, closing upvalues and to-be-closed
    /// slots first when any were captured or registered.
    fn end_scope(&mut self, line: u32) -> Result<(), SyntaxError> {
        let fs = self.fs();
        fs.scope_depth -= 1;
        let depth = fs.scope_depth as i32;
        let mut count = 0u32;
        let mut needs_close = false;
        while let Some(l) = fs.locals.last() {
            if l.depth <= depth {
                break;
            }
            needs_close |= l.captured || l.kind == VarKind::Close;
            let name = l.name;
            let start = 0; // refined per-local tracking is not kept
            fs.locals.pop();
            fs.debug_local(name, start);
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }
        let level = fs.sp - count;
        if needs_close {
            fs.emit_op_l(OpCode::Close, level, line);
        }
        if count == 1 {
            fs.emit_op(OpCode::Pop, line);
        } else {
            fs.emit_op_l(OpCode::PopN, count, line);
            fs.adjust_sp(-(count as i32));
        }
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        self.expect(TokenKind::LParen, "'(' after 'if'")?;
        let cond = self.expression()?;
        self.discharge(cond)?;
        self.expect(TokenKind::RParen, "')' after condition")?;
        let else_jump = self.fs().emit_jump(OpCode::TestPop, Some(0), line);
        self.statement()?;
        if self.matches(TokenKind::Else)? {
            let end_jump = self.fs().emit_jump(OpCode::Jmp, None, line);
            self.fs().patch_jump(else_jump)?;
            self.statement()?;
            self.fs().patch_jump(end_jump)?;
        } else {
            self.fs().patch_jump(else_jump)?;
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        let start = self.fs().pc();
        self.expect(TokenKind::LParen, "'(' after 'while'")?;
        let cond = self.expression()?;
        self.discharge(cond)?;
        self.expect(TokenKind::RParen, "')' after condition")?;
        let exit = self.fs().emit_jump(OpCode::TestPop, Some(0), line);
        let sp = self.fs().sp;
        self.fs().ctrl.push(ControlCtx {
            is_loop: true,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: Some(start),
            sp,
        });
        self.statement()?;
        self.fs().emit_loop_to(start, line)?;
        self.fs().patch_jump(exit)?;
        self.finish_control(line)?;
        Ok(())
    }

    /// Both loop forms: C-style `for (init; cond; step) stmt` and the
    /// generic `for name[, name] in expr stmt`.
    fn for_statement(&mut self) -> Result<(), SyntaxError> {
        if self.check(TokenKind::LParen) {
            self.c_style_for()
        } else {
            self.generic_for()
        }
    }

    fn c_style_for(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        self.expect(TokenKind::LParen, "'(' after 'for'")?;
        self.begin_scope();
        // initializer
        if self.matches(TokenKind::Semicolon)? {
            // empty
        } else if self.matches(TokenKind::Local)? {
            self.local_declaration(VarKind::Regular)?;
        } else {
            self.expr_statement()?;
        }
        let cond_pc = self.fs().pc();
        let exit = if !self.check(TokenKind::Semicolon) {
            let cond = self.expression()?;
            self.discharge(cond)?;
            Some(self.fs().emit_jump(OpCode::TestPop, Some(0), line))
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';' after loop condition")?;
        // jump over the step clause into the body; the step runs after
        // each iteration, which is also where 'continue' lands
        let body_jump = self.fs().emit_jump(OpCode::Jmp, None, line);
        let step_pc = self.fs().pc();
        if !self.check(TokenKind::RParen) {
            // the step clause is an assignment or an expression for
            // effect, without the trailing semicolon
            let step = self.expression()?;
            if self.matches(TokenKind::Eq)? {
                let v = self.expression()?;
                self.discharge(v)?;
                self.emit_store(step)?;
            } else {
                match step.kind {
                    ExpKind::Call(at) => {
                        // a call used for effect keeps no results
                        put_u24(&mut self.fs().chunk.code, at, 1);
                        self.fs().adjust_sp(-1);
                    }
                    _ => {
                        self.discharge(step)?;
                        self.fs().emit_op(OpCode::Pop, line);
                    }
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after for clauses")?;
        self.fs().emit_loop_to(cond_pc, line)?;
        self.fs().patch_jump(body_jump)?;
        let sp = self.fs().sp;
        self.fs().ctrl.push(ControlCtx {
            is_loop: true,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: Some(step_pc),
            sp,
        });
        self.statement()?;
        self.fs().emit_loop_to(step_pc, line)?;
        if let Some(exit) = exit {
            self.fs().patch_jump(exit)?;
        }
        self.finish_control(line)?;
        self.end_scope(line)?;
        Ok(())
    }

    /// Generic for over an iterator triple: hidden (iterator, state,
    /// control) locals, then `ForPrep`/`ForCall`/`ForLoop`.
    fn generic_for(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        self.begin_scope();
        let mut vars = Vec::new();
        loop {
            vars.push(self.expect_ident("loop variable name")?);
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::In, "'in' after loop variables")?;
        let base_rel = self.fs().sp;
        // the iterator expression provides up to three values
        self.exprlist_adjusted(3)?;
        for hidden in ["(for iterator)", "(for state)", "(for control)"] {
            let n = self.st.heap_mut().intern_str(hidden);
            self.fs().declare_local(n, VarKind::Regular, line)?;
            self.fs().define_local();
        }
        let prep = {
            let fs = self.fs();
            fs.emit_op(OpCode::ForPrep, line);
            fs.emit_l(base_rel);
            let at = fs.pc();
            fs.emit_l(0);
            crate::emit::JumpAt { at, trailing: 0 }
        };
        let body_start = self.fs().pc();
        // loop variables live at base+3..; each ForCall writes them
        self.begin_scope();
        for &v in &vars {
            self.fs().declare_local(v, VarKind::Regular, line)?;
            self.fs().define_local();
        }
        self.fs().adjust_sp(vars.len() as i32);
        // break and continue both leave the loop variables behind; the
        // unwind level is the hidden-triple top
        self.fs().ctrl.push(ControlCtx {
            is_loop: true,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: None,
            sp: base_rel + 3,
        });
        self.statement()?;
        // the loop variables are re-created by the next ForCall; drop
        // them from the compiler's view without emitting pops
        {
            let fs = self.fs();
            for _ in 0..vars.len() {
                let l = fs.locals.pop().expect("loop variable slot");
                fs.debug_local(l.name, body_start as u32);
            }
            fs.scope_depth -= 1;
            fs.sp = base_rel + 3;
        }
        let forcall_pc = self.fs().pc();
        {
            let fs = self.fs();
            fs.emit_op(OpCode::ForCall, line);
            fs.emit_l(base_rel);
            fs.emit_l(vars.len() as u32);
            fs.patch_jump_to(prep, forcall_pc)?;
        }
        {
            let fs = self.fs();
            fs.emit_op(OpCode::ForLoop, line);
            fs.emit_l(base_rel);
            let after = fs.pc() + 3;
            let off = after - body_start;
            fs.emit_l(off as u32);
        }
        // continue re-enters at the iterator call
        let ctx = self.fs().ctrl.last_mut().expect("loop context");
        let continues = std::mem::take(&mut ctx.continues);
        for at in continues {
            self.fs().patch_jump_to(at, forcall_pc)?;
        }
        self.finish_control(line)?;
        self.end_scope(line)?;
        Ok(())
    }

    fn switch_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        self.expect(TokenKind::LParen, "'(' after 'switch'")?;
        let subject = self.expression()?;
        self.discharge(subject)?;
        self.expect(TokenKind::RParen, "')' after switch subject")?;
        self.expect(TokenKind::LBrace, "'{' before switch cases")?;
        let sp = self.fs().sp;
        self.fs().ctrl.push(ControlCtx {
            is_loop: false,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: None,
            sp,
        });
        let mut saw_default = false;
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Case)? {
                if saw_default {
                    return Err(self.error("'case' after 'default' in switch"));
                }
                let cline = self.prev.line;
                let val = self.expression()?;
                self.discharge(val)?;
                self.expect(TokenKind::Colon, "':' after case value")?;
                self.fs().emit_op(OpCode::EqPreserve, cline);
                let fail = self.fs().emit_jump(OpCode::TestPop, Some(0), cline);
                self.case_body()?;
                // each case exits the switch; there is no fallthrough
                let out = self.fs().emit_jump(OpCode::Jmp, None, cline);
                self.fs().ctrl.last_mut().expect("switch context").breaks.push(out);
                self.fs().patch_jump(fail)?;
            } else if self.matches(TokenKind::Default)? {
                if saw_default {
                    return Err(self.error("duplicate 'default' in switch"));
                }
                saw_default = true;
                self.expect(TokenKind::Colon, "':' after 'default'")?;
                self.case_body()?;
            } else {
                return Err(self.error_at_cur("expected 'case' or 'default' in switch body"));
            }
        }
        self.expect(TokenKind::RBrace, "'}' after switch body")?;
        self.finish_control(line)?;
        self.fs().emit_op(OpCode::Pop, line); // the subject
        Ok(())
    }

    fn case_body(&mut self) -> Result<(), SyntaxError> {
        use TokenKind::*;
        while !self.check(Case) && !self.check(Default) && !self.check(RBrace) && !self.check(Eof)
        {
            self.declaration()?;
        }
        Ok(())
    }

    /// Pop the innermost control context, patching its break jumps to
    /// land here.
    fn finish_control(&mut self, _line: u32) -> Result<(), SyntaxError> {
        let ctx = self.fs().ctrl.pop().expect("control context");
        debug_assert!(ctx.continues.is_empty(), "unpatched continue jumps");
        for at in ctx.breaks {
            self.fs().patch_jump(at)?;
        }
        Ok(())
    }

    fn break_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        self.expect(TokenKind::Semicolon, "';' after 'break'")?;
        let Some(ctx_idx) = self.fs().ctrl.len().checked_sub(1) else {
            return Err(self.error("'break' outside a loop or switch"));
        };
        let target_sp = self.fs().ctrl[ctx_idx].sp;
        self.emit_unwind_to(target_sp, line);
        let at = self.fs().emit_jump(OpCode::Jmp, None, line);
        self.fs().ctrl[ctx_idx].breaks.push(at);
        Ok(())
    }

    fn continue_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        self.expect(TokenKind::Semicolon, "';' after 'continue'")?;
        let Some(ctx_idx) = self.fs().ctrl.iter().rposition(|c| c.is_loop) else {
            return Err(self.error("'continue' outside a loop"));
        };
        let target_sp = self.fs().ctrl[ctx_idx].sp;
        self.emit_unwind_to(target_sp, line);
        match self.fs().ctrl[ctx_idx].continue_target {
            Some(target) => self.fs().emit_loop_to(target, line)?,
            None => {
                let at = self.fs().emit_jump(OpCode::Jmp, None, line);
                self.fs().ctrl[ctx_idx].continues.push(at);
            }
        }
        Ok(())
    }

    /// Emit (without changing compile-time state) the pops and closes
    /// that leave the stack at `target_sp`, for a jump out of nested
    /// scopes.
    fn emit_unwind_to(&mut self, target_sp: u32, line: u32) {
        let fs = self.fs();
        let count = fs.sp - target_sp;
        if count == 0 {
            return;
        }
        // jumping over scope ends; close conservatively when anything in
        // this function could need it
        if fs.needs_close {
            fs.emit_op_l(OpCode::Close, target_sp, line);
        }
        if count == 1 {
            fs.emit_op(OpCode::Pop, line);
            fs.adjust_sp(1); // the jump target owns the true sp
        } else {
            fs.emit_op_l(OpCode::PopN, count, line);
        }
    }

    fn return_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.prev.line;
        let first = self.fs().sp;
        let mut count = 0u32;
        let mut multret = false;
        if !self.check(TokenKind::Semicolon) {
            if self.fs().kind == FnKind::Init {
                return Err(self.error("cannot return a value from '__init'"));
            }
            loop {
                let e = self.expression()?;
                count += 1;
                if !self.matches(TokenKind::Comma)? {
                    // `return f(...)` becomes a proper tail call unless
                    // this frame still has slots to close
                    if count == 1 && !self.fs().needs_close {
                        if let ExpKind::Call(nres_at) = e.kind {
                            self.expect(TokenKind::Semicolon, "';' after return")?;
                            let fs = self.fs();
                            fs.chunk.code.truncate(nres_at);
                            fs.chunk.code[nres_at - 4] = OpCode::TailCall.into();
                            fs.sp = first;
                            return Ok(());
                        }
                    }
                    if e.is_multret() {
                        self.set_returns_all(&e);
                        multret = true;
                    } else {
                        self.discharge(e)?;
                    }
                    break;
                }
                self.discharge(e)?;
            }
        }
        self.expect(TokenKind::Semicolon, "';' after return")?;
        let fs = self.fs();
        let close = u8::from(fs.needs_close);
        fs.emit_op(OpCode::Ret, line);
        fs.emit_l(first);
        fs.emit_l(if multret { 0 } else { count + 1 });
        fs.emit_s(close);
        fs.sp = first;
        Ok(())
    }

    /// Expression statement, which is also where assignment lives.
    fn expr_statement(&mut self) -> Result<(), SyntaxError> {
        let line = self.cur.line;
        let e = self.expression()?;
        if self.check(TokenKind::Eq) || self.check(TokenKind::Comma) {
            return self.assignment(e, line);
        }
        self.expect(TokenKind::Semicolon, "';' after expression")?;
        match e.kind {
            ExpKind::Call(at) => {
                // a call statement wants no results at all
                put_u24(&mut self.fs().chunk.code, at, 1);
                self.fs().adjust_sp(-1);
            }
            _ => {
                self.discharge(e)?;
                self.fs().emit_op(OpCode::Pop, line);
            }
        }
        Ok(())
    }

    fn assignment(&mut self, first: Exp, line: u32) -> Result<(), SyntaxError> {
        let mut targets = vec![first];
        while self.matches(TokenKind::Comma)? {
            targets.push(self.expression()?);
        }
        self.expect(TokenKind::Eq, "'=' in assignment")?;
        if targets.len() == 1 {
            let target = targets.pop().unwrap();
            let v = self.expression()?;
            self.discharge(v)?;
            self.emit_store(target)?;
            self.expect(TokenKind::Semicolon, "';' after assignment")?;
            return Ok(());
        }
        // with several targets the pending-operand order cannot be
        // reconstructed, so only name targets are allowed
        for t in &targets {
            if !matches!(
                t.kind,
                ExpKind::Local(..) | ExpKind::Upval(..) | ExpKind::Global(_)
            ) {
                return Err(self.error(
                    "only plain variables can be targets of a multiple assignment",
                ));
            }
        }
        self.exprlist_adjusted(targets.len())?;
        self.expect(TokenKind::Semicolon, "';' after assignment")?;
        for t in targets.into_iter().rev() {
            self.emit_store(t)?;
        }
        Ok(())
    }
}

fn infix_prec_of_binop(op: BinOp) -> Prec {
    match op {
        BinOp::Add | BinOp::Sub => Prec::Term,
        BinOp::Mul | BinOp::Div | BinOp::Mod => Prec::Factor,
        BinOp::Pow => Prec::Power,
        BinOp::Shl | BinOp::Shr => Prec::Shift,
        BinOp::BAnd => Prec::BAnd,
        BinOp::BOr => Prec::BOr,
        BinOp::BXor => Prec::BXor,
        BinOp::Concat => Prec::Concat,
    }
}
