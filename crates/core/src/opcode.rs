//! The Cript instruction set.
//!
//! Every instruction is a 1-byte opcode followed by zero or more operands.
//! Operands come in two widths: short (`S`, 1 byte) and long (`L`, 3 bytes,
//! little-endian). Jump offsets are always long, giving a 24-bit range in
//! each direction; the compiler rejects functions whose branches would not
//! fit.
//!
//! Arithmetic and comparison come in three forms:
//!
//! - plain: both operands on the stack
//! - `K`: right operand in the constant pool (`L` = constant index)
//! - `I`: right operand an immediate integer (`L` = magnitude, `S` = sign,
//!   0 negative / 1 positive)
//!
//! A `K`/`I` form that meets a non-numeric stack operand pushes its constant
//! and falls through to the `MBin` instruction the compiler always emits
//! right after it; when the primitive form succeeds, `MBin` is skipped.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Binary operator selector carried by [`OpCode::MBin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BinOp {
    Add = 0,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Shl,
    Shr,
    BAnd,
    BOr,
    BXor,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    /* literals */
    True = 0,   /*           push true                                   */
    False,      /*           push false                                  */
    Nil,        /*           push nil                                    */
    NilN,       /* L         push L nils                                 */
    Const,      /* S         push K[S]                                   */
    ConstL,     /* L         push K[L]                                   */
    ConstI,     /* L S       push integer L with sign S                  */
    ConstF,     /* L S       push float L with sign S                    */

    /* varargs */
    VarargPrep, /* L         move extra args out of the frame (arity L)  */
    Vararg,     /* L         push L-1 varargs (0 = all)                  */

    /* closures and object creation */
    Closure,    /* L         push closure of nested proto L              */
    NewArray,   /* S         push new array, size hint 1<<(S-1)          */
    NewTable,   /* S         push new table, size hint 1<<(S-1)          */
    NewClass,   /*           push new class                              */
    Method,     /* L         class.methods[K[L]] = top; pop              */
    SetMm,      /* S         class.vmt[S] = top; pop                     */
    Inherit,    /*           copy methods of -2 (super) into top; pop    */
    SetArray,   /* L S       arr[-S-1][L+i] = stack values; pop S        */

    /* stack */
    Pop,        /*           pop one value                               */
    PopN,       /* L         pop L values                                */

    /* arithmetic, both operands on the stack */
    Add,        /*           -2 -1 -> result                             */
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Shl,
    Shr,
    BAnd,
    BOr,
    BXor,
    Concat,

    /* arithmetic, right operand in the constant pool */
    AddK,       /* L         top = top + K[L]                            */
    SubK,
    MulK,
    DivK,
    ModK,
    PowK,
    ShlK,
    ShrK,
    BAndK,
    BOrK,
    BXorK,

    /* arithmetic, right operand an immediate integer */
    AddI,       /* L S       top = top + (S? L : -L)                     */
    SubI,
    MulI,
    DivI,
    ModI,
    PowI,
    ShlI,
    ShrI,
    BAndI,
    BOrI,
    BXorI,

    /* metamethod fallback for a failed K/I form */
    MBin,       /* S         binop S on -2 -1 with metamethod dispatch   */

    /* unary */
    Not,        /*           top = not top                               */
    Unm,        /*           top = -top                                  */
    BNot,       /*           top = ~top                                  */
    Len,        /*           top = #top                                  */

    /* comparison */
    Eq,         /* S         push ((-2 == -1) == S); pop both            */
    Lt,
    Le,
    Gt,
    Ge,
    EqK,        /* L S       top = ((top == K[L]) == S)                  */
    EqI,        /* L S S     top = ((top == imm) == S2)                  */
    LtI,        /* L S       top = top < imm                             */
    LeI,
    GtI,
    GeI,
    EqPreserve, /*           push (-2 == -1); pop right only             */

    /* control flow */
    Jmp,        /* L         pc += L                                     */
    JmpS,       /* L         pc -= L                                     */
    Test,       /* L S       if truthy(top) == S: pc += L                */
    TestOrPop,  /* L S       if truthy(top) == S: pc += L else pop       */
    TestAndPop, /* L S       if truthy(top) == S: pc += L, pop           */
    TestPop,    /* L S       if truthy(top) == S: pc += L; always pop    */

    /* calls and returns */
    Call,       /* L L       call stack[L1], L2-1 results (0 = multret)  */
    TailCall,   /* L         tail call stack[L]                          */
    Ret,        /* L L S     return L2-1 values from L1; S = close frame */

    /* generic for loop */
    ForPrep,    /* L L       prepare loop at base L1; pc += L2           */
    ForCall,    /* L L       call iterator at base L1, L2 results        */
    ForLoop,    /* L L       if control not nil: pc -= L2                */

    /* locals and upvalues */
    GetLocal,   /* L         push frame slot L                           */
    SetLocal,   /* L         frame slot L = pop                          */
    GetUval,    /* L         push upvalue L                              */
    SetUval,    /* L         upvalue L = pop                             */
    Close,      /* L         close upvalues and TBC slots >= L           */
    Tbc,        /* L         mark frame slot L as to-be-closed           */

    /* globals */
    GetGlobal,  /* L         push globals[K[L]]                          */
    SetGlobal,  /* L         globals[K[L]] = pop                         */

    /* indexing */
    GetIndex,    /*          push (-2)[-1]; pop both                     */
    SetIndex,    /*          (-3)[-2] = -1; pop all three                */
    GetIndexStr, /* L        top = top[K[L]]                             */
    SetIndexStr, /* L        (-2)[K[L]] = -1; pop both                   */
    GetIndexInt, /* L        top = top[L]                                */
    SetIndexInt, /* L        (-2)[L] = -1; pop both                      */
    GetProperty, /* L        top = top.K[L] (binds methods)              */
    SetProperty, /* L        (-2).K[L] = -1; pop both                    */
    GetSup,      /* L        push bind(-2, (-1 super).K[L]); pop both    */
    GetSupIdx,   /*          push bind(-3, (-2 super)[-1]); pop all      */
    GetSupIdxStr,/* L        push bind(-2, (-1 super)[K[L]]); pop both   */
}

impl OpCode {
    /// Number of operand bytes following this opcode.
    pub const fn operand_len(self) -> usize {
        use OpCode::*;
        match self {
            True | False | Nil | NewClass | Inherit | Pop | Add | Sub | Mul | Div | Mod | Pow
            | Shl | Shr | BAnd | BOr | BXor | Concat | Not | Unm | BNot | Len | Lt | Le | Gt
            | Ge | EqPreserve | GetIndex | SetIndex | GetSupIdx => 0,
            Const | NewArray | NewTable | SetMm | MBin | Eq => 1,
            NilN | ConstL | VarargPrep | Vararg | Closure | Method | PopN | AddK | SubK | MulK
            | DivK | ModK | PowK | ShlK | ShrK | BAndK | BOrK | BXorK | Jmp | JmpS | TailCall
            | GetLocal | SetLocal | GetUval | SetUval | Close | Tbc | GetGlobal | SetGlobal
            | GetIndexStr | SetIndexStr | GetIndexInt | SetIndexInt | GetProperty
            | SetProperty | GetSup | GetSupIdxStr => 3,
            ConstI | ConstF | SetArray | AddI | SubI | MulI | DivI | ModI | PowI | ShlI | ShrI
            | BAndI | BOrI | BXorI | EqK | LtI | LeI | GtI | GeI | Test | TestOrPop
            | TestAndPop | TestPop => 4,
            EqI => 5,
            Call | ForPrep | ForCall | ForLoop => 6,
            Ret => 7,
        }
    }

    /// Net stack effect of a successful step of this opcode, when it is a
    /// per-opcode constant. `None` marks the opcodes whose effect depends
    /// on an operand or on the callee (pushes of N nils, calls, returns,
    /// varargs, conditional pops).
    pub const fn stack_effect(self) -> Option<i32> {
        use OpCode::*;
        match self {
            True | False | Nil | Const | ConstL | ConstI | ConstF | Closure | NewArray
            | NewTable | NewClass | GetLocal | GetUval | GetGlobal => Some(1),
            AddK | SubK | MulK | DivK | ModK | PowK | ShlK | ShrK | BAndK | BOrK | BXorK
            | AddI | SubI | MulI | DivI | ModI | PowI | ShlI | ShrI | BAndI | BOrI | BXorI
            | Not | Unm | BNot | Len | EqK | EqI | LtI | LeI | GtI | GeI | EqPreserve | Jmp
            | JmpS | Test | Close | Tbc | VarargPrep | GetIndexStr | GetIndexInt
            | GetProperty => Some(0),
            Pop | Method | SetMm | Inherit | Add | Sub | Mul | Div | Mod | Pow | Shl | Shr
            | BAnd | BOr | BXor | Concat | MBin | Eq | Lt | Le | Gt | Ge | TestPop
            | SetLocal | SetUval | SetGlobal | GetIndex | GetSup | GetSupIdxStr => Some(-1),
            SetIndexStr | SetIndexInt | SetProperty | GetSupIdx => Some(-2),
            SetIndex => Some(-3),
            NilN | Vararg | PopN | TestOrPop | TestAndPop | Call | TailCall | Ret | ForPrep
            | ForCall | ForLoop | SetArray => None,
        }
    }

    /// Mnemonic used by the disassembler and by error messages.
    pub const fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            True => "true",
            False => "false",
            Nil => "nil",
            NilN => "niln",
            Const => "const",
            ConstL => "constl",
            ConstI => "consti",
            ConstF => "constf",
            VarargPrep => "varargprep",
            Vararg => "vararg",
            Closure => "closure",
            NewArray => "newarray",
            NewTable => "newtable",
            NewClass => "newclass",
            Method => "method",
            SetMm => "setmm",
            Inherit => "inherit",
            SetArray => "setarray",
            Pop => "pop",
            PopN => "popn",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Pow => "pow",
            Shl => "shl",
            Shr => "shr",
            BAnd => "band",
            BOr => "bor",
            BXor => "bxor",
            Concat => "concat",
            AddK => "addk",
            SubK => "subk",
            MulK => "mulk",
            DivK => "divk",
            ModK => "modk",
            PowK => "powk",
            ShlK => "shlk",
            ShrK => "shrk",
            BAndK => "bandk",
            BOrK => "bork",
            BXorK => "bxork",
            AddI => "addi",
            SubI => "subi",
            MulI => "muli",
            DivI => "divi",
            ModI => "modi",
            PowI => "powi",
            ShlI => "shli",
            ShrI => "shri",
            BAndI => "bandi",
            BOrI => "bori",
            BXorI => "bxori",
            MBin => "mbin",
            Not => "not",
            Unm => "unm",
            BNot => "bnot",
            Len => "len",
            Eq => "eq",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
            EqK => "eqk",
            EqI => "eqi",
            LtI => "lti",
            LeI => "lei",
            GtI => "gti",
            GeI => "gei",
            EqPreserve => "eqpreserve",
            Jmp => "jmp",
            JmpS => "jmps",
            Test => "test",
            TestOrPop => "testorpop",
            TestAndPop => "testandpop",
            TestPop => "testpop",
            Call => "call",
            TailCall => "tailcall",
            Ret => "ret",
            ForPrep => "forprep",
            ForCall => "forcall",
            ForLoop => "forloop",
            GetLocal => "getlocal",
            SetLocal => "setlocal",
            GetUval => "getuval",
            SetUval => "setuval",
            Close => "close",
            Tbc => "tbc",
            GetGlobal => "getglobal",
            SetGlobal => "setglobal",
            GetIndex => "getindex",
            SetIndex => "setindex",
            GetIndexStr => "getindexstr",
            SetIndexStr => "setindexstr",
            GetIndexInt => "getindexint",
            SetIndexInt => "setindexint",
            GetProperty => "getproperty",
            SetProperty => "setproperty",
            GetSup => "getsup",
            GetSupIdx => "getsupidx",
            GetSupIdxStr => "getsupidxstr",
        }
    }

    /// `K`-form counterpart of a binary operator, if it has one.
    pub const fn k_form(op: BinOp) -> Option<OpCode> {
        match op {
            BinOp::Add => Some(OpCode::AddK),
            BinOp::Sub => Some(OpCode::SubK),
            BinOp::Mul => Some(OpCode::MulK),
            BinOp::Div => Some(OpCode::DivK),
            BinOp::Mod => Some(OpCode::ModK),
            BinOp::Pow => Some(OpCode::PowK),
            BinOp::Shl => Some(OpCode::ShlK),
            BinOp::Shr => Some(OpCode::ShrK),
            BinOp::BAnd => Some(OpCode::BAndK),
            BinOp::BOr => Some(OpCode::BOrK),
            BinOp::BXor => Some(OpCode::BXorK),
            BinOp::Concat => None,
        }
    }

    /// `I`-form counterpart of a binary operator, if it has one.
    pub const fn i_form(op: BinOp) -> Option<OpCode> {
        match op {
            BinOp::Add => Some(OpCode::AddI),
            BinOp::Sub => Some(OpCode::SubI),
            BinOp::Mul => Some(OpCode::MulI),
            BinOp::Div => Some(OpCode::DivI),
            BinOp::Mod => Some(OpCode::ModI),
            BinOp::Pow => Some(OpCode::PowI),
            BinOp::Shl => Some(OpCode::ShlI),
            BinOp::Shr => Some(OpCode::ShrI),
            BinOp::BAnd => Some(OpCode::BAndI),
            BinOp::BOr => Some(OpCode::BOrI),
            BinOp::BXor => Some(OpCode::BXorI),
            BinOp::Concat => None,
        }
    }

    /// Plain (both-on-stack) opcode of a binary operator.
    pub const fn bin_form(op: BinOp) -> OpCode {
        match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            BinOp::Shl => OpCode::Shl,
            BinOp::Shr => OpCode::Shr,
            BinOp::BAnd => OpCode::BAnd,
            BinOp::BOr => OpCode::BOr,
            BinOp::BXor => OpCode::BXor,
            BinOp::Concat => OpCode::Concat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_byte() {
        for byte in 0..=u8::MAX {
            if let Ok(op) = OpCode::try_from(byte) {
                assert_eq!(u8::from(op), byte);
            }
        }
        assert!(OpCode::try_from(0u8).is_ok());
        assert!(OpCode::try_from(250u8).is_err());
    }

    #[test]
    fn operand_lengths_are_consistent_with_forms() {
        assert_eq!(OpCode::True.operand_len(), 0);
        assert_eq!(OpCode::Const.operand_len(), 1);
        assert_eq!(OpCode::ConstL.operand_len(), 3);
        assert_eq!(OpCode::ConstI.operand_len(), 4);
        assert_eq!(OpCode::EqI.operand_len(), 5);
        assert_eq!(OpCode::Call.operand_len(), 6);
        assert_eq!(OpCode::Ret.operand_len(), 7);
    }

    #[test]
    fn k_and_i_forms_cover_every_arith_op() {
        for raw in 0..=10u8 {
            let op = BinOp::try_from(raw).unwrap();
            assert!(OpCode::k_form(op).is_some());
            assert!(OpCode::i_form(op).is_some());
        }
        assert!(OpCode::k_form(BinOp::Concat).is_none());
    }
}
