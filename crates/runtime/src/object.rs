//! Collectable objects and their common header.
//!
//! Every heap object carries a [`GcHeader`]: a kind byte and a mark word
//! holding the tri-color state (two white bits for the current/previous
//! generation, one black bit, gray being the absence of all three), plus
//! the fixed and finalized auxiliary bits. Objects live in the heap slab
//! and are addressed by [`GcRef`] handles; the slab order doubles as the
//! allocation list the sweep phase walks.

use std::rc::Rc;

use bitflags::bitflags;
use cript_core::code::LineInfo;

use crate::array::Array;
use crate::meta::{MM_COUNT, Mm};
use crate::table::Table;
use crate::value::{CFunction, Value};

/// Handle to a collectable object: an index into the heap slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(u32);

impl GcRef {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        GcRef(index as u32)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Mark word. An object is gray when none of the color bits are set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mark: u8 {
        const WHITE0    = 1 << 0;
        const WHITE1    = 1 << 1;
        const BLACK     = 1 << 2;
        /// Never collected (metamethod names, the memory-error message).
        const FIXED     = 1 << 3;
        /// Already separated for finalization; do not queue again.
        const FINALIZED = 1 << 4;
    }
}

impl Mark {
    pub const WHITES: Mark = Mark::WHITE0.union(Mark::WHITE1);

    #[inline]
    pub fn white_for(generation: bool) -> Mark {
        if generation { Mark::WHITE1 } else { Mark::WHITE0 }
    }

    #[inline]
    pub fn is_white(self) -> bool {
        self.intersects(Mark::WHITES)
    }

    #[inline]
    pub fn is_black(self) -> bool {
        self.contains(Mark::BLACK)
    }

    #[inline]
    pub fn is_gray(self) -> bool {
        !self.intersects(Mark::WHITES | Mark::BLACK)
    }

    /// Dead means "still carries the previous generation's white" during
    /// sweep.
    #[inline]
    pub fn is_dead(self, current_generation: bool) -> bool {
        self.contains(Mark::white_for(!current_generation))
    }
}

/// Object kind byte; subvariants of the value tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Str,
    Proto,
    Upvalue,
    Closure,
    CClosure,
    Class,
    Instance,
    BoundMethod,
    UserData,
    Table,
    Array,
}

impl ObjKind {
    pub const fn type_name(self) -> &'static str {
        match self {
            ObjKind::Str => "string",
            ObjKind::Proto => "function",
            ObjKind::Upvalue => "upvalue",
            ObjKind::Closure | ObjKind::CClosure | ObjKind::BoundMethod => "function",
            ObjKind::Class => "class",
            ObjKind::Instance => "instance",
            ObjKind::UserData => "userdata",
            ObjKind::Table => "table",
            ObjKind::Array => "array",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StrBits: u8 {
        /// String is in the interner set.
        const INTERNED = 1 << 0;
        /// Cached hash is valid.
        const HAS_HASH = 1 << 1;
        /// Reserved keyword; the lexer tags these once at state creation.
        const KEYWORD  = 1 << 2;
        /// One of the fixed metamethod names; `extra` holds the Mm slot.
        const MM_NAME  = 1 << 3;
    }
}

/// Immutable byte string with a cached, seed-salted hash.
#[derive(Debug)]
pub struct Str {
    pub bytes: Box<[u8]>,
    pub hash: u32,
    pub bits: StrBits,
    /// Keyword ordinal or metamethod slot, depending on `bits`.
    pub extra: u8,
}

impl Str {
    #[inline]
    pub fn as_str(&self) -> &str {
        // strings enter the heap from &str sources or validated escapes
        std::str::from_utf8(&self.bytes).unwrap_or("\u{fffd}")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What kind of variable a local was declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    #[default]
    Regular,
    /// `const`/`fixed` declaration; assignment is a compile error.
    Const,
    /// `<close>` attribute; slot runs `__close` when it leaves scope.
    Close,
    /// `static` declaration; const-kind with chunk lifetime.
    Static,
}

/// Upvalue descriptor in a prototype: where the capture comes from in the
/// enclosing function.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    pub name: GcRef,
    /// Index of the source: a local slot or an upvalue index of the
    /// enclosing function, per `in_stack`.
    pub index: u32,
    pub in_stack: bool,
    pub kind: VarKind,
}

/// Debug record for a local variable's live range.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: GcRef,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// Compiled function body. Immutable once the compiler finishes it; the
/// prototype object wraps it in an `Rc` so the VM can hold the running
/// chunk without borrowing the heap.
#[derive(Debug)]
pub struct Chunk {
    pub arity: u32,
    pub is_vararg: bool,
    pub max_stack: u32,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub lines: LineInfo,
    pub upvals: Vec<UpvalDesc>,
    pub locals: Vec<LocalVar>,
    /// Nested function prototypes, indexed by the `Closure` operand.
    pub protos: Vec<GcRef>,
    pub source: GcRef,
    pub defline: u32,
    pub deflastline: u32,
}

/// Function prototype object.
#[derive(Debug)]
pub struct Proto {
    pub chunk: Rc<Chunk>,
}

/// An upvalue is open while its variable still lives on the stack (the
/// payload is the absolute stack slot) and closed afterwards (the payload
/// is the value itself).
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    #[inline]
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(s) => Some(*s),
            Upvalue::Closed(_) => None,
        }
    }
}

/// Script closure: prototype plus shared upvalue references.
#[derive(Debug)]
pub struct Closure {
    pub proto: GcRef,
    pub upvals: Vec<GcRef>,
}

/// Native closure: function pointer plus owned upvalues.
pub struct CClosure {
    pub f: CFunction,
    pub upvals: Vec<Value>,
}

impl std::fmt::Debug for CClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CClosure")
            .field("f", &(self.f as usize as *const ()))
            .field("upvals", &self.upvals)
            .finish()
    }
}

/// Fixed-slot virtual-method table.
#[derive(Debug)]
pub struct Vmt(pub [Value; MM_COUNT]);

impl Default for Vmt {
    fn default() -> Self {
        Vmt([Value::Nil; MM_COUNT])
    }
}

impl Vmt {
    #[inline]
    pub fn get(&self, mm: Mm) -> Value {
        self.0[mm as usize]
    }

    #[inline]
    pub fn set(&mut self, mm: Mm, v: Value) {
        self.0[mm as usize] = v;
    }
}

#[derive(Debug)]
pub struct Class {
    pub name: GcRef,
    pub methods: Table,
    pub vmt: Option<Box<Vmt>>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: GcRef,
    pub fields: Table,
}

/// Method bound to its receiver by a property access.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

/// Raw byte block owned by the embedder, with optional metamethods and
/// embedded user values.
#[derive(Debug)]
pub struct UserData {
    pub data: Box<[u8]>,
    pub vmt: Option<Box<Vmt>>,
    pub user_values: Vec<Value>,
}

/// Payload of a heap slot.
#[derive(Debug)]
pub enum ObjData {
    Str(Str),
    Proto(Proto),
    Upvalue(Upvalue),
    Closure(Closure),
    CClosure(CClosure),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    UserData(UserData),
    Table(Table),
    Array(Array),
}

impl ObjData {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjData::Str(_) => ObjKind::Str,
            ObjData::Proto(_) => ObjKind::Proto,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::CClosure(_) => ObjKind::CClosure,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
            ObjData::UserData(_) => ObjKind::UserData,
            ObjData::Table(_) => ObjKind::Table,
            ObjData::Array(_) => ObjKind::Array,
        }
    }

    /// Estimated footprint for allocation accounting.
    pub fn size_hint(&self) -> usize {
        let base = std::mem::size_of::<ObjData>();
        base + match self {
            ObjData::Str(s) => s.bytes.len(),
            ObjData::Proto(p) => {
                p.chunk.code.len()
                    + p.chunk.constants.len() * std::mem::size_of::<Value>()
                    + p.chunk.lines.entries().len() * 8
            }
            ObjData::Upvalue(_) => 0,
            ObjData::Closure(c) => c.upvals.len() * std::mem::size_of::<GcRef>(),
            ObjData::CClosure(c) => c.upvals.len() * std::mem::size_of::<Value>(),
            ObjData::Class(c) => {
                c.methods.byte_size() + c.vmt.as_ref().map_or(0, |_| std::mem::size_of::<Vmt>())
            }
            ObjData::Instance(i) => i.fields.byte_size(),
            ObjData::BoundMethod(_) => 0,
            ObjData::UserData(u) => {
                u.data.len()
                    + u.user_values.len() * std::mem::size_of::<Value>()
                    + u.vmt.as_ref().map_or(0, |_| std::mem::size_of::<Vmt>())
            }
            ObjData::Table(t) => t.byte_size(),
            ObjData::Array(a) => a.byte_size(),
        }
    }
}

/// Header plus payload: one heap slot.
#[derive(Debug)]
pub struct GcObject {
    pub mark: Mark,
    pub data: ObjData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_color_transitions() {
        let mut m = Mark::white_for(false);
        assert!(m.is_white());
        assert!(!m.is_dead(false));
        assert!(m.is_dead(true));
        m.remove(Mark::WHITES);
        assert!(m.is_gray());
        m.insert(Mark::BLACK);
        assert!(m.is_black() && !m.is_gray() && !m.is_white());
    }

    #[test]
    fn value_cell_stays_small() {
        assert!(std::mem::size_of::<Value>() <= 16);
    }
}
