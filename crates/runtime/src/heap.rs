//! The object heap.
//!
//! Objects live in a slab of slots addressed by [`GcRef`]. The slab order
//! stands in for the original allocation list: the sweep phase walks slot
//! indices with a cursor, and freed slots go on a free list for reuse.
//! Every allocation and free updates the byte accounting that drives the
//! collector's debt.
//!
//! A newborn object is white and reachable only through the value that
//! received it; collection steps run at VM safe points, where everything
//! live is anchored on the stack, in a frame, or in `temp_roots` (the
//! anchor used by code that must allocate several objects before the
//! group becomes reachable from the stack; the compiler in particular).

use cript_core::hash::hash_bytes;
use cript_core::mem::MemStats;

use crate::array::Array;
use crate::gc::GcState;
use crate::meta::Mm;
use crate::object::{
    BoundMethod, CClosure, Chunk, Class, Closure, GcObject, GcRef, Instance, Mark, ObjData,
    ObjKind, Proto, Str, StrBits, Upvalue, UserData, Vmt,
};
use crate::string::Interner;
use crate::table::Table;
use crate::value::{CFunction, Value};

pub struct Heap {
    slab: Vec<Option<GcObject>>,
    free: Vec<u32>,
    pub(crate) interner: Interner,
    pub(crate) mem: MemStats,
    pub(crate) seed: u32,
    pub(crate) gc: GcState,
    pub(crate) temp_roots: Vec<Value>,
}

impl Heap {
    pub fn new(seed: u32) -> Self {
        Heap {
            slab: Vec::new(),
            free: Vec::new(),
            interner: Interner::new(),
            mem: MemStats::new(),
            seed,
            gc: GcState::new(),
            temp_roots: Vec::new(),
        }
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slab.len() - self.free.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.mem.total()
    }

    pub fn gc_phase(&self) -> crate::gc::GcPhase {
        self.gc.phase()
    }

    pub(crate) fn slab_len(&self) -> usize {
        self.slab.len()
    }

    /* ---------------- temp-root anchoring ---------------- */

    /// Current anchor watermark; pass it to [`Heap::temp_release`].
    pub fn temp_mark(&self) -> usize {
        self.temp_roots.len()
    }

    /// Anchor a value so a collection step cannot free it before it
    /// becomes reachable from the stack.
    pub fn temp_push(&mut self, v: Value) {
        self.temp_roots.push(v);
    }

    pub fn temp_release(&mut self, mark: usize) {
        self.temp_roots.truncate(mark);
    }

    /* ---------------- allocation ---------------- */

    pub(crate) fn alloc(&mut self, data: ObjData) -> GcRef {
        let size = data.size_hint();
        self.mem.on_alloc(size);
        let obj = GcObject { mark: Mark::white_for(self.gc.current_white), data };
        let r = match self.free.pop() {
            Some(idx) => {
                self.slab[idx as usize] = Some(obj);
                GcRef::new(idx as usize)
            }
            None => {
                self.slab.push(Some(obj));
                GcRef::new(self.slab.len() - 1)
            }
        };
        r
    }

    /// Free one slot; the collector calls this during sweep. Interned
    /// strings are unlinked from the weak set on the way out.
    pub(crate) fn free_object(&mut self, r: GcRef) {
        let slot = self.slab[r.index() as usize].take().expect("double free");
        if let ObjData::Str(s) = &slot.data {
            if s.bits.contains(StrBits::INTERNED) {
                self.interner.remove(s.hash, r);
            }
        }
        self.mem.on_free(slot.data.size_hint());
        self.free.push(r.index());
    }

    /* ---------------- typed access ---------------- */

    #[inline]
    pub(crate) fn get(&self, r: GcRef) -> &GcObject {
        self.slab[r.index() as usize].as_ref().expect("dangling object handle")
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, r: GcRef) -> &mut GcObject {
        self.slab[r.index() as usize].as_mut().expect("dangling object handle")
    }

    #[inline]
    pub(crate) fn get_opt(&self, idx: usize) -> Option<&GcObject> {
        self.slab.get(idx).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn kind(&self, r: GcRef) -> ObjKind {
        self.get(r).data.kind()
    }

    pub fn try_str(&self, r: GcRef) -> Option<&Str> {
        match &self.get(r).data {
            ObjData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn str_(&self, r: GcRef) -> &Str {
        self.try_str(r).expect("expected string object")
    }

    pub fn table(&self, r: GcRef) -> &Table {
        match &self.get(r).data {
            ObjData::Table(t) => t,
            _ => panic!("expected table object"),
        }
    }

    pub fn table_mut(&mut self, r: GcRef) -> &mut Table {
        match &mut self.get_mut(r).data {
            ObjData::Table(t) => t,
            _ => panic!("expected table object"),
        }
    }

    pub fn array(&self, r: GcRef) -> &Array {
        match &self.get(r).data {
            ObjData::Array(a) => a,
            _ => panic!("expected array object"),
        }
    }

    pub fn array_mut(&mut self, r: GcRef) -> &mut Array {
        match &mut self.get_mut(r).data {
            ObjData::Array(a) => a,
            _ => panic!("expected array object"),
        }
    }

    pub fn class(&self, r: GcRef) -> &Class {
        match &self.get(r).data {
            ObjData::Class(c) => c,
            _ => panic!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: GcRef) -> &mut Class {
        match &mut self.get_mut(r).data {
            ObjData::Class(c) => c,
            _ => panic!("expected class object"),
        }
    }

    pub fn instance(&self, r: GcRef) -> &Instance {
        match &self.get(r).data {
            ObjData::Instance(i) => i,
            _ => panic!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: GcRef) -> &mut Instance {
        match &mut self.get_mut(r).data {
            ObjData::Instance(i) => i,
            _ => panic!("expected instance object"),
        }
    }

    pub fn closure(&self, r: GcRef) -> &Closure {
        match &self.get(r).data {
            ObjData::Closure(c) => c,
            _ => panic!("expected closure object"),
        }
    }

    pub fn cclosure(&self, r: GcRef) -> &CClosure {
        match &self.get(r).data {
            ObjData::CClosure(c) => c,
            _ => panic!("expected native closure object"),
        }
    }

    pub fn proto(&self, r: GcRef) -> &Proto {
        match &self.get(r).data {
            ObjData::Proto(p) => p,
            _ => panic!("expected prototype object"),
        }
    }

    pub fn upvalue(&self, r: GcRef) -> &Upvalue {
        match &self.get(r).data {
            ObjData::Upvalue(u) => u,
            _ => panic!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: GcRef) -> &mut Upvalue {
        match &mut self.get_mut(r).data {
            ObjData::Upvalue(u) => u,
            _ => panic!("expected upvalue object"),
        }
    }

    pub fn bound_method(&self, r: GcRef) -> &BoundMethod {
        match &self.get(r).data {
            ObjData::BoundMethod(b) => b,
            _ => panic!("expected bound method object"),
        }
    }

    pub fn userdata(&self, r: GcRef) -> &UserData {
        match &self.get(r).data {
            ObjData::UserData(u) => u,
            _ => panic!("expected userdata object"),
        }
    }

    pub fn userdata_mut(&mut self, r: GcRef) -> &mut UserData {
        match &mut self.get_mut(r).data {
            ObjData::UserData(u) => u,
            _ => panic!("expected userdata object"),
        }
    }

    /* ---------------- constructors ---------------- */

    /// Intern a byte string: return the canonical handle, allocating on a
    /// miss. Every string in the system goes through here, which is why
    /// string equality is handle identity.
    pub fn intern(&mut self, bytes: &[u8]) -> GcRef {
        let hash = hash_bytes(bytes, self.seed);
        let mut found = None;
        for cand in self.interner.candidates(hash) {
            if let Some(s) = self.try_str(cand) {
                if &*s.bytes == bytes {
                    found = Some(cand);
                    break;
                }
            }
        }
        if let Some(r) = found {
            // keep an interner hit out of the next sweep's reach
            self.gc.ensure_alive(&mut self.slab[r.index() as usize].as_mut().unwrap().mark);
            return r;
        }
        let s = Str {
            bytes: bytes.to_vec().into_boxed_slice(),
            hash,
            bits: StrBits::INTERNED | StrBits::HAS_HASH,
            extra: 0,
        };
        let r = self.alloc(ObjData::Str(s));
        self.interner.insert(hash, r);
        r
    }

    pub fn intern_str(&mut self, s: &str) -> GcRef {
        self.intern(s.as_bytes())
    }

    /// Intern and pin: the object survives every collection. Used for
    /// metamethod names and the shared memory-error message.
    pub fn intern_fixed(&mut self, s: &str) -> GcRef {
        let r = self.intern(s.as_bytes());
        self.get_mut(r).mark.insert(Mark::FIXED);
        r
    }

    pub fn new_table(&mut self, hint: usize) -> GcRef {
        self.alloc(ObjData::Table(Table::with_capacity(hint)))
    }

    pub fn new_array(&mut self, hint: usize) -> GcRef {
        self.alloc(ObjData::Array(Array::with_capacity(hint)))
    }

    pub fn new_class(&mut self, name: GcRef) -> GcRef {
        self.alloc(ObjData::Class(Class { name, methods: Table::new(), vmt: None }))
    }

    pub fn new_instance(&mut self, class: GcRef) -> GcRef {
        self.alloc(ObjData::Instance(Instance { class, fields: Table::new() }))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: Value) -> GcRef {
        self.alloc(ObjData::BoundMethod(BoundMethod { receiver, method }))
    }

    pub fn new_proto(&mut self, chunk: Chunk) -> GcRef {
        self.alloc(ObjData::Proto(Proto { chunk: std::rc::Rc::new(chunk) }))
    }

    pub fn new_closure(&mut self, proto: GcRef, upvals: Vec<GcRef>) -> GcRef {
        self.alloc(ObjData::Closure(Closure { proto, upvals }))
    }

    pub fn new_cclosure(&mut self, f: CFunction, upvals: Vec<Value>) -> GcRef {
        self.alloc(ObjData::CClosure(CClosure { f, upvals }))
    }

    pub fn new_upvalue_open(&mut self, slot: usize) -> GcRef {
        self.alloc(ObjData::Upvalue(Upvalue::Open(slot)))
    }

    pub fn new_userdata(&mut self, size: usize, nuvalues: usize) -> GcRef {
        self.alloc(ObjData::UserData(UserData {
            data: vec![0u8; size].into_boxed_slice(),
            vmt: None,
            user_values: vec![Value::Nil; nuvalues],
        }))
    }

    /* ---------------- barriered mutation ---------------- */

    /// Store into a table with the backward barrier: a black table that
    /// gains any reference is repainted gray and revisited in the atomic
    /// phase.
    pub fn table_set(&mut self, tref: GcRef, key: Value, val: Value) -> bool {
        let khash = key.hash(self);
        let is_new = self.table_mut(tref).set(key, khash, val);
        self.barrier_back(tref);
        is_new
    }

    pub fn table_get(&self, tref: GcRef, key: Value) -> Value {
        let khash = key.hash(self);
        self.table(tref).get(key, khash).unwrap_or(Value::Nil)
    }

    pub fn table_remove(&mut self, tref: GcRef, key: Value) -> Option<Value> {
        let khash = key.hash(self);
        self.table_mut(tref).remove(key, khash)
    }

    pub fn instance_set_field(&mut self, iref: GcRef, key: Value, val: Value) {
        let khash = key.hash(self);
        self.instance_mut(iref).fields.set(key, khash, val);
        self.barrier_back(iref);
    }

    pub fn instance_get_field(&self, iref: GcRef, key: Value) -> Option<Value> {
        let khash = key.hash(self);
        self.instance(iref).fields.get(key, khash)
    }

    pub fn class_add_method(&mut self, cref: GcRef, name: GcRef, method: Value) {
        let key = Value::Obj(name);
        let khash = key.hash(self);
        self.class_mut(cref).methods.set(key, khash, method);
        self.barrier_back(cref);
    }

    pub fn class_set_mm(&mut self, cref: GcRef, mm: Mm, method: Value) {
        let c = self.class_mut(cref);
        c.vmt.get_or_insert_with(|| Box::new(Vmt::default())).set(mm, method);
        self.barrier_back(cref);
    }

    pub fn class_get_mm(&self, cref: GcRef, mm: Mm) -> Value {
        self.class(cref).vmt.as_ref().map_or(Value::Nil, |v| v.get(mm))
    }

    pub fn array_set(&mut self, aref: GcRef, index: i64, val: Value) -> Result<(), crate::array::ArrayIndexError> {
        let res = self.array_mut(aref).set(index, val);
        if res.is_ok() {
            self.barrier_back(aref);
        }
        res
    }

    pub fn array_push(&mut self, aref: GcRef, val: Value) {
        let a = self.array_mut(aref);
        let old_cap = a.byte_size();
        a.push(val);
        let new_cap = self.array(aref).byte_size();
        self.mem.on_resize(old_cap, new_cap);
        self.barrier_back(aref);
    }

    /// Write through an upvalue (open writes hit the stack, handled by
    /// the thread; this is the closed case) with the forward barrier.
    pub fn upvalue_store(&mut self, uref: GcRef, val: Value) {
        if let Upvalue::Closed(slot) = self.upvalue_mut(uref) {
            *slot = val;
        } else {
            panic!("upvalue_store on open upvalue");
        }
        self.barrier_forward(uref, val);
    }

    pub fn userdata_set_uv(&mut self, uref: GcRef, i: usize, val: Value) {
        self.userdata_mut(uref).user_values[i] = val;
        self.barrier_forward(uref, val);
    }

    /* ---------------- string helpers ---------------- */

    pub fn str_bytes(&self, r: GcRef) -> &[u8] {
        &self.str_(r).bytes
    }

    pub fn str_text(&self, r: GcRef) -> &str {
        // interned strings come from source text or escape-validated
        // literals; lossy is for embedder-provided raw bytes
        std::str::from_utf8(&self.str_(r).bytes).unwrap_or("?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_bytes_allocates_once() {
        let mut heap = Heap::new(0x5EED);
        let a = heap.intern(b"hello");
        let live = heap.live_objects();
        let b = heap.intern(b"hello");
        assert_eq!(a, b);
        assert_eq!(heap.live_objects(), live);
        let c = heap.intern(b"hellO");
        assert_ne!(a, c);
    }

    #[test]
    fn accounting_tracks_alloc_and_free() {
        let mut heap = Heap::new(1);
        let before = heap.total_bytes();
        let t = heap.new_table(0);
        assert!(heap.total_bytes() > before);
        heap.free_object(t);
        assert_eq!(heap.total_bytes(), before);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new(1);
        let t = heap.new_table(0);
        let idx = t.index();
        heap.free_object(t);
        let a = heap.new_array(0);
        assert_eq!(a.index(), idx);
    }
}
