//! Incremental tri-color tracing collector.
//!
//! The cycle runs `Pause -> Propagate -> (atomic) -> SweepObjects ->
//! SweepFinalizers -> CallFinalizers -> Pause`. Steps are budgeted in
//! work units (roughly bytes traversed) proportional to
//! `step_size * step_mul`; the atomic part runs to completion inside a
//! single step. Two whites alternate per cycle: marking paints the
//! current white, sweep frees whatever still wears the previous one.
//!
//! Mutator stores are guarded by two barriers: the forward barrier marks
//! a white child stored into a black parent immediately (cheap parents:
//! upvalues, userdata slots), the backward barrier repaints a black table
//! gray and queues it for the atomic re-scan (tables mutate too often to
//! re-mark eagerly). Strings have no outgoing references and need
//! neither.
//!
//! Finalizable objects (instances and userdata whose class declares
//! `__gc`) found unreachable are resurrected, queued, and finalized one
//! per step under a protected call; they die for real one cycle later.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::heap::Heap;
use crate::meta::Mm;
use crate::object::{GcRef, Mark, ObjData};
use crate::state::State;
use crate::value::Value;

/// Slots visited per sweep step.
const SWEEP_STRIDE: usize = 256;

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Pause,
    Propagate,
    Atomic,
    SweepObjects,
    SweepFinalizers,
    CallFinalizers,
}

#[derive(Debug)]
pub struct GcState {
    pub(crate) phase: GcPhase,
    /// Which of the two white bits newborns receive.
    pub(crate) current_white: bool,
    pub(crate) gray: Vec<GcRef>,
    pub(crate) gray_again: Vec<GcRef>,
    pub(crate) tobefin: VecDeque<GcRef>,
    pub(crate) sweep_cursor: usize,
    /// Collector disabled while positive (`gc stop` nests).
    pub(crate) stop_count: u32,
    /// Reentrancy guard for emergency collections.
    pub(crate) stopem: bool,
    /// Set while a `__gc` finalizer runs, so the safe-point check inside
    /// the finalizer's own frames cannot pop the next one reentrantly.
    pub(crate) in_finalizer: bool,
    /// Live-byte estimate taken at the end of the last cycle.
    pub(crate) estimate: usize,
    /* tunables, kept clamped by [`crate::config::Config`] */
    pub(crate) pause: u32,
    pub(crate) step_mul: u32,
    pub(crate) step_size: u32,
}

impl GcState {
    pub fn new() -> Self {
        GcState {
            phase: GcPhase::Pause,
            current_white: false,
            gray: Vec::new(),
            gray_again: Vec::new(),
            tobefin: VecDeque::new(),
            sweep_cursor: 0,
            stop_count: 0,
            stopem: false,
            in_finalizer: false,
            estimate: 0,
            pause: crate::config::Config::DEFAULT_PAUSE,
            step_mul: crate::config::Config::DEFAULT_STEP_MUL,
            step_size: crate::config::Config::DEFAULT_STEP_SIZE,
        }
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.stop_count == 0
    }

    pub fn stop(&mut self) {
        self.stop_count += 1;
    }

    pub fn restart(&mut self) {
        self.stop_count = self.stop_count.saturating_sub(1);
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Resurrect a dead-white object found by an interner hit during the
    /// sweep phase.
    #[inline]
    pub(crate) fn ensure_alive(&self, mark: &mut Mark) {
        if mark.is_dead(self.current_white) {
            mark.remove(Mark::WHITES);
            mark.insert(Mark::white_for(self.current_white));
        }
    }

    /// Work units per step: `step_size` bytes of debt, scaled by the
    /// `step_mul` percentage.
    fn budget(&self) -> isize {
        self.step_size as isize * self.step_mul as isize / 100
    }
}

impl Default for GcState {
    fn default() -> Self {
        GcState::new()
    }
}

impl Heap {
    /* ---------------- marking ---------------- */

    #[inline]
    pub(crate) fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    /// White -> gray (or straight to black for leaves like strings).
    pub(crate) fn mark_object(&mut self, r: GcRef) {
        let obj = self.get_mut(r);
        if !obj.mark.is_white() {
            return;
        }
        obj.mark.remove(Mark::WHITES);
        match &obj.data {
            // no outgoing references; skip the gray list entirely
            ObjData::Str(_) => obj.mark.insert(Mark::BLACK),
            // open upvalues point into the stack, which is a root itself
            ObjData::Upvalue(u) if u.open_slot().is_some() => obj.mark.insert(Mark::BLACK),
            _ => self.gc.gray.push(r),
        }
    }

    /// Children of one object, gathered so marking can mutate the slab.
    fn children_of(&self, r: GcRef) -> Vec<Value> {
        match &self.get(r).data {
            ObjData::Str(_) => Vec::new(),
            ObjData::Proto(p) => {
                let c = &p.chunk;
                let mut out: Vec<Value> = c.constants.clone();
                out.extend(c.protos.iter().map(|&p| Value::Obj(p)));
                out.extend(c.upvals.iter().map(|u| Value::Obj(u.name)));
                out.extend(c.locals.iter().map(|l| Value::Obj(l.name)));
                out.push(Value::Obj(c.source));
                out
            }
            ObjData::Upvalue(u) => match u {
                crate::object::Upvalue::Closed(v) => vec![*v],
                crate::object::Upvalue::Open(_) => Vec::new(),
            },
            ObjData::Closure(c) => {
                let mut out = vec![Value::Obj(c.proto)];
                out.extend(c.upvals.iter().map(|&u| Value::Obj(u)));
                out
            }
            ObjData::CClosure(c) => c.upvals.clone(),
            ObjData::Class(c) => {
                let mut out = vec![Value::Obj(c.name)];
                for (k, v) in c.methods.entries_for_trace() {
                    out.push(k);
                    out.push(v);
                }
                if let Some(vmt) = &c.vmt {
                    out.extend(vmt.0.iter().copied());
                }
                out
            }
            ObjData::Instance(i) => {
                let mut out = vec![Value::Obj(i.class)];
                for (k, v) in i.fields.entries_for_trace() {
                    out.push(k);
                    out.push(v);
                }
                out
            }
            ObjData::BoundMethod(b) => vec![b.receiver, b.method],
            ObjData::UserData(u) => {
                let mut out = u.user_values.clone();
                if let Some(vmt) = &u.vmt {
                    out.extend(vmt.0.iter().copied());
                }
                out
            }
            ObjData::Table(t) => {
                let mut out = Vec::with_capacity(t.len() * 2);
                for (k, v) in t.entries_for_trace() {
                    out.push(k);
                    out.push(v);
                }
                out
            }
            ObjData::Array(a) => a.iter().collect(),
        }
    }

    /// Pop one gray object, mark its children, paint it black. Returns
    /// the work done.
    fn propagate_one(&mut self) -> usize {
        let Some(r) = self.gc.gray.pop() else { return 0 };
        let children = self.children_of(r);
        for child in &children {
            self.mark_value(*child);
        }
        let obj = self.get_mut(r);
        obj.mark.remove(Mark::WHITES);
        obj.mark.insert(Mark::BLACK);
        obj.data.size_hint()
    }

    pub(crate) fn propagate(&mut self, mut budget: isize) -> isize {
        while budget > 0 && !self.gc.gray.is_empty() {
            budget -= self.propagate_one() as isize;
        }
        budget
    }

    pub(crate) fn propagate_all(&mut self) {
        while !self.gc.gray.is_empty() {
            self.propagate_one();
        }
    }

    /* ---------------- barriers ---------------- */

    /// Forward barrier: mark the white child now. For parents whose
    /// re-traversal is cheap (single-slot objects).
    pub(crate) fn barrier_forward(&mut self, parent: GcRef, child: Value) {
        if !self.get(parent).mark.is_black() {
            return;
        }
        if let Value::Obj(c) = child {
            if self.get(c).mark.is_white() {
                self.mark_object(c);
            }
        }
    }

    /// Backward barrier: repaint the parent gray and revisit it in the
    /// atomic phase. For containers that mutate often.
    pub(crate) fn barrier_back(&mut self, parent: GcRef) {
        let obj = self.get_mut(parent);
        if obj.mark.is_black() {
            obj.mark.remove(Mark::BLACK);
            self.gc.gray_again.push(parent);
        }
    }

    /* ---------------- atomic ---------------- */

    /// Close marking: drain the gray and gray-again lists, separate the
    /// unreachable finalizable objects (resurrecting them), and flip the
    /// current white. Roots have just been re-marked by the caller.
    pub(crate) fn atomic_finish(&mut self) {
        self.gc.phase = GcPhase::Atomic;
        self.propagate_all();
        let again = std::mem::take(&mut self.gc.gray_again);
        for r in again {
            let obj = self.get_mut(r);
            if obj.mark.is_gray() {
                self.gc.gray.push(r);
            }
        }
        self.propagate_all();

        // separate unreachable objects with pending finalizers
        let mut newly = Vec::new();
        for idx in 0..self.slab_len() {
            let Some(obj) = self.get_opt(idx) else { continue };
            if !obj.mark.is_white() || obj.mark.contains(Mark::FINALIZED) {
                continue;
            }
            let r = GcRef::new(idx);
            if self.has_finalizer(r) {
                newly.push(r);
            }
        }
        for r in &newly {
            self.get_mut(*r).mark.insert(Mark::FINALIZED);
            self.gc.tobefin.push_back(*r);
            // resurrect: the finalizer will still see a whole object
            self.mark_object(*r);
        }
        self.propagate_all();

        self.gc.current_white = !self.gc.current_white;
        self.gc.sweep_cursor = 0;
        self.gc.estimate = self.total_bytes();
        self.gc.phase = GcPhase::SweepObjects;
        debug!(
            separated = newly.len(),
            estimate = self.gc.estimate,
            "gc atomic complete"
        );
    }

    fn has_finalizer(&self, r: GcRef) -> bool {
        match &self.get(r).data {
            ObjData::Instance(i) => !self.class_get_mm(i.class, Mm::Gc).is_nil(),
            ObjData::UserData(u) => {
                u.vmt.as_ref().map_or(false, |v| !v.get(Mm::Gc).is_nil())
            }
            _ => false,
        }
    }

    /* ---------------- sweep ---------------- */

    /// Sweep up to [`SWEEP_STRIDE`] slots; true when the pass is done.
    pub(crate) fn sweep_step(&mut self) -> bool {
        let end = (self.gc.sweep_cursor + SWEEP_STRIDE).min(self.slab_len());
        let mut freed = 0usize;
        for idx in self.gc.sweep_cursor..end {
            let Some(obj) = self.get_opt(idx) else { continue };
            let mark = obj.mark;
            if mark.is_dead(self.gc.current_white) && !mark.contains(Mark::FIXED) {
                self.free_object(GcRef::new(idx));
                freed += 1;
            } else {
                // survivor: back to (new) white for the next cycle
                let w = Mark::white_for(self.gc.current_white);
                let obj = self.get_mut(GcRef::new(idx));
                obj.mark.remove(Mark::WHITES | Mark::BLACK);
                obj.mark.insert(w);
            }
        }
        self.gc.sweep_cursor = end;
        if freed > 0 {
            trace!(freed, cursor = end, "gc sweep step");
        }
        self.gc.sweep_cursor >= self.slab_len()
    }

    /// Repaint the finalizer queue for the next cycle (its members were
    /// resurrected black in the atomic phase).
    pub(crate) fn sweep_finalizers(&mut self) {
        let queued: Vec<GcRef> = self.gc.tobefin.iter().copied().collect();
        for r in queued {
            let w = Mark::white_for(self.gc.current_white);
            let obj = self.get_mut(r);
            obj.mark.remove(Mark::WHITES | Mark::BLACK);
            obj.mark.insert(w);
        }
    }

    pub(crate) fn take_finalizable(&mut self) -> Option<GcRef> {
        self.gc.tobefin.pop_front()
    }

    /// End of cycle: back to pause, with enough negative debt that the
    /// next cycle waits for `pause`% of the surviving size.
    pub(crate) fn cycle_done(&mut self) {
        self.gc.phase = GcPhase::Pause;
        let threshold = self.gc.estimate / 100 * self.gc.pause as usize;
        self.mem.set_debt(-(threshold as isize));
        debug!(
            live = self.total_bytes(),
            threshold, "gc cycle complete"
        );
    }
}

impl State {
    /// One collector step, run at VM safe points whenever the debt is
    /// positive. Returns true when a full cycle finished.
    pub fn gc_step(&mut self) -> bool {
        if !self.gs.heap.gc.running() || self.gs.heap.gc.in_finalizer {
            return false;
        }
        match self.gs.heap.gc.phase {
            GcPhase::Pause => {
                if self.gs.heap.mem.debt() <= 0 {
                    return false;
                }
                self.gs.heap.gc.gray.clear();
                self.gs.heap.gc.gray_again.clear();
                self.mark_roots();
                self.gs.heap.gc.phase = GcPhase::Propagate;
                debug!(debt = self.gs.heap.mem.debt(), "gc cycle start");
                false
            }
            GcPhase::Propagate => {
                let budget = self.gs.heap.gc.budget();
                self.gs.heap.propagate(budget);
                let paid = self.gs.heap.gc.step_size as usize;
                self.gs.heap.mem.pay(paid);
                if self.gs.heap.gc.gray.is_empty() {
                    // stop-the-world part of the cycle
                    self.mark_roots();
                    self.gs.heap.atomic_finish();
                }
                false
            }
            GcPhase::Atomic => unreachable!("atomic runs inside a step"),
            GcPhase::SweepObjects => {
                if self.gs.heap.sweep_step() {
                    self.gs.heap.gc.phase = GcPhase::SweepFinalizers;
                }
                self.gs.heap.mem.pay(self.gs.heap.gc.step_size as usize);
                false
            }
            GcPhase::SweepFinalizers => {
                self.gs.heap.sweep_finalizers();
                self.gs.heap.gc.phase = GcPhase::CallFinalizers;
                false
            }
            GcPhase::CallFinalizers => {
                if let Some(r) = self.gs.heap.take_finalizable() {
                    self.run_finalizer(r);
                    false
                } else {
                    self.gs.heap.cycle_done();
                    true
                }
            }
        }
    }

    /// Run the collector to the end of the current (or a whole new)
    /// cycle.
    pub fn gc_full(&mut self, emergency: bool) {
        if emergency {
            if self.gs.heap.gc.stopem {
                return;
            }
            self.gs.heap.gc.stopem = true;
        }
        // finish whatever phase we are in, then run one complete cycle
        let mut fuel = self.gs.heap.slab_len() * 4 + 1024;
        let mut cycles = 0;
        while cycles < 2 && fuel > 0 {
            fuel -= 1;
            if self.gs.heap.gc.phase == GcPhase::Pause {
                // force the cycle to start regardless of debt
                if self.gs.heap.mem.debt() <= 0 {
                    self.gs.heap.mem.set_debt(1);
                }
                cycles += 1;
                if cycles == 2 {
                    break;
                }
            }
            self.gc_step();
        }
        if emergency {
            self.gs.heap.gc.stopem = false;
        }
    }

    /// Invoke `__gc` on a queued object under a protected call; errors go
    /// to the warning hook and never abort collection.
    fn run_finalizer(&mut self, r: GcRef) {
        let mm = match &self.gs.heap.get(r).data {
            ObjData::Instance(i) => self.gs.heap.class_get_mm(i.class, Mm::Gc),
            ObjData::UserData(u) => {
                u.vmt.as_ref().map_or(Value::Nil, |v| v.get(Mm::Gc))
            }
            _ => Value::Nil,
        };
        if mm.is_nil() {
            return;
        }
        self.gs.heap.gc.in_finalizer = true;
        let res = self.call_finalizer(mm, Value::Obj(r));
        self.gs.heap.gc.in_finalizer = false;
        if let Err(e) = res {
            let msg = self.error_to_display(&e);
            self.warn(&format!("error in __gc finalizer: {msg}"));
        }
    }
}
