//! Runtime-level tests that drive the VM and collector through the host
//! API, including hand-assembled chunks for opcode behavior that no
//! surface syntax reaches directly.

use cript_core::code::LineInfo;
use cript_core::opcode::OpCode;
use cript_runtime::{Chunk, GcPhase, MULTRET, State, Value};

/// Hand-assemble a zero-arg chunk and call it, keeping all results.
fn run_chunk(st: &mut State, code: Vec<u8>, constants: Vec<Value>, max_stack: u32) {
    let source = st.heap_mut().intern_str("asm");
    let mut lines = LineInfo::new();
    let mut pc = 0u32;
    while (pc as usize) < code.len() {
        lines.record(pc, 1);
        let op = OpCode::try_from(code[pc as usize]).expect("valid opcode");
        pc += 1 + op.operand_len() as u32;
    }
    let chunk = Chunk {
        arity: 0,
        is_vararg: false,
        max_stack,
        code,
        constants,
        lines,
        upvals: Vec::new(),
        locals: Vec::new(),
        protos: Vec::new(),
        source,
        defline: 1,
        deflastline: 1,
    };
    let proto = st.heap_mut().new_proto(chunk);
    let cl = st.heap_mut().new_closure(proto, Vec::new());
    st.push_value(Value::Obj(cl)).unwrap();
    st.call(0, MULTRET).unwrap();
}

fn op(o: OpCode) -> u8 {
    o.into()
}

fn l24(v: u32) -> [u8; 3] {
    [v as u8, (v >> 8) as u8, (v >> 16) as u8]
}

#[test]
fn test_hand_assembled_arithmetic() {
    // true-path of the Test family and the plain binary ops
    let mut st = State::new();
    let mut code = Vec::new();
    // 2 3 add -> 5; return it
    code.push(op(OpCode::ConstI));
    code.extend(l24(2));
    code.push(1);
    code.push(op(OpCode::ConstI));
    code.extend(l24(3));
    code.push(1);
    code.push(op(OpCode::Add));
    code.push(op(OpCode::Ret));
    code.extend(l24(1)); // first result at frame slot 1
    code.extend(l24(2)); // one result
    code.push(0);
    run_chunk(&mut st, code, Vec::new(), 4);
    assert_eq!(st.to_int(-1), Some(5));
}

#[test]
fn test_test_opcodes_jump_and_pop_as_documented() {
    // Test keeps its operand; TestPop always pops. Program:
    //   push true; Test(+off, S=1) over a Nil push; push 7; ret 2 values
    let mut st = State::new();
    let mut code = Vec::new();
    code.push(op(OpCode::True));
    code.push(op(OpCode::Test));
    code.extend(l24(4)); // skip the NilN below (1 + 3 operand bytes)
    code.push(1);
    code.push(op(OpCode::NilN));
    code.extend(l24(9));
    code.push(op(OpCode::ConstI));
    code.extend(l24(7));
    code.push(1);
    code.push(op(OpCode::Ret));
    code.extend(l24(1));
    code.extend(l24(3)); // two results: the kept true and the 7
    code.push(0);
    run_chunk(&mut st, code, Vec::new(), 16);
    assert_eq!(st.get_top(), 2);
    assert!(st.to_bool(0));
    assert_eq!(st.to_int(1), Some(7));
}

#[test]
fn test_stack_effects_match_documented_deltas() {
    // spot-check the static stack-effect table against real execution
    // by returning the whole frame contents
    assert_eq!(OpCode::True.stack_effect(), Some(1));
    assert_eq!(OpCode::Add.stack_effect(), Some(-1));
    assert_eq!(OpCode::SetIndex.stack_effect(), Some(-3));
    assert_eq!(OpCode::GetProperty.stack_effect(), Some(0));
    assert_eq!(OpCode::Call.stack_effect(), None);
}

#[test]
fn test_collector_frees_unreachable_objects() {
    let mut st = State::new();
    st.gc_collect();
    let baseline = st.heap().live_objects();
    for i in 0..500 {
        st.create_table(4).unwrap();
        st.push_int(i).unwrap();
        st.set_field(-2, "x").unwrap();
        st.pop_values(1);
    }
    st.gc_collect();
    let after = st.heap().live_objects();
    assert!(
        after <= baseline + 8,
        "garbage survived: {baseline} -> {after}"
    );
}

#[test]
fn test_collector_preserves_reachable_objects() {
    let mut st = State::new();
    st.create_table(0).unwrap();
    st.push_string("payload").unwrap();
    st.set_field(-2, "k").unwrap();
    st.gc_collect();
    st.gc_collect();
    st.get_field(-1, "k").unwrap();
    assert_eq!(st.to_str(-1), Some("payload"));
}

#[test]
fn test_completed_cycle_is_idempotent_on_total_bytes() {
    let mut st = State::new();
    st.create_table(8).unwrap();
    st.gc_collect();
    let total = st.gc_count();
    st.gc_collect();
    assert_eq!(st.gc_count(), total);
}

#[test]
fn test_interner_is_weak() {
    let mut st = State::new();
    st.gc_collect();
    let live = st.heap().live_objects();
    // intern a string nothing references
    st.heap_mut().intern_str("definitely-unreferenced-string");
    assert_eq!(st.heap().live_objects(), live + 1);
    st.gc_collect();
    assert_eq!(st.heap().live_objects(), live, "weak interner entry survived");
    // and interning it again re-creates rather than resurrects
    st.heap_mut().intern_str("definitely-unreferenced-string");
    assert_eq!(st.heap().live_objects(), live + 1);
}

#[test]
fn test_gc_stop_restart_nest() {
    let mut st = State::new();
    st.gc_stop();
    st.gc_stop();
    st.gc_restart();
    // still stopped: one stop outstanding
    assert!(!st.gc_step());
    st.gc_restart();
    assert_eq!(st.heap().gc_phase(), GcPhase::Pause);
}

#[test]
fn test_registry_slots_are_reserved() {
    let mut st = State::new();
    st.registry_get(cript_runtime::RIDX_GLOBALS).unwrap();
    assert_eq!(st.type_of(-1), cript_runtime::TypeTag::Table);
    st.pop_values(1);
    st.registry_get(cript_runtime::RIDX_MAINTHREAD).unwrap();
    // reserved, not populated in a single-thread build
    assert_eq!(st.type_of(-1), cript_runtime::TypeTag::Nil);
}

#[test]
fn test_userdata_carries_bytes_and_user_values() {
    let mut st = State::new();
    st.new_userdata_api(16, 2).unwrap();
    st.userdata_bytes_mut(-1).unwrap()[0] = 0xAB;
    st.push_int(5).unwrap();
    st.set_user_value(-2, 1).unwrap();
    st.get_user_value(-1, 1).unwrap();
    assert_eq!(st.to_int(-1), Some(5));
    st.pop_values(1);
    assert_eq!(st.userdata_bytes_mut(-1).unwrap()[0], 0xAB);
    st.push_int(1).unwrap();
    assert!(st.set_user_value(-2, 9).is_err(), "out-of-range user value accepted");
}

#[test]
fn test_warning_hook_receives_messages() {
    use std::cell::RefCell;
    use std::rc::Rc;
    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&seen);
    let mut st = State::new();
    st.set_warn_hook(Some(Box::new(move |msg| {
        sink.borrow_mut().push(msg.to_string());
    })));
    st.warn("something odd");
    assert_eq!(seen.borrow().as_slice(), ["something odd"]);
}
