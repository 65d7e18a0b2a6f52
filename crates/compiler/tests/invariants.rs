//! Boundary behavior and invariant tests: numeric edges, unwind order,
//! stack limits, collector behavior observed through scripts.

mod common;

use common::{output, run, run_expect_error, state_with_helpers, state_with_helpers_cfg};
use cript_runtime::Config;

#[test]
fn integer_arithmetic_wraps_at_64_bits() {
    assert_eq!(
        run("print(9223372036854775807 + 1);"),
        "-9223372036854775808\n"
    );
    assert_eq!(
        run("local n = 9223372036854775807; print(n + 1);"),
        "-9223372036854775808\n"
    );
}

#[test]
fn modulo_follows_divisor_sign() {
    assert_eq!(run("print(5 % 3, -5 % 3, 5 % -3, -5 % -3);"), "2\t1\t-1\t-2\n");
}

#[test]
fn division_always_floats_and_power_too() {
    assert_eq!(run("print(7 / 2, 8 / 2, 2 ** 3);"), "3.5\t4.0\t8.0\n");
}

#[test]
fn integer_modulo_by_zero_errors() {
    let msg = run_expect_error("local a = 5; local b = 0; print(a % b);");
    assert!(msg.contains("% 0"), "got: {msg}");
}

#[test]
fn bitwise_needs_integer_representation() {
    assert_eq!(run("print(6.0 & 3);"), "2\n");
    let msg = run_expect_error("print(6.5 & 3);");
    assert!(msg.contains("integer representation"), "got: {msg}");
}

#[test]
fn interned_strings_compare_by_identity() {
    // the concatenation result must be the same object as the literal
    assert_eq!(run("print(\"a\" .. \"b\" == \"ab\");"), "true\n");
}

#[test]
fn deep_recursion_hits_stack_overflow_cleanly() {
    let cfg = Config { max_stack: 2048, ..Config::default() };
    let mut st = state_with_helpers_cfg(cfg);
    let src = "fn rec(n) { return rec(n + 1) + 0; }\n\
               ok, e = pcall(rec, 1);\n\
               print(ok, e);";
    criptc::do_str(&mut st, src, "deep").unwrap();
    let out = output(&mut st);
    assert!(out.starts_with("false\t"), "got: {out}");
    assert!(out.contains("stack overflow"), "got: {out}");
}

#[test]
fn tail_calls_reuse_the_frame() {
    // 200k iterations in a 2k-slot stack only works if the frame is
    // reused
    let cfg = Config { max_stack: 2048, ..Config::default() };
    let mut st = state_with_helpers_cfg(cfg);
    let src = "fn spin(n) {\n\
                  if (n == 0) return \"done\";\n\
                  return spin(n - 1);\n\
               }\n\
               print(spin(200000));";
    criptc::do_str(&mut st, src, "spin").unwrap();
    assert_eq!(output(&mut st), "done\n");
}

#[test]
fn runaway_metamethod_recursion_raises_c_stack_overflow() {
    let src = "class L {\n\
                  __add(a, b) { return a + b; }\n\
               }\n\
               ok, e = pcall(fn() { return L() + L(); });\n\
               print(ok, e);";
    let out = run(src);
    assert!(out.starts_with("false\t"), "got: {out}");
    assert!(out.contains("C stack overflow"), "got: {out}");
}

#[test]
fn close_order_is_reverse_of_registration() {
    let out = run(
        "class R {\n\
            __init(n) { self.n = n; }\n\
            __close(err) { print(self.n); }\n\
         }\n\
         fn g() {\n\
            local a<close> = R(1);\n\
            local b<close> = R(2);\n\
         }\n\
         g();\n\
         print(\"after\");",
    );
    assert_eq!(out, "2\n1\nafter\n");
}

#[test]
fn close_receives_the_error_object() {
    let out = run(
        "class R {\n\
            __close(err) { print(err); }\n\
         }\n\
         fn ok() { local x<close> = R(); }\n\
         ok();\n\
         ok2, e = pcall(fn() {\n\
            local x<close> = R();\n\
            error(\"whoops\");\n\
         });\n\
         print(ok2);",
    );
    let mut lines = out.lines();
    assert_eq!(lines.next(), Some("nil"));
    let err_line = lines.next().unwrap();
    assert!(err_line.ends_with("whoops"), "got: {err_line}");
    assert_eq!(lines.next(), Some("false"));
}

#[test]
fn non_closable_value_is_rejected_at_registration() {
    let msg = run_expect_error("local x<close> = 42;");
    assert!(msg.contains("non-closable"), "got: {msg}");
    // nil and false register nothing and close silently
    assert_eq!(run("local x<close> = false; print(\"ok\");"), "ok\n");
}

#[test]
fn collector_frees_garbage_and_keeps_live_data() {
    let mut st = state_with_helpers();
    criptc::do_str(
        &mut st,
        "keep = { tag = \"live\" };\n\
         for (local i = 0; i < 2000; i = i + 1) {\n\
            local junk = [i, i + 1, i + 2];\n\
         }",
        "gc1",
    )
    .unwrap();
    st.gc_collect();
    let after_first = st.gc_count();
    // a completed cycle with no root changes must not shrink further
    st.gc_collect();
    assert_eq!(st.gc_count(), after_first);
    // the live table is still intact
    criptc::do_str(&mut st, "print(keep.tag);", "gc2").unwrap();
    assert_eq!(output(&mut st), "live\n");
}

#[test]
fn finalizers_run_once_between_cycles() {
    let mut st = state_with_helpers();
    criptc::do_str(
        &mut st,
        "class F {\n\
            __gc() { print(\"fin\"); }\n\
         }\n\
         fn make() { local x = F(); }\n\
         make();",
        "fin",
    )
    .unwrap();
    st.gc_collect();
    st.gc_collect();
    let out = output(&mut st);
    assert_eq!(out.matches("fin").count(), 1, "got: {out}");
}

#[test]
fn incremental_steps_happen_during_execution() {
    // allocate well past the default debt threshold; the safe-point
    // steps must keep the heap from growing without bound
    let mut st = state_with_helpers();
    criptc::do_str(
        &mut st,
        "for (local i = 0; i < 20000; i = i + 1) {\n\
            local junk = { a = i, b = [i] };\n\
         }\n\
         print(\"done\");",
        "steps",
    )
    .unwrap();
    assert_eq!(output(&mut st), "done\n");
    st.gc_collect();
    // after a full collection only the helpers' data remains
    assert!(st.heap().live_objects() < 2000, "heap kept {} objects", st.heap().live_objects());
}
