//! End-to-end language tests: compile with the real compiler, run on
//! the real VM, assert on captured print output.

mod common;

use common::{output, run, run_expect_error, state_with_helpers};
use cript_runtime::MULTRET;

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("x = 1 + 2 * 3; print(x);"), "7\n");
}

#[test]
fn concat_and_length() {
    assert_eq!(run("s = \"ab\" .. \"cd\"; print(#s, s);"), "4\tabcd\n");
}

#[test]
fn multiple_returns_and_targets() {
    let out = run(
        "fn f(a, b) { return a, b, b, a; }\n\
         a, b, c, d = f(10, 20);\n\
         print(a, b, c, d);",
    );
    assert_eq!(out, "10\t20\t20\t10\n");
}

#[test]
fn classes_construct_and_dispatch() {
    let out = run(
        "class A {\n\
            __init(x) { self.x = x; }\n\
            get() { return self.x; }\n\
         }\n\
         print(A(42).get());",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn pairs_sees_every_entry_once() {
    let out = run(
        "t = { a = 1 };\n\
         t.b = 2;\n\
         local s = \"\";\n\
         for k, v in pairs(t) { s = s .. k .. v; }\n\
         print(#s == 4);",
    );
    assert_eq!(out, "true\n");
}

#[test]
fn close_runs_on_error_unwind() {
    let mut st = state_with_helpers();
    let src = "class R {\n\
            __close(err) { print(\"bye\"); }\n\
         }\n\
         fn g() {\n\
            local x<close> = R();\n\
            error(\"boom\");\n\
         }\n\
         ok, e = pcall(g);\n\
         print(ok, e);";
    criptc::do_str(&mut st, src, "t6").unwrap();
    let out = output(&mut st);
    let mut lines = out.lines();
    assert_eq!(lines.next(), Some("bye"));
    let last = lines.next().unwrap();
    assert!(last.starts_with("false\t"), "got: {last}");
    assert!(last.ends_with("boom"), "got: {last}");
}

#[test]
fn locals_shadow_and_scope() {
    let out = run(
        "local x = 1;\n\
         {\n\
            local x = 2;\n\
            print(x);\n\
         }\n\
         print(x);",
    );
    assert_eq!(out, "2\n1\n");
}

#[test]
fn const_assignment_is_a_compile_error() {
    let msg = run_expect_error("const k = 1; k = 2;");
    assert!(msg.contains("const"), "got: {msg}");
    let msg = run_expect_error("local v<const> = 1; v = 2;");
    assert!(msg.contains("const"), "got: {msg}");
    let msg = run_expect_error("static s = 1; s = 2;");
    assert!(msg.contains("const"), "got: {msg}");
}

#[test]
fn closures_capture_and_share_upvalues() {
    let out = run(
        "fn counter() {\n\
            local n = 0;\n\
            fn bump() { n = n + 1; return n; }\n\
            fn read() { return n; }\n\
            return bump, read;\n\
         }\n\
         bump, read = counter();\n\
         bump(); bump();\n\
         print(read());\n\
         print(bump());",
    );
    assert_eq!(out, "2\n3\n");
}

#[test]
fn upvalues_survive_the_frame() {
    let out = run(
        "fn make(start) {\n\
            return fn() { start = start + 10; return start; };\n\
         }\n\
         f = make(5);\n\
         g = make(100);\n\
         print(f(), f(), g());",
    );
    assert_eq!(out, "15\t25\t110\n");
}

#[test]
fn while_break_continue() {
    let out = run(
        "local i = 0; local acc = 0;\n\
         while (true) {\n\
            i = i + 1;\n\
            if (i > 10) break;\n\
            if (i % 2 == 0) continue;\n\
            acc = acc + i;\n\
         }\n\
         print(acc);",
    );
    assert_eq!(out, "25\n"); // 1+3+5+7+9
}

#[test]
fn c_style_for() {
    let out = run(
        "local acc = 0;\n\
         for (local i = 0; i < 5; i = i + 1) {\n\
            acc = acc + i;\n\
         }\n\
         print(acc);",
    );
    assert_eq!(out, "10\n");
}

#[test]
fn switch_matches_and_defaults() {
    let src = "fn pick(v) {\n\
            switch (v) {\n\
                case 1: return \"one\";\n\
                case \"x\": return \"ex\";\n\
                default: return \"other\";\n\
            }\n\
         }\n\
         print(pick(1), pick(\"x\"), pick(99));";
    assert_eq!(run(src), "one\tex\tother\n");
}

#[test]
fn inheritance_and_super() {
    let out = run(
        "class Animal {\n\
            __init(name) { self.name = name; }\n\
            speak() { return self.name .. \" makes a sound\"; }\n\
         }\n\
         class Dog : Animal {\n\
            speak() { return super.speak() .. \": woof\"; }\n\
         }\n\
         print(Dog(\"rex\").speak());",
    );
    assert_eq!(out, "rex makes a sound: woof\n");
}

#[test]
fn bound_methods_are_first_class() {
    let out = run(
        "class C {\n\
            __init() { self.v = 7; }\n\
            get() { return self.v; }\n\
         }\n\
         local m = C().get;\n\
         print(m());",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn metamethod_arithmetic() {
    let out = run(
        "class Vec {\n\
            __init(x) { self.x = x; }\n\
            __add(a, b) { return Vec(a.x + b.x); }\n\
            __eq(a, b) { return a.x == b.x; }\n\
         }\n\
         local v = Vec(2) + Vec(3);\n\
         print(v.x, v == Vec(5), v == Vec(6));",
    );
    assert_eq!(out, "5\ttrue\tfalse\n");
}

#[test]
fn call_metamethod() {
    let out = run(
        "class Adder {\n\
            __init(k) { self.k = k; }\n\
            __call(n) { return self.k + n; }\n\
         }\n\
         local add3 = Adder(3);\n\
         print(add3(4));",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn tostring_metamethod() {
    let out = run(
        "class P {\n\
            __init(n) { self.n = n; }\n\
            __tostring() { return \"P<\" .. self.n .. \">\"; }\n\
         }\n\
         print(P(9));",
    );
    assert_eq!(out, "P<9>\n");
}

#[test]
fn arrays_index_and_length() {
    let out = run(
        "a = [10, 20, 30];\n\
         a[1] = 21;\n\
         a[3] = 40;\n\
         print(#a, a[0], a[1], a[3]);",
    );
    assert_eq!(out, "4\t10\t21\t40\n");
}

#[test]
fn table_constructor_forms() {
    let out = run(
        "t = { a = 1, [\"b\"] = 2, [10] = 3 };\n\
         print(t.a, t.b, t[10], t.missing);",
    );
    assert_eq!(out, "1\t2\t3\tnil\n");
}

#[test]
fn varargs_collect_and_spread() {
    let out = run(
        "fn sum(...) {\n\
            local a, b, c = ...;\n\
            return a + b + c;\n\
         }\n\
         print(sum(1, 2, 3));",
    );
    assert_eq!(out, "6\n");
}

#[test]
fn and_or_short_circuit() {
    let out = run(
        "fn boom() { error(\"must not run\"); }\n\
         print(false and boom());\n\
         print(true or boom());\n\
         print(nil or \"fallback\");\n\
         print(1 and 2);",
    );
    assert_eq!(out, "false\ntrue\nfallback\n2\n");
}

#[test]
fn generic_for_with_break() {
    let out = run(
        "t = { a = 1, b = 2, c = 3 };\n\
         local n = 0;\n\
         for k, v in pairs(t) {\n\
            n = n + 1;\n\
            if (n == 2) break;\n\
         }\n\
         print(n);",
    );
    assert_eq!(out, "2\n");
}

#[test]
fn script_results_come_back_to_the_host() {
    let mut st = state_with_helpers();
    criptc::load_str(&mut st, "return 1, \"two\", 3.5;", "r").unwrap();
    st.call(0, MULTRET).unwrap();
    assert_eq!(st.get_top(), 3);
    assert_eq!(st.to_int(0), Some(1));
    assert_eq!(st.to_str(1), Some("two"));
    assert_eq!(st.to_float(2), Some(3.5));
}

#[test]
fn runtime_errors_carry_source_and_line() {
    let msg = run_expect_error("x = 1;\ny = x + nil;\n");
    assert!(msg.starts_with("test:2:"), "got: {msg}");
}

#[test]
fn undefined_global_is_an_error() {
    let msg = run_expect_error("print(no_such_global);");
    assert!(msg.contains("undefined global 'no_such_global'"), "got: {msg}");
}

#[test]
fn calling_a_number_is_an_error() {
    let msg = run_expect_error("x = 5; x();");
    assert!(msg.contains("attempt to call a number value"), "got: {msg}");
}

#[test]
fn syntax_errors_report_position() {
    let mut st = state_with_helpers();
    let err = criptc::load_str(&mut st, "fn broken( {", "bad").unwrap_err();
    assert_eq!(err.status, cript_runtime::Status::SyntaxErr);
    let msg = st.error_message(&err);
    assert!(msg.starts_with("bad:1:"), "got: {msg}");
}

#[test]
fn ternary_is_rejected_clearly() {
    let mut st = state_with_helpers();
    let err = criptc::load_str(&mut st, "x = true ? 1 : 2;", "t").unwrap_err();
    let msg = st.error_message(&err);
    assert!(msg.contains("ternary"), "got: {msg}");
}

#[test]
fn load_file_compiles_from_disk() {
    use std::io::Write;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "print(\"from disk\");").unwrap();
    let mut st = state_with_helpers();
    criptc::do_file(&mut st, f.path()).unwrap();
    assert_eq!(output(&mut st), "from disk\n");
}
