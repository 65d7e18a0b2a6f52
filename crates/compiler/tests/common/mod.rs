//! Shared test scaffolding: a state with a handful of native helpers
//! (print into a capture buffer, pairs/next, error, pcall) registered
//! through the host API. These are test fixtures, not a standard
//! library.
#![allow(dead_code)]

use cript_runtime::{Error, MULTRET, State, TypeTag};

/// Print: tab-separated, newline-terminated, appended to the `__output`
/// global so tests can assert on it.
fn native_print(st: &mut State) -> Result<usize, Error> {
    let n = st.nargs();
    let mut line = String::new();
    for i in 0..n {
        if i > 0 {
            line.push('\t');
        }
        let v = st.value_at(i as i32);
        let s = st.tostring_value(v)?;
        line.push_str(&s);
    }
    line.push('\n');
    st.get_global("__output")?;
    let prev = st.to_str(-1).unwrap_or_default().to_string();
    st.pop_values(1);
    st.push_string(&format!("{prev}{line}"))?;
    st.set_global("__output")?;
    Ok(0)
}

/// Stateless table iterator: `next(t, ctl)` resumes after the entry
/// whose key is `ctl` (nil starts from the beginning).
fn native_next(st: &mut State) -> Result<usize, Error> {
    let t = st.check_type(0, TypeTag::Table)?;
    let tr = t.as_obj().expect("checked table");
    let ctl = st.value_at(1);
    let cursor = if ctl.is_nil() {
        0
    } else {
        let h = ctl.hash(st.heap());
        match st.heap().table(tr).slot_of(ctl, h) {
            Some(slot) => slot + 1,
            None => return Err(st.error_msg("invalid key to 'next'")),
        }
    };
    match st.heap().table(tr).next_entry(cursor) {
        Some((_, k, v)) => {
            st.push_value(k)?;
            st.push_value(v)?;
            Ok(2)
        }
        None => {
            st.push_nil()?;
            Ok(1)
        }
    }
}

fn native_pairs(st: &mut State) -> Result<usize, Error> {
    let t = st.check_type(0, TypeTag::Table)?;
    st.push_cfunction(native_next)?;
    st.push_value(t)?;
    st.push_nil()?;
    Ok(3)
}

fn native_error(st: &mut State) -> Result<usize, Error> {
    let v = st.value_at(0);
    Err(Error::runtime(v))
}

/// `pcall(f, ...) -> (true, results...) | (false, error)`
fn native_pcall(st: &mut State) -> Result<usize, Error> {
    let n = st.nargs();
    if n == 0 {
        return Err(st.error_msg("'pcall' needs a function argument"));
    }
    let status = st.pcall(n - 1, MULTRET, None);
    if status == cript_runtime::Status::Ok {
        st.push_bool(true)?;
        st.insert_at(0);
        Ok(st.get_top())
    } else {
        st.push_bool(false)?;
        st.insert_at(-2);
        Ok(2)
    }
}

fn native_typename(st: &mut State) -> Result<usize, Error> {
    let name = st.type_of(0).name();
    st.push_string(name)?;
    Ok(1)
}

/// Fresh state with the helper natives and an empty capture buffer.
pub fn state_with_helpers() -> State {
    state_with_helpers_cfg(cript_runtime::Config::default())
}

pub fn state_with_helpers_cfg(cfg: cript_runtime::Config) -> State {
    let mut st = State::with_config(cfg);
    st.register("print", native_print).unwrap();
    st.register("pairs", native_pairs).unwrap();
    st.register("next", native_next).unwrap();
    st.register("error", native_error).unwrap();
    st.register("pcall", native_pcall).unwrap();
    st.register("typename", native_typename).unwrap();
    st.push_string("").unwrap();
    st.set_global("__output").unwrap();
    st
}

/// Captured print output so far.
pub fn output(st: &mut State) -> String {
    st.get_global("__output").unwrap();
    let s = st.to_str(-1).unwrap_or_default().to_string();
    st.pop_values(1);
    s
}

/// Run a script and return the captured output; panics on any error.
pub fn run(src: &str) -> String {
    let mut st = state_with_helpers();
    if let Err(e) = criptc::do_str(&mut st, src, "test") {
        panic!("script failed: {}", st.error_message(&e));
    }
    output(&mut st)
}

/// Run a script expected to fail; returns the rendered error message.
pub fn run_expect_error(src: &str) -> String {
    let mut st = state_with_helpers();
    match criptc::do_str(&mut st, src, "test") {
        Ok(()) => panic!("script unexpectedly succeeded"),
        Err(e) => st.error_message(&e),
    }
}
