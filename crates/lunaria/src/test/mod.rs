// Integration-style tests driving the public VM surface with source
// snippets.

pub mod test_basic;
pub mod test_closures;
pub mod test_coroutine;
pub mod test_dump;
pub mod test_error;
pub mod test_gc;
pub mod test_metamethods;
pub mod test_operators;
pub mod test_string;
pub mod test_syntax;
pub mod test_table;
pub mod test_tailcall;
pub mod test_tbc;

use crate::{LuaVM, LuaValue, Stdlib, VmOptions};

/// Fresh VM with the full stdlib; panics with the Lua error message on
/// failure so test output is readable.
pub(crate) fn run(src: &str) -> (Box<LuaVM>, Vec<LuaValue>) {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    match vm.execute_string(src) {
        Ok(values) => (vm, values),
        Err(kind) => panic!("{}: {}", kind, vm.error_message()),
    }
}

pub(crate) fn run_ok(src: &str) {
    let _ = run(src);
}

/// Runs the source and expects an error; returns its rendered message.
pub(crate) fn run_err(src: &str) -> String {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    match vm.execute_string(src) {
        Ok(_) => panic!("expected an error from: {}", src),
        Err(_) => vm.error_message(),
    }
}

pub(crate) fn int_results(src: &str) -> Vec<i64> {
    let (_, values) = run(src);
    values
        .iter()
        .map(|v| {
            assert!(v.is_integer(), "non-integer result {:?}", v);
            v.as_integer()
        })
        .collect()
}

pub(crate) fn str_result(src: &str) -> String {
    let (vm, values) = run(src);
    assert!(!values.is_empty());
    vm.main_state_ref().to_display(&values[0])
}

pub(crate) fn bool_results(src: &str) -> Vec<bool> {
    let (_, values) = run(src);
    values
        .iter()
        .map(|v| {
            assert!(v.is_boolean(), "non-boolean result {:?}", v);
            v.as_boolean()
        })
        .collect()
}
