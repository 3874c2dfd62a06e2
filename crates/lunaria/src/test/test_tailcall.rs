// Tail calls: a chain of calls in tail position runs in a single
// reused frame, so depth stays constant.

use crate::test::{int_results, run_ok};
use crate::value::LuaValue;
use crate::{LuaResult, LuaState, LuaVM, Stdlib, VmOptions};

#[test]
fn fibonacci_by_tail_recursion() {
    assert_eq!(
        int_results(
            r##"
            local function fib(n, a, b)
                if n == 0 then return a end
                return fib(n - 1, b, a + b)
            end
            return fib(50, 0, 1)
        "##
        ),
        vec![12586269025]
    );
}

#[test]
fn deep_tail_chain_does_not_grow_stack() {
    // Far beyond the configured call-depth limit: only possible if the
    // chain reuses one frame.
    assert_eq!(
        int_results(
            r##"
            local function loop(n)
                if n == 0 then return 0 end
                return loop(n - 1)
            end
            return loop(100000)
        "##
        ),
        vec![0]
    );
}

fn observe_depth(l: &mut LuaState) -> LuaResult<usize> {
    l.push(LuaValue::integer(l.call_depth() as i64))?;
    Ok(1)
}

#[test]
fn tail_frame_depth_is_constant() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let probe = LuaValue::cfunction(observe_depth);
    vm.set_global("depth", probe);
    let results = vm
        .execute_string(
            r##"
            local function chain(n)
                if n == 0 then return depth() end
                return chain(n - 1)
            end
            return chain(1), chain(5000)
        "##,
        )
        .unwrap();
    let d1 = results[0].as_integer();
    let d2 = results[1].as_integer();
    assert_eq!(d1, d2, "tail chain grew the call chain: {} vs {}", d1, d2);
}

#[test]
fn mutual_tail_recursion() {
    assert_eq!(
        int_results(
            r##"
            local is_even, is_odd
            function is_even(n)
                if n == 0 then return 1 end
                return is_odd(n - 1)
            end
            function is_odd(n)
                if n == 0 then return 0 end
                return is_even(n - 1)
            end
            return is_even(60001)
        "##
        ),
        vec![0]
    );
}

#[test]
fn tail_call_to_native() {
    run_ok(
        r##"
        local function f() return tostring(42) end
        assert(f() == "42")
    "##,
    );
}

#[test]
fn tail_call_passes_all_results() {
    assert_eq!(
        int_results(
            r##"
            local function three() return 1, 2, 3 end
            local function fwd() return three() end
            return fwd()
        "##
        ),
        vec![1, 2, 3]
    );
}

#[test]
fn non_tail_recursion_hits_the_limit() {
    run_ok(
        r##"
        local function grow(n)
            if n == 0 then return 0 end
            return 1 + grow(n - 1)
        end
        local ok, err = pcall(grow, 100000)
        assert(ok == false)
        assert(err:find("stack overflow") ~= nil)
    "##,
    );
}

#[test]
fn protected_tail_call_keeps_protection() {
    run_ok(
        r##"
        local function boom() error("late") end
        local function trampoline() return boom() end
        local ok, err = pcall(trampoline)
        assert(ok == false)
        assert(err:find("late") ~= nil)
    "##,
    );
}
