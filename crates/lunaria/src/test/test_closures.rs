// Upvalue capture, sharing, and closing: one upvalue object per
// captured stack slot, visible to every closure that took it.

use crate::test::{int_results, run_ok};

#[test]
fn simple_counter() {
    assert_eq!(
        int_results(
            r##"
            local function counter()
                local n = 0
                return function() n = n + 1 return n end
            end
            local c = counter()
            c() c()
            return c()
        "##
        ),
        vec![3]
    );
}

#[test]
fn closures_share_one_upvalue() {
    // Exactly one upvalue object per (thread, slot): both closures must
    // see each other's writes.
    assert_eq!(
        int_results(
            r##"
            local function pair()
                local n = 0
                local function inc() n = n + 1 end
                local function get() return n end
                return inc, get
            end
            local inc, get = pair()
            inc() inc() inc()
            return get()
        "##
        ),
        vec![3]
    );
}

#[test]
fn loop_iterations_capture_fresh_variables() {
    assert_eq!(
        int_results(
            r##"
            local fns = {}
            for i = 1, 3 do
                fns[i] = function() return i end
            end
            return fns[1](), fns[2](), fns[3]()
        "##
        ),
        vec![1, 2, 3]
    );
}

#[test]
fn upvalues_close_with_last_value() {
    // After the frame pops, the closure observes the final value.
    assert_eq!(
        int_results(
            r##"
            local f
            do
                local x = 1
                f = function() return x end
                x = 42
            end
            return f()
        "##
        ),
        vec![42]
    );
}

#[test]
fn writes_after_close_are_private() {
    assert_eq!(
        int_results(
            r##"
            local mk = function()
                local v = 0
                return function(d) v = v + d return v end
            end
            local a, b = mk(), mk()
            a(5)
            b(100)
            return a(0), b(0)
        "##
        ),
        vec![5, 100]
    );
}

#[test]
fn nested_capture_through_two_levels() {
    assert_eq!(
        int_results(
            r##"
            local function outer()
                local x = 10
                local function middle()
                    local function inner() return x end
                    return inner
                end
                return middle()
            end
            return outer()()
        "##
        ),
        vec![10]
    );
}

#[test]
fn break_closes_loop_locals() {
    run_ok(
        r##"
        local f
        for i = 1, 10 do
            local v = i * 2
            f = function() return v end
            if i == 3 then break end
        end
        assert(f() == 6)
    "##,
    );
}

#[test]
fn recursive_local_function_sees_itself() {
    assert_eq!(
        int_results(
            r##"
            local function fact(n)
                if n <= 1 then return 1 end
                return n * fact(n - 1)
            end
            return fact(6)
        "##
        ),
        vec![720]
    );
}

#[test]
fn upvalue_from_vararg_frame() {
    assert_eq!(
        int_results(
            r##"
            local function hold(...)
                local a, b = ...
                return function() return a + b end
            end
            return hold(30, 12)()
        "##
        ),
        vec![42]
    );
}
