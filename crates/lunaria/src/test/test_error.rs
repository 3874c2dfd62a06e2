// Protected execution: pcall/xpcall, error values, unwinding back to
// the checkpoint, and handler behavior.

use crate::test::{bool_results, int_results, run, run_err, run_ok, str_result};

#[test]
fn pcall_no_error_is_transparent() {
    // pcall(f, a...) with a clean f behaves as (true, f(a...)).
    run_ok(
        r##"
        local ok, a, b = pcall(function(x, y) return x + 1, y + 1 end, 10, 20)
        assert(ok == true and a == 11 and b == 21)
        local ok2 = pcall(function() end)
        assert(ok2 == true)
    "##,
    );
}

#[test]
fn pcall_catches_runtime_errors() {
    run_ok(
        r##"
        local ok, err = pcall(function() error("boom") end)
        assert(ok == false)
        assert(type(err) == "string")
        assert(err:sub(-4) == "boom")
    "##,
    );
}

#[test]
fn error_values_are_arbitrary() {
    run_ok(
        r##"
        local ok, err = pcall(function() error({code = 42}) end)
        assert(ok == false)
        assert(type(err) == "table" and err.code == 42)
        local ok2, err2 = pcall(function() error() end)
        assert(ok2 == false and err2 == nil)
    "##,
    );
}

#[test]
fn nested_pcall() {
    assert_eq!(
        bool_results(
            r##"
            local outer_ok = pcall(function()
                local inner_ok, inner_err = pcall(error, "inner")
                assert(inner_ok == false)
                -- the inner failure was contained; we finish cleanly
            end)
            return outer_ok
        "##
        ),
        vec![true]
    );
}

#[test]
fn errors_propagate_through_frames() {
    run_ok(
        r##"
        local function level3() error("deep") end
        local function level2() level3() end
        local function level1() level2() end
        local ok, err = pcall(level1)
        assert(not ok and err:find("deep") ~= nil)
    "##,
    );
}

#[test]
fn stack_restored_after_catch() {
    // After a caught error, execution continues with the stack and
    // call chain back at their checkpoint state.
    assert_eq!(
        int_results(
            r##"
            local results = {}
            for i = 1, 5 do
                local ok = pcall(function()
                    if i % 2 == 0 then error("even") end
                    return i
                end)
                results[#results + 1] = ok and 1 or 0
            end
            return results[1], results[2], results[3], results[4], results[5]
        "##
        ),
        vec![1, 0, 1, 0, 1]
    );
}

#[test]
fn xpcall_runs_handler_at_throw_point() {
    run_ok(
        r##"
        local ok, decorated = xpcall(
            function() error("raw") end,
            function(e) return "handled: " .. e end
        )
        assert(ok == false)
        assert(decorated:find("handled: ") == 1)
    "##,
    );
}

#[test]
fn xpcall_passes_arguments() {
    assert_eq!(
        int_results(
            r##"
            local ok, sum = xpcall(function(a, b) return a + b end, tostring, 3, 4)
            assert(ok == true)
            return sum
        "##
        ),
        vec![7]
    );
}

#[test]
fn handler_error_is_contained() {
    run_ok(
        r##"
        local ok, err = xpcall(
            function() error("original") end,
            function() error("handler blew up") end
        )
        assert(ok == false)
        assert(type(err) == "string")
    "##,
    );
}

#[test]
fn pcall_of_noncallable_reports_failure() {
    run_ok(
        r##"
        local ok, err = pcall(42)
        assert(ok == false)
        assert(err:find("attempt to call") ~= nil)
        local ok2 = pcall(nil)
        assert(ok2 == false)
    "##,
    );
}

#[test]
fn uncaught_error_surfaces_to_host() {
    let msg = run_err("error('top level')");
    assert!(msg.contains("top level"), "{}", msg);
}

#[test]
fn error_level_zero_keeps_value_raw() {
    assert_eq!(
        str_result(
            r##"
            local _, err = pcall(function() error("bare", 0) end)
            return err
        "##
        ),
        "bare"
    );
}

#[test]
fn call_depth_overflow_is_catchable() {
    run_ok(
        r##"
        local function recurse(n) return recurse(n + 1) + 1 end
        local ok, err = pcall(recurse, 1)
        assert(ok == false)
        assert(err:find("stack overflow") ~= nil)
    "##,
    );
}

#[test]
fn protected_call_host_api() {
    let (mut vm, values) = run("return function(a, b) return a * b end");
    let f = values[0];
    let (ok, results) =
        vm.protected_call(f, &[crate::LuaValue::integer(6), crate::LuaValue::integer(7)]).unwrap();
    assert!(ok);
    assert_eq!(results[0].as_integer(), 42);

    // Values belong to their owning state; a failing callee reports
    // through the same surface.
    let (mut vm, values) = run("return function() error('host sees this') end");
    let f = values[0];
    let (ok, results) = vm.protected_call(f, &[]).unwrap();
    assert!(!ok);
    let msg = vm.main_state_ref().to_display(&results[0]);
    assert!(msg.contains("host sees this"), "{}", msg);
}
