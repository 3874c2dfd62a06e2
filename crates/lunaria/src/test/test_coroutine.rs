// Coroutines: suspension, transfer of values both ways, statuses, wrap,
// and yielding through protected frames.

use crate::test::{bool_results, int_results, run_err, run_ok, str_result};

#[test]
fn ping_pong_value_transfer() {
    // Values flow resume -> body -> yield -> resume across three rounds,
    // with stack and pc preserved at each suspension.
    assert_eq!(
        int_results(
            r##"
            local co = coroutine.create(function(x)
                for i = 1, 3 do
                    x = coroutine.yield(x * 2)
                end
                return x
            end)
            local out = {}
            local function step(v)
                local ok, r = coroutine.resume(co, v)
                assert(ok)
                out[#out + 1] = r
            end
            step(1) step(10) step(100) step(1000)
            return out[1], out[2], out[3], out[4]
        "##
        ),
        vec![2, 20, 200, 1000]
    );
}

#[test]
fn first_resume_passes_arguments() {
    assert_eq!(
        int_results(
            r##"
            local co = coroutine.create(function(a, b) return a + b end)
            local ok, sum = coroutine.resume(co, 30, 12)
            assert(ok)
            return sum
        "##
        ),
        vec![42]
    );
}

#[test]
fn statuses() {
    run_ok(
        r##"
        local co
        co = coroutine.create(function()
            assert(coroutine.status(co) == "running")
            coroutine.yield()
        end)
        assert(coroutine.status(co) == "suspended")
        coroutine.resume(co)
        assert(coroutine.status(co) == "suspended")
        coroutine.resume(co)
        assert(coroutine.status(co) == "dead")
        local ok, err = coroutine.resume(co)
        assert(ok == false and err:find("dead") ~= nil)
    "##,
    );
}

#[test]
fn coroutine_error_kills_it() {
    run_ok(
        r##"
        local co = coroutine.create(function() error("inside") end)
        local ok, err = coroutine.resume(co)
        assert(ok == false)
        assert(err:find("inside") ~= nil)
        assert(coroutine.status(co) == "dead")
    "##,
    );
}

#[test]
fn wrap_propagates_values_and_errors() {
    assert_eq!(
        int_results(
            r##"
            local gen = coroutine.wrap(function()
                for i = 1, 3 do coroutine.yield(i * 11) end
            end)
            return gen(), gen(), gen()
        "##
        ),
        vec![11, 22, 33]
    );
    run_ok(
        r##"
        local bad = coroutine.wrap(function() error("wrapped") end)
        local ok, err = pcall(bad)
        assert(ok == false and err:find("wrapped") ~= nil)
    "##,
    );
}

#[test]
fn yield_through_pcall() {
    // A protected frame is pure data, so suspension passes through it
    // and the protection still works after resumption.
    run_ok(
        r##"
        local co = coroutine.create(function()
            local ok, err = pcall(function()
                coroutine.yield("suspended inside pcall")
                error("after resume")
            end)
            assert(ok == false)
            assert(err:find("after resume") ~= nil)
            return "finished"
        end)
        local ok, v = coroutine.resume(co)
        assert(ok and v == "suspended inside pcall")
        local ok2, v2 = coroutine.resume(co)
        assert(ok2 and v2 == "finished")
    "##,
    );
}

#[test]
fn yield_from_nested_lua_calls() {
    assert_eq!(
        int_results(
            r##"
            local function inner() return coroutine.yield(5) end
            local function outer() return inner() + 1 end
            local co = coroutine.create(outer)
            local ok, v = coroutine.resume(co)
            assert(ok and v == 5)
            local ok2, total = coroutine.resume(co, 41)
            assert(ok2)
            return total
        "##
        ),
        vec![42]
    );
}

#[test]
fn yield_outside_coroutine_fails() {
    let msg = run_err("coroutine.yield()");
    assert!(msg.contains("outside a coroutine"), "{}", msg);
}

#[test]
fn isyieldable_and_running() {
    assert_eq!(
        bool_results(
            r##"
            local main_yieldable = coroutine.isyieldable()
            local inside
            local co = coroutine.create(function()
                inside = coroutine.isyieldable()
            end)
            coroutine.resume(co)
            local me, ismain = coroutine.running()
            return main_yieldable, inside, ismain, type(me) == "thread"
        "##
        ),
        vec![false, true, true, true]
    );
}

#[test]
fn close_suspended_coroutine() {
    assert_eq!(
        str_result(
            r##"
            local co = coroutine.create(function() coroutine.yield() end)
            coroutine.resume(co)
            local ok = coroutine.close(co)
            assert(ok == true)
            return coroutine.status(co)
        "##
        ),
        "dead"
    );
}

#[test]
fn resume_into_normal_coroutine_fails() {
    run_ok(
        r##"
        local outer
        local inner = coroutine.create(function()
            local ok, err = coroutine.resume(outer)
            assert(ok == false)
            assert(err:find("non-suspended") ~= nil)
        end)
        outer = coroutine.create(function()
            coroutine.resume(inner)
        end)
        coroutine.resume(outer)
    "##,
    );
}

#[test]
fn generic_for_over_wrap() {
    assert_eq!(
        int_results(
            r##"
            local function range(n)
                return coroutine.wrap(function()
                    for i = 1, n do coroutine.yield(i) end
                end)
            end
            local s = 0
            for x in range(5) do s = s + x end
            return s
        "##
        ),
        vec![15]
    );
}
