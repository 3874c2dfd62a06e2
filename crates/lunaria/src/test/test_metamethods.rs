// Metamethod dispatch: operators, __call, __tostring, protected
// metatables, and the absence-cache behavior.

use crate::test::{bool_results, int_results, run_err, run_ok, str_result};

#[test]
fn arithmetic_metamethods() {
    assert_eq!(
        int_results(
            r##"
            local mt = {
                __add = function(a, b) return a.v + b.v end,
                __mul = function(a, b) return a.v * b.v end,
                __unm = function(a) return -a.v end,
            }
            local a = setmetatable({v = 6}, mt)
            local b = setmetatable({v = 7}, mt)
            return a + b, a * b, -a
        "##
        ),
        vec![13, 42, -6]
    );
}

#[test]
fn mixed_operand_dispatch() {
    // Either operand's handler may serve; operand order is preserved.
    assert_eq!(
        int_results(
            r##"
            local mt = {__sub = function(a, b)
                local av = type(a) == "table" and a.v or a
                local bv = type(b) == "table" and b.v or b
                return av - bv
            end}
            local x = setmetatable({v = 10}, mt)
            return x - 4, 20 - x
        "##
        ),
        vec![6, 10]
    );
}

#[test]
fn eq_only_between_same_kind() {
    run_ok(
        r##"
        local mt = {__eq = function() return true end}
        local t = setmetatable({}, mt)
        local u = setmetatable({}, mt)
        assert(t == u)
        -- Numbers never reach __eq.
        assert(t ~= 1)
        -- Raw equality shortcuts before the handler.
        assert(t == t)
    "##,
    );
}

#[test]
fn comparison_metamethods() {
    run_ok(
        r##"
        local mt = {
            __lt = function(a, b) return a.v < b.v end,
            __le = function(a, b) return a.v <= b.v end,
        }
        local small = setmetatable({v = 1}, mt)
        local big = setmetatable({v = 2}, mt)
        assert(small < big)
        assert(small <= big)
        assert(not (big < small))
        assert(big > small)
        assert(big >= small)
    "##,
    );
}

#[test]
fn len_and_concat_handlers() {
    assert_eq!(int_results(
        r##"
        local t = setmetatable({}, {__len = function() return 99 end})
        return #t
    "##), vec![99]);
    assert_eq!(str_result(
        r##"
        local t = setmetatable({}, {__concat = function(a, b)
            return "<" .. tostring(type(a)) .. ":" .. tostring(type(b)) .. ">"
        end})
        return t .. "x"
    "##), "<table:string>");
}

#[test]
fn call_metamethod() {
    assert_eq!(
        int_results(
            r##"
            local callable = setmetatable({}, {__call = function(self, a, b)
                return a + b
            end})
            return callable(30, 12)
        "##
        ),
        vec![42]
    );
    let msg = run_err("local t = {} t()");
    assert!(msg.contains("attempt to call"), "{}", msg);
}

#[test]
fn tostring_and_name() {
    assert_eq!(
        str_result(
            r##"
            local t = setmetatable({}, {__tostring = function() return "custom!" end})
            return tostring(t)
        "##
        ),
        "custom!"
    );
    run_ok(
        r##"
        local t = setmetatable({}, {__name = "widget"})
        assert(tostring(t):find("widget") == 1)
    "##,
    );
}

#[test]
fn protected_metatable() {
    run_ok(
        r##"
        local t = setmetatable({}, {__metatable = "locked"})
        assert(getmetatable(t) == "locked")
        local ok, err = pcall(setmetatable, t, {})
        assert(not ok)
    "##,
    );
}

#[test]
fn index_function_receives_table_and_key() {
    run_ok(
        r##"
        local t = setmetatable({}, {__index = function(tab, key)
            return key .. "!"
        end})
        assert(t.hello == "hello!")
        t.present = "x"
        assert(t.present == "x")
    "##,
    );
}

#[test]
fn metamethods_on_strings() {
    // The shared string metatable exposes the library via __index.
    run_ok(
        r##"
        local s = "hello"
        assert(s:upper() == "HELLO")
        assert(s:len() == 5)
        assert(("a,b"):sub(1, 1) == "a")
    "##,
    );
}

#[test]
fn metatable_swap_invalidates_cache() {
    // The absence cache must not survive metatable mutation.
    assert_eq!(
        bool_results(
            r##"
            local mt = {}
            local t = setmetatable({}, mt)
            local before = t.x == nil
            mt.__index = function() return 1 end
            local after = t.x == 1
            return before, after
        "##
        ),
        vec![true, true]
    );
}
