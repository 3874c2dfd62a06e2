// To-be-closed variables: LIFO close order, error delivery, and
// interaction with loops and iterators.

use crate::test::{int_results, run_err, run_ok};

#[test]
fn close_order_under_error() {
    run_ok(
        r##"
        local log = {}
        local function closer(id)
            return setmetatable({id = id}, {__close = function(self, e)
                log[#log + 1] = {self.id, e}
            end})
        end
        local ok, err = pcall(function()
            local a <close> = closer(1)
            local b <close> = closer(2)
            error("x")
        end)
        assert(ok == false)
        assert(err:sub(-1) == "x")
        assert(#log == 2)
        -- LIFO: b first, then a, both seeing the propagating error.
        assert(log[1][1] == 2 and log[1][2]:sub(-1) == "x")
        assert(log[2][1] == 1 and log[2][2]:sub(-1) == "x")
    "##,
    );
}

#[test]
fn close_on_normal_scope_exit() {
    assert_eq!(
        int_results(
            r##"
            local closed = 0
            do
                local r <close> = setmetatable({}, {__close = function(_, e)
                    assert(e == nil)
                    closed = closed + 1
                end})
            end
            return closed
        "##
        ),
        vec![1]
    );
}

#[test]
fn close_on_break_and_return() {
    assert_eq!(
        int_results(
            r##"
            local count = 0
            local mt = {__close = function() count = count + 1 end}
            for i = 1, 5 do
                local guard <close> = setmetatable({}, mt)
                if i == 2 then break end
            end
            local function f()
                local guard <close> = setmetatable({}, mt)
                return count
            end
            f()
            return count
        "##
        ),
        vec![3]
    );
}

#[test]
fn nil_and_false_are_ignored() {
    run_ok(
        r##"
        do
            local a <close> = nil
            local b <close> = false
        end
    "##,
    );
}

#[test]
fn non_closable_value_is_rejected() {
    let msg = run_err("local x <close> = 42");
    assert!(msg.contains("non-closable"), "{}", msg);
    let msg = run_err("local x <close> = {}");
    assert!(msg.contains("non-closable"), "{}", msg);
}

#[test]
fn close_error_on_clean_exit_becomes_the_error() {
    run_ok(
        r##"
        local ok, err = pcall(function()
            local r <close> = setmetatable({}, {__close = function()
                error("close failed")
            end})
            return "unreachable result"
        end)
        assert(ok == false)
        assert(err:find("close failed") ~= nil)
    "##,
    );
}

#[test]
fn original_error_stays_primary() {
    // A __close failure during unwinding must not replace the original.
    run_ok(
        r##"
        local ok, err = pcall(function()
            local r <close> = setmetatable({}, {__close = function()
                error("secondary")
            end})
            error("primary")
        end)
        assert(ok == false)
        assert(err:find("primary") ~= nil)
    "##,
    );
}

#[test]
fn generic_for_closing_slot() {
    // The 4th value of the iterator list is closed when the loop ends.
    assert_eq!(
        int_results(
            r##"
            local closed = 0
            local guard = setmetatable({}, {__close = function() closed = closed + 1 end})
            local function iter(_, i)
                if i < 3 then return i + 1 end
            end
            for i in iter, nil, 0, guard do end
            return closed
        "##
        ),
        vec![1]
    );
}

#[test]
fn multiple_close_attr_in_one_list_rejected() {
    let msg = run_err(
        r##"
        local mt = {__close = function() end}
        local a <close>, b <close> = setmetatable({}, mt), setmetatable({}, mt)
    "##,
    );
    assert!(msg.contains("multiple"), "{}", msg);
}
