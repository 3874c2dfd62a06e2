use crate::test::{bool_results, int_results, run, run_err, run_ok, str_result};

#[test]
fn literals_and_locals() {
    assert_eq!(int_results("local a = 1 local b = 2 return a + b"), vec![3]);
    assert_eq!(int_results("return 10, 20, 30"), vec![10, 20, 30]);
}

#[test]
fn type_names() {
    run_ok(
        r##"
        assert(type(nil) == "nil")
        assert(type(true) == "boolean")
        assert(type(1) == "number")
        assert(type(1.5) == "number")
        assert(type("x") == "string")
        assert(type({}) == "table")
        assert(type(print) == "function")
    "##,
    );
}

#[test]
fn tostring_basics() {
    assert_eq!(str_result("return tostring(123)"), "123");
    assert_eq!(str_result("return tostring(1.5)"), "1.5");
    assert_eq!(str_result("return tostring(nil)"), "nil");
    assert_eq!(str_result("return tostring(true)"), "true");
    // Floats keep a visible fraction.
    assert_eq!(str_result("return tostring(1.0)"), "1.0");
}

#[test]
fn tonumber_basics() {
    run_ok(
        r##"
        assert(tonumber("123") == 123)
        assert(tonumber("3.5") == 3.5)
        assert(tonumber("0x10") == 16)
        assert(tonumber("  42  ") == 42)
        assert(tonumber("bad") == nil)
        assert(tonumber("ff", 16) == 255)
        assert(tonumber("z", 36) == 35)
        assert(tonumber(7) == 7)
    "##,
    );
}

#[test]
fn select_semantics() {
    run_ok(
        r##"
        assert(select("#", 1, 2, 3) == 3)
        assert(select("#") == 0)
        local a, b = select(2, "x", "y", "z")
        assert(a == "y" and b == "z")
        local c = select(-1, "p", "q")
        assert(c == "q")
    "##,
    );
}

#[test]
fn assert_passes_values_through() {
    assert_eq!(int_results("return assert(42)"), vec![42]);
    run_ok(r#"local a, b = assert(1, "msg") assert(a == 1 and b == "msg")"#);
    let msg = run_err("assert(false, 'boom')");
    assert!(msg.contains("boom"), "{}", msg);
    let msg = run_err("assert(nil)");
    assert!(msg.contains("assertion failed!"), "{}", msg);
}

#[test]
fn rawequal_and_rawops() {
    assert_eq!(
        bool_results(
            r##"
            local t = setmetatable({}, {__eq = function() return true end})
            local u = setmetatable({}, {__eq = function() return true end})
            return rawequal(t, u), t == u, rawequal(t, t)
        "##
        ),
        vec![false, true, true]
    );
    run_ok(
        r##"
        local t = setmetatable({}, {__index = function() return 99 end})
        assert(t.missing == 99)
        assert(rawget(t, "missing") == nil)
        rawset(t, "missing", 1)
        assert(rawget(t, "missing") == 1)
        assert(rawlen({1, 2, 3}) == 3)
        assert(rawlen("abcd") == 4)
    "##,
    );
}

#[test]
fn vararg_select_interplay() {
    run_ok(
        r##"
        local function f(...)
            local n = select("#", ...)
            local first = ...
            return n, first
        end
        local n, first = f("a", "b", "c")
        assert(n == 3 and first == "a")
        local n2 = f()
        assert(n2 == 0)
    "##,
    );
}

#[test]
fn load_text_chunk() {
    run_ok(
        r##"
        local f = load("return 1 + 2")
        assert(f() == 3)
        local bad, err = load("return +")
        assert(bad == nil and type(err) == "string")
    "##,
    );
}

#[test]
fn global_environment() {
    run_ok(
        r##"
        x_global = 7
        assert(_G.x_global == 7)
        _G.y_global = 8
        assert(y_global == 8)
        assert(_G._G == _G)
    "##,
    );
}

#[test]
fn runtime_error_carries_position() {
    let msg = run_err("local t = nil\nreturn t.x");
    assert!(msg.contains(":2:"), "position missing in: {}", msg);
    assert!(msg.contains("attempt to index"), "{}", msg);
}

#[test]
fn instruction_budget_interrupts() {
    let mut vm = crate::LuaVM::new(crate::VmOptions::default());
    vm.open_stdlib(crate::Stdlib::All).unwrap();
    vm.main_state().set_instruction_budget(Some(10_000));
    let err = vm.execute_string("while true do end");
    assert!(err.is_err());
    assert!(vm.error_message().contains("interrupted"));
}

#[test]
fn results_from_run_helper() {
    let (vm, values) = run("return 'hello' .. ' ' .. 'world'");
    assert_eq!(values.len(), 1);
    assert_eq!(vm.main_state_ref().to_display(&values[0]), "hello world");
}
