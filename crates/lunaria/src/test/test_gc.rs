// Collector behavior observable from programs: interning, weak tables,
// ephemerons, finalizers, and collection timing never changing results.

use crate::test::{bool_results, int_results, run, run_ok};
use crate::{LuaVM, Stdlib, VmOptions};

#[test]
fn short_string_interning_is_identity() {
    // Two routes to the same short string yield one object.
    assert_eq!(
        bool_results(r#"local a = "foo" local b = "f" .. "oo" return rawequal(a, b), a == b"#),
        vec![true, true]
    );
}

#[test]
fn long_strings_compare_by_content() {
    run_ok(
        r##"
        local prefix = string.rep("x", 100)
        local a = prefix .. "end"
        local b = prefix .. "end"
        assert(a == b)
        assert(rawequal(a, b))
    "##,
    );
}

#[test]
fn weak_values_drop_garbage() {
    assert_eq!(
        bool_results(
            r##"
            local t = setmetatable({}, {__mode = "v"})
            do local u = {} t.k = u end
            collectgarbage()
            collectgarbage()
            return t.k == nil
        "##
        ),
        vec![true]
    );
}

#[test]
fn weak_values_keep_reachable_entries() {
    run_ok(
        r##"
        local strong = {}
        local t = setmetatable({}, {__mode = "v"})
        t.k = strong
        collectgarbage()
        assert(t.k == strong)
    "##,
    );
}

#[test]
fn weak_keys_are_ephemerons() {
    // Ephemeron rule: the value survives iff the key is reachable
    // from outside its own entry.
    run_ok(
        r##"
        local t = setmetatable({}, {__mode = "k"})
        local kept_key = {}
        t[kept_key] = {"payload"}
        do
            local dead_key = {}
            t[dead_key] = {"doomed"}
        end
        collectgarbage()
        collectgarbage()
        local count = 0
        for _ in pairs(t) do count = count + 1 end
        assert(count == 1)
        assert(t[kept_key][1] == "payload")
    "##,
    );
}

#[test]
fn ephemeron_chain_converges() {
    // v1's key is kept; v1 keeps k2 alive which keeps v2: the fixpoint
    // must find the whole chain.
    run_ok(
        r##"
        local t = setmetatable({}, {__mode = "k"})
        local root = {}
        local k2 = {}
        t[root] = k2
        t[k2] = {"chained"}
        collectgarbage()
        assert(t[t[root]][1] == "chained")
    "##,
    );
}

#[test]
fn finalizers_run_once_with_object_intact() {
    run_ok(
        r##"
        local log = {}
        do
            local obj = setmetatable({tag = "fin"}, {__gc = function(o)
                log[#log + 1] = o.tag
            end})
        end
        collectgarbage()
        collectgarbage()
        collectgarbage()
        assert(#log == 1)
        assert(log[1] == "fin")
    "##,
    );
}

#[test]
fn collectgarbage_controls() {
    run_ok(
        r##"
        assert(collectgarbage("isrunning") == true)
        collectgarbage("stop")
        assert(collectgarbage("isrunning") == false)
        collectgarbage("restart")
        assert(collectgarbage("isrunning") == true)
        local kb = collectgarbage("count")
        assert(type(kb) == "number" and kb > 0)
        collectgarbage("incremental")
        collectgarbage("step")
        collectgarbage("generational")
        collectgarbage("collect")
    "##,
    );
}

#[test]
fn allocation_pressure_triggers_collection() {
    // Churn enough garbage that debt-driven steps must fire; totals
    // stay correct regardless of collection timing.
    assert_eq!(
        int_results(
            r##"
            local sum = 0
            for i = 1, 2000 do
                local t = {i, i + 1, i + 2}
                sum = sum + t[1]
            end
            return sum
        "##
        ),
        vec![2001000]
    );
}

#[test]
fn heap_shrinks_after_collect() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    vm.execute_string("junk = nil local t = {} for i = 1, 5000 do t[i] = {i} end").unwrap();
    vm.collect_garbage();
    let after_drop = vm.gc.heap_bytes();
    vm.execute_string("collectgarbage()").unwrap();
    let settled = vm.gc.heap_bytes();
    assert!(settled <= after_drop + 1024, "{} vs {}", settled, after_drop);
}

#[test]
fn survivors_stay_valid_across_cycles() {
    run_ok(
        r##"
        local keep = {}
        for round = 1, 5 do
            for i = 1, 200 do
                keep[#keep + 1] = {round = round, i = i}
            end
            collectgarbage()
        end
        assert(#keep == 1000)
        assert(keep[1].round == 1 and keep[1000].round == 5)
    "##,
    );
}

#[test]
fn finalizer_errors_go_to_warning_channel() {
    let (vm, _) = run(
        r##"
        do
            local obj = setmetatable({}, {__gc = function() error("in finalizer") end})
        end
        collectgarbage()
        collectgarbage()
        return 1
    "##,
    );
    // The error was swallowed; the program completed.
    let _ = vm;
}

#[test]
fn open_upvalues_keep_thread_values_alive() {
    run_ok(
        r##"
        local getter
        do
            local big = string.rep("payload", 50)
            getter = function() return big end
        end
        collectgarbage()
        collectgarbage()
        assert(getter():find("payload") == 1)
    "##,
    );
}
