// Binary chunks: dump/load round trips, and dumping what was just
// loaded reproduces the same bytes.

use crate::test::{int_results, run_ok};
use crate::vm::dump;
use crate::{LuaVM, Stdlib, VmOptions};

#[test]
fn dump_load_executes_identically() {
    assert_eq!(
        int_results(
            r##"
            local function f(a, b) return a * 10 + b end
            local chunk = string.dump(f)
            local g = load(chunk)
            return f(4, 2), g(4, 2)
        "##
        ),
        vec![42, 42]
    );
}

#[test]
fn dump_of_loaded_chunk_is_identical() {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_stdlib(Stdlib::All).unwrap();
    let source = r##"
        local acc = 0
        for i = 1, 10 do acc = acc + i * 2 end
        return acc, "tag", 1.5
    "##;
    let p1 = vm.compile_with_name(source, "=roundtrip").unwrap();
    let d1 = dump::dump(&vm, &p1, false);
    let p2 = dump::undump(&mut vm, &d1, "=roundtrip").unwrap();
    let d2 = dump::dump(&vm, &p2, false);
    assert_eq!(d1, d2, "second dump differs from first");
    // And the reloaded prototype still runs.
    let results = vm.execute_proto(p2).unwrap();
    assert_eq!(results[0].as_integer(), 110);
}

#[test]
fn stripped_chunks_still_run() {
    run_ok(
        r##"
        local f = function(x) return x + 1 end
        local stripped = string.dump(f, true)
        local g = load(stripped)
        assert(g(41) == 42)
    "##,
    );
}

#[test]
fn nested_prototypes_survive() {
    assert_eq!(
        int_results(
            r##"
            local chunk = string.dump(function()
                local function inner(n)
                    return function() return n * 2 end
                end
                return inner(21)()
            end)
            return load(chunk)()
        "##
        ),
        vec![42]
    );
}

#[test]
fn upvalue_structure_survives() {
    assert_eq!(
        int_results(
            r##"
            local f = load(string.dump(function()
                local count = 0
                return function() count = count + 1 return count end
            end))
            local counter = f()
            counter() counter()
            return counter()
        "##
        ),
        vec![3]
    );
}

#[test]
fn corrupted_chunk_is_rejected() {
    run_ok(
        r##"
        local chunk = string.dump(function() return 1 end)
        local broken = "\27Lua" .. string.char(99) .. chunk:sub(6)
        local f, err = load(broken)
        assert(f == nil and type(err) == "string")
    "##,
    );
}

#[test]
fn mode_argument_is_honored() {
    run_ok(
        r##"
        local chunk = string.dump(function() return 1 end)
        local f, err = load(chunk, "bin", "t")
        assert(f == nil and err:find("binary") ~= nil)
        local g, err2 = load("return 2", "txt", "b")
        assert(g == nil and err2:find("text") ~= nil)
    "##,
    );
}

#[test]
fn constants_of_all_kinds_round_trip() {
    run_ok(
        r##"
        local f = load(string.dump(function()
            return nil, true, false, 7, 2.5, "short", string.rep("L", 80)
        end))
        local a, b, c, d, e, s1, s2 = f()
        assert(a == nil and b == true and c == false)
        assert(d == 7 and e == 2.5)
        assert(s1 == "short" and #s2 == 80)
    "##,
    );
}
