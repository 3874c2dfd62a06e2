// Table semantics: absence, borders, traversal, and the table library.

use crate::test::{bool_results, int_results, run_err, run_ok, str_result};

#[test]
fn absence_semantics() {
    // Deleting a key makes it invisible to reads and traversal.
    run_ok(
        r##"
        local t = {}
        t.k = 1
        t.k = nil
        assert(t.k == nil)
        for k in pairs(t) do error("traversal saw " .. tostring(k)) end
        -- same for array-part slots
        local u = {1, 2, 3}
        u[2] = nil
        local seen = 0
        for _ in pairs(u) do seen = seen + 1 end
        assert(seen == 2)
    "##,
    );
}

#[test]
fn constructor_forms() {
    run_ok(
        r##"
        local t = {1, 2, 3; x = 10, ["y"] = 20, [99] = 30}
        assert(t[1] == 1 and t[3] == 3)
        assert(t.x == 10 and t.y == 20 and t[99] == 30)
        local function three() return 7, 8, 9 end
        local m = {0, three()}
        assert(#m == 4 and m[4] == 9)
        local trunc = {three(), 0}
        assert(trunc[1] == 7 and trunc[2] == 0)
    "##,
    );
}

#[test]
fn float_keys_normalize() {
    run_ok(
        r##"
        local t = {}
        t[2.0] = "two"
        assert(t[2] == "two")
        t[0.5] = "half"
        assert(t[0.5] == "half" and t[1/2] == "half")
    "##,
    );
    let msg = run_err("local t = {} t[0/0] = 1");
    assert!(msg.contains("NaN"), "{}", msg);
    let msg = run_err("local t = {} t[nil] = 1");
    assert!(msg.contains("nil"), "{}", msg);
}

#[test]
fn length_is_a_border() {
    run_ok(
        r##"
        assert(#{} == 0)
        assert(#{1, 2, 3} == 3)
        -- With a hole, any border is legal.
        local t = {1, 2, 3}
        t[5] = 5
        local n = #t
        assert(n == 3 or n == 5)
        assert(t[n] ~= nil and t[n + 1] == nil)
    "##,
    );
    // Mixed array/hash border per the boundary clause: array 1..5 plus
    // hash 6..10 must expose a border covering them.
    run_ok(
        r##"
        local t = {}
        for i = 1, 10 do t[i] = i end
        assert(#t == 10)
        local count = 0
        for _ in pairs(t) do count = count + 1 end
        assert(count == 10)
    "##,
    );
}

#[test]
fn next_traversal_is_complete_and_stable() {
    // An unmutated traversal visits each entry exactly once.
    run_ok(
        r##"
        local t = {a = 1, b = 2, c = 3, 10, 20}
        local seen = {}
        local count = 0
        for k, v in pairs(t) do
            assert(seen[k] == nil)
            seen[k] = v
            count = count + 1
        end
        assert(count == 5)
        assert(seen.a == 1 and seen[2] == 20)
    "##,
    );
    // Deleting the current key mid-walk is allowed.
    run_ok(
        r##"
        local t = {x = 1, y = 2, z = 3}
        local count = 0
        for k in pairs(t) do
            t[k] = nil
            count = count + 1
        end
        assert(count == 3)
        assert(next(t) == nil)
    "##,
    );
}

#[test]
fn growth_through_rehash() {
    run_ok(
        r##"
        local t = {}
        for i = 1, 1000 do t[i] = i * 3 end
        for i = 1, 1000 do assert(t[i] == i * 3) end
        assert(#t == 1000)
        for i = 1, 1000, 2 do t[i] = nil end
        for i = 2, 1000, 2 do assert(t[i] == i * 3) end
        local stringkeys = {}
        for i = 1, 200 do stringkeys["k" .. i] = i end
        for i = 1, 200 do assert(stringkeys["k" .. i] == i) end
    "##,
    );
}

#[test]
fn table_insert_remove() {
    run_ok(
        r##"
        local t = {1, 2, 3}
        table.insert(t, 4)
        assert(#t == 4 and t[4] == 4)
        table.insert(t, 1, 0)
        assert(t[1] == 0 and t[5] == 4 and #t == 5)
        local last = table.remove(t)
        assert(last == 4 and #t == 4)
        local first = table.remove(t, 1)
        assert(first == 0 and t[1] == 1)
    "##,
    );
}

#[test]
fn table_concat_unpack_pack() {
    assert_eq!(str_result(r#"return table.concat({"a", "b", "c"}, "-")"#), "a-b-c");
    assert_eq!(str_result(r#"return table.concat({1, 2, 3})"#), "123");
    assert_eq!(int_results("return table.unpack({4, 5, 6})"), vec![4, 5, 6]);
    assert_eq!(int_results("return table.unpack({4, 5, 6}, 2, 3)"), vec![5, 6]);
    run_ok(
        r##"
        local p = table.pack(7, nil, 9)
        assert(p.n == 3 and p[1] == 7 and p[3] == 9)
    "##,
    );
}

#[test]
fn table_sort() {
    run_ok(
        r##"
        local t = {5, 2, 8, 1, 9, 3}
        table.sort(t)
        for i = 1, #t - 1 do assert(t[i] <= t[i + 1]) end
        table.sort(t, function(a, b) return a > b end)
        for i = 1, #t - 1 do assert(t[i] >= t[i + 1]) end
    "##,
    );
}

#[test]
fn index_chain() {
    assert_eq!(
        bool_results(
            r##"
            local base = {inherited = true}
            local mid = setmetatable({}, {__index = base})
            local leaf = setmetatable({}, {__index = mid})
            return leaf.inherited, rawget(leaf, "inherited") == nil
        "##
        ),
        vec![true, true]
    );
}

#[test]
fn newindex_function_and_table() {
    run_ok(
        r##"
        local log = {}
        local t = setmetatable({}, {__newindex = function(t, k, v)
            log[#log + 1] = k
            rawset(t, k, v * 2)
        end})
        t.a = 5
        assert(t.a == 10)
        assert(log[1] == "a")
        -- Present keys bypass __newindex.
        t.a = 7
        assert(t.a == 7)

        local sink = {}
        local u = setmetatable({}, {__newindex = sink})
        u.hidden = 3
        assert(rawget(u, "hidden") == nil and sink.hidden == 3)
    "##,
    );
}
