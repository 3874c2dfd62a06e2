// String library behavior over byte strings.

use crate::test::{int_results, run_ok, str_result};

#[test]
fn sub_with_relative_indices() {
    run_ok(
        r##"
        local s = "hello world"
        assert(s:sub(1, 5) == "hello")
        assert(s:sub(7) == "world")
        assert(s:sub(-5) == "world")
        assert(s:sub(2, -2) == "ello worl")
        assert(s:sub(10, 2) == "")
        assert(s:sub(0, 3) == "hel")
    "##,
    );
}

#[test]
fn rep_upper_lower_reverse() {
    assert_eq!(str_result(r#"return ("ab"):rep(3)"#), "ababab");
    assert_eq!(str_result(r#"return ("ab"):rep(3, "-")"#), "ab-ab-ab");
    assert_eq!(str_result(r#"return ("ab"):rep(0)"#), "");
    assert_eq!(str_result(r#"return ("MiXeD"):upper()"#), "MIXED");
    assert_eq!(str_result(r#"return ("MiXeD"):lower()"#), "mixed");
    assert_eq!(str_result(r#"return ("abc"):reverse()"#), "cba");
}

#[test]
fn byte_and_char_round_trip() {
    assert_eq!(int_results(r#"return ("A"):byte()"#), vec![65]);
    assert_eq!(int_results(r#"return ("ABC"):byte(1, 3)"#), vec![65, 66, 67]);
    assert_eq!(str_result("return string.char(104, 105)"), "hi");
    run_ok(
        r##"
        local s = "lunar"
        assert(string.char(s:byte(1, -1)) == s)
    "##,
    );
}

#[test]
fn plain_find() {
    run_ok(
        r##"
        local s = "the quick brown fox"
        local i, j = s:find("quick")
        assert(i == 5 and j == 9)
        assert(s:find("missing") == nil)
        local i2 = s:find("the")
        assert(i2 == 1)
        -- init offset
        local i3 = s:find("o", 14)
        assert(i3 == 18)
    "##,
    );
}

#[test]
fn format_conversions() {
    assert_eq!(str_result(r#"return string.format("%d+%d=%d", 2, 3, 5)"#), "2+3=5");
    assert_eq!(str_result(r#"return string.format("%5d", 42)"#), "   42");
    assert_eq!(str_result(r#"return string.format("%-5d|", 42)"#), "42   |");
    assert_eq!(str_result(r#"return string.format("%05d", 42)"#), "00042");
    assert_eq!(str_result(r#"return string.format("%x %X", 255, 255)"#), "ff FF");
    assert_eq!(str_result(r#"return string.format("%.2f", 1.0 / 3.0)"#), "0.33");
    assert_eq!(str_result(r#"return string.format("%s and %s", "a", "b")"#), "a and b");
    assert_eq!(str_result(r#"return string.format("100%%")"#), "100%");
    assert_eq!(str_result(r#"return string.format("%c%c", 104, 105)"#), "hi");
    assert_eq!(str_result(r#"return string.format("%.3s", "abcdef")"#), "abc");
}

#[test]
fn format_q_round_trips() {
    run_ok(
        r##"
        local original = "line\nquote\" back\\slash"
        local quoted = string.format("%q", original)
        local back = load("return " .. quoted)()
        assert(back == original)
        assert(load("return " .. string.format("%q", 123))() == 123)
    "##,
    );
}

#[test]
fn tostring_number_law() {
    // tonumber(tostring(n)) == n for integers and printable floats.
    run_ok(
        r##"
        for _, n in ipairs({0, 1, -1, 42, math.maxinteger, math.mininteger}) do
            assert(tonumber(tostring(n)) == n)
        end
        for _, n in ipairs({0.5, -3.25, 1e100, 123.456}) do
            assert(tonumber(tostring(n)) == n)
        end
    "##,
    );
}

#[test]
fn strings_are_byte_sequences() {
    run_ok(
        r##"
        local s = "\xff\x00\x01"
        assert(#s == 3)
        assert(s:byte(1) == 255)
        assert(s:byte(2) == 0)
    "##,
    );
}

#[test]
fn method_syntax_via_string_metatable() {
    assert_eq!(str_result(r#"local s = "chain" return s:upper():lower():sub(1, 2)"#), "ch");
}
