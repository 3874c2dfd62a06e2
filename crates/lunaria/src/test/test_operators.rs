// Numeric semantics: two's-complement integers, IEEE floats, floor
// division, shifts, and the comparison rules across the int/float line.

use crate::test::{bool_results, int_results, run, run_err, run_ok, str_result};

#[test]
fn integer_arithmetic_wraps() {
    run_ok(
        r##"
        assert(math.maxinteger + 1 == math.mininteger)
        assert(math.mininteger - 1 == math.maxinteger)
        assert(math.mininteger // -1 == math.mininteger)
        assert(math.mininteger % -1 == 0)
    "##,
    );
}

#[test]
fn floor_division_and_modulo() {
    assert_eq!(int_results("return 7 // 2, -7 // 2, 7 // -2, -7 // -2"), vec![3, -4, -4, 3]);
    assert_eq!(int_results("return 7 % 3, -7 % 3, 7 % -3, -7 % -3"), vec![1, 2, -2, -1]);
    run_ok("assert(7.0 // 2.0 == 3.0) assert(math.type(7.0 // 2) == 'float')");
    run_ok("assert(5.5 % -2.0 == -0.5)");
}

#[test]
fn division_by_zero() {
    // Integer division by zero raises; float yields infinities.
    let msg = run_err("local a = 1 local b = 0 return a // b");
    assert!(msg.contains("n//0"), "{}", msg);
    let msg = run_err("local a = 1 local b = 0 return a % b");
    assert!(msg.contains("n%0"), "{}", msg);
    assert_eq!(str_result("return 1.0 / 0"), "inf");
    assert_eq!(str_result("return -1.0 / 0"), "-inf");
    run_ok("local r = 0.0 / 0.0 assert(r ~= r)");
}

#[test]
fn mixed_arithmetic_types() {
    run_ok(
        r##"
        assert(math.type(1 + 1) == "integer")
        assert(math.type(1 + 1.0) == "float")
        assert(math.type(2 / 1) == "float")
        assert(math.type(2 ^ 2) == "float")
        assert(2 ^ 10 == 1024.0)
    "##,
    );
}

#[test]
fn string_coercion_in_arithmetic() {
    assert_eq!(int_results(r#"return "10" + 5"#), vec![15]);
    run_ok(r#"assert("0x10" + 0 == 16)"#);
    let msg = run_err(r#"return {} + 1"#);
    assert!(msg.contains("perform arithmetic"), "{}", msg);
}

#[test]
fn bitwise_semantics() {
    assert_eq!(int_results("return 5 & 3, 5 | 3, 5 ~ 3, ~0"), vec![1, 7, 6, -1]);
    assert_eq!(int_results("return 1 << 4, 256 >> 4"), vec![16, 16]);
    // Shift counts beyond the width drain to zero; negative reverses.
    assert_eq!(int_results("return 1 << 64, 1 << 100, 8 >> -1"), vec![0, 0, 16]);
    run_ok("assert(-1 >> 1 == math.maxinteger)");
    // Exact floats convert; fractional ones refuse.
    assert_eq!(int_results("return 3.0 & 1"), vec![1]);
    let msg = run_err("return 3.5 & 1");
    assert!(msg.contains("no integer representation"), "{}", msg);
}

#[test]
fn comparison_rules() {
    assert_eq!(
        bool_results("return 1 < 2, 2 <= 2, 3 > 2, 2 >= 3, 1 == 1.0, 1 ~= 2"),
        vec![true, true, true, false, true, true]
    );
    run_ok(
        r##"
        -- NaN compares false with everything, including itself.
        local nan = 0.0 / 0.0
        assert(not (nan < nan))
        assert(not (nan <= nan))
        assert(nan ~= nan)
        -- Exact comparison across the int/float divide.
        assert(math.maxinteger < math.huge)
        assert(math.mininteger > -math.huge)
        assert(not (math.maxinteger < 2.0 ^ 62))
    "##,
    );
    run_ok(r#"assert("abc" < "abd") assert("abc" < "abcd") assert(not ("b" < "a"))"#);
    let msg = run_err(r#"return 1 < "2""#);
    assert!(msg.contains("attempt to compare"), "{}", msg);
}

#[test]
fn concat_and_len() {
    assert_eq!(str_result(r#"return "a" .. "b" .. "c""#), "abc");
    assert_eq!(str_result(r#"return "n=" .. 5"#), "n=5");
    assert_eq!(str_result(r#"return 1 .. 2"#), "12");
    assert_eq!(int_results(r#"return #"hello", #({1,2,3})"#), vec![5, 3]);
    let msg = run_err("return {} .. 'x'");
    assert!(msg.contains("concatenate"), "{}", msg);
}

#[test]
fn unary_operators() {
    assert_eq!(int_results("local a = 5 return -a, ~a"), vec![-5, -6]);
    assert_eq!(bool_results("return not nil, not false, not 0, not ''"),
        vec![true, true, false, false]);
}

#[test]
fn integer_float_equality_is_exact() {
    run_ok(
        r##"
        -- 2^53 + 1 is not representable as a float.
        local big = 9007199254740993
        assert(big ~= 9007199254740992.0)
        assert(math.maxinteger ~= math.maxinteger + 0.0)
        assert(2^53 == 9007199254740992)
    "##,
    );
}

#[test]
fn constant_folding_preserves_semantics() {
    // These fold at compile time; results must match runtime rules.
    assert_eq!(int_results("return 2 + 3 * 4, (2 + 3) * 4"), vec![14, 20]);
    run_ok("assert(2.0 * 0.5 == 1.0) assert(math.type(2 * 0.5) == 'float')");
    assert_eq!(int_results("return 7 // 2 + 0"), vec![3]);
    run_ok("assert(1/4 == 0.25)");
}

#[test]
fn float_to_int_boundaries() {
    run_ok(
        r##"
        assert(math.floor(3.5) == 3)
        assert(math.ceil(3.5) == 4)
        assert(math.floor(-3.5) == -4)
        assert(math.ceil(-3.5) == -3)
        assert(math.type(math.floor(3.5)) == "integer")
        assert(math.tointeger(7.0) == 7)
        assert(math.tointeger(7.5) == nil)
        assert(math.tointeger("8") == nil)
    "##,
    );
}

#[test]
fn numeric_for_loops() {
    assert_eq!(int_results(
        "local s = 0 for i = 1, 10 do s = s + i end return s"), vec![55]);
    assert_eq!(int_results(
        "local s = 0 for i = 10, 1, -2 do s = s + i end return s"), vec![30]);
    assert_eq!(int_results(
        "local n = 0 for i = 1, 0 do n = n + 1 end return n"), vec![0]);
    run_ok(
        r##"
        local s = 0.0
        for x = 1.0, 2.0, 0.5 do s = s + x end
        assert(s == 4.5)
    "##,
    );
    let msg = run_err("for i = 1, 10, 0 do end");
    assert!(msg.contains("'for' step is zero"), "{}", msg);
    // The loop counter survives wrapping limits.
    run_ok(
        r##"
        local n = 0
        for i = math.maxinteger - 2, math.maxinteger do n = n + 1 end
        assert(n == 3)
    "##,
    );
}

#[test]
fn integer_float_boundary() {
    let (vm, values) = run("return math.type(1), math.type(1.0), 1 == 1.0, 1.0 / 0");
    assert_eq!(vm.main_state_ref().to_display(&values[0]), "integer");
    assert_eq!(vm.main_state_ref().to_display(&values[1]), "float");
    assert!(values[2].as_boolean());
    assert_eq!(vm.main_state_ref().to_display(&values[3]), "inf");
    let msg = run_err("local one = 1 return one // 0");
    assert!(msg.contains("n//0"), "{}", msg);
}
