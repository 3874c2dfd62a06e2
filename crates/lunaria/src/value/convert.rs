// Numeric conversions: string <-> number in Lua's formats, and the three
// float-to-integer coercion modes.

use crate::limits::{LuaFloat, LuaInt};

/// Float-to-integer coercion mode, selected by the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F2IMode {
    /// Accept only exact integral floats.
    Exact,
    /// Round toward minus infinity.
    Floor,
    /// Round toward plus infinity.
    Ceil,
}

/// Converts a float to an integer under `mode`. Fails on NaN, infinities,
/// out-of-range values, and (in `Exact` mode) fractional values.
pub fn float_to_int(n: LuaFloat, mode: F2IMode) -> Option<LuaInt> {
    let f = match mode {
        F2IMode::Exact => {
            if n.floor() != n {
                return None;
            }
            n
        }
        F2IMode::Floor => n.floor(),
        F2IMode::Ceil => n.ceil(),
    };
    // 2^63 as f64 is exact; the valid doubles are [-2^63, 2^63).
    if f >= -(LuaInt::MIN as LuaFloat) || f < LuaInt::MIN as LuaFloat || f.is_nan() {
        return None;
    }
    Some(f as LuaInt)
}

/// Parsed numeric literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(LuaInt),
    Float(LuaFloat),
}

/// Parses a complete string as a Lua number: optional sign, decimal or
/// `0x`/`0X` hexadecimal, with fraction and exponent in either base.
/// Surrounding ASCII whitespace is permitted; anything else fails.
pub fn str_to_number(s: &str) -> Option<Number> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if body.is_empty() {
        return None;
    }
    let parsed = if body.len() > 2 && (body.starts_with("0x") || body.starts_with("0X")) {
        parse_hex(&body[2..])?
    } else {
        parse_dec(body)?
    };
    Some(match parsed {
        Number::Int(i) => {
            if neg {
                Number::Int(i.wrapping_neg())
            } else {
                Number::Int(i)
            }
        }
        Number::Float(f) => Number::Float(if neg { -f } else { f }),
    })
}

/// Strict integer parse: like `str_to_number` but rejects any fractional
/// or exponent form, even when the value would be integral. (Fractional
/// forms always parse as floats, so matching on `Int` is sufficient.)
pub fn str_to_int(s: &str) -> Option<LuaInt> {
    match str_to_number(s)? {
        Number::Int(i) => Some(i),
        Number::Float(_) => None,
    }
}

fn parse_dec(s: &str) -> Option<Number> {
    let b = s.as_bytes();
    let mut has_digit = false;
    let mut is_float = false;
    for &c in b {
        match c {
            b'0'..=b'9' => has_digit = true,
            b'.' | b'e' | b'E' | b'+' | b'-' => is_float = true,
            _ => return None,
        }
    }
    if !has_digit {
        return None;
    }
    if !is_float {
        // Integer if it fits; overflowing decimal literals become floats.
        if let Ok(i) = s.parse::<LuaInt>() {
            return Some(Number::Int(i));
        }
    }
    s.parse::<LuaFloat>().ok().filter(|f| f.is_finite() || is_float).map(Number::Float)
}

fn parse_hex(s: &str) -> Option<Number> {
    let b = s.as_bytes();
    let mut mantissa: u64 = 0;
    let mut sig_digits = 0usize; // significant hex digits consumed
    let mut any_digit = false;
    let mut exp_shift: i32 = 0; // binary exponent from overflow / fraction
    let mut seen_dot = false;
    let mut i = 0;
    while i < b.len() {
        let c = b[i];
        if c == b'.' {
            if seen_dot {
                return None;
            }
            seen_dot = true;
        } else if let Some(d) = (c as char).to_digit(16) {
            any_digit = true;
            if mantissa == 0 && d == 0 {
                // Leading zero: contributes only to a fraction's scale.
                if seen_dot {
                    exp_shift -= 4;
                }
            } else if sig_digits < 16 {
                mantissa = mantissa * 16 + d as u64;
                sig_digits += 1;
                if seen_dot {
                    exp_shift -= 4;
                }
            } else if !seen_dot {
                exp_shift += 4;
            }
        } else if c == b'p' || c == b'P' {
            // Binary exponent: hex float.
            if !any_digit {
                return None;
            }
            let rest = &s[i + 1..];
            let p: i32 = rest.parse().ok()?;
            let val = mantissa as LuaFloat * (2.0f64).powi(exp_shift + p);
            return Some(Number::Float(val));
        } else {
            return None;
        }
        i += 1;
    }
    if !any_digit {
        return None;
    }
    if seen_dot || exp_shift != 0 {
        return Some(Number::Float(mantissa as LuaFloat * (2.0f64).powi(exp_shift)));
    }
    // Plain hex integer: wraps modulo 2^64 like the reference lexer.
    let mut v: u64 = 0;
    for &c in b {
        let d = (c as char).to_digit(16)?;
        v = v.wrapping_mul(16).wrapping_add(d as u64);
    }
    Some(Number::Int(v as LuaInt))
}

/// Renders an integer using `itoa` (hot path for `tostring` and concat).
pub fn int_to_str(i: LuaInt) -> String {
    let mut buf = itoa::Buffer::new();
    buf.format(i).to_string()
}

/// Renders a float the way `%.14g` does, with a trailing `.0` appended to
/// integral results so floats stay visibly floats.
pub fn float_to_str(n: LuaFloat) -> String {
    if n.is_nan() {
        // Sign of NaN is not observable through arithmetic; print the
        // canonical form.
        return if n.is_sign_negative() { "-nan".to_string() } else { "nan".to_string() };
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf".to_string() } else { "inf".to_string() };
    }
    let mut s = format_g(n, 14);
    if !s.contains(['.', 'e', 'n', 'i']) {
        s.push_str(".0");
    }
    s
}

/// Minimal `%.<prec>g`: significant-digit formatting with the shorter of
/// fixed/exponential notation and trailing zeros trimmed.
pub fn format_g(n: LuaFloat, prec: usize) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    let exp = n.abs().log10().floor() as i32;
    if exp < -4 || exp >= prec as i32 {
        // Exponential notation, e.g. 1.5e+20.
        let mut s = format!("{:.*e}", prec.saturating_sub(1), n);
        // Rust prints `1.5e20`; normalize to `1.5e+20` and trim zeros.
        if let Some(epos) = s.find('e') {
            let (mant, e) = s.split_at(epos);
            let mant = trim_zeros(mant);
            let exp_num: i32 = e[1..].parse().unwrap_or(0);
            s = format!("{}e{}{:02}", mant, if exp_num < 0 { '-' } else { '+' }, exp_num.abs());
        }
        s
    } else {
        let decimals = (prec as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, n);
        trim_zeros(&s).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_int_modes() {
        assert_eq!(float_to_int(3.0, F2IMode::Exact), Some(3));
        assert_eq!(float_to_int(3.5, F2IMode::Exact), None);
        assert_eq!(float_to_int(3.5, F2IMode::Floor), Some(3));
        assert_eq!(float_to_int(3.5, F2IMode::Ceil), Some(4));
        assert_eq!(float_to_int(-3.5, F2IMode::Floor), Some(-4));
        assert_eq!(float_to_int(-3.5, F2IMode::Ceil), Some(-3));
        assert_eq!(float_to_int(f64::NAN, F2IMode::Floor), None);
        assert_eq!(float_to_int(1e300, F2IMode::Floor), None);
        assert_eq!(float_to_int(-(LuaInt::MIN as f64), F2IMode::Exact), None);
        assert_eq!(float_to_int(LuaInt::MIN as f64, F2IMode::Exact), Some(LuaInt::MIN));
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(str_to_number("123"), Some(Number::Int(123)));
        assert_eq!(str_to_number("  -7  "), Some(Number::Int(-7)));
        assert_eq!(str_to_number("3.5"), Some(Number::Float(3.5)));
        assert_eq!(str_to_number("1e2"), Some(Number::Float(100.0)));
        assert_eq!(str_to_number("0x10"), Some(Number::Int(16)));
        assert_eq!(str_to_number("-0xff"), Some(Number::Int(-255)));
        assert_eq!(str_to_number(""), None);
        assert_eq!(str_to_number("12a"), None);
        assert_eq!(str_to_number("1 2"), None);
    }

    #[test]
    fn hex_float_parsing() {
        assert_eq!(str_to_number("0x1p4"), Some(Number::Float(16.0)));
        assert_eq!(str_to_number("0x.8"), Some(Number::Float(0.5)));
        assert_eq!(str_to_number("0xA.8"), Some(Number::Float(10.5)));
    }

    #[test]
    fn strict_int_rejects_fractions() {
        assert_eq!(str_to_int("10"), Some(10));
        assert_eq!(str_to_int("10.0"), None);
        assert_eq!(str_to_int("1e1"), None);
        assert_eq!(str_to_int("0x10"), Some(16));
    }

    #[test]
    fn float_formatting() {
        assert_eq!(float_to_str(1.0), "1.0");
        assert_eq!(float_to_str(3.14), "3.14");
        assert_eq!(float_to_str(0.5), "0.5");
        assert_eq!(float_to_str(f64::INFINITY), "inf");
        assert_eq!(float_to_str(-f64::INFINITY), "-inf");
        assert_eq!(float_to_str(0.0), "0.0");
        // tonumber(tostring(n)) == n for representable values
        for &n in &[0.1, 123.456, 1e100, -2.5e-7] {
            let s = float_to_str(n);
            match str_to_number(&s) {
                Some(Number::Float(back)) => assert_eq!(back, n, "{}", s),
                other => panic!("reparse of {} gave {:?}", s, other),
            }
        }
    }
}
