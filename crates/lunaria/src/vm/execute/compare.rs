// Comparison semantics. Numbers compare exactly across the int/float
// divide (no precision loss on large integers), strings compare as byte
// sequences, everything else goes to `__eq`/`__lt`/`__le`.

use crate::limits::{LuaFloat, LuaInt};
use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{LuaResult, LuaState};

/// 2^63 as a float, the first value beyond i64 range.
const TWO_POW_63: LuaFloat = 9_223_372_036_854_775_808.0;

/// Exact `i < f`, correct even where f64 cannot represent the integer.
pub(crate) fn int_lt_float(i: LuaInt, f: LuaFloat) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    // f is in i64 range; floor(f) fits.
    let g = f.floor();
    (i < g as LuaInt) || (i == g as LuaInt && f > g)
}

pub(crate) fn int_le_float(i: LuaInt, f: LuaFloat) -> bool {
    if f.is_nan() {
        return false;
    }
    if f >= TWO_POW_63 {
        return true;
    }
    if f < -TWO_POW_63 {
        return false;
    }
    let g = f.floor();
    i <= g as LuaInt
}

pub(crate) fn float_lt_int(f: LuaFloat, i: LuaInt) -> bool {
    if f.is_nan() {
        return false;
    }
    !int_le_float(i, f)
}

pub(crate) fn float_le_int(f: LuaFloat, i: LuaInt) -> bool {
    if f.is_nan() {
        return false;
    }
    !int_lt_float(i, f)
}

/// Numeric `<` over any mix of int and float.
pub(crate) fn num_lt(a: &LuaValue, b: &LuaValue) -> bool {
    debug_assert!(a.is_number() && b.is_number());
    if a.is_integer() {
        if b.is_integer() {
            a.as_integer() < b.as_integer()
        } else {
            int_lt_float(a.as_integer(), b.as_float())
        }
    } else if b.is_integer() {
        float_lt_int(a.as_float(), b.as_integer())
    } else {
        a.as_float() < b.as_float()
    }
}

pub(crate) fn num_le(a: &LuaValue, b: &LuaValue) -> bool {
    debug_assert!(a.is_number() && b.is_number());
    if a.is_integer() {
        if b.is_integer() {
            a.as_integer() <= b.as_integer()
        } else {
            int_le_float(a.as_integer(), b.as_float())
        }
    } else if b.is_integer() {
        float_le_int(a.as_float(), b.as_integer())
    } else {
        a.as_float() <= b.as_float()
    }
}

impl LuaState {
    /// `a < b` with metamethod fallback.
    pub(crate) fn lt_values(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if a.is_number() && b.is_number() {
            return Ok(num_lt(&a, &b));
        }
        if a.is_string() && b.is_string() {
            let g = self.g();
            return Ok(g.pool.str_bytes(a.as_string_id()) < g.pool.str_bytes(b.as_string_id()));
        }
        self.try_order_metamethod(TmKind::Lt, a, b)
    }

    /// `a <= b` with metamethod fallback.
    pub(crate) fn le_values(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if a.is_number() && b.is_number() {
            return Ok(num_le(&a, &b));
        }
        if a.is_string() && b.is_string() {
            let g = self.g();
            return Ok(g.pool.str_bytes(a.as_string_id()) <= g.pool.str_bytes(b.as_string_id()));
        }
        self.try_order_metamethod(TmKind::Le, a, b)
    }

    /// `a == b`: raw equality first, then `__eq`, which runs only when
    /// both operands are tables or both are full userdata.
    pub(crate) fn eq_values(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if self.g().pool.values_equal(&a, &b) {
            return Ok(true);
        }
        let both_tables = a.is_table() && b.is_table();
        let both_udata = a.is_full_userdata() && b.is_full_userdata();
        if !both_tables && !both_udata {
            return Ok(false);
        }
        let mut h = self.get_metamethod(&a, TmKind::Eq);
        if h.is_nil() {
            h = self.get_metamethod(&b, TmKind::Eq);
        }
        if h.is_nil() {
            return Ok(false);
        }
        let mut res = self.call_value(h, &[a, b], 1)?;
        Ok(res.drain(..).next().unwrap_or(LuaValue::nil()).is_truthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_large_integer_comparisons() {
        // 2^63 - 1 is not representable as f64; its nearest double is 2^63.
        let max = LuaInt::MAX;
        assert!(int_lt_float(max, TWO_POW_63));
        assert!(!int_le_float(max, (max - 512) as LuaFloat - 1024.0));
        assert!(float_lt_int((max as LuaFloat) - 2048.0, max));
        assert!(int_le_float(5, 5.0));
        assert!(!int_lt_float(5, 5.0));
        assert!(int_lt_float(5, 5.5));
    }

    #[test]
    fn nan_comparisons_false() {
        let nan = f64::NAN;
        assert!(!int_lt_float(0, nan));
        assert!(!int_le_float(0, nan));
        assert!(!float_lt_int(nan, 0));
        assert!(!float_le_int(nan, 0));
    }

    #[test]
    fn mixed_numeric_order() {
        assert!(num_lt(&LuaValue::integer(1), &LuaValue::float(1.5)));
        assert!(num_le(&LuaValue::float(2.0), &LuaValue::integer(2)));
        assert!(!num_lt(&LuaValue::float(2.0), &LuaValue::integer(2)));
    }
}
