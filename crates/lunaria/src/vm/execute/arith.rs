// Arithmetic and bitwise semantics: integer ops wrap in two's
// complement, floor division and modulo take the divisor's sign, floats
// follow IEEE-754, and anything else falls back to metamethods.

use crate::limits::{LuaFloat, LuaInt};
use crate::value::convert::{self, F2IMode};
use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{LuaResult, LuaState};

/// A numeric operand after coercion.
#[derive(Clone, Copy)]
pub(crate) enum Num {
    Int(LuaInt),
    Float(LuaFloat),
}

impl LuaState {
    /// Arithmetic operand coercion: numbers, or strings spelling numbers.
    pub(crate) fn coerce_num(&self, v: &LuaValue) -> Option<Num> {
        if v.is_integer() {
            Some(Num::Int(v.as_integer()))
        } else if v.is_float() {
            Some(Num::Float(v.as_float()))
        } else if v.is_string() {
            let s = self.g().pool.str_utf8(v.as_string_id());
            match convert::str_to_number(&s)? {
                convert::Number::Int(i) => Some(Num::Int(i)),
                convert::Number::Float(f) => Some(Num::Float(f)),
            }
        } else {
            None
        }
    }

    /// Bitwise operand coercion: integers, exact floats, numeric strings.
    pub(crate) fn coerce_int(&self, v: &LuaValue) -> Option<LuaInt> {
        if v.is_integer() {
            Some(v.as_integer())
        } else if v.is_float() {
            convert::float_to_int(v.as_float(), F2IMode::Exact)
        } else if v.is_string() {
            self.to_integer(v)
        } else {
            None
        }
    }

    /// Raw arithmetic fast path. `None` means "dispatch the metamethod";
    /// `Some(Err(..))` is a hard failure (division by zero).
    pub(crate) fn raw_arith(
        &mut self,
        tm: TmKind,
        a: &LuaValue,
        b: &LuaValue,
    ) -> Option<LuaResult<LuaValue>> {
        use TmKind::*;
        match tm {
            Add | Sub | Mul | Mod | IDiv => {
                let (na, nb) = (self.coerce_num(a)?, self.coerce_num(b)?);
                match (na, nb) {
                    (Num::Int(x), Num::Int(y)) => Some(self.int_arith(tm, x, y)),
                    _ => {
                        let x = num_to_float(na);
                        let y = num_to_float(nb);
                        Some(Ok(LuaValue::float(float_arith(tm, x, y))))
                    }
                }
            }
            Div | Pow => {
                let x = num_to_float(self.coerce_num(a)?);
                let y = num_to_float(self.coerce_num(b)?);
                Some(Ok(LuaValue::float(float_arith(tm, x, y))))
            }
            BAnd | BOr | BXor | Shl | Shr => {
                let x = self.coerce_int(a)?;
                let y = self.coerce_int(b)?;
                let r = match tm {
                    BAnd => x & y,
                    BOr => x | y,
                    BXor => x ^ y,
                    Shl => shift_left(x, y),
                    Shr => shift_left(x, y.wrapping_neg()),
                    _ => unreachable!(),
                };
                Some(Ok(LuaValue::integer(r)))
            }
            Unm => match self.coerce_num(a)? {
                Num::Int(x) => Some(Ok(LuaValue::integer(x.wrapping_neg()))),
                Num::Float(x) => Some(Ok(LuaValue::float(-x))),
            },
            BNot => {
                let x = self.coerce_int(a)?;
                Some(Ok(LuaValue::integer(!x)))
            }
            _ => unreachable!("not an arithmetic event"),
        }
    }

    fn int_arith(&mut self, tm: TmKind, x: LuaInt, y: LuaInt) -> LuaResult<LuaValue> {
        let r = match tm {
            TmKind::Add => x.wrapping_add(y),
            TmKind::Sub => x.wrapping_sub(y),
            TmKind::Mul => x.wrapping_mul(y),
            TmKind::IDiv => {
                if y == 0 {
                    return Err(self.rt_error("attempt to perform 'n//0'".to_string()));
                }
                floor_div(x, y)
            }
            TmKind::Mod => {
                if y == 0 {
                    return Err(self.rt_error("attempt to perform 'n%0'".to_string()));
                }
                floor_mod(x, y)
            }
            _ => unreachable!(),
        };
        Ok(LuaValue::integer(r))
    }

    /// Full arithmetic: fast path, then metamethods.
    pub(crate) fn do_arith(
        &mut self,
        tm: TmKind,
        a: LuaValue,
        b: LuaValue,
    ) -> LuaResult<LuaValue> {
        match self.raw_arith(tm, &a, &b) {
            Some(r) => r,
            None => self.try_bin_metamethod(tm, a, b),
        }
    }
}

#[inline]
pub(crate) fn num_to_float(n: Num) -> LuaFloat {
    match n {
        Num::Int(i) => i as LuaFloat,
        Num::Float(f) => f,
    }
}

pub(crate) fn float_arith(tm: TmKind, x: LuaFloat, y: LuaFloat) -> LuaFloat {
    match tm {
        TmKind::Add => x + y,
        TmKind::Sub => x - y,
        TmKind::Mul => x * y,
        TmKind::Div => x / y,
        TmKind::Pow => x.powf(y),
        TmKind::IDiv => (x / y).floor(),
        TmKind::Mod => {
            // Result takes the divisor's sign, unlike fmod.
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r }
        }
        _ => unreachable!(),
    }
}

/// Floor division: rounds toward minus infinity; MIN / -1 wraps.
#[inline]
pub(crate) fn floor_div(x: LuaInt, y: LuaInt) -> LuaInt {
    let q = x.wrapping_div(y);
    if (x ^ y) < 0 && q.wrapping_mul(y) != x { q - 1 } else { q }
}

/// Modulo with the divisor's sign.
#[inline]
pub(crate) fn floor_mod(x: LuaInt, y: LuaInt) -> LuaInt {
    let r = x.wrapping_rem(y);
    if r != 0 && (r ^ y) < 0 { r + y } else { r }
}

/// Shift with Lua semantics: counts >= 64 produce 0, negative counts
/// shift the other way, and right shifts are logical.
#[inline]
pub(crate) fn shift_left(x: LuaInt, n: LuaInt) -> LuaInt {
    if n < 0 {
        if n <= -64 { 0 } else { ((x as u64) >> (-n as u32)) as LuaInt }
    } else if n >= 64 {
        0
    } else {
        ((x as u64) << (n as u32)) as LuaInt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_division_signs() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
        // MIN // -1 wraps instead of trapping.
        assert_eq!(floor_div(LuaInt::MIN, -1), LuaInt::MIN);
    }

    #[test]
    fn modulo_takes_divisor_sign() {
        assert_eq!(floor_mod(7, 3), 1);
        assert_eq!(floor_mod(-7, 3), 2);
        assert_eq!(floor_mod(7, -3), -2);
        assert_eq!(floor_mod(-7, -3), -1);
        assert_eq!(floor_mod(LuaInt::MIN, -1), 0);
    }

    #[test]
    fn shifts_saturate_at_width() {
        assert_eq!(shift_left(1, 4), 16);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(-1, -1), LuaInt::MAX);
        assert_eq!(shift_left(16, -4), 1);
        assert_eq!(shift_left(1, -64), 0);
    }

    #[test]
    fn float_mod_sign() {
        let r = float_arith(TmKind::Mod, 5.5, -2.0);
        assert!((r - -0.5).abs() < 1e-12);
    }
}
