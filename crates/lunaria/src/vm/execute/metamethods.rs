// Metamethod events and their dispatch. The first six events are covered
// by the per-metatable absence cache; everything else always queries.

use crate::value::LuaValue;
use crate::vm::{LuaResult, LuaState, OpCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TmKind {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    Eq, // last event with an absence-cache bit

    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,

    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    Close,
    ToString,
    Metatable,
    Name,
    Pairs,
}

impl TmKind {
    pub const ALL: [TmKind; 29] = [
        TmKind::Index,
        TmKind::NewIndex,
        TmKind::Gc,
        TmKind::Mode,
        TmKind::Len,
        TmKind::Eq,
        TmKind::Add,
        TmKind::Sub,
        TmKind::Mul,
        TmKind::Mod,
        TmKind::Pow,
        TmKind::Div,
        TmKind::IDiv,
        TmKind::BAnd,
        TmKind::BOr,
        TmKind::BXor,
        TmKind::Shl,
        TmKind::Shr,
        TmKind::Unm,
        TmKind::BNot,
        TmKind::Lt,
        TmKind::Le,
        TmKind::Concat,
        TmKind::Call,
        TmKind::Close,
        TmKind::ToString,
        TmKind::Metatable,
        TmKind::Name,
        TmKind::Pairs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TmKind::Index => "__index",
            TmKind::NewIndex => "__newindex",
            TmKind::Gc => "__gc",
            TmKind::Mode => "__mode",
            TmKind::Len => "__len",
            TmKind::Eq => "__eq",
            TmKind::Add => "__add",
            TmKind::Sub => "__sub",
            TmKind::Mul => "__mul",
            TmKind::Mod => "__mod",
            TmKind::Pow => "__pow",
            TmKind::Div => "__div",
            TmKind::IDiv => "__idiv",
            TmKind::BAnd => "__band",
            TmKind::BOr => "__bor",
            TmKind::BXor => "__bxor",
            TmKind::Shl => "__shl",
            TmKind::Shr => "__shr",
            TmKind::Unm => "__unm",
            TmKind::BNot => "__bnot",
            TmKind::Lt => "__lt",
            TmKind::Le => "__le",
            TmKind::Concat => "__concat",
            TmKind::Call => "__call",
            TmKind::Close => "__close",
            TmKind::ToString => "__tostring",
            TmKind::Metatable => "__metatable",
            TmKind::Name => "__name",
            TmKind::Pairs => "__pairs",
        }
    }

    /// Events whose absence can be cached in a metatable's flag byte.
    #[inline(always)]
    pub fn cacheable(self) -> bool {
        (self as u8) <= (TmKind::Eq as u8)
    }

    /// Operator event names without the underscores, for error text.
    pub fn op_name(self) -> &'static str {
        match self {
            TmKind::Add => "add",
            TmKind::Sub => "sub",
            TmKind::Mul => "mul",
            TmKind::Mod => "mod",
            TmKind::Pow => "pow",
            TmKind::Div => "div",
            TmKind::IDiv => "idiv",
            TmKind::BAnd | TmKind::BOr | TmKind::BXor | TmKind::Shl | TmKind::Shr => {
                "bitwise operation"
            }
            TmKind::Unm => "unm",
            TmKind::BNot => "bnot",
            TmKind::Concat => "concatenate",
            TmKind::Len => "get length of",
            _ => "operate on",
        }
    }

    /// Event for a register-form or K-form arithmetic opcode.
    pub fn of_arith_op(op: OpCode) -> TmKind {
        let base = match op {
            o if (OpCode::Add as u8..=OpCode::Shr as u8).contains(&(o as u8)) => {
                (o as u8) - OpCode::Add as u8
            }
            o if (OpCode::AddK as u8..=OpCode::BXorK as u8).contains(&(o as u8)) => {
                (o as u8) - OpCode::AddK as u8
            }
            OpCode::AddI => 0,
            OpCode::ShlI => TmKind::Shl as u8 - TmKind::Add as u8,
            OpCode::ShrI => TmKind::Shr as u8 - TmKind::Add as u8,
            _ => unreachable!("not an arithmetic opcode"),
        };
        let raw = TmKind::Add as u8 + base;
        debug_assert!(raw <= TmKind::Shr as u8);
        unsafe { std::mem::transmute(raw) }
    }
}

impl LuaState {
    /// The metamethod governing event `tm` on `v`, or nil.
    pub fn get_metamethod(&self, v: &LuaValue, tm: TmKind) -> LuaValue {
        let g = self.g();
        match g.metatable_of(v) {
            Some(mt) => g.fast_metamethod(mt, tm).unwrap_or(LuaValue::nil()),
            None => LuaValue::nil(),
        }
    }

    /// Binary metamethod dispatch: tries `a`'s handler then `b`'s, calls
    /// it with (a, b), and yields the single result.
    pub(crate) fn try_bin_metamethod(
        &mut self,
        tm: TmKind,
        a: LuaValue,
        b: LuaValue,
    ) -> LuaResult<LuaValue> {
        let mut h = self.get_metamethod(&a, tm);
        if h.is_nil() {
            h = self.get_metamethod(&b, tm);
        }
        if h.is_nil() {
            // Pick the offending operand for the message, preferring the
            // non-numeric one.
            let bad = if a.is_number() || (a.is_string() && matches!(tm, TmKind::Concat)) {
                b
            } else {
                a
            };
            return if matches!(
                tm,
                TmKind::BAnd | TmKind::BOr | TmKind::BXor | TmKind::Shl | TmKind::Shr | TmKind::BNot
            ) {
                if bad.is_number() {
                    Err(self.rt_error("number has no integer representation".to_string()))
                } else {
                    Err(self.rt_error(format!(
                        "attempt to perform bitwise operation on a {} value",
                        bad.type_name()
                    )))
                }
            } else if matches!(tm, TmKind::Concat) {
                Err(self.rt_error(format!("attempt to concatenate a {} value", bad.type_name())))
            } else {
                Err(self.rt_error(format!(
                    "attempt to perform arithmetic on a {} value",
                    bad.type_name()
                )))
            };
        }
        let mut res = self.call_value(h, &[a, b], 1)?;
        Ok(res.drain(..).next().unwrap_or(LuaValue::nil()))
    }

    /// Order metamethod: `__lt`/`__le` over (a, b), result as truth.
    pub(crate) fn try_order_metamethod(
        &mut self,
        tm: TmKind,
        a: LuaValue,
        b: LuaValue,
    ) -> LuaResult<bool> {
        let mut h = self.get_metamethod(&a, tm);
        if h.is_nil() {
            h = self.get_metamethod(&b, tm);
        }
        if h.is_nil() {
            if tm == TmKind::Le && self.g().options.lt_for_le {
                // Legacy derivation: a <= b  <=>  not (b < a).
                return Ok(!self.lt_values(b, a)?);
            }
            let (t1, t2) = (a.type_name(), b.type_name());
            return Err(if t1 == t2 {
                self.rt_error(format!("attempt to compare two {} values", t1))
            } else {
                self.rt_error(format!("attempt to compare {} with {}", t1, t2))
            });
        }
        let mut res = self.call_value(h, &[a, b], 1)?;
        Ok(res.drain(..).next().unwrap_or(LuaValue::nil()).is_truthy())
    }
}
