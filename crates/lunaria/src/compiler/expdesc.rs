// Expression descriptors: the single-pass code generator's currency.
// An expression is parsed into one of these states and only materialized
// into registers when its context demands it. The `t`/`f` fields chain
// pending jumps for short-circuit evaluation.

use crate::gc::StringId;

pub const NO_JUMP: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpKind {
    /// No value (empty expression list slot).
    Void,
    Nil,
    True,
    False,
    /// Numeric literal not yet in the constant pool.
    KInt(i64),
    KFlt(f64),
    /// String literal, already interned.
    KStr(StringId),
    /// Constant pool entry.
    K(u32),
    /// Value fixed in a register.
    NonReloc(u32),
    /// Local variable (register, index into active variables).
    Local { ridx: u32, vidx: u32 },
    /// Upvalue index of the current function.
    Upval(u32),
    /// `t[k]` where both sides are in registers.
    Indexed { t: u32, idx: u32 },
    /// `up[k]` with a short-string constant key.
    IndexUp { t: u32, idx: u32 },
    /// `t[i]` with a small integer immediate key.
    IndexI { t: u32, idx: i64 },
    /// `t.k` with a short-string constant key.
    IndexStr { t: u32, idx: u32 },
    /// Comparison/test whose outcome is a pending jump at `pc`.
    Jmp(i32),
    /// Result in whatever register gets patched into instruction `pc`.
    Reloc(i32),
    /// A CALL at `pc` whose result count is still adjustable.
    Call(i32),
    /// A VARARG at `pc` whose result count is still adjustable.
    Vararg(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct ExpDesc {
    pub k: ExpKind,
    /// Patch list: jumps taken when the expression is true.
    pub t: i32,
    /// Patch list: jumps taken when the expression is false.
    pub f: i32,
}

impl ExpDesc {
    pub fn new(k: ExpKind) -> Self {
        ExpDesc { k, t: NO_JUMP, f: NO_JUMP }
    }

    pub fn void() -> Self {
        Self::new(ExpKind::Void)
    }

    #[inline]
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// Numeric literal usable for compile-time folding.
    pub fn as_number(&self) -> Option<FoldValue> {
        if self.has_jumps() {
            return None;
        }
        match self.k {
            ExpKind::KInt(i) => Some(FoldValue::Int(i)),
            ExpKind::KFlt(f) => Some(FoldValue::Float(f)),
            _ => None,
        }
    }

    /// True for expressions that deliver multiple results.
    pub fn is_multiret(&self) -> bool {
        matches!(self.k, ExpKind::Call(_) | ExpKind::Vararg(_))
    }

    /// Constant-like expressions (no side effects, no registers).
    pub fn is_const(&self) -> bool {
        !self.has_jumps()
            && matches!(
                self.k,
                ExpKind::Nil
                    | ExpKind::True
                    | ExpKind::False
                    | ExpKind::KInt(_)
                    | ExpKind::KFlt(_)
                    | ExpKind::KStr(_)
                    | ExpKind::K(_)
            )
    }
}

/// Literal operand for constant folding.
#[derive(Debug, Clone, Copy)]
pub enum FoldValue {
    Int(i64),
    Float(f64),
}

impl FoldValue {
    pub fn as_float(self) -> f64 {
        match self {
            FoldValue::Int(i) => i as f64,
            FoldValue::Float(f) => f,
        }
    }

    pub fn as_int_exact(self) -> Option<i64> {
        match self {
            FoldValue::Int(i) => Some(i),
            FoldValue::Float(f) => {
                crate::value::convert::float_to_int(f, crate::value::F2IMode::Exact)
            }
        }
    }
}
