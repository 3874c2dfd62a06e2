// Concatenation: strings and numbers join directly; any other operand
// dispatches `__concat` pairwise, right-associatively.

use crate::value::convert;
use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{LuaResult, LuaState};

impl LuaState {
    /// True when the value takes part in direct string concatenation.
    fn concat_coercible(&self, v: &LuaValue) -> bool {
        v.is_string() || v.is_number()
    }

    fn concat_bytes(&self, v: &LuaValue, out: &mut Vec<u8>) {
        if v.is_string() {
            out.extend_from_slice(self.g().pool.str_bytes(v.as_string_id()));
        } else if v.is_integer() {
            out.extend_from_slice(convert::int_to_str(v.as_integer()).as_bytes());
        } else {
            out.extend_from_slice(convert::float_to_str(v.as_float()).as_bytes());
        }
    }

    /// Concatenates `n` values starting at stack slot `first`, leaving
    /// the result in `stack[first]`.
    pub(crate) fn concat_slots(&mut self, first: usize, n: usize) -> LuaResult<()> {
        debug_assert!(n >= 1);
        let mut n = n;
        while n > 1 {
            let b = self.stack[first + n - 2];
            let c = self.stack[first + n - 1];
            if self.concat_coercible(&b) && self.concat_coercible(&c) {
                // Greedily fold the whole directly-joinable suffix run.
                let mut start = first + n - 2;
                while start > first && self.concat_coercible(&self.stack[start - 1].clone()) {
                    start -= 1;
                }
                let mut bytes = Vec::new();
                for i in start..first + n {
                    let v = self.stack[i];
                    self.concat_bytes(&v, &mut bytes);
                }
                let s = {
                    let g = self.g_mut();
                    g.pool.create_string(&mut g.gc, &bytes)
                };
                self.stack[start] = s;
                n = start - first + 1;
            } else {
                let v = self.try_bin_metamethod(TmKind::Concat, b, c)?;
                self.stack[first + n - 2] = v;
                n -= 1;
            }
        }
        Ok(())
    }
}
