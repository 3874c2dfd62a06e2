// Indexing with metamethod chains. Raw hits never consult metatables;
// misses walk `__index`/`__newindex` until a table without a handler, a
// handler function, or the chain cap (which breaks cycles).

use crate::limits::{LuaInt, MAX_TAG_LOOP};
use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{LuaResult, LuaState};

impl LuaState {
    /// `t[k]` with `__index` chaining.
    pub(crate) fn index_value(&mut self, t: LuaValue, k: LuaValue) -> LuaResult<LuaValue> {
        let mut t = t;
        for _ in 0..MAX_TAG_LOOP {
            if t.is_table() {
                let tid = t.as_table_id();
                if let Some(v) = self.g().pool.table_get(tid, &k) {
                    return Ok(v);
                }
                let h = self.get_metamethod(&t, TmKind::Index);
                if h.is_nil() {
                    return Ok(LuaValue::nil());
                }
                if h.is_function() {
                    let mut res = self.call_value(h, &[t, k], 1)?;
                    return Ok(res.drain(..).next().unwrap_or(LuaValue::nil()));
                }
                t = h;
            } else {
                let h = self.get_metamethod(&t, TmKind::Index);
                if h.is_nil() {
                    let msg = format!("attempt to index a {} value", t.type_name());
                    return Err(self.rt_error(msg));
                }
                if h.is_function() {
                    let mut res = self.call_value(h, &[t, k], 1)?;
                    return Ok(res.drain(..).next().unwrap_or(LuaValue::nil()));
                }
                t = h;
            }
        }
        Err(self.rt_error("'__index' chain too long; possible loop".to_string()))
    }

    /// Fast integer index, falling into the full path only when needed.
    pub(crate) fn index_int(&mut self, t: LuaValue, i: LuaInt) -> LuaResult<LuaValue> {
        if t.is_table() {
            let tid = t.as_table_id();
            if let Some(v) = self.g().pool.table_get_int(tid, i) {
                return Ok(v);
            }
            // Absent: only worth the slow path when __index exists.
            if self.get_metamethod(&t, TmKind::Index).is_nil() {
                return Ok(LuaValue::nil());
            }
        }
        self.index_value(t, LuaValue::integer(i))
    }

    /// `t[k] = v` with `__newindex` chaining.
    pub(crate) fn set_index(&mut self, t: LuaValue, k: LuaValue, v: LuaValue) -> LuaResult<()> {
        let mut t = t;
        for _ in 0..MAX_TAG_LOOP {
            if t.is_table() {
                let tid = t.as_table_id();
                let present = self.g().pool.table_get(tid, &k).is_some();
                if present {
                    return self.raw_set_checked(tid, &k, v);
                }
                let h = self.get_metamethod(&t, TmKind::NewIndex);
                if h.is_nil() {
                    return self.raw_set_checked(tid, &k, v);
                }
                if h.is_function() {
                    self.call_value(h, &[t, k, v], 0)?;
                    return Ok(());
                }
                t = h;
            } else {
                let h = self.get_metamethod(&t, TmKind::NewIndex);
                if h.is_nil() {
                    let msg = format!("attempt to index a {} value", t.type_name());
                    return Err(self.rt_error(msg));
                }
                if h.is_function() {
                    self.call_value(h, &[t, k, v], 0)?;
                    return Ok(());
                }
                t = h;
            }
        }
        Err(self.rt_error("'__newindex' chain too long; possible loop".to_string()))
    }

    /// Raw table store, with key errors surfaced as Lua errors and the
    /// GC barrier applied.
    pub(crate) fn raw_set_checked(
        &mut self,
        tid: crate::gc::TableId,
        k: &LuaValue,
        v: LuaValue,
    ) -> LuaResult<()> {
        match self.g_mut().raw_set(tid, k, v) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.rt_error(e.message().to_string())),
        }
    }

    /// `#v`: strings report byte length; tables prefer `__len`, then the
    /// border; everything else needs `__len`.
    pub(crate) fn length_of(&mut self, v: LuaValue) -> LuaResult<LuaValue> {
        if v.is_string() {
            let n = self.g().pool.str_bytes(v.as_string_id()).len();
            return Ok(LuaValue::integer(n as LuaInt));
        }
        if v.is_table() {
            let h = self.get_metamethod(&v, TmKind::Len);
            if h.is_nil() {
                let n = self.g().pool.table_len(v.as_table_id());
                return Ok(LuaValue::integer(n));
            }
            let mut res = self.call_value(h, &[v], 1)?;
            return Ok(res.drain(..).next().unwrap_or(LuaValue::nil()));
        }
        let h = self.get_metamethod(&v, TmKind::Len);
        if h.is_nil() {
            let msg = format!("attempt to get length of a {} value", v.type_name());
            return Err(self.rt_error(msg));
        }
        let mut res = self.call_value(h, &[v], 1)?;
        Ok(res.drain(..).next().unwrap_or(LuaValue::nil()))
    }
}
