// Standard library: native functions over the core's value/stack API.

pub mod basic;
pub mod coroutine;
pub mod math;
pub mod os;
pub mod string;
pub mod table;

use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{CFunction, LuaResult, LuaState, LuaVM};

/// Which libraries to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdlib {
    /// Everything below.
    All,
    /// Just the basic library (print, pcall, setmetatable, ...).
    Basic,
}

pub fn open(vm: &mut LuaVM, which: Stdlib) -> LuaResult<()> {
    basic::open(vm)?;
    if which == Stdlib::All {
        string::open(vm)?;
        table::open(vm)?;
        math::open(vm)?;
        os::open(vm)?;
        coroutine::open(vm)?;
    }
    Ok(())
}

/// Registers one native in a library table.
pub(crate) fn set_fn(vm: &mut LuaVM, t: crate::gc::TableId, name: &str, f: CFunction) {
    let key = vm.new_str(name);
    let fv = LuaValue::cfunction(f);
    let _ = vm.raw_set(t, &key, fv);
}

/// Creates a library table and binds it to a global name.
pub(crate) fn new_lib(vm: &mut LuaVM, name: &str) -> crate::gc::TableId {
    let t = vm.new_table(0, 16);
    vm.set_global(name, t);
    t.as_table_id()
}

/// `tostring` semantics: `__tostring` wins, then `__name` decorates the
/// default rendering.
pub(crate) fn tostring_value(l: &mut LuaState, v: LuaValue) -> LuaResult<LuaValue> {
    let h = l.get_metamethod(&v, TmKind::ToString);
    if !h.is_nil() {
        let mut res = l.call_value(h, &[v], 1)?;
        let out = res.drain(..).next().unwrap_or(LuaValue::nil());
        if !out.is_string() {
            return Err(l.rt_error("'__tostring' must return a string".to_string()));
        }
        return Ok(out);
    }
    if v.is_table() || v.is_full_userdata() {
        let name = l.get_metamethod(&v, TmKind::Name);
        if name.is_string() {
            let tag = l.g().pool.str_utf8(name.as_string_id()).into_owned();
            let s = format!("{}: 0x{:08x}", tag, v.gc_id());
            return Ok(l.new_str_value(&s));
        }
    }
    let s = l.to_display(&v);
    Ok(l.new_str_value(&s))
}
