// Basic library: the globals every program assumes.

use crate::gc::GcKind;
use crate::limits::LuaInt;
use crate::stdlib::{set_fn, tostring_value};
use crate::value::convert;
use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{dump, LuaResult, LuaState, LuaVM};
use std::io::Write;

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let g = vm.globals_table();
    set_fn(vm, g, "print", lua_print);
    set_fn(vm, g, "type", lua_type);
    set_fn(vm, g, "tostring", lua_tostring);
    set_fn(vm, g, "tonumber", lua_tonumber);
    set_fn(vm, g, "rawequal", lua_rawequal);
    set_fn(vm, g, "rawget", lua_rawget);
    set_fn(vm, g, "rawset", lua_rawset);
    set_fn(vm, g, "rawlen", lua_rawlen);
    set_fn(vm, g, "next", lua_next);
    set_fn(vm, g, "pairs", lua_pairs);
    set_fn(vm, g, "ipairs", lua_ipairs);
    set_fn(vm, g, "select", lua_select);
    set_fn(vm, g, "error", lua_error);
    set_fn(vm, g, "assert", lua_assert);
    set_fn(vm, g, "pcall", lua_pcall);
    set_fn(vm, g, "xpcall", lua_xpcall);
    set_fn(vm, g, "setmetatable", lua_setmetatable);
    set_fn(vm, g, "getmetatable", lua_getmetatable);
    set_fn(vm, g, "collectgarbage", lua_collectgarbage);
    set_fn(vm, g, "load", lua_load);
    set_fn(vm, g, "warn", lua_warn);
    Ok(())
}

fn lua_print(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    let mut out = String::new();
    for i in 1..=n {
        if i > 1 {
            out.push('\t');
        }
        let v = l.arg(i);
        let s = tostring_value(l, v)?;
        out.push_str(&l.g().pool.str_utf8(s.as_string_id()));
    }
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", out);
    Ok(0)
}

fn lua_type(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    l.push_str(v.type_name())?;
    Ok(1)
}

fn lua_tostring(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    let s = tostring_value(l, v)?;
    l.push(s)?;
    Ok(1)
}

fn lua_tonumber(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    if l.nargs() >= 2 && !l.arg(2).is_nil() {
        // Explicit base: digits only.
        let base = l.check_int(2)?;
        if !(2..=36).contains(&base) {
            return Err(l.arg_error(2, "base out of range"));
        }
        let s = l.check_string(1)?;
        let s = s.trim();
        let mut value: LuaInt = 0;
        let mut any = false;
        let (neg, digits) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        for c in digits.chars() {
            let Some(d) = c.to_digit(36) else {
                any = false;
                break;
            };
            if d as i64 >= base {
                any = false;
                break;
            }
            value = value.wrapping_mul(base).wrapping_add(d as LuaInt);
            any = true;
        }
        if any {
            l.push(LuaValue::integer(if neg { value.wrapping_neg() } else { value }))?;
        } else {
            l.push(LuaValue::nil())?;
        }
        return Ok(1);
    }
    if v.is_number() {
        l.push(v)?;
    } else if v.is_string() {
        let s = l.g().pool.str_utf8(v.as_string_id()).into_owned();
        match convert::str_to_number(&s) {
            Some(convert::Number::Int(i)) => l.push(LuaValue::integer(i))?,
            Some(convert::Number::Float(f)) => l.push(LuaValue::float(f))?,
            None => l.push(LuaValue::nil())?,
        }
    } else {
        l.push(LuaValue::nil())?;
    }
    Ok(1)
}

fn lua_rawequal(l: &mut LuaState) -> LuaResult<usize> {
    let a = l.check_any(1)?;
    let b = l.check_any(2)?;
    let eq = l.g().pool.values_equal(&a, &b);
    l.push(LuaValue::boolean(eq))?;
    Ok(1)
}

fn lua_rawget(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let k = l.check_any(2)?;
    let v = l.g().pool.table_get(t, &k).unwrap_or(LuaValue::nil());
    l.push(v)?;
    Ok(1)
}

fn lua_rawset(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let k = l.check_any(2)?;
    let v = l.check_any(3)?;
    l.raw_set_checked(t, &k, v)?;
    let tv = l.arg(1);
    l.push(tv)?;
    Ok(1)
}

fn lua_rawlen(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    let n = if v.is_table() {
        l.g().pool.table_len(v.as_table_id())
    } else if v.is_string() {
        l.g().pool.str_bytes(v.as_string_id()).len() as LuaInt
    } else {
        return Err(l.arg_error(1, "table or string expected"));
    };
    l.push(LuaValue::integer(n))?;
    Ok(1)
}

pub(crate) fn lua_next(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let k = l.arg(2);
    let key = if k.is_nil() { None } else { Some(k) };
    match l.g().pool.table_next(t, key.as_ref()) {
        Ok(Some((nk, nv))) => {
            l.push(nk)?;
            l.push(nv)?;
            Ok(2)
        }
        Ok(None) => {
            l.push(LuaValue::nil())?;
            Ok(1)
        }
        Err(e) => Err(l.rt_error(e.message().to_string())),
    }
}

fn lua_pairs(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    let h = l.get_metamethod(&v, TmKind::Pairs);
    if !h.is_nil() {
        let results = l.call_value(h, &[v], 3)?;
        for r in results.iter().take(3) {
            l.push(*r)?;
        }
        for _ in results.len()..3 {
            l.push(LuaValue::nil())?;
        }
        return Ok(3);
    }
    l.check_table(1)?;
    l.push(LuaValue::cfunction(lua_next))?;
    l.push(v)?;
    l.push(LuaValue::nil())?;
    Ok(3)
}

fn ipairs_iter(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_any(1)?;
    let i = l.check_int(2)? + 1;
    let v = l.index_int(t, i)?;
    if v.is_nil() {
        l.push(LuaValue::nil())?;
        Ok(1)
    } else {
        l.push(LuaValue::integer(i))?;
        l.push(v)?;
        Ok(2)
    }
}

fn lua_ipairs(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    l.push(LuaValue::cfunction(ipairs_iter))?;
    l.push(v)?;
    l.push(LuaValue::integer(0))?;
    Ok(3)
}

fn lua_select(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    let first = l.arg(1);
    if first.is_string() && l.g().pool.str_bytes(first.as_string_id()) == b"#" {
        l.push(LuaValue::integer(n as LuaInt - 1))?;
        return Ok(1);
    }
    let mut i = l.check_int(1)?;
    if i < 0 {
        i += n as LuaInt;
        if i < 1 {
            return Err(l.arg_error(1, "index out of range"));
        }
    } else if i == 0 {
        return Err(l.arg_error(1, "index out of range"));
    }
    let mut count = 0;
    for j in (i as usize + 1)..=n {
        let v = l.arg(j);
        l.push(v)?;
        count += 1;
    }
    Ok(count)
}

fn lua_error(l: &mut LuaState) -> LuaResult<usize> {
    let mut v = l.arg(1);
    let level = l.opt_int(2, 1)?;
    if v.is_string() && level > 0 {
        let msg = l.g().pool.str_utf8(v.as_string_id()).into_owned();
        let full = format!("{}{}", l.where_str(), msg);
        v = l.new_str_value(&full);
    }
    Err(l.raise_value(v))
}

fn lua_assert(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    if v.is_falsy() {
        if l.nargs() >= 2 {
            let msg = l.arg(2);
            return Err(l.raise_value(msg));
        }
        return Err(l.rt_error("assertion failed!".to_string()));
    }
    // Pass every argument through.
    let n = l.nargs();
    for i in 1..=n {
        let a = l.arg(i);
        l.push(a)?;
    }
    Ok(n)
}

fn lua_pcall(l: &mut LuaState) -> LuaResult<usize> {
    l.protect_current_call(false)
}

fn lua_xpcall(l: &mut LuaState) -> LuaResult<usize> {
    l.protect_current_call(true)
}

fn lua_setmetatable(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let mt = l.arg(2);
    let mt_id = if mt.is_nil() {
        None
    } else if mt.is_table() {
        Some(mt.as_table_id())
    } else {
        return Err(l.arg_error(2, "nil or table expected"));
    };
    // A protected metatable refuses replacement.
    let tv = l.arg(1);
    if !l.get_metamethod(&tv, TmKind::Metatable).is_nil() {
        return Err(l.rt_error("cannot change a protected metatable".to_string()));
    }
    let _ = t;
    l.g_mut().set_metatable(&tv, mt_id);
    l.push(tv)?;
    Ok(1)
}

fn lua_getmetatable(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    let protected = l.get_metamethod(&v, TmKind::Metatable);
    if !protected.is_nil() {
        l.push(protected)?;
        return Ok(1);
    }
    match l.g().metatable_of(&v) {
        Some(mt) => l.push(LuaValue::table(mt))?,
        None => l.push(LuaValue::nil())?,
    }
    Ok(1)
}

fn lua_collectgarbage(l: &mut LuaState) -> LuaResult<usize> {
    let opt = if l.nargs() >= 1 && !l.arg(1).is_nil() {
        l.check_string(1)?
    } else {
        "collect".to_string()
    };
    match opt.as_str() {
        "collect" => {
            l.g_mut().collect_garbage();
            l.push(LuaValue::integer(0))?;
        }
        "step" => {
            l.g_mut().collect_step();
            l.push(LuaValue::boolean(l.g().gc.state == crate::gc::GcState::Pause))?;
        }
        "stop" => {
            l.g_mut().gc.stopped = true;
            l.push(LuaValue::integer(0))?;
        }
        "restart" => {
            l.g_mut().gc.stopped = false;
            l.push(LuaValue::integer(0))?;
        }
        "count" => {
            let kb = l.g().gc.heap_bytes() as f64 / 1024.0;
            l.push(LuaValue::float(kb))?;
        }
        "isrunning" => {
            let running = !l.g().gc.stopped;
            l.push(LuaValue::boolean(running))?;
        }
        "incremental" => {
            l.g_mut().gc.kind = GcKind::Incremental;
            l.push_str("incremental")?;
        }
        "generational" => {
            l.g_mut().gc.kind = GcKind::Generational;
            l.push_str("generational")?;
        }
        _ => return Err(l.arg_error(1, "invalid option")),
    }
    Ok(1)
}

fn lua_load(l: &mut LuaState) -> LuaResult<usize> {
    let chunk = l.check_any(1)?;
    let chunk_name = if l.nargs() >= 2 && l.arg(2).is_string() {
        l.check_string(2)?
    } else {
        "=(load)".to_string()
    };
    let mode = if l.nargs() >= 3 && l.arg(3).is_string() {
        l.check_string(3)?
    } else {
        "bt".to_string()
    };
    if !chunk.is_string() {
        return Err(l.arg_error(1, "string expected"));
    }
    let bytes = l.g().pool.str_bytes(chunk.as_string_id()).to_vec();
    let result = if dump::is_binary_chunk(&bytes) {
        if !mode.contains('b') {
            Err("attempt to load a binary chunk".to_string())
        } else {
            let vm_ptr = l.vm_ptr();
            let vm = unsafe { &mut *vm_ptr };
            match dump::undump(vm, &bytes, &chunk_name) {
                Ok(p) => Ok(p),
                Err(_) => Err(l.error_message()),
            }
        }
    } else if !mode.contains('t') {
        Err("attempt to load a text chunk".to_string())
    } else {
        let src = String::from_utf8_lossy(&bytes).into_owned();
        let vm_ptr = l.vm_ptr();
        let vm = unsafe { &mut *vm_ptr };
        match vm.compile_with_name(&src, &chunk_name) {
            Ok(p) => Ok(p),
            Err(_) => Err(l.error_message()),
        }
    };
    match result {
        Ok(proto) => {
            let vm_ptr = l.vm_ptr();
            let vm = unsafe { &mut *vm_ptr };
            let f = vm.make_chunk_closure(proto);
            l.push(f)?;
            Ok(1)
        }
        Err(msg) => {
            l.push(LuaValue::nil())?;
            l.push_str(&msg)?;
            Ok(2)
        }
    }
}

fn lua_warn(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    let mut parts = Vec::with_capacity(n);
    for i in 1..=n {
        parts.push(l.check_string(i)?);
    }
    let msg = parts.concat();
    if n == 1 && msg.starts_with('@') {
        // Control messages toggle the warning system.
        match msg.as_str() {
            "@on" => l.g_mut().set_warnings_enabled(true),
            "@off" => l.g_mut().set_warnings_enabled(false),
            _ => {} // unknown control messages are ignored
        }
        return Ok(0);
    }
    l.g_mut().warn(&msg);
    Ok(0)
}
