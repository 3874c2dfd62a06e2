// Table library: sequence manipulation over the array/border model.

use crate::limits::LuaInt;
use crate::stdlib::{new_lib, set_fn};
use crate::value::LuaValue;
use crate::vm::{LuaResult, LuaState, LuaVM};

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let t = new_lib(vm, "table");
    set_fn(vm, t, "insert", tbl_insert);
    set_fn(vm, t, "remove", tbl_remove);
    set_fn(vm, t, "concat", tbl_concat);
    set_fn(vm, t, "unpack", tbl_unpack);
    set_fn(vm, t, "pack", tbl_pack);
    set_fn(vm, t, "sort", tbl_sort);
    Ok(())
}

fn tbl_insert(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let n = l.g().pool.table_len(t);
    match l.nargs() {
        2 => {
            let v = l.arg(2);
            l.g_mut().raw_seti(t, n + 1, v);
        }
        3 => {
            let pos = l.check_int(2)?;
            if pos < 1 || pos > n + 1 {
                return Err(l.arg_error(2, "position out of bounds"));
            }
            let v = l.arg(3);
            // Shift the tail up one slot.
            let mut i = n;
            while i >= pos {
                let moved = l.g().pool.table_get_int(t, i).unwrap_or(LuaValue::nil());
                l.g_mut().raw_seti(t, i + 1, moved);
                i -= 1;
            }
            l.g_mut().raw_seti(t, pos, v);
        }
        _ => return Err(l.rt_error("wrong number of arguments to 'insert'".to_string())),
    }
    Ok(0)
}

fn tbl_remove(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let n = l.g().pool.table_len(t);
    let pos = l.opt_int(2, n)?;
    if n == 0 && l.nargs() < 2 {
        l.push(LuaValue::nil())?;
        return Ok(1);
    }
    if n > 0 && (pos < 1 || pos > n + 1) {
        return Err(l.arg_error(2, "position out of bounds"));
    }
    let removed = l.g().pool.table_get_int(t, pos).unwrap_or(LuaValue::nil());
    let mut i = pos;
    while i < n {
        let moved = l.g().pool.table_get_int(t, i + 1).unwrap_or(LuaValue::nil());
        l.g_mut().raw_seti(t, i, moved);
        i += 1;
    }
    if pos <= n {
        l.g_mut().raw_seti(t, n, LuaValue::nil());
    }
    l.push(removed)?;
    Ok(1)
}

fn tbl_concat(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let sep = if l.nargs() >= 2 && !l.arg(2).is_nil() {
        l.check_string(2)?
    } else {
        String::new()
    };
    let n = l.g().pool.table_len(t);
    let i = l.opt_int(3, 1)?;
    let j = l.opt_int(4, n)?;
    let mut out = Vec::new();
    for pos in i..=j {
        let v = l.g().pool.table_get_int(t, pos).unwrap_or(LuaValue::nil());
        if v.is_string() {
            out.extend_from_slice(l.g().pool.str_bytes(v.as_string_id()));
        } else if v.is_integer() {
            out.extend_from_slice(crate::value::convert::int_to_str(v.as_integer()).as_bytes());
        } else if v.is_float() {
            out.extend_from_slice(crate::value::convert::float_to_str(v.as_float()).as_bytes());
        } else {
            return Err(l.rt_error(format!(
                "invalid value (at index {}) in table for 'concat'",
                pos
            )));
        }
        if pos < j {
            out.extend_from_slice(sep.as_bytes());
        }
    }
    l.push_bytes(&out)?;
    Ok(1)
}

fn tbl_unpack(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let i = l.opt_int(2, 1)?;
    let j = if l.nargs() >= 3 && !l.arg(3).is_nil() {
        l.check_int(3)?
    } else {
        l.g().pool.table_len(t)
    };
    if i > j {
        return Ok(0);
    }
    let count = (j - i + 1) as usize;
    if count > 1_000_000 {
        return Err(l.rt_error("too many results to unpack".to_string()));
    }
    l.ensure_stack(count)?;
    for pos in i..=j {
        let v = l.g().pool.table_get_int(t, pos).unwrap_or(LuaValue::nil());
        l.push(v)?;
    }
    Ok(count)
}

fn tbl_pack(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    let t = l.g_mut().new_table(n, 1);
    let tid = t.as_table_id();
    for i in 1..=n {
        let v = l.arg(i);
        l.g_mut().raw_seti(tid, i as LuaInt, v);
    }
    let nkey = l.new_str_value("n");
    let _ = l.g_mut().raw_set(tid, &nkey, LuaValue::integer(n as LuaInt));
    l.push(t)?;
    Ok(1)
}

fn tbl_sort(l: &mut LuaState) -> LuaResult<usize> {
    let t = l.check_table(1)?;
    let cmp = if l.nargs() >= 2 && !l.arg(2).is_nil() {
        let f = l.arg(2);
        if !f.is_function() {
            return Err(l.arg_error(2, "function expected"));
        }
        Some(f)
    } else {
        None
    };
    let n = l.g().pool.table_len(t);
    let mut items: Vec<LuaValue> = Vec::with_capacity(n as usize);
    for i in 1..=n {
        items.push(l.g().pool.table_get_int(t, i).unwrap_or(LuaValue::nil()));
    }
    // Anchor the items against collection while comparators run.
    let anchor_base = l.get_top();
    l.ensure_stack(items.len())?;
    for v in &items {
        l.push(*v)?;
    }
    let sorted = merge_sort(l, items, &cmp)?;
    l.set_top(anchor_base);
    for (i, v) in sorted.into_iter().enumerate() {
        l.g_mut().raw_seti(t, i as LuaInt + 1, v);
    }
    Ok(0)
}

/// Stable merge sort with a fallible comparator (default: `<`).
fn merge_sort(
    l: &mut LuaState,
    mut items: Vec<LuaValue>,
    cmp: &Option<LuaValue>,
) -> LuaResult<Vec<LuaValue>> {
    let n = items.len();
    if n <= 1 {
        return Ok(items);
    }
    let right = items.split_off(n / 2);
    let left = merge_sort(l, items, cmp)?;
    let right = merge_sort(l, right, cmp)?;
    let mut out = Vec::with_capacity(n);
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if lua_less(l, &right[j], &left[i], cmp)? {
            out.push(right[j]);
            j += 1;
        } else {
            out.push(left[i]);
            i += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    Ok(out)
}

fn lua_less(
    l: &mut LuaState,
    a: &LuaValue,
    b: &LuaValue,
    cmp: &Option<LuaValue>,
) -> LuaResult<bool> {
    match cmp {
        Some(f) => {
            let mut r = l.call_value(*f, &[*a, *b], 1)?;
            Ok(r.drain(..).next().unwrap_or(LuaValue::nil()).is_truthy())
        }
        None => l.lt_values(*a, *b),
    }
}
