// String library subset. Strings are byte sequences throughout; indices
// follow the 1-based, negative-from-end convention.

use crate::limits::LuaInt;
use crate::stdlib::{new_lib, set_fn, tostring_value};
use crate::value::convert;
use crate::value::LuaValue;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::{dump, LuaResult, LuaState, LuaVM};

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let t = new_lib(vm, "string");
    set_fn(vm, t, "len", str_len);
    set_fn(vm, t, "sub", str_sub);
    set_fn(vm, t, "rep", str_rep);
    set_fn(vm, t, "upper", str_upper);
    set_fn(vm, t, "lower", str_lower);
    set_fn(vm, t, "reverse", str_reverse);
    set_fn(vm, t, "byte", str_byte);
    set_fn(vm, t, "char", str_char);
    set_fn(vm, t, "format", str_format);
    set_fn(vm, t, "find", str_find);
    set_fn(vm, t, "dump", str_dump);

    // The shared string metatable: indexing a string reaches this
    // library (`("x"):upper()`).
    let mt = vm.new_table(0, 1);
    let index_key = vm.tm_names[TmKind::Index as usize];
    let tv = LuaValue::table(t);
    let _ = vm.raw_set(mt.as_table_id(), &index_key, tv);
    let probe = vm.new_str("");
    vm.set_metatable(&probe, Some(mt.as_table_id()));
    Ok(())
}

fn check_bytes(l: &mut LuaState, n: usize) -> LuaResult<Vec<u8>> {
    let v = l.arg(n);
    if v.is_string() {
        Ok(l.g().pool.str_bytes(v.as_string_id()).to_vec())
    } else if v.is_integer() {
        Ok(convert::int_to_str(v.as_integer()).into_bytes())
    } else if v.is_float() {
        Ok(convert::float_to_str(v.as_float()).into_bytes())
    } else {
        Err(l.arg_error(n, &format!("string expected, got {}", v.type_name())))
    }
}

/// Translates a relative position: negative counts from the end.
fn str_index(pos: LuaInt, len: usize) -> LuaInt {
    if pos >= 0 { pos } else { len as LuaInt + pos + 1 }
}

fn str_len(l: &mut LuaState) -> LuaResult<usize> {
    let s = check_bytes(l, 1)?;
    l.push(LuaValue::integer(s.len() as LuaInt))?;
    Ok(1)
}

fn str_sub(l: &mut LuaState) -> LuaResult<usize> {
    let s = check_bytes(l, 1)?;
    let len = s.len();
    let mut i = str_index(l.opt_int(2, 1)?, len);
    let mut j = str_index(l.opt_int(3, -1)?, len);
    if i < 1 {
        i = 1;
    }
    if j > len as LuaInt {
        j = len as LuaInt;
    }
    if i > j {
        l.push_bytes(b"")?;
    } else {
        l.push_bytes(&s[i as usize - 1..j as usize])?;
    }
    Ok(1)
}

fn str_rep(l: &mut LuaState) -> LuaResult<usize> {
    let s = check_bytes(l, 1)?;
    let n = l.check_int(2)?;
    let sep = if l.nargs() >= 3 { check_bytes(l, 3)? } else { Vec::new() };
    if n <= 0 {
        l.push_bytes(b"")?;
        return Ok(1);
    }
    let total = (s.len() + sep.len()) * n as usize;
    if total > 1 << 28 {
        return Err(l.rt_error("resulting string too large".to_string()));
    }
    let mut out = Vec::with_capacity(total);
    for i in 0..n {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(&s);
    }
    l.push_bytes(&out)?;
    Ok(1)
}

fn str_upper(l: &mut LuaState) -> LuaResult<usize> {
    let mut s = check_bytes(l, 1)?;
    s.iter_mut().for_each(|b| *b = b.to_ascii_uppercase());
    l.push_bytes(&s)?;
    Ok(1)
}

fn str_lower(l: &mut LuaState) -> LuaResult<usize> {
    let mut s = check_bytes(l, 1)?;
    s.iter_mut().for_each(|b| *b = b.to_ascii_lowercase());
    l.push_bytes(&s)?;
    Ok(1)
}

fn str_reverse(l: &mut LuaState) -> LuaResult<usize> {
    let mut s = check_bytes(l, 1)?;
    s.reverse();
    l.push_bytes(&s)?;
    Ok(1)
}

fn str_byte(l: &mut LuaState) -> LuaResult<usize> {
    let s = check_bytes(l, 1)?;
    let len = s.len();
    let i = str_index(l.opt_int(2, 1)?, len).max(1);
    let j = str_index(l.opt_int(3, i)?, len).min(len as LuaInt);
    let mut count = 0;
    for pos in i..=j {
        if pos >= 1 && pos <= len as LuaInt {
            l.push(LuaValue::integer(s[pos as usize - 1] as LuaInt))?;
            count += 1;
        }
    }
    Ok(count)
}

fn str_char(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    let mut out = Vec::with_capacity(n);
    for i in 1..=n {
        let c = l.check_int(i)?;
        if !(0..=255).contains(&c) {
            return Err(l.arg_error(i, "value out of range"));
        }
        out.push(c as u8);
    }
    l.push_bytes(&out)?;
    Ok(1)
}

/// Plain substring search (pattern matching is out of scope for this
/// library; the needle is taken literally).
fn str_find(l: &mut LuaState) -> LuaResult<usize> {
    let hay = check_bytes(l, 1)?;
    let needle = check_bytes(l, 2)?;
    let init = str_index(l.opt_int(3, 1)?, hay.len()).max(1) as usize - 1;
    if init > hay.len() {
        l.push(LuaValue::nil())?;
        return Ok(1);
    }
    let found = hay[init..]
        .windows(needle.len().max(1))
        .position(|w| w == &needle[..])
        .map(|p| p + init);
    match (found, needle.is_empty()) {
        (_, true) => {
            l.push(LuaValue::integer(init as LuaInt + 1))?;
            l.push(LuaValue::integer(init as LuaInt))?;
            Ok(2)
        }
        (Some(p), _) => {
            l.push(LuaValue::integer(p as LuaInt + 1))?;
            l.push(LuaValue::integer((p + needle.len()) as LuaInt))?;
            Ok(2)
        }
        (None, _) => {
            l.push(LuaValue::nil())?;
            Ok(1)
        }
    }
}

fn str_dump(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    let strip = l.nargs() >= 2 && l.arg(2).is_truthy();
    if !v.is_closure() {
        return Err(l.arg_error(1, "unable to dump given function"));
    }
    let proto = match l.g().pool.closure(v.as_closure_id()).proto() {
        Some(p) => p.clone(),
        None => return Err(l.arg_error(1, "unable to dump given function")),
    };
    let bytes = dump::dump(l.g(), &proto, strip);
    l.push_bytes(&bytes)?;
    Ok(1)
}

// ---- string.format ----

fn str_format(l: &mut LuaState) -> LuaResult<usize> {
    let fmt = check_bytes(l, 1)?;
    let mut out: Vec<u8> = Vec::with_capacity(fmt.len());
    let mut arg = 1usize;
    let mut i = 0usize;
    while i < fmt.len() {
        let c = fmt[i];
        if c != b'%' {
            out.push(c);
            i += 1;
            continue;
        }
        i += 1;
        if i >= fmt.len() {
            return Err(l.rt_error("invalid format string to 'format'".to_string()));
        }
        if fmt[i] == b'%' {
            out.push(b'%');
            i += 1;
            continue;
        }
        // flags / width / precision
        let start = i;
        while i < fmt.len() && matches!(fmt[i], b'-' | b'+' | b' ' | b'#' | b'0') {
            i += 1;
        }
        while i < fmt.len() && fmt[i].is_ascii_digit() {
            i += 1;
        }
        let mut precision: Option<usize> = None;
        if i < fmt.len() && fmt[i] == b'.' {
            i += 1;
            let ps = i;
            while i < fmt.len() && fmt[i].is_ascii_digit() {
                i += 1;
            }
            precision =
                Some(std::str::from_utf8(&fmt[ps..i]).unwrap().parse().unwrap_or(0));
        }
        let spec = std::str::from_utf8(&fmt[start..i]).unwrap_or("").to_string();
        let (flags, width) = parse_spec(&spec);
        if i >= fmt.len() {
            return Err(l.rt_error("invalid conversion to 'format'".to_string()));
        }
        let conv = fmt[i];
        i += 1;
        arg += 1;
        let piece = match conv {
            b'd' | b'i' => {
                let v = l.check_int(arg)?;
                pad_num(&v.to_string(), &flags, width)
            }
            b'u' => {
                let v = l.check_int(arg)?;
                pad_num(&(v as u64).to_string(), &flags, width)
            }
            b'x' => {
                let v = l.check_int(arg)?;
                pad_num(&format!("{:x}", v as u64), &flags, width)
            }
            b'X' => {
                let v = l.check_int(arg)?;
                pad_num(&format!("{:X}", v as u64), &flags, width)
            }
            b'o' => {
                let v = l.check_int(arg)?;
                pad_num(&format!("{:o}", v as u64), &flags, width)
            }
            b'c' => {
                let v = l.check_int(arg)?;
                String::from_utf8_lossy(&[v as u8]).into_owned()
            }
            b'f' | b'F' => {
                let v = l.check_number(arg)?;
                pad_num(&format!("{:.*}", precision.unwrap_or(6), v), &flags, width)
            }
            b'e' | b'E' => {
                let v = l.check_number(arg)?;
                let s = format!("{:.*e}", precision.unwrap_or(6), v);
                pad_num(&if conv == b'E' { s.to_uppercase() } else { s }, &flags, width)
            }
            b'g' | b'G' => {
                let v = l.check_number(arg)?;
                let s = convert::format_g(v, precision.unwrap_or(6).max(1));
                pad_num(&if conv == b'G' { s.to_uppercase() } else { s }, &flags, width)
            }
            b'a' | b'A' => {
                let v = l.check_number(arg)?;
                pad_num(&format!("{:?}", v), &flags, width)
            }
            b's' => {
                let v = l.arg(arg);
                let sv = tostring_value(l, v)?;
                let mut s = l.g().pool.str_utf8(sv.as_string_id()).into_owned();
                if let Some(p) = precision {
                    s.truncate(p);
                }
                pad_num(&s, &flags, width)
            }
            b'q' => {
                let v = l.arg(arg);
                quote_value(l, &v)?
            }
            other => {
                return Err(l.rt_error(format!(
                    "invalid conversion '%{}' to 'format'",
                    other as char
                )));
            }
        };
        out.extend_from_slice(piece.as_bytes());
    }
    l.push_bytes(&out)?;
    Ok(1)
}

fn parse_spec(spec: &str) -> (String, usize) {
    let flags: String = spec.chars().take_while(|c| "-+ #0".contains(*c)).collect();
    let width: usize = spec[flags.len()..].parse().unwrap_or(0);
    (flags, width)
}

fn pad_num(s: &str, flags: &str, width: usize) -> String {
    if s.len() >= width {
        return s.to_string();
    }
    let pad = width - s.len();
    if flags.contains('-') {
        format!("{}{}", s, " ".repeat(pad))
    } else if flags.contains('0') && !s.starts_with('-') {
        format!("{}{}", "0".repeat(pad), s)
    } else if flags.contains('0') {
        format!("-{}{}", "0".repeat(pad), &s[1..])
    } else {
        format!("{}{}", " ".repeat(pad), s)
    }
}

/// `%q`: a literal that reads back as the same value.
fn quote_value(l: &mut LuaState, v: &LuaValue) -> LuaResult<String> {
    if v.is_string() {
        let bytes = l.g().pool.str_bytes(v.as_string_id()).to_vec();
        let mut out = String::from("\"");
        for b in bytes {
            match b {
                b'"' => out.push_str("\\\""),
                b'\\' => out.push_str("\\\\"),
                b'\n' => out.push_str("\\n"),
                b'\r' => out.push_str("\\r"),
                0 => out.push_str("\\0"),
                b if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
                b => out.push_str(&format!("\\{}", b)),
            }
        }
        out.push('"');
        Ok(out)
    } else if v.is_integer() {
        Ok(convert::int_to_str(v.as_integer()))
    } else if v.is_float() {
        let f = v.as_float();
        Ok(if f.is_nan() {
            "(0/0)".to_string()
        } else if f.is_infinite() {
            if f > 0.0 { "1e9999".to_string() } else { "-1e9999".to_string() }
        } else {
            // Debug formatting round-trips and reads back as a float.
            format!("{:?}", f)
        })
    } else if v.is_nil() {
        Ok("nil".to_string())
    } else if v.is_boolean() {
        Ok(v.as_boolean().to_string())
    } else {
        Err(l.rt_error("value has no literal form".to_string()))
    }
}
