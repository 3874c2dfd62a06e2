// OS library subset: time, formatted dates, environment.

use crate::stdlib::{new_lib, set_fn};
use crate::value::LuaValue;
use crate::vm::{LuaResult, LuaState, LuaVM};
use chrono::{Local, TimeZone};

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let t = new_lib(vm, "os");
    set_fn(vm, t, "clock", os_clock);
    set_fn(vm, t, "time", os_time);
    set_fn(vm, t, "date", os_date);
    set_fn(vm, t, "getenv", os_getenv);
    Ok(())
}

fn os_clock(l: &mut LuaState) -> LuaResult<usize> {
    let secs = l.g().start_time.elapsed().as_secs_f64();
    l.push(LuaValue::float(secs))?;
    Ok(1)
}

fn os_time(l: &mut LuaState) -> LuaResult<usize> {
    let now = Local::now().timestamp();
    l.push(LuaValue::integer(now))?;
    Ok(1)
}

fn os_date(l: &mut LuaState) -> LuaResult<usize> {
    let fmt = if l.nargs() >= 1 && l.arg(1).is_string() {
        l.check_string(1)?
    } else {
        "%c".to_string()
    };
    let when = if l.nargs() >= 2 {
        let t = l.check_int(2)?;
        Local.timestamp_opt(t, 0).single().unwrap_or_else(Local::now)
    } else {
        Local::now()
    };
    // The strftime directive set maps straight onto chrono's.
    let fmt = fmt.strip_prefix('!').unwrap_or(&fmt);
    let out = when.format(fmt).to_string();
    l.push_str(&out)?;
    Ok(1)
}

fn os_getenv(l: &mut LuaState) -> LuaResult<usize> {
    let name = l.check_string(1)?;
    match std::env::var(&name) {
        Ok(v) => l.push_str(&v)?,
        Err(_) => l.push(LuaValue::nil())?,
    }
    Ok(1)
}
