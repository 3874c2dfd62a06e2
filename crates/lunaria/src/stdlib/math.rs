// Math library over the two numeric subtypes.

use crate::limits::{LuaFloat, LuaInt};
use crate::stdlib::{new_lib, set_fn};
use crate::value::convert::{self, F2IMode};
use crate::value::LuaValue;
use crate::vm::{LuaResult, LuaState, LuaVM};
use rand::Rng;

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let t = new_lib(vm, "math");
    set_fn(vm, t, "floor", math_floor);
    set_fn(vm, t, "ceil", math_ceil);
    set_fn(vm, t, "abs", math_abs);
    set_fn(vm, t, "sqrt", math_sqrt);
    set_fn(vm, t, "exp", math_exp);
    set_fn(vm, t, "log", math_log);
    set_fn(vm, t, "sin", math_sin);
    set_fn(vm, t, "cos", math_cos);
    set_fn(vm, t, "tan", math_tan);
    set_fn(vm, t, "fmod", math_fmod);
    set_fn(vm, t, "modf", math_modf);
    set_fn(vm, t, "tointeger", math_tointeger);
    set_fn(vm, t, "type", math_type);
    set_fn(vm, t, "max", math_max);
    set_fn(vm, t, "min", math_min);
    set_fn(vm, t, "random", math_random);
    set_fn(vm, t, "randomseed", math_randomseed);
    set_fn(vm, t, "ult", math_ult);

    let huge_key = vm.new_str("huge");
    let _ = vm.raw_set(t, &huge_key, LuaValue::float(f64::INFINITY));
    let pi_key = vm.new_str("pi");
    let _ = vm.raw_set(t, &pi_key, LuaValue::float(std::f64::consts::PI));
    let maxi_key = vm.new_str("maxinteger");
    let _ = vm.raw_set(t, &maxi_key, LuaValue::integer(LuaInt::MAX));
    let mini_key = vm.new_str("mininteger");
    let _ = vm.raw_set(t, &mini_key, LuaValue::integer(LuaInt::MIN));
    Ok(())
}

fn math_floor(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.arg(1);
    if v.is_integer() {
        l.push(v)?;
    } else {
        let n = l.check_number(1)?;
        match convert::float_to_int(n, F2IMode::Floor) {
            Some(i) => l.push(LuaValue::integer(i))?,
            None => l.push(LuaValue::float(n.floor()))?,
        }
    }
    Ok(1)
}

fn math_ceil(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.arg(1);
    if v.is_integer() {
        l.push(v)?;
    } else {
        let n = l.check_number(1)?;
        match convert::float_to_int(n, F2IMode::Ceil) {
            Some(i) => l.push(LuaValue::integer(i))?,
            None => l.push(LuaValue::float(n.ceil()))?,
        }
    }
    Ok(1)
}

fn math_abs(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.arg(1);
    if v.is_integer() {
        l.push(LuaValue::integer(v.as_integer().wrapping_abs()))?;
    } else {
        let n = l.check_number(1)?;
        l.push(LuaValue::float(n.abs()))?;
    }
    Ok(1)
}

fn math_sqrt(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.check_number(1)?;
    l.push(LuaValue::float(n.sqrt()))?;
    Ok(1)
}

fn math_exp(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.check_number(1)?;
    l.push(LuaValue::float(n.exp()))?;
    Ok(1)
}

fn math_log(l: &mut LuaState) -> LuaResult<usize> {
    let x = l.check_number(1)?;
    let r = if l.nargs() >= 2 {
        let base = l.check_number(2)?;
        if base == 2.0 {
            x.log2()
        } else if base == 10.0 {
            x.log10()
        } else {
            x.ln() / base.ln()
        }
    } else {
        x.ln()
    };
    l.push(LuaValue::float(r))?;
    Ok(1)
}

fn math_sin(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.check_number(1)?;
    l.push(LuaValue::float(n.sin()))?;
    Ok(1)
}

fn math_cos(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.check_number(1)?;
    l.push(LuaValue::float(n.cos()))?;
    Ok(1)
}

fn math_tan(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.check_number(1)?;
    l.push(LuaValue::float(n.tan()))?;
    Ok(1)
}

fn math_fmod(l: &mut LuaState) -> LuaResult<usize> {
    let a = l.arg(1);
    let b = l.arg(2);
    if a.is_integer() && b.is_integer() {
        let (x, y) = (a.as_integer(), b.as_integer());
        if y == 0 {
            return Err(l.arg_error(2, "zero"));
        }
        l.push(LuaValue::integer(x.wrapping_rem(y)))?;
    } else {
        let x = l.check_number(1)?;
        let y = l.check_number(2)?;
        l.push(LuaValue::float(x % y))?;
    }
    Ok(1)
}

fn math_modf(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.check_number(1)?;
    let ip = n.trunc();
    match convert::float_to_int(ip, F2IMode::Exact) {
        Some(i) => l.push(LuaValue::integer(i))?,
        None => l.push(LuaValue::float(ip))?,
    }
    l.push(LuaValue::float(if n.is_infinite() { 0.0 } else { n - ip }))?;
    Ok(2)
}

fn math_tointeger(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.arg(1);
    match l.to_integer(&v) {
        Some(i) if v.is_number() => l.push(LuaValue::integer(i))?,
        _ => l.push(LuaValue::nil())?,
    }
    Ok(1)
}

fn math_type(l: &mut LuaState) -> LuaResult<usize> {
    let v = l.check_any(1)?;
    if v.is_integer() {
        l.push_str("integer")?;
    } else if v.is_float() {
        l.push_str("float")?;
    } else {
        l.push(LuaValue::nil())?;
    }
    Ok(1)
}

fn math_max(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    if n == 0 {
        return Err(l.arg_error(1, "value expected"));
    }
    let mut best = l.check_any(1)?;
    for i in 2..=n {
        let v = l.check_any(i)?;
        if l.lt_values(best, v)? {
            best = v;
        }
    }
    l.push(best)?;
    Ok(1)
}

fn math_min(l: &mut LuaState) -> LuaResult<usize> {
    let n = l.nargs();
    if n == 0 {
        return Err(l.arg_error(1, "value expected"));
    }
    let mut best = l.check_any(1)?;
    for i in 2..=n {
        let v = l.check_any(i)?;
        if l.lt_values(v, best)? {
            best = v;
        }
    }
    l.push(best)?;
    Ok(1)
}

fn math_random(l: &mut LuaState) -> LuaResult<usize> {
    match l.nargs() {
        0 => {
            let r: LuaFloat = l.g_mut().rng.r#gen::<f64>();
            l.push(LuaValue::float(r))?;
        }
        1 => {
            let m = l.check_int(1)?;
            if m < 1 {
                return Err(l.arg_error(1, "interval is empty"));
            }
            let r = l.g_mut().rng.gen_range(1..=m);
            l.push(LuaValue::integer(r))?;
        }
        _ => {
            let lo = l.check_int(1)?;
            let hi = l.check_int(2)?;
            if lo > hi {
                return Err(l.arg_error(2, "interval is empty"));
            }
            let r = l.g_mut().rng.gen_range(lo..=hi);
            l.push(LuaValue::integer(r))?;
        }
    }
    Ok(1)
}

fn math_randomseed(l: &mut LuaState) -> LuaResult<usize> {
    if l.nargs() >= 1 {
        let seed = l.check_int(1)?;
        l.g_mut().rng = rand::SeedableRng::seed_from_u64(seed as u64);
    } else {
        l.g_mut().rng = rand::SeedableRng::from_entropy();
    }
    Ok(0)
}

fn math_ult(l: &mut LuaState) -> LuaResult<usize> {
    let a = l.check_int(1)? as u64;
    let b = l.check_int(2)? as u64;
    l.push(LuaValue::boolean(a < b))?;
    Ok(1)
}
