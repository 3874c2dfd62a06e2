// Coroutine library: thin wrappers over the thread model's
// resume/yield. Each coroutine is a pooled thread; resuming swaps the
// active state, never the host thread.

use crate::gc::ThreadId;
use crate::stdlib::{new_lib, set_fn};
use crate::value::LuaValue;
use crate::vm::{LuaResult, LuaState, LuaVM, ThreadStatus};

pub fn open(vm: &mut LuaVM) -> LuaResult<()> {
    let t = new_lib(vm, "coroutine");
    set_fn(vm, t, "create", co_create);
    set_fn(vm, t, "resume", co_resume);
    set_fn(vm, t, "yield", co_yield);
    set_fn(vm, t, "status", co_status);
    set_fn(vm, t, "wrap", co_wrap);
    set_fn(vm, t, "isyieldable", co_isyieldable);
    set_fn(vm, t, "running", co_running);
    set_fn(vm, t, "close", co_close);
    Ok(())
}

fn check_thread(l: &mut LuaState, n: usize) -> LuaResult<ThreadId> {
    let v = l.arg(n);
    if v.is_thread() {
        Ok(v.as_thread_id())
    } else {
        Err(l.arg_error(n, &format!("coroutine expected, got {}", v.type_name())))
    }
}

fn co_create(l: &mut LuaState) -> LuaResult<usize> {
    let f = l.check_any(1)?;
    if !f.is_function() {
        return Err(l.arg_error(1, "function expected"));
    }
    let co = l.g_mut().new_coroutine(f);
    l.push(co)?;
    Ok(1)
}

/// Transfers control into `tid`. The resumer parks as Normal for the
/// duration; the target runs on its own stack and call chain.
fn resume_into(l: &mut LuaState, tid: ThreadId, args: Vec<LuaValue>) -> (bool, Vec<LuaValue>) {
    if tid == l.thread_id() {
        let msg = l.new_str_value("cannot resume non-suspended coroutine");
        return (false, vec![msg]);
    }
    let ptr = l.g_mut().pool.thread_ptr(tid);
    let co = unsafe { &mut *ptr };
    l.status = ThreadStatus::Normal;
    let out = co.resume(args);
    l.status = ThreadStatus::Running;
    out
}

fn co_resume(l: &mut LuaState) -> LuaResult<usize> {
    let tid = check_thread(l, 1)?;
    let args: Vec<LuaValue> = (2..=l.nargs()).map(|i| l.arg(i)).collect();
    let (ok, vals) = resume_into(l, tid, args);
    l.ensure_stack(vals.len() + 1)?;
    l.push(LuaValue::boolean(ok))?;
    let n = vals.len();
    for v in vals {
        l.push(v)?;
    }
    Ok(n + 1)
}

fn co_yield(l: &mut LuaState) -> LuaResult<usize> {
    let args: Vec<LuaValue> = (1..=l.nargs()).map(|i| l.arg(i)).collect();
    Err(l.do_yield(args))
}

fn co_status(l: &mut LuaState) -> LuaResult<usize> {
    let tid = check_thread(l, 1)?;
    let s = if tid == l.thread_id() {
        "running"
    } else {
        match l.g().pool.thread(tid).status() {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead => "dead",
            ThreadStatus::Running => "running",
        }
    };
    l.push_str(s)?;
    Ok(1)
}

fn wrap_call(l: &mut LuaState) -> LuaResult<usize> {
    let co = l.native_upvalue(0);
    debug_assert!(co.is_thread());
    let tid = co.as_thread_id();
    let args: Vec<LuaValue> = (1..=l.nargs()).map(|i| l.arg(i)).collect();
    let (ok, mut vals) = resume_into(l, tid, args);
    if !ok {
        let err = vals.drain(..).next().unwrap_or(LuaValue::nil());
        return Err(l.raise_value(err));
    }
    l.ensure_stack(vals.len())?;
    let n = vals.len();
    for v in vals {
        l.push(v)?;
    }
    Ok(n)
}

fn co_wrap(l: &mut LuaState) -> LuaResult<usize> {
    let f = l.check_any(1)?;
    if !f.is_function() {
        return Err(l.arg_error(1, "function expected"));
    }
    let co = l.g_mut().new_coroutine(f);
    let wrapper = {
        let g = l.g_mut();
        g.pool.create_native_closure(&mut g.gc, wrap_call, vec![co])
    };
    l.push(wrapper)?;
    Ok(1)
}

fn co_isyieldable(l: &mut LuaState) -> LuaResult<usize> {
    let yieldable = !l.is_main_thread() && l.nny == 0;
    l.push(LuaValue::boolean(yieldable))?;
    Ok(1)
}

fn co_running(l: &mut LuaState) -> LuaResult<usize> {
    let me = LuaValue::thread(l.thread_id());
    l.push(me)?;
    l.push(LuaValue::boolean(l.is_main_thread()))?;
    Ok(2)
}

fn co_close(l: &mut LuaState) -> LuaResult<usize> {
    let tid = check_thread(l, 1)?;
    if tid == l.thread_id() {
        return Err(l.rt_error("cannot close a running coroutine".to_string()));
    }
    let status = l.g().pool.thread(tid).status();
    match status {
        ThreadStatus::Suspended | ThreadStatus::Dead => {
            let ptr = l.g_mut().pool.thread_ptr(tid);
            let co = unsafe { &mut *ptr };
            match co.close_coroutine() {
                None => {
                    l.push(LuaValue::boolean(true))?;
                    Ok(1)
                }
                Some(err) => {
                    l.push(LuaValue::boolean(false))?;
                    l.push(err)?;
                    Ok(2)
                }
            }
        }
        _ => Err(l.rt_error("cannot close a running coroutine".to_string())),
    }
}
