// Call machinery: frame push/pop, native invocation, tail calls,
// protected frames (pcall/xpcall as data, so yields pass through them),
// coroutine resume/yield, and nested calls from native code.

use crate::gc::{Closure, ClosureId, GcRef, UpvalId};
use crate::limits::{EXTRA_STACK, MULTRET};
use crate::value::{LuaValue, Proto};
use crate::vm::execute::execute;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::frame::{CallInfo, cist};
use crate::vm::state::{ThreadStatus, YieldCtx};
use crate::vm::{CFunction, LuaError, LuaResult, LuaState};
use std::rc::Rc;

/// What `call_at` did with the callee.
pub(crate) enum CallOut {
    /// A Lua frame was pushed; the dispatch loop must reload.
    LuaFrame,
    /// A native ran to completion; results are already in place.
    NativeDone,
}

const MAX_CALL_META: usize = 16;

impl LuaState {
    pub(crate) fn new_str_value(&mut self, s: &str) -> LuaValue {
        let g = self.g_mut();
        g.pool.create_str(&mut g.gc, s)
    }

    pub(crate) fn closure_upval(&self, cl: ClosureId, i: usize) -> UpvalId {
        match self.g().pool.closure(cl) {
            Closure::Lua(c) => c.upvals[i],
            Closure::Native(_) => unreachable!("native closure in Lua dispatch"),
        }
    }

    /// Replaces a non-function callee with its `__call` handler, shifting
    /// the original callee down into the argument list.
    fn resolve_callee(&mut self, func_idx: usize) -> LuaResult<()> {
        for _ in 0..MAX_CALL_META {
            let fv = self.stack[func_idx];
            if fv.is_function() {
                return Ok(());
            }
            let h = self.get_metamethod(&fv, TmKind::Call);
            if h.is_nil() {
                let msg = format!("attempt to call a {} value", fv.type_name());
                return Err(self.rt_error(msg));
            }
            self.ensure_stack(1)?;
            let top = self.top;
            self.stack.copy_within(func_idx..top, func_idx + 1);
            self.top += 1;
            self.stack[func_idx] = h;
        }
        Err(self.rt_error("'__call' chain too long".to_string()))
    }

    /// Starts a call of the value at `func_idx` with the arguments
    /// between it and the current top.
    pub(crate) fn call_at(&mut self, func_idx: usize, nresults: i32) -> LuaResult<CallOut> {
        self.resolve_callee(func_idx)?;
        let fv = self.stack[func_idx];
        if fv.is_cfunction() {
            return self.call_native(func_idx, nresults, fv.as_cfunction());
        }
        let cl_id = fv.as_closure_id();
        enum Kind {
            Lua(Rc<Proto>),
            Native(CFunction),
        }
        let kind = match self.g().pool.closure(cl_id) {
            Closure::Lua(c) => Kind::Lua(c.proto.clone()),
            Closure::Native(c) => Kind::Native(c.f),
        };
        match kind {
            Kind::Native(f) => self.call_native(func_idx, nresults, f),
            Kind::Lua(proto) => {
                if self.frames.len() >= self.g().options.max_call_depth {
                    return Err(self.rt_error("stack overflow".to_string()));
                }
                let base = func_idx + 1;
                let nargs = self.top - base;
                let nfix = proto.num_params as usize;
                if nargs < nfix {
                    self.ensure_stack(nfix - nargs)?;
                    for _ in nargs..nfix {
                        let t = self.top;
                        self.stack[t] = LuaValue::nil();
                        self.top += 1;
                    }
                }
                let frame_top = base + proto.max_stack_size as usize;
                if frame_top + EXTRA_STACK > self.stack.len() {
                    let grow = frame_top + EXTRA_STACK - self.top;
                    self.ensure_stack(grow)?;
                }
                let mut ci = CallInfo::new_lua(func_idx, base, frame_top);
                ci.nresults = nresults;
                self.frames.push(ci);
                if proto.is_vararg {
                    // VARARGPREP reads the actual argument count from top.
                    self.top = base + nargs.max(nfix);
                } else {
                    self.top = frame_top;
                }
                Ok(CallOut::LuaFrame)
            }
        }
    }

    fn call_native(
        &mut self,
        func_idx: usize,
        nresults: i32,
        f: CFunction,
    ) -> LuaResult<CallOut> {
        if self.c_depth >= self.g().options.max_call_depth {
            return Err(self.rt_error("native call depth exceeded".to_string()));
        }
        let base = func_idx + 1;
        let mut ci = CallInfo::new_native(func_idx, base, self.top);
        ci.nresults = nresults;
        self.frames.push(ci);
        self.c_depth += 1;
        let res = f(self);
        self.c_depth -= 1;
        match res {
            Ok(nret) => {
                if self.reenter {
                    // The native rearranged the frames (protected call);
                    // nothing to move, just re-enter dispatch.
                    self.reenter = false;
                    return Ok(CallOut::LuaFrame);
                }
                let ci = self.frames.pop().expect("native frame vanished");
                debug_assert!(nret <= self.top - ci.base + 1);
                let first = self.top - nret;
                let dest = ci.orig_func;
                for i in 0..nret {
                    self.stack[dest + i] = self.stack[first + i];
                }
                if nresults >= 0 {
                    let w = nresults as usize;
                    for i in nret..w {
                        self.stack[dest + i] = LuaValue::nil();
                    }
                    self.top = dest + w;
                } else {
                    self.top = dest + nret;
                }
                Ok(CallOut::NativeDone)
            }
            Err(LuaError::Yield) => {
                let ci = self.frames.pop().expect("native frame vanished");
                self.yield_ctx = Some(YieldCtx { result_slot: ci.orig_func, nresults });
                Err(LuaError::Yield)
            }
            Err(e) => {
                self.frames.pop();
                Err(e)
            }
        }
    }

    /// Finishes a returning Lua frame: moves `nret` results starting at
    /// `first` down to the frame's return position, prefixes the status
    /// for protected frames, pads or truncates to the caller's wish.
    /// Returns true when the frame was the entry of the running dispatch.
    pub(crate) fn poscall(&mut self, first: usize, nret: usize) -> bool {
        let ci = self.frames.pop().expect("poscall without frame");
        let fresh = ci.is_fresh();
        let protected = ci.is_protected();
        let dest = if protected {
            self.stack[ci.ret_slot] = LuaValue::boolean(true);
            ci.ret_slot + 1
        } else {
            ci.orig_func
        };
        debug_assert!(dest <= first);
        for i in 0..nret {
            self.stack[dest + i] = self.stack[first + i];
        }
        let total_start = if protected { ci.ret_slot } else { dest };
        let mut total = nret + protected as usize;
        if ci.nresults >= 0 {
            let w = ci.nresults as usize;
            while total < w {
                self.stack[total_start + total] = LuaValue::nil();
                total += 1;
            }
            total = w;
        }
        self.top = total_start + total;
        fresh
    }

    // ---- nested calls (from native code and the host) ----

    /// Calls `f` with `args`, running the interpreter to completion.
    /// Yields cannot cross this boundary.
    pub fn call_value(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
        nresults: i32,
    ) -> LuaResult<Vec<LuaValue>> {
        self.ensure_stack(args.len() + 1)?;
        let func_idx = self.top;
        self.stack[func_idx] = f;
        self.top += 1;
        for a in args {
            let t = self.top;
            self.stack[t] = *a;
            self.top += 1;
        }
        let entry = self.frames.len();
        self.nny += 1;
        let run = match self.call_at(func_idx, nresults) {
            Ok(CallOut::LuaFrame) => {
                self.frames.last_mut().expect("frame").flags |= cist::FRESH;
                execute(self, entry)
            }
            Ok(CallOut::NativeDone) => Ok(()),
            Err(e) => Err(e),
        };
        self.nny -= 1;
        match run {
            Ok(()) => {
                let out = self.stack[func_idx..self.top].to_vec();
                self.top = func_idx;
                Ok(out)
            }
            Err(e) => {
                let errv = self.error_value;
                let _ = self.close_tbc(func_idx, Some(errv));
                self.close_upvalues(func_idx);
                self.frames.truncate(entry);
                self.top = func_idx;
                Err(e)
            }
        }
    }

    /// Nested call with a host-level protected boundary: the stack, call
    /// chain, and tbc list are restored on error and the error value is
    /// left readable via `error_object`.
    pub fn call_value_protected(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
    ) -> LuaResult<Vec<LuaValue>> {
        match self.call_value(f, args, MULTRET) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.handling_overflow = false;
                Err(e)
            }
        }
    }

    /// Protected call with pcall-shaped results, for host code.
    pub fn pcall_value(
        &mut self,
        f: LuaValue,
        args: &[LuaValue],
    ) -> (bool, Vec<LuaValue>) {
        match self.call_value_protected(f, args) {
            Ok(v) => (true, v),
            Err(_) => (false, vec![self.error_value]),
        }
    }

    // ---- protected frames (stdlib pcall / xpcall) ----

    /// Turns the running native's own call into a protected call of its
    /// first argument. Invoked by `pcall`/`xpcall`; returns the native
    /// result count (0 when dispatch should re-enter a new Lua frame).
    pub(crate) fn protect_current_call(&mut self, with_handler: bool) -> LuaResult<usize> {
        let saved = self.frame().clone();
        if self.nargs() < 1 + with_handler as usize {
            let which = if with_handler { "xpcall" } else { "pcall" };
            return Err(self.arg_error(1, &format!("value expected by '{}'", which)));
        }
        self.frames.pop();
        match self.protect_inner(&saved, with_handler) {
            Ok(None) => {
                self.reenter = true;
                Ok(0)
            }
            Ok(Some(n)) => {
                self.frames.push(saved);
                Ok(n)
            }
            Err(LuaError::Yield) => Err(LuaError::Yield),
            Err(_) => {
                // The failure itself is the protected result.
                let err = self.error_value;
                self.frames.push(saved);
                self.handling_overflow = false;
                self.top = self.frame().base;
                self.push(LuaValue::boolean(false))?;
                self.push(err)?;
                Ok(2)
            }
        }
    }

    fn protect_inner(
        &mut self,
        saved: &CallInfo,
        with_handler: bool,
    ) -> LuaResult<Option<usize>> {
        let ret_slot = saved.func;
        let wanted = saved.nresults;
        if with_handler {
            // xpcall(f, handler, ...): park the handler in the vacated
            // callee slot and close the gap in the argument list.
            let handler = self.stack[ret_slot + 2];
            let top = self.top;
            if top > ret_slot + 3 {
                self.stack.copy_within(ret_slot + 3..top, ret_slot + 2);
            }
            self.top -= 1;
            self.stack[ret_slot] = handler;
        }
        let callee_idx = ret_slot + 1;
        self.resolve_callee(callee_idx)?;
        let fv = self.stack[callee_idx];
        let is_lua_callee = fv.is_closure() && self.g().pool.closure(fv.as_closure_id()).is_lua();
        if is_lua_callee {
            match self.call_at(callee_idx, wanted)? {
                CallOut::LuaFrame => {
                    let f = self.frames.last_mut().expect("protected frame");
                    f.flags |= cist::PROTECTED;
                    f.ret_slot = ret_slot;
                    f.handler = if with_handler { Some(ret_slot) } else { None };
                    Ok(None)
                }
                CallOut::NativeDone => unreachable!("lua callee completed natively"),
            }
        } else {
            // Native callee: run it under a host-level catch. A yield
            // would have no frame to land in, so it is blocked here.
            self.nny += 1;
            let r = self.call_at(callee_idx, MULTRET);
            self.nny -= 1;
            match r {
                Ok(CallOut::NativeDone) => {
                    // Results sit at callee_idx..top; prefix the status.
                    self.ensure_stack(1)?;
                    let top = self.top;
                    self.stack.copy_within(callee_idx..top, callee_idx + 1);
                    self.stack[callee_idx] = LuaValue::boolean(true);
                    self.top += 1;
                    Ok(Some(self.top - callee_idx))
                }
                Ok(CallOut::LuaFrame) => unreachable!("native callee pushed a lua frame"),
                Err(LuaError::Yield) => Err(LuaError::Yield),
                Err(_) => {
                    let mut err = self.error_value;
                    if with_handler {
                        let h = self.stack[ret_slot];
                        self.in_error_handler = true;
                        if let Ok(mut vals) = self.call_value_protected(h, &[err]) {
                            err = vals.drain(..).next().unwrap_or(LuaValue::nil());
                        }
                        self.in_error_handler = false;
                    }
                    self.handling_overflow = false;
                    self.stack[callee_idx] = LuaValue::boolean(false);
                    self.stack[callee_idx + 1] = err;
                    self.top = callee_idx + 2;
                    Ok(Some(2))
                }
            }
        }
    }

    // ---- coroutines ----

    /// Suspends the running coroutine; `values` become resume's results.
    /// Returned as an error kind so it unwinds the dispatch loop.
    pub fn do_yield(&mut self, values: Vec<LuaValue>) -> LuaError {
        if self.is_main {
            return self.rt_error("attempt to yield from outside a coroutine".to_string());
        }
        if self.nny > 0 {
            return self.rt_error("attempt to yield across a C-call boundary".to_string());
        }
        self.yield_values = values;
        LuaError::Yield
    }

    /// Resumes this (suspended) coroutine with `args`. Returns
    /// `(true, yields-or-results)` or `(false, [error value])`.
    pub fn resume(&mut self, args: Vec<LuaValue>) -> (bool, Vec<LuaValue>) {
        match self.status {
            ThreadStatus::Suspended => {}
            ThreadStatus::Dead => {
                let msg = self.new_str_value("cannot resume dead coroutine");
                return (false, vec![msg]);
            }
            _ => {
                let msg = self.new_str_value("cannot resume non-suspended coroutine");
                return (false, vec![msg]);
            }
        }
        self.status = ThreadStatus::Running;
        // A pending yield context (not frame depth) distinguishes a
        // continuation from the first start: a native body can yield
        // with no frame left behind.
        let run = if self.yield_ctx.is_some() {
            self.reenter_coroutine(args)
        } else {
            self.start_coroutine(args)
        };
        match run {
            Ok(()) => {
                self.status = ThreadStatus::Dead;
                let out = self.stack[..self.top].to_vec();
                self.top = 0;
                (true, out)
            }
            Err(LuaError::Yield) => {
                self.status = ThreadStatus::Suspended;
                (true, std::mem::take(&mut self.yield_values))
            }
            Err(_) => {
                self.status = ThreadStatus::Dead;
                (false, vec![self.error_value])
            }
        }
    }

    fn start_coroutine(&mut self, args: Vec<LuaValue>) -> LuaResult<()> {
        debug_assert!(self.top >= 1, "coroutine body missing");
        self.top = 1;
        self.ensure_stack(args.len())?;
        for a in args {
            let t = self.top;
            self.stack[t] = a;
            self.top += 1;
        }
        match self.call_at(0, MULTRET)? {
            CallOut::LuaFrame => {
                self.frames.last_mut().expect("frame").flags |= cist::FRESH;
                execute(self, 0)
            }
            CallOut::NativeDone => Ok(()),
        }
    }

    fn reenter_coroutine(&mut self, args: Vec<LuaValue>) -> LuaResult<()> {
        let ctx = self.yield_ctx.take().expect("resumed thread has no yield context");
        let slot = ctx.result_slot;
        let n = args.len();
        let w = if ctx.nresults >= 0 { ctx.nresults as usize } else { 0 };
        self.top = slot;
        self.ensure_stack(n.max(w))?;
        for (i, a) in args.into_iter().enumerate() {
            self.stack[slot + i] = a;
        }
        if ctx.nresults >= 0 {
            for i in n..w {
                self.stack[slot + i] = LuaValue::nil();
            }
            self.top = self.frame().top;
        } else {
            self.top = slot + n;
        }
        execute(self, 0)
    }

    /// Shuts a suspended or dead coroutine down, closing pending tbc
    /// variables and upvalues. Returns the close error, if one occurred.
    pub fn close_coroutine(&mut self) -> Option<LuaValue> {
        let err = match self.close_tbc(0, None) {
            Ok(()) => None,
            Err(_) => Some(self.error_value),
        };
        self.close_upvalues(0);
        self.frames.clear();
        self.top = 0;
        self.status = ThreadStatus::Dead;
        err
    }

    // ---- finalizer dispatch ----

    /// Runs every pending `__gc` finalizer from this thread, protected;
    /// errors go to the warning channel and are swallowed.
    pub(crate) fn run_finalizers(&mut self) {
        loop {
            let next = self.g_mut().gc.take_finalizable();
            let Some(r) = next else { break };
            let objv = match r {
                GcRef::Table(id) => LuaValue::table(id),
                GcRef::Udata(id) => LuaValue::userdata(id),
                _ => continue,
            };
            let h = self.get_metamethod(&objv, TmKind::Gc);
            if h.is_nil() {
                continue;
            }
            if self.call_value_protected(h, &[objv]).is_err() {
                let msg = self.error_message();
                self.g_mut().warn_always(&format!("error in __gc metamethod ({})", msg));
            }
        }
    }

    /// Debt-driven collection step at a dispatch safepoint.
    #[inline]
    pub(crate) fn check_gc(&mut self) {
        if !self.g().gc.should_collect() {
            return;
        }
        let signal = {
            let g = self.g_mut();
            let roots = g.gc_roots();
            g.gc.step(&mut g.pool, &roots)
        };
        if signal == crate::gc::GcSignal::RunFinalizers {
            self.run_finalizers();
        }
    }
}
