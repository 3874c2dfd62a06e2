// Per-thread execution state: the contiguous value stack, the call
// chain, open upvalues, and the to-be-closed list. Every reference into
// the stack is an index, so reallocation on growth moves nothing else.
//
// The back-pointer to the global state is raw: a thread lives inside the
// global state's pool while running against it, exactly one of each is
// active at a time, and the accessors below are the only doorway.

use crate::gc::{ThreadId, UpvalId};
use crate::limits::{
    BASIC_STACK_SIZE, ERROR_STACK_RESERVE, EXTRA_STACK, LuaInt,
};
use crate::value::convert;
use crate::value::{LuaValue, Proto};
use crate::vm::frame::CallInfo;
use crate::vm::{LuaError, LuaResult, LuaVM, TmKind};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not started or parked at a yield.
    Suspended,
    Running,
    /// Alive but resumed some other coroutine.
    Normal,
    Dead,
}

/// Where a yield interrupted a call, so resume can finish it.
#[derive(Clone, Copy)]
pub(crate) struct YieldCtx {
    /// Stack slot of the call being completed by the resume values.
    pub result_slot: usize,
    /// Results the interrupted call site expects.
    pub nresults: i32,
}

pub struct LuaState {
    vm: *mut LuaVM,
    pub(crate) id: ThreadId,
    pub(crate) is_main: bool,

    pub(crate) stack: Vec<LuaValue>,
    /// First free slot; live values sit strictly below.
    pub(crate) top: usize,
    pub(crate) frames: Vec<CallInfo>,

    /// Open upvalues sorted ascending by stack slot; at most one per slot.
    pub(crate) open_upvals: Vec<(usize, UpvalId)>,
    /// To-be-closed slots, LIFO.
    pub(crate) tbc: Vec<usize>,

    pub(crate) status: ThreadStatus,
    pub(crate) error_value: LuaValue,
    pub(crate) yield_values: Vec<LuaValue>,
    pub(crate) yield_ctx: Option<YieldCtx>,

    /// Non-yieldable nesting: >0 whenever a native Rust frame sits
    /// between here and the resume boundary.
    pub(crate) nny: usize,
    /// Native reentry depth (guards the host stack).
    pub(crate) c_depth: usize,
    /// A native rearranged the frames; dispatch must reload instead of
    /// doing normal result handling.
    pub(crate) reenter: bool,

    pub(crate) in_error_handler: bool,
    pub(crate) handling_overflow: bool,

    /// Cooperative cancellation: when set, decremented per dispatched
    /// instruction; hitting zero raises "interrupted".
    pub(crate) instr_budget: Option<i64>,
}

impl LuaState {
    pub(crate) fn new(vm: *mut LuaVM, is_main: bool) -> Self {
        LuaState {
            vm,
            id: ThreadId(u32::MAX),
            is_main,
            stack: vec![LuaValue::nil(); BASIC_STACK_SIZE],
            top: 0,
            frames: Vec::with_capacity(8),
            open_upvals: Vec::new(),
            tbc: Vec::new(),
            status: if is_main { ThreadStatus::Running } else { ThreadStatus::Suspended },
            error_value: LuaValue::nil(),
            yield_values: Vec::new(),
            yield_ctx: None,
            nny: if is_main { 1 } else { 0 },
            c_depth: 0,
            reenter: false,
            in_error_handler: false,
            handling_overflow: false,
            instr_budget: None,
        }
    }

    pub(crate) fn set_id(&mut self, id: ThreadId) {
        self.id = id;
    }

    #[inline(always)]
    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    #[inline(always)]
    pub fn is_main_thread(&self) -> bool {
        self.is_main
    }

    #[inline(always)]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    // ---- global-state access ----

    #[inline(always)]
    pub fn g(&self) -> &LuaVM {
        unsafe { &*self.vm }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn g_mut(&mut self) -> &mut LuaVM {
        unsafe { &mut *self.vm }
    }

    pub(crate) fn vm_ptr(&self) -> *mut LuaVM {
        self.vm
    }

    // ---- stack management ----

    #[inline(always)]
    pub fn get_top(&self) -> usize {
        self.top
    }

    #[inline(always)]
    pub(crate) fn set_top(&mut self, top: usize) {
        debug_assert!(top <= self.stack.len());
        self.top = top;
    }

    /// Guarantees `extra` free slots above the current top, growing by
    /// 1.5x up to the configured hard maximum (plus the error reserve
    /// while unwinding). Overflowing the reserve is fatal.
    pub fn ensure_stack(&mut self, extra: usize) -> LuaResult<()> {
        let needed = self.top + extra + EXTRA_STACK;
        if needed <= self.stack.len() {
            return Ok(());
        }
        let max = self.g().options.max_stack;
        let limit = if self.handling_overflow { max + ERROR_STACK_RESERVE } else { max };
        if needed > limit {
            if self.handling_overflow {
                // Overflow while handling an overflow: there is no stack
                // left to raise on.
                (self.g().options.panic)("stack overflow in error handling");
            }
            self.handling_overflow = true;
            return Err(self.rt_error("stack overflow".to_string()));
        }
        let new_len = needed.max(self.stack.len() + self.stack.len() / 2).min(limit);
        self.stack.resize(new_len, LuaValue::nil());
        Ok(())
    }

    #[inline]
    pub fn push(&mut self, v: LuaValue) -> LuaResult<()> {
        self.ensure_stack(1)?;
        self.stack[self.top] = v;
        self.top += 1;
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> LuaValue {
        debug_assert!(self.top > 0);
        self.top -= 1;
        self.stack[self.top]
    }

    #[inline(always)]
    pub fn stack_get(&self, idx: usize) -> LuaValue {
        self.stack[idx]
    }

    #[inline(always)]
    pub(crate) fn stack_set(&mut self, idx: usize, v: LuaValue) {
        self.stack[idx] = v;
    }

    // ---- frames ----

    #[inline(always)]
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    #[inline(always)]
    pub(crate) fn frame(&self) -> &CallInfo {
        self.frames.last().expect("no active frame")
    }

    #[inline(always)]
    pub(crate) fn frame_mut(&mut self) -> &mut CallInfo {
        self.frames.last_mut().expect("no active frame")
    }

    /// Prototype of the running Lua frame.
    pub(crate) fn current_proto(&self) -> Rc<Proto> {
        let ci = self.frame();
        debug_assert!(ci.is_lua());
        let cl = self.stack[ci.func].as_closure_id();
        self.g().pool.closure(cl).proto().expect("lua frame without proto").clone()
    }

    /// Current source position, for error messages.
    pub(crate) fn where_str(&self) -> String {
        for ci in self.frames.iter().rev() {
            if ci.is_lua() {
                let cl = self.stack[ci.func].as_closure_id();
                if let Some(proto) = self.g().pool.closure(cl).proto() {
                    let line = proto.line_at(ci.pc.saturating_sub(1));
                    return format!("{}:{}: ", chunk_id(&proto.source), line);
                }
            }
        }
        String::new()
    }

    /// Conventional traceback block for message handlers and the CLI.
    pub fn generate_traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for ci in self.frames.iter().rev() {
            if ci.is_lua() {
                let cl = self.stack[ci.func].as_closure_id();
                if let Some(proto) = self.g().pool.closure(cl).proto() {
                    let line = proto.line_at(ci.pc.saturating_sub(1));
                    let what = if proto.line_defined == 0 { "in main chunk".to_string() } else {
                        format!("in function <{}:{}>", chunk_id(&proto.source), proto.line_defined)
                    };
                    out.push_str(&format!("\n\t{}:{}: {}", chunk_id(&proto.source), line, what));
                }
            } else {
                out.push_str("\n\t[C]: in ?");
            }
        }
        out
    }

    // ---- open upvalues ----

    /// Finds the open upvalue for `slot`, creating it if absent. Keeps
    /// the per-slot uniqueness invariant.
    pub(crate) fn find_upvalue(&mut self, slot: usize) -> UpvalId {
        match self.open_upvals.binary_search_by_key(&slot, |&(s, _)| s) {
            Ok(i) => self.open_upvals[i].1,
            Err(i) => {
                let tid = self.id;
                let g = self.g_mut();
                let id = g.pool.create_upvalue_open(&mut g.gc, tid, slot);
                self.open_upvals.insert(i, (slot, id));
                id
            }
        }
    }

    /// Closes every open upvalue at or above `level`: the stack value
    /// moves into the upvalue object and the list entry is dropped.
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        while let Some(&(slot, id)) = self.open_upvals.last() {
            if slot < level {
                break;
            }
            let value = self.stack[slot];
            let g = self.g_mut();
            g.pool.upval_mut(id).close(value);
            g.gc.barrier_upval_close(&mut g.pool, id, &value);
            self.open_upvals.pop();
        }
    }

    /// Reads through an upvalue of the running closure.
    pub(crate) fn upvalue_get(&self, id: UpvalId) -> LuaValue {
        match self.g().pool.upval(id) {
            crate::gc::Upvalue::Closed(v) => *v,
            crate::gc::Upvalue::Open { thread, slot } => {
                if *thread == self.id {
                    self.stack[*slot]
                } else {
                    self.g().pool.thread(*thread).stack[*slot]
                }
            }
        }
    }

    pub(crate) fn upvalue_set(&mut self, id: UpvalId, v: LuaValue) {
        let (thread, slot) = match self.g().pool.upval(id) {
            crate::gc::Upvalue::Open { thread, slot } => (Some(*thread), *slot),
            crate::gc::Upvalue::Closed(_) => (None, 0),
        };
        match thread {
            Some(t) if t == self.id => self.stack[slot] = v,
            Some(t) => {
                let g = self.g_mut();
                let ptr = g.pool.thread_ptr(t);
                unsafe { (&mut (*ptr).stack)[slot] = v };
            }
            None => {
                let g = self.g_mut();
                *g.pool.upval_mut(id) = crate::gc::Upvalue::Closed(v);
                g.gc.barrier_upval_close(&mut g.pool, id, &v);
            }
        }
    }

    // ---- to-be-closed variables ----

    /// Registers `slot` as to-be-closed. nil and false are accepted and
    /// ignored at close time; anything else must carry `__close`.
    pub(crate) fn mark_tbc(&mut self, slot: usize) -> LuaResult<()> {
        let v = self.stack[slot];
        if v.is_falsy() {
            return Ok(());
        }
        if self.get_metamethod(&v, TmKind::Close).is_nil() {
            let tn = v.type_name();
            return Err(self.rt_error(format!(
                "variable '{}' got a non-closable value (a {} value)",
                "?", tn
            )));
        }
        self.tbc.push(slot);
        Ok(())
    }

    /// Closes, in LIFO order, every tbc variable at or above `level`.
    /// `err` is the propagating error, if any; a `__close` failure during
    /// propagation is reported to the warning channel and the original
    /// error stays primary. During a normal exit a `__close` failure
    /// becomes the new error.
    pub(crate) fn close_tbc(&mut self, level: usize, err: Option<LuaValue>) -> LuaResult<()> {
        while let Some(&slot) = self.tbc.last() {
            if slot < level {
                break;
            }
            self.tbc.pop();
            let v = self.stack[slot];
            if v.is_falsy() {
                continue;
            }
            let close = self.get_metamethod(&v, TmKind::Close);
            if close.is_nil() {
                continue;
            }
            let errval = err.unwrap_or(LuaValue::nil());
            match self.call_value_protected(close, &[v, errval]) {
                Ok(_) => {}
                Err(_) => {
                    let second = self.error_value;
                    if err.is_some() {
                        // Keep the original error primary; the secondary
                        // goes to the warning channel.
                        let msg = self.describe_value(&second);
                        self.g_mut().warn(&format!("error in __close ({})", msg));
                        self.error_value = err.unwrap_or(LuaValue::nil());
                    } else {
                        // A clean scope exit turned into an error.
                        self.close_tbc(level, Some(second))?;
                        self.error_value = second;
                        return Err(LuaError::Runtime);
                    }
                }
            }
        }
        Ok(())
    }

    // ---- error raising ----

    /// Raises a runtime error with source position prefixed.
    pub fn rt_error(&mut self, msg: String) -> LuaError {
        let full = format!("{}{}", self.where_str(), msg);
        let v = {
            let g = self.g_mut();
            g.pool.create_str(&mut g.gc, &full)
        };
        self.raise_value(v)
    }

    /// Raises an arbitrary Lua value as an error. If a protected frame
    /// with a message handler encloses us, the handler runs now, while
    /// the stack is intact.
    pub fn raise_value(&mut self, v: LuaValue) -> LuaError {
        let handler = if self.in_error_handler {
            None
        } else {
            self.frames.iter().rev().find(|ci| ci.is_protected()).and_then(|ci| ci.handler)
        };
        match handler {
            Some(hslot) => {
                self.in_error_handler = true;
                let h = self.stack[hslot];
                let res = self.call_value_protected(h, &[v]);
                self.in_error_handler = false;
                match res {
                    Ok(mut vals) => {
                        self.error_value = vals.drain(..).next().unwrap_or(LuaValue::nil());
                        LuaError::Runtime
                    }
                    Err(_) => {
                        let ev = {
                            let g = self.g_mut();
                            g.pool.create_str(&mut g.gc, "error in error handling")
                        };
                        self.error_value = ev;
                        LuaError::ErrErr
                    }
                }
            }
            None => {
                self.error_value = v;
                LuaError::Runtime
            }
        }
    }

    pub fn type_error(&mut self, op: &str, v: &LuaValue) -> LuaError {
        self.rt_error(format!("attempt to {} a {} value", op, v.type_name()))
    }

    /// Renders an error value for host-facing messages.
    pub fn describe_value(&self, v: &LuaValue) -> String {
        if v.is_string() {
            self.g().pool.str_utf8(v.as_string_id()).into_owned()
        } else if v.is_integer() {
            convert::int_to_str(v.as_integer())
        } else if v.is_float() {
            convert::float_to_str(v.as_float())
        } else if v.is_nil() {
            "nil".to_string()
        } else if v.is_boolean() {
            v.as_boolean().to_string()
        } else {
            format!("(error object is a {} value)", v.type_name())
        }
    }

    pub fn error_message(&self) -> String {
        self.describe_value(&self.error_value)
    }

    pub fn error_object(&self) -> LuaValue {
        self.error_value
    }

    // ---- native-function argument interface ----

    /// Number of arguments the running native received.
    pub fn nargs(&self) -> usize {
        let ci = self.frame();
        self.top - ci.base
    }

    /// Argument by 1-based position; nil when missing.
    pub fn arg(&self, n: usize) -> LuaValue {
        let ci = self.frame();
        let idx = ci.base + n - 1;
        if idx < self.top { self.stack[idx] } else { LuaValue::nil() }
    }

    /// Absolute stack slot of argument `n`.
    pub(crate) fn arg_slot(&self, n: usize) -> usize {
        self.frame().base + n - 1
    }

    pub fn check_any(&mut self, n: usize) -> LuaResult<LuaValue> {
        if n > self.nargs() {
            return Err(self.arg_error(n, "value expected"));
        }
        Ok(self.arg(n))
    }

    pub fn check_int(&mut self, n: usize) -> LuaResult<LuaInt> {
        let v = self.arg(n);
        self.to_integer(&v).ok_or_else(|| {
            self.arg_error(n, &format!("number expected, got {}", self.arg(n).type_name()))
        })
    }

    pub fn check_number(&mut self, n: usize) -> LuaResult<f64> {
        let v = self.arg(n);
        self.to_number(&v).ok_or_else(|| {
            self.arg_error(n, &format!("number expected, got {}", self.arg(n).type_name()))
        })
    }

    pub fn check_string(&mut self, n: usize) -> LuaResult<String> {
        let v = self.arg(n);
        if v.is_string() {
            Ok(self.g().pool.str_utf8(v.as_string_id()).into_owned())
        } else if v.is_integer() {
            Ok(convert::int_to_str(v.as_integer()))
        } else if v.is_float() {
            Ok(convert::float_to_str(v.as_float()))
        } else {
            Err(self.arg_error(n, &format!("string expected, got {}", v.type_name())))
        }
    }

    pub fn check_table(&mut self, n: usize) -> LuaResult<crate::gc::TableId> {
        let v = self.arg(n);
        if v.is_table() {
            Ok(v.as_table_id())
        } else {
            Err(self.arg_error(n, &format!("table expected, got {}", v.type_name())))
        }
    }

    pub fn opt_int(&mut self, n: usize, default: LuaInt) -> LuaResult<LuaInt> {
        if n > self.nargs() || self.arg(n).is_nil() { Ok(default) } else { self.check_int(n) }
    }

    pub fn arg_error(&mut self, n: usize, msg: &str) -> LuaError {
        self.rt_error(format!("bad argument #{} ({})", n, msg))
    }

    /// Pushes a string result.
    pub fn push_str(&mut self, s: &str) -> LuaResult<()> {
        let v = {
            let g = self.g_mut();
            g.pool.create_str(&mut g.gc, s)
        };
        self.push(v)
    }

    pub fn push_bytes(&mut self, b: &[u8]) -> LuaResult<()> {
        let v = {
            let g = self.g_mut();
            g.pool.create_string(&mut g.gc, b)
        };
        self.push(v)
    }

    // ---- coercions (value-level, metamethod-free) ----

    /// Number coercion: numbers pass through, numeric strings parse.
    pub fn to_number(&self, v: &LuaValue) -> Option<f64> {
        if v.is_integer() {
            Some(v.as_integer() as f64)
        } else if v.is_float() {
            Some(v.as_float())
        } else if v.is_string() {
            let s = self.g().pool.str_utf8(v.as_string_id());
            match convert::str_to_number(&s)? {
                convert::Number::Int(i) => Some(i as f64),
                convert::Number::Float(f) => Some(f),
            }
        } else {
            None
        }
    }

    /// Integer coercion: exact floats convert, numeric strings parse
    /// (fractional string forms are rejected).
    pub fn to_integer(&self, v: &LuaValue) -> Option<LuaInt> {
        if v.is_integer() {
            Some(v.as_integer())
        } else if v.is_float() {
            convert::float_to_int(v.as_float(), convert::F2IMode::Exact)
        } else if v.is_string() {
            let s = self.g().pool.str_utf8(v.as_string_id());
            match convert::str_to_number(&s)? {
                convert::Number::Int(i) => Some(i),
                convert::Number::Float(f) => convert::float_to_int(f, convert::F2IMode::Exact),
            }
        } else {
            None
        }
    }

    /// `tostring` without the `__tostring` metamethod.
    pub fn to_display(&self, v: &LuaValue) -> String {
        if v.is_string() {
            self.g().pool.str_utf8(v.as_string_id()).into_owned()
        } else if v.is_integer() {
            convert::int_to_str(v.as_integer())
        } else if v.is_float() {
            convert::float_to_str(v.as_float())
        } else if v.is_nil() {
            "nil".to_string()
        } else if v.is_boolean() {
            v.as_boolean().to_string()
        } else if v.is_collectable() {
            format!("{}: 0x{:08x}", v.type_name(), v.gc_id())
        } else {
            format!("{}: 0x{:x}", v.type_name(), v.payload_bits())
        }
    }

    /// Upvalue `i` (0-based) of the running native closure.
    pub fn native_upvalue(&self, i: usize) -> LuaValue {
        let ci = self.frame();
        let fv = self.stack[ci.func];
        if fv.is_closure() {
            if let crate::gc::Closure::Native(c) = self.g().pool.closure(fv.as_closure_id()) {
                return c.upvals.get(i).copied().unwrap_or(LuaValue::nil());
            }
        }
        LuaValue::nil()
    }

    // ---- cancellation hook ----

    /// Installs an instruction budget; the dispatch loop raises
    /// "interrupted" once it is exhausted.
    pub fn set_instruction_budget(&mut self, budget: Option<i64>) {
        self.instr_budget = budget;
    }
}

/// Shortens a chunk name for messages.
fn chunk_id(source: &str) -> &str {
    source.strip_prefix('@').unwrap_or(source)
}
