// The interpreter loop: fetch, decode, execute over the running frame's
// register window. Arithmetic runs a numeric fast path and falls through
// to the MMBIN* bridge instructions on failure; calls and returns reload
// the cached frame context; errors unwind to the nearest protected frame
// or out of the loop.

pub(crate) mod arith;
pub(crate) mod call;
pub(crate) mod compare;
pub(crate) mod concat;
pub(crate) mod metamethods;
pub(crate) mod table_access;

use crate::gc::ClosureId;
use crate::limits::EXTRA_STACK;
use crate::value::{LuaValue, Proto};
use crate::vm::execute::call::CallOut;
use crate::vm::execute::metamethods::TmKind;
use crate::vm::frame::cist;
use crate::vm::opcode::{Instruction, OpCode};
use crate::vm::{LuaError, LuaResult, LuaState};
use std::rc::Rc;

enum Flow {
    Next,
    /// Frame set changed (call/return/vararg adjust): reload context.
    Reload,
    /// The entry frame returned: leave this dispatch invocation.
    Exit,
}

/// Runs the interpreter until the frame at `entry_depth` returns. The
/// frame stack below `entry_depth` belongs to enclosing invocations.
pub(crate) fn execute(l: &mut LuaState, entry_depth: usize) -> LuaResult<()> {
    'reentry: loop {
        if l.frames.len() <= entry_depth {
            return Ok(());
        }
        let ci = l.frame();
        debug_assert!(ci.is_lua(), "dispatch entered on a non-Lua frame");
        let base = ci.base;
        let mut pc = ci.pc;
        let cl_id = l.stack[ci.func].as_closure_id();
        let proto = l.current_proto();
        if pc > 0 {
            // Returning to a call site that expected a fixed result
            // count: its register window ends at the frame top again.
            let prev = proto.code[pc - 1];
            let pop = Instruction::opcode(prev);
            if matches!(pop, OpCode::Call | OpCode::TForCall) && Instruction::c(prev) != 0 {
                l.top = l.frame().top;
            }
        }
        loop {
            if let Some(budget) = l.instr_budget {
                if budget <= 0 {
                    l.instr_budget = None;
                    let e = l.rt_error("interrupted!".to_string());
                    if recover(l, entry_depth) {
                        continue 'reentry;
                    }
                    return Err(e);
                }
                l.instr_budget = Some(budget - 1);
            }
            let inst = proto.code[pc];
            pc += 1;
            l.frame_mut().pc = pc;
            match step(l, inst, &mut pc, base, &proto, cl_id) {
                Ok(Flow::Next) => {}
                Ok(Flow::Reload) => continue 'reentry,
                Ok(Flow::Exit) => return Ok(()),
                Err(LuaError::Yield) => return Err(LuaError::Yield),
                Err(e) => {
                    if recover(l, entry_depth) {
                        continue 'reentry;
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Unwinds to the nearest protected frame within this invocation,
/// leaving `false, err` at its return position. False when no protected
/// frame encloses the error here.
fn recover(l: &mut LuaState, entry_depth: usize) -> bool {
    let Some(p) = l.frames.iter().rposition(|ci| ci.is_protected()) else {
        return false;
    };
    if p < entry_depth {
        return false;
    }
    let ci = l.frames[p].clone();
    let err = l.error_value;
    // Close every tbc variable and upvalue between the error site and
    // the checkpoint, LIFO, with the error attached.
    let _ = l.close_tbc(ci.ret_slot, Some(err));
    l.close_upvalues(ci.ret_slot);
    let err = l.error_value;
    l.frames.truncate(p);
    l.stack[ci.ret_slot] = LuaValue::boolean(false);
    l.stack[ci.ret_slot + 1] = err;
    let mut total = 2usize;
    if ci.nresults >= 0 {
        let w = ci.nresults as usize;
        while total < w {
            l.stack[ci.ret_slot + total] = LuaValue::nil();
            total += 1;
        }
        total = w;
    }
    l.top = ci.ret_slot + total;
    l.handling_overflow = false;
    true
}

#[inline]
fn next_jump(proto: &Proto, pc: &mut usize) {
    let ji = proto.code[*pc];
    debug_assert_eq!(Instruction::opcode(ji), OpCode::Jmp);
    *pc = (*pc as i64 + 1 + Instruction::sj(ji) as i64) as usize;
}

#[inline]
fn cond_jump(proto: &Proto, pc: &mut usize, cond: bool, k: bool) {
    if cond != k {
        *pc += 1;
    } else {
        next_jump(proto, pc);
    }
}

fn step(
    l: &mut LuaState,
    inst: u32,
    pc: &mut usize,
    base: usize,
    proto: &Rc<Proto>,
    cl_id: ClosureId,
) -> LuaResult<Flow> {
    let op = Instruction::opcode(inst);
    let a = Instruction::a(inst);
    match op {
        OpCode::Move => {
            let b = Instruction::b(inst);
            l.stack[base + a] = l.stack[base + b];
        }
        OpCode::LoadI => {
            l.stack[base + a] = LuaValue::integer(Instruction::sbx(inst) as i64);
        }
        OpCode::LoadF => {
            l.stack[base + a] = LuaValue::float(Instruction::sbx(inst) as f64);
        }
        OpCode::LoadK => {
            l.stack[base + a] = proto.constants[Instruction::bx(inst)];
        }
        OpCode::LoadKX => {
            let ax = Instruction::ax(proto.code[*pc]);
            *pc += 1;
            l.stack[base + a] = proto.constants[ax];
        }
        OpCode::LoadFalse => {
            l.stack[base + a] = LuaValue::boolean(false);
        }
        OpCode::LFalseSkip => {
            l.stack[base + a] = LuaValue::boolean(false);
            *pc += 1;
        }
        OpCode::LoadTrue => {
            l.stack[base + a] = LuaValue::boolean(true);
        }
        OpCode::LoadNil => {
            let b = Instruction::b(inst);
            for i in 0..=b {
                l.stack[base + a + i] = LuaValue::nil();
            }
        }

        OpCode::GetUpval => {
            let b = Instruction::b(inst);
            let uv = l.closure_upval(cl_id, b);
            l.stack[base + a] = l.upvalue_get(uv);
        }
        OpCode::SetUpval => {
            let b = Instruction::b(inst);
            let uv = l.closure_upval(cl_id, b);
            let v = l.stack[base + a];
            l.upvalue_set(uv, v);
        }

        OpCode::GetTabUp => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.upvalue_get(l.closure_upval(cl_id, b));
            let key = proto.constants[c];
            l.stack[base + a] = l.index_value(t, key)?;
        }
        OpCode::GetTable => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + b];
            let key = l.stack[base + c];
            l.stack[base + a] = l.index_value(t, key)?;
        }
        OpCode::GetI => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + b];
            l.stack[base + a] = l.index_int(t, c as i64)?;
        }
        OpCode::GetField => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + b];
            let key = proto.constants[c];
            l.stack[base + a] = l.index_value(t, key)?;
        }

        OpCode::SetTabUp => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.upvalue_get(l.closure_upval(cl_id, a));
            let key = proto.constants[b];
            let v = if Instruction::k(inst) { proto.constants[c] } else { l.stack[base + c] };
            l.set_index(t, key, v)?;
        }
        OpCode::SetTable => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + a];
            let key = l.stack[base + b];
            let v = if Instruction::k(inst) { proto.constants[c] } else { l.stack[base + c] };
            l.set_index(t, key, v)?;
        }
        OpCode::SetI => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + a];
            let v = if Instruction::k(inst) { proto.constants[c] } else { l.stack[base + c] };
            l.set_index(t, LuaValue::integer(b as i64), v)?;
        }
        OpCode::SetField => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + a];
            let key = proto.constants[b];
            let v = if Instruction::k(inst) { proto.constants[c] } else { l.stack[base + c] };
            l.set_index(t, key, v)?;
        }

        OpCode::NewTable => {
            let b = Instruction::b(inst);
            let mut c = Instruction::c(inst);
            if Instruction::k(inst) {
                c += Instruction::ax(proto.code[*pc]) * (Instruction::MAX_C as usize + 1);
            }
            *pc += 1; // NEWTABLE is always followed by EXTRAARG
            let hash_hint = if b > 0 { 1 << (b - 1) } else { 0 };
            let t = {
                let g = l.g_mut();
                g.pool.create_table(&mut g.gc, c, hash_hint)
            };
            l.stack[base + a] = t;
            l.check_gc();
        }

        OpCode::SelfOp => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let t = l.stack[base + b];
            let key = if Instruction::k(inst) { proto.constants[c] } else { l.stack[base + c] };
            l.stack[base + a + 1] = t;
            l.stack[base + a] = l.index_value(t, key)?;
        }

        OpCode::AddI => {
            let b = Instruction::b(inst);
            let imm = Instruction::sc(inst);
            let rb = l.stack[base + b];
            if rb.is_integer() {
                l.stack[base + a] = LuaValue::integer(rb.as_integer().wrapping_add(imm));
                *pc += 1;
            } else if rb.is_float() {
                l.stack[base + a] = LuaValue::float(rb.as_float() + imm as f64);
                *pc += 1;
            }
            // otherwise fall through to MMBINI
        }
        OpCode::ShrI => {
            let b = Instruction::b(inst);
            let imm = Instruction::sc(inst);
            let rb = l.stack[base + b];
            if let Some(x) = l.coerce_int(&rb) {
                l.stack[base + a] = LuaValue::integer(arith::shift_left(x, imm.wrapping_neg()));
                *pc += 1;
            }
        }
        OpCode::ShlI => {
            let b = Instruction::b(inst);
            let imm = Instruction::sc(inst);
            let rb = l.stack[base + b];
            if let Some(x) = l.coerce_int(&rb) {
                l.stack[base + a] = LuaValue::integer(arith::shift_left(imm, x));
                *pc += 1;
            }
        }

        OpCode::AddK
        | OpCode::SubK
        | OpCode::MulK
        | OpCode::ModK
        | OpCode::PowK
        | OpCode::DivK
        | OpCode::IDivK
        | OpCode::BAndK
        | OpCode::BOrK
        | OpCode::BXorK => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let rb = l.stack[base + b];
            let kc = proto.constants[c];
            let tm = TmKind::of_arith_op(op);
            if let Some(r) = l.raw_arith(tm, &rb, &kc) {
                l.stack[base + a] = r?;
                *pc += 1; // skip the MMBINK bridge
            }
        }

        OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Div
        | OpCode::IDiv
        | OpCode::BAnd
        | OpCode::BOr
        | OpCode::BXor
        | OpCode::Shl
        | OpCode::Shr => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let rb = l.stack[base + b];
            let rc = l.stack[base + c];
            let tm = TmKind::of_arith_op(op);
            if let Some(r) = l.raw_arith(tm, &rb, &rc) {
                l.stack[base + a] = r?;
                *pc += 1; // skip the MMBIN bridge
            }
        }

        // The MMBIN bridges re-run the full arithmetic: the fast path
        // above them only handles number tags, so numeric strings land
        // here before metamethod dispatch does.
        OpCode::MmBin => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let prev = proto.code[*pc - 2];
            let dest = base + Instruction::a(prev);
            let tm = TmKind::ALL[c];
            let va = l.stack[base + a];
            let vb = l.stack[base + b];
            let (x, y) = if Instruction::k(inst) { (vb, va) } else { (va, vb) };
            let res = l.do_arith(tm, x, y)?;
            l.stack[dest] = res;
        }
        OpCode::MmBinI => {
            let c = Instruction::c(inst);
            let prev = proto.code[*pc - 2];
            let dest = base + Instruction::a(prev);
            let tm = TmKind::ALL[c];
            let imm = LuaValue::integer(Instruction::sb(inst));
            let ra = l.stack[base + a];
            let (x, y) = if Instruction::k(inst) { (imm, ra) } else { (ra, imm) };
            let res = l.do_arith(tm, x, y)?;
            l.stack[dest] = res;
        }
        OpCode::MmBinK => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let prev = proto.code[*pc - 2];
            let dest = base + Instruction::a(prev);
            let tm = TmKind::ALL[c];
            let kb = proto.constants[b];
            let ra = l.stack[base + a];
            let (x, y) = if Instruction::k(inst) { (kb, ra) } else { (ra, kb) };
            let res = l.do_arith(tm, x, y)?;
            l.stack[dest] = res;
        }

        OpCode::Unm => {
            let b = Instruction::b(inst);
            let rb = l.stack[base + b];
            match l.raw_arith(TmKind::Unm, &rb, &rb) {
                Some(r) => l.stack[base + a] = r?,
                None => {
                    l.stack[base + a] = l.try_bin_metamethod(TmKind::Unm, rb, rb)?;
                }
            }
        }
        OpCode::BNot => {
            let b = Instruction::b(inst);
            let rb = l.stack[base + b];
            match l.raw_arith(TmKind::BNot, &rb, &rb) {
                Some(r) => l.stack[base + a] = r?,
                None => {
                    l.stack[base + a] = l.try_bin_metamethod(TmKind::BNot, rb, rb)?;
                }
            }
        }
        OpCode::Not => {
            let b = Instruction::b(inst);
            l.stack[base + a] = LuaValue::boolean(l.stack[base + b].is_falsy());
        }
        OpCode::Len => {
            let b = Instruction::b(inst);
            let rb = l.stack[base + b];
            l.stack[base + a] = l.length_of(rb)?;
        }

        OpCode::Concat => {
            let b = Instruction::b(inst);
            l.top = base + a + b;
            l.concat_slots(base + a, b)?;
            l.top = l.frame().top;
            l.check_gc();
        }

        OpCode::Close => {
            l.close_tbc(base + a, None)?;
            l.close_upvalues(base + a);
        }
        OpCode::Tbc => {
            l.mark_tbc(base + a)?;
        }

        OpCode::Jmp => {
            let sj = Instruction::sj(inst);
            *pc = (*pc as i64 + sj as i64) as usize;
            if sj < 0 {
                l.check_gc();
            }
        }

        OpCode::Eq => {
            let b = Instruction::b(inst);
            let (ra, rb) = (l.stack[base + a], l.stack[base + b]);
            let cond = l.eq_values(ra, rb)?;
            cond_jump(proto, pc, cond, Instruction::k(inst));
        }
        OpCode::Lt => {
            let b = Instruction::b(inst);
            let (ra, rb) = (l.stack[base + a], l.stack[base + b]);
            let cond = l.lt_values(ra, rb)?;
            cond_jump(proto, pc, cond, Instruction::k(inst));
        }
        OpCode::Le => {
            let b = Instruction::b(inst);
            let (ra, rb) = (l.stack[base + a], l.stack[base + b]);
            let cond = l.le_values(ra, rb)?;
            cond_jump(proto, pc, cond, Instruction::k(inst));
        }
        OpCode::EqK => {
            let b = Instruction::b(inst);
            let ra = l.stack[base + a];
            let kb = proto.constants[b];
            let cond = l.g().pool.values_equal(&ra, &kb);
            cond_jump(proto, pc, cond, Instruction::k(inst));
        }
        OpCode::EqI => {
            let imm = Instruction::sb(inst);
            let ra = l.stack[base + a];
            let cond = if ra.is_integer() {
                ra.as_integer() == imm
            } else if ra.is_float() {
                ra.as_float() == imm as f64
            } else {
                false
            };
            cond_jump(proto, pc, cond, Instruction::k(inst));
        }
        OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI => {
            let imm = Instruction::sb(inst);
            let ra = l.stack[base + a];
            let cond = if ra.is_number() {
                let iv = LuaValue::integer(imm);
                match op {
                    OpCode::LtI => compare::num_lt(&ra, &iv),
                    OpCode::LeI => compare::num_le(&ra, &iv),
                    OpCode::GtI => compare::num_lt(&iv, &ra),
                    OpCode::GeI => compare::num_le(&iv, &ra),
                    _ => unreachable!(),
                }
            } else {
                let iv = LuaValue::integer(imm);
                match op {
                    OpCode::LtI => l.try_order_metamethod(TmKind::Lt, ra, iv)?,
                    OpCode::LeI => l.try_order_metamethod(TmKind::Le, ra, iv)?,
                    OpCode::GtI => l.try_order_metamethod(TmKind::Lt, iv, ra)?,
                    OpCode::GeI => l.try_order_metamethod(TmKind::Le, iv, ra)?,
                    _ => unreachable!(),
                }
            };
            cond_jump(proto, pc, cond, Instruction::k(inst));
        }

        OpCode::Test => {
            let falsy = l.stack[base + a].is_falsy();
            if falsy == Instruction::k(inst) {
                *pc += 1;
            } else {
                next_jump(proto, pc);
            }
        }
        OpCode::TestSet => {
            let b = Instruction::b(inst);
            let rb = l.stack[base + b];
            if rb.is_falsy() == Instruction::k(inst) {
                *pc += 1;
            } else {
                l.stack[base + a] = rb;
                next_jump(proto, pc);
            }
        }

        OpCode::Call => {
            let b = Instruction::b(inst);
            let c = Instruction::c(inst);
            let func_idx = base + a;
            if b != 0 {
                l.top = func_idx + b;
            }
            match l.call_at(func_idx, c as i32 - 1)? {
                CallOut::LuaFrame => return Ok(Flow::Reload),
                CallOut::NativeDone => {
                    if c != 0 {
                        l.top = l.frame().top;
                    }
                    l.check_gc();
                }
            }
        }
        OpCode::TailCall => {
            let b = Instruction::b(inst);
            let func_idx = base + a;
            if b != 0 {
                l.top = func_idx + b;
            }
            l.close_tbc(base, None)?;
            l.close_upvalues(base);
            let old = l.frame().clone();
            let dest = old.orig_func;
            let n = l.top - func_idx;
            for i in 0..n {
                l.stack[dest + i] = l.stack[func_idx + i];
            }
            l.top = dest + n;
            l.frames.pop();
            match l.call_at(dest, old.nresults) {
                Ok(CallOut::LuaFrame) => {
                    let f = l.frames.last_mut().expect("tail frame");
                    f.flags |= cist::TAIL | (old.flags & cist::FRESH);
                    // The vanished frame's protection carries over, unless
                    // the callee already set up its own protected frame.
                    if !f.is_protected() && old.flags & cist::PROTECTED != 0 {
                        f.flags |= cist::PROTECTED;
                        f.ret_slot = old.ret_slot;
                        f.handler = old.handler;
                    }
                    f.nresults = old.nresults;
                    return Ok(Flow::Reload);
                }
                Ok(CallOut::NativeDone) => {
                    // The native already finished: this frame's return.
                    let nret = l.top - dest;
                    l.frames.push(old);
                    let fresh = l.poscall(dest, nret);
                    l.check_gc();
                    return Ok(if fresh { Flow::Exit } else { Flow::Reload });
                }
                Err(e) => {
                    // Keep the frame bookkeeping coherent for unwinding.
                    l.frames.push(old);
                    return Err(e);
                }
            }
        }

        OpCode::Return => {
            let b = Instruction::b(inst);
            let first = base + a;
            let nret = if b == 0 { l.top - first } else { b - 1 };
            l.close_tbc(base, None)?;
            l.close_upvalues(base);
            l.check_gc();
            let fresh = l.poscall(first, nret);
            return Ok(if fresh { Flow::Exit } else { Flow::Reload });
        }
        OpCode::Return0 => {
            l.close_tbc(base, None)?;
            l.close_upvalues(base);
            l.check_gc();
            let fresh = l.poscall(base, 0);
            return Ok(if fresh { Flow::Exit } else { Flow::Reload });
        }
        OpCode::Return1 => {
            l.close_tbc(base, None)?;
            l.close_upvalues(base);
            l.check_gc();
            let fresh = l.poscall(base + a, 1);
            return Ok(if fresh { Flow::Exit } else { Flow::Reload });
        }

        OpCode::ForLoop => {
            let bx = Instruction::bx(inst);
            let step = l.stack[base + a + 2];
            if step.is_integer() {
                let count = l.stack[base + a + 1].as_integer() as u64;
                if count > 0 {
                    l.stack[base + a + 1] = LuaValue::integer((count - 1) as i64);
                    let next = l.stack[base + a].as_integer().wrapping_add(step.as_integer());
                    l.stack[base + a] = LuaValue::integer(next);
                    l.stack[base + a + 3] = LuaValue::integer(next);
                    *pc -= bx;
                    l.check_gc();
                }
            } else {
                let st = step.as_float();
                let idx = l.stack[base + a].as_float() + st;
                let lim = l.stack[base + a + 1].as_float();
                let cont = if st > 0.0 { idx <= lim } else { idx >= lim };
                if cont {
                    l.stack[base + a] = LuaValue::float(idx);
                    l.stack[base + a + 3] = LuaValue::float(idx);
                    *pc -= bx;
                    l.check_gc();
                }
            }
        }
        OpCode::ForPrep => {
            let bx = Instruction::bx(inst);
            for_prep(l, base + a, bx, pc)?;
        }

        OpCode::TForPrep => {
            let bx = Instruction::bx(inst);
            l.mark_tbc(base + a + 3)?;
            *pc += bx;
        }
        OpCode::TForCall => {
            let c = Instruction::c(inst);
            let s = base + a;
            let need = (s + 7).saturating_sub(l.top);
            l.ensure_stack(need)?;
            l.stack[s + 4] = l.stack[s];
            l.stack[s + 5] = l.stack[s + 1];
            l.stack[s + 6] = l.stack[s + 2];
            l.top = s + 7;
            match l.call_at(s + 4, c as i32)? {
                CallOut::LuaFrame => return Ok(Flow::Reload),
                CallOut::NativeDone => {
                    l.top = l.frame().top;
                }
            }
        }
        OpCode::TForLoop => {
            let bx = Instruction::bx(inst);
            let ctrl = l.stack[base + a + 2];
            if !ctrl.is_nil() {
                l.stack[base + a] = ctrl;
                *pc -= bx;
                l.check_gc();
            }
        }

        OpCode::SetList => {
            let b = Instruction::b(inst);
            let mut c = Instruction::c(inst);
            if Instruction::k(inst) {
                c += Instruction::ax(proto.code[*pc]) * (Instruction::MAX_C as usize + 1);
                *pc += 1;
            }
            let n = if b == 0 { l.top - (base + a) - 1 } else { b };
            let t = l.stack[base + a];
            debug_assert!(t.is_table());
            let tid = t.as_table_id();
            for i in 1..=n {
                let v = l.stack[base + a + i];
                l.g_mut().raw_seti(tid, (c + i) as i64, v);
            }
            l.top = l.frame().top;
        }

        OpCode::Closure => {
            let bx = Instruction::bx(inst);
            let sub = proto.protos[bx].clone();
            let mut ups = Vec::with_capacity(sub.upvalues.len());
            for ud in &sub.upvalues {
                if ud.in_stack {
                    ups.push(l.find_upvalue(base + ud.idx as usize));
                } else {
                    ups.push(l.closure_upval(cl_id, ud.idx as usize));
                }
            }
            let v = {
                let g = l.g_mut();
                g.pool.create_closure(&mut g.gc, sub, ups)
            };
            l.stack[base + a] = v;
            l.check_gc();
        }

        OpCode::Vararg => {
            let c = Instruction::c(inst);
            let ci = l.frame().clone();
            let nextra = ci.nextraargs;
            let from = ci.func - nextra;
            if c == 0 {
                // All extras, onto the open top.
                let need = (base + a + nextra).saturating_sub(l.top) + EXTRA_STACK;
                l.ensure_stack(need)?;
                for i in 0..nextra {
                    l.stack[base + a + i] = l.stack[from + i];
                }
                l.top = base + a + nextra;
            } else {
                let wanted = c - 1;
                for i in 0..wanted {
                    l.stack[base + a + i] =
                        if i < nextra { l.stack[from + i] } else { LuaValue::nil() };
                }
            }
        }
        OpCode::VarargPrep => {
            vararg_prep(l, proto)?;
            return Ok(Flow::Reload);
        }

        OpCode::ExtraArg => {
            debug_assert!(false, "EXTRAARG executed directly");
        }
    }
    Ok(Flow::Next)
}

fn for_prep(l: &mut LuaState, s: usize, bx: usize, pc: &mut usize) -> LuaResult<()> {
    let init = l.stack[s];
    let limit = l.stack[s + 1];
    let step = l.stack[s + 2];
    if init.is_integer() && limit.is_integer() && step.is_integer() {
        let (i0, lim, st) = (init.as_integer(), limit.as_integer(), step.as_integer());
        if st == 0 {
            return Err(l.rt_error("'for' step is zero".to_string()));
        }
        let skip = if st > 0 { i0 > lim } else { i0 < lim };
        if skip {
            *pc += bx + 1;
        } else {
            let count = if st > 0 {
                (lim as u64).wrapping_sub(i0 as u64) / (st as u64)
            } else {
                (i0 as u64).wrapping_sub(lim as u64) / st.unsigned_abs()
            };
            l.stack[s + 1] = LuaValue::integer(count as i64);
            l.stack[s + 3] = init;
        }
    } else {
        let fi = for_number(l, init, "initial")?;
        let fl = for_number(l, limit, "limit")?;
        let fs = for_number(l, step, "step")?;
        if fs == 0.0 {
            return Err(l.rt_error("'for' step is zero".to_string()));
        }
        let skip = if fs > 0.0 { fi > fl } else { fi < fl };
        if skip {
            *pc += bx + 1;
        } else {
            l.stack[s] = LuaValue::float(fi);
            l.stack[s + 1] = LuaValue::float(fl);
            l.stack[s + 2] = LuaValue::float(fs);
            l.stack[s + 3] = LuaValue::float(fi);
        }
    }
    Ok(())
}

fn for_number(l: &mut LuaState, v: LuaValue, what: &str) -> LuaResult<f64> {
    if v.is_integer() {
        Ok(v.as_integer() as f64)
    } else if v.is_float() {
        Ok(v.as_float())
    } else {
        Err(l.rt_error(format!("'for' {} value must be a number", what)))
    }
}

fn vararg_prep(l: &mut LuaState, proto: &Rc<Proto>) -> LuaResult<()> {
    let ci = l.frame().clone();
    let nfix = proto.num_params as usize;
    let actual = l.top - ci.base;
    debug_assert!(actual >= nfix);
    let nextra = actual - nfix;
    l.ensure_stack(nfix + 1)?;
    let old_func = ci.func;
    let t = l.top;
    for i in 0..=nfix {
        l.stack[t + i] = l.stack[old_func + i];
        l.stack[old_func + i] = LuaValue::nil();
    }
    let new_func = old_func + actual + 1;
    debug_assert_eq!(new_func, t);
    let frame_top = new_func + 1 + proto.max_stack_size as usize;
    if frame_top + EXTRA_STACK > l.stack.len() {
        let grow = frame_top + EXTRA_STACK - l.top;
        l.ensure_stack(grow)?;
    }
    let ci = l.frame_mut();
    ci.func = new_func;
    ci.base = new_func + 1;
    ci.top = frame_top;
    ci.nextraargs = nextra;
    l.top = frame_top;
    Ok(())
}
