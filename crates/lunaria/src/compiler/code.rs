// Code emission: registers, the constant pool, jump patch lists, and
// operator compilation with compile-time folding. Expressions arrive as
// ExpDesc records and leave as registers, constants, or pending jumps.

use crate::compiler::expdesc::{ExpDesc, ExpKind, FoldValue, NO_JUMP};
use crate::compiler::{KKey, Parser};
use crate::gc::StringId;
use crate::limits::MULTRET;
use crate::value::convert::float_to_int;
use crate::value::proto::add_line_info;
use crate::value::F2IMode;
use crate::value::LuaValue;
use crate::vm::opcode::{Instruction, OpCode};
use crate::vm::TmKind;

/// "No register" marker used while patching TESTSET instructions.
pub(crate) const NO_REG: u32 = Instruction::MAX_A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnOpr {
    Minus,
    BNot,
    Not,
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOpr {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOpr {
    /// (left, right) binding priorities; right < left means right
    /// associative.
    pub fn priority(self) -> (u8, u8) {
        use BinOpr::*;
        match self {
            Or => (1, 1),
            And => (2, 2),
            Eq | Ne | Lt | Le | Gt | Ge => (3, 3),
            BOr => (4, 4),
            BXor => (5, 5),
            BAnd => (6, 6),
            Shl | Shr => (7, 7),
            Concat => (9, 8),
            Add | Sub => (10, 10),
            Mul | Div | IDiv | Mod => (11, 11),
            Pow => (14, 13),
        }
    }

    fn arith_op(self) -> Option<(OpCode, TmKind)> {
        use BinOpr::*;
        Some(match self {
            Add => (OpCode::Add, TmKind::Add),
            Sub => (OpCode::Sub, TmKind::Sub),
            Mul => (OpCode::Mul, TmKind::Mul),
            Mod => (OpCode::Mod, TmKind::Mod),
            Pow => (OpCode::Pow, TmKind::Pow),
            Div => (OpCode::Div, TmKind::Div),
            IDiv => (OpCode::IDiv, TmKind::IDiv),
            BAnd => (OpCode::BAnd, TmKind::BAnd),
            BOr => (OpCode::BOr, TmKind::BOr),
            BXor => (OpCode::BXor, TmKind::BXor),
            Shl => (OpCode::Shl, TmKind::Shl),
            Shr => (OpCode::Shr, TmKind::Shr),
            _ => return None,
        })
    }

    fn k_op(self) -> Option<OpCode> {
        use BinOpr::*;
        Some(match self {
            Add => OpCode::AddK,
            Sub => OpCode::SubK,
            Mul => OpCode::MulK,
            Mod => OpCode::ModK,
            Pow => OpCode::PowK,
            Div => OpCode::DivK,
            IDiv => OpCode::IDivK,
            BAnd => OpCode::BAndK,
            BOr => OpCode::BOrK,
            BXor => OpCode::BXorK,
            _ => return None,
        })
    }

    fn commutative(self) -> bool {
        matches!(self, BinOpr::Add | BinOpr::Mul | BinOpr::BAnd | BinOpr::BOr | BinOpr::BXor)
    }

    fn int_only(self) -> bool {
        matches!(self, BinOpr::BAnd | BinOpr::BOr | BinOpr::BXor | BinOpr::Shl | BinOpr::Shr)
    }
}

pub(crate) const UNARY_PRIORITY: u8 = 12;

impl Parser<'_> {
    // ---- raw emission ----

    pub(crate) fn emit(&mut self, inst: u32) -> Result<i32, String> {
        let line = self.lx.token_line;
        let fs = self.fs();
        fs.proto.code.push(inst);
        let (mut pl, mut iw) = (fs.prev_line, fs.iwthabs);
        add_line_info(&mut fs.proto, &mut pl, &mut iw, line);
        fs.prev_line = pl;
        fs.iwthabs = iw;
        Ok(fs.proto.code.len() as i32 - 1)
    }

    pub(crate) fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, String> {
        self.emit(Instruction::abc(op, a, b, c))
    }

    pub(crate) fn emit_abck(
        &mut self,
        op: OpCode,
        a: u32,
        b: u32,
        c: u32,
        k: bool,
    ) -> Result<i32, String> {
        self.emit(Instruction::abck(op, a, b, c, k))
    }

    pub(crate) fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32) -> Result<i32, String> {
        self.emit(Instruction::abx(op, a, bx))
    }

    pub(crate) fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> Result<i32, String> {
        self.emit(Instruction::asbx(op, a, sbx))
    }

    pub(crate) fn emit_extraarg(&mut self, ax: u32) -> Result<i32, String> {
        self.emit(Instruction::ax_(OpCode::ExtraArg, ax))
    }

    pub(crate) fn emit_return(&mut self, first: u32, nret: u32) -> Result<i32, String> {
        self.emit_abc(OpCode::Return, first, nret + 1, 0)
    }

    // ---- jumps ----

    pub(crate) fn emit_jump(&mut self) -> Result<i32, String> {
        self.emit(Instruction::sj_(OpCode::Jmp, NO_JUMP))
    }

    /// Destination of the jump at `pc`, or NO_JUMP at a list end.
    fn get_jump(&self, pc: i32) -> i32 {
        let off = Instruction::sj(self.fs_ref().proto.code[pc as usize]);
        if off == NO_JUMP { NO_JUMP } else { pc + 1 + off }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), String> {
        let offset = dest - (pc + 1);
        if offset.abs() > Instruction::OFFSET_SJ {
            return Err(self.lx.error("control structure too long"));
        }
        Instruction::set_sj(&mut self.fs().proto.code[pc as usize], offset);
        Ok(())
    }

    /// Appends jump list `l2` onto `*l1`.
    pub(crate) fn concat_jump(&mut self, l1: &mut i32, l2: i32) -> Result<(), String> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2)
    }

    /// Marks here as a jump target, pinning instruction merges.
    pub(crate) fn get_label(&mut self) -> i32 {
        let fs = self.fs();
        fs.last_target = fs.pc();
        fs.last_target
    }

    pub(crate) fn patch_list(&mut self, list: i32, target: i32) -> Result<(), String> {
        self.patch_list_aux(list, target, NO_REG, target)
    }

    pub(crate) fn patch_to_here(&mut self, list: i32) -> Result<(), String> {
        let here = self.get_label();
        self.patch_list(list, here)
    }

    /// Patches a whole list: jumps producing a value go to `vtarget`
    /// (their TESTSET gains the result register), the rest to `dtarget`.
    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u32,
        dtarget: i32,
    ) -> Result<(), String> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget)?;
            } else {
                self.fix_jump(list, dtarget)?;
            }
            list = next;
        }
        Ok(())
    }

    /// Instruction controlling the jump at `pc` (the test right before
    /// it, if any).
    fn jump_control(&self, pc: i32) -> usize {
        let code = &self.fs_ref().proto.code;
        if pc >= 1 && is_test_op(Instruction::opcode(code[pc as usize - 1])) {
            pc as usize - 1
        } else {
            pc as usize
        }
    }

    /// Redirects a TESTSET's destination register; converts to TEST when
    /// no value is wanted. False when the jump is not value-producing.
    fn patch_test_reg(&mut self, node: i32, reg: u32) -> bool {
        let ipos = self.jump_control(node);
        let inst = self.fs_ref().proto.code[ipos];
        if Instruction::opcode(inst) != OpCode::TestSet {
            return false;
        }
        let b = Instruction::b(inst) as u32;
        if reg != NO_REG && reg != b {
            Instruction::set_a(&mut self.fs().proto.code[ipos], reg);
        } else {
            // Value not wanted (or already there): plain test.
            self.fs().proto.code[ipos] =
                Instruction::abck(OpCode::Test, b, 0, 0, Instruction::k(inst));
        }
        true
    }

    /// Any jump in the list that cannot deliver a value through TESTSET?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let inst = self.fs_ref().proto.code[self.jump_control(list)];
            if Instruction::opcode(inst) != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    // ---- registers ----

    pub(crate) fn reserve_regs(&mut self, n: usize) -> Result<(), String> {
        let new_free = self.fs_ref().freereg as usize + n;
        self.check_reg_limit(new_free)?;
        let fs = self.fs();
        fs.freereg = new_free as u8;
        if new_free > fs.proto.max_stack_size as usize {
            fs.proto.max_stack_size = new_free as u8;
        }
        Ok(())
    }

    fn free_reg(&mut self, r: u32) {
        let level = self.reg_level(self.fs_ref().nactvar) as u32;
        if r >= level {
            self.fs().freereg -= 1;
            debug_assert_eq!(self.fs_ref().freereg as u32, r, "register free out of order");
        }
    }

    pub(crate) fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.k {
            self.free_reg(r);
        }
    }

    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        match (&e1.k, &e2.k) {
            (ExpKind::NonReloc(r1), ExpKind::NonReloc(r2)) => {
                if r1 > r2 {
                    self.free_reg(*r1);
                    self.free_reg(*r2);
                } else {
                    self.free_reg(*r2);
                    self.free_reg(*r1);
                }
            }
            _ => {
                self.free_exp(e1);
                self.free_exp(e2);
            }
        }
    }

    // ---- constant pool ----

    fn add_constant(&mut self, key: KKey, v: LuaValue) -> u32 {
        let fs = self.fs();
        if let Some(&idx) = fs.kmap.get(&key) {
            return idx;
        }
        let idx = fs.proto.constants.len() as u32;
        fs.proto.constants.push(v);
        fs.kmap.insert(key, idx);
        idx
    }

    pub(crate) fn string_k(&mut self, id: StringId) -> u32 {
        let v = self.str_id_value(id);
        self.add_constant(KKey::Str(id), v)
    }

    pub(crate) fn int_k(&mut self, i: i64) -> u32 {
        self.add_constant(KKey::Int(i), LuaValue::integer(i))
    }

    pub(crate) fn float_k(&mut self, f: f64) -> u32 {
        self.add_constant(KKey::FloatBits(f.to_bits()), LuaValue::float(f))
    }

    fn nil_k(&mut self) -> u32 {
        self.add_constant(KKey::Nil, LuaValue::nil())
    }

    fn bool_k(&mut self, b: bool) -> u32 {
        self.add_constant(KKey::Bool(b), LuaValue::boolean(b))
    }

    /// Pool index of any constant-kind expression.
    fn const_k(&mut self, e: &ExpDesc) -> Option<u32> {
        Some(match e.k {
            ExpKind::Nil => self.nil_k(),
            ExpKind::True => self.bool_k(true),
            ExpKind::False => self.bool_k(false),
            ExpKind::KInt(i) => self.int_k(i),
            ExpKind::KFlt(f) => self.float_k(f),
            ExpKind::KStr(id) => self.string_k(id),
            ExpKind::K(k) => k,
            _ => return None,
        })
    }

    // ---- discharging expressions into registers ----

    /// Resolves variable reads into concrete instructions.
    pub(crate) fn discharge_vars(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        match e.k {
            ExpKind::Local { ridx, .. } => {
                e.k = ExpKind::NonReloc(ridx);
            }
            ExpKind::Upval(i) => {
                let pc = self.emit_abc(OpCode::GetUpval, 0, i, 0)?;
                e.k = ExpKind::Reloc(pc);
            }
            ExpKind::IndexUp { t, idx } => {
                let pc = self.emit_abc(OpCode::GetTabUp, 0, t, idx)?;
                e.k = ExpKind::Reloc(pc);
            }
            ExpKind::IndexI { t, idx } => {
                self.free_reg(t);
                let pc = self.emit_abc(OpCode::GetI, 0, t, idx as u32)?;
                e.k = ExpKind::Reloc(pc);
            }
            ExpKind::IndexStr { t, idx } => {
                self.free_reg(t);
                let pc = self.emit_abc(OpCode::GetField, 0, t, idx)?;
                e.k = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed { t, idx } => {
                if idx > t {
                    self.free_reg(idx);
                    self.free_reg(t);
                } else {
                    self.free_reg(t);
                    self.free_reg(idx);
                }
                let pc = self.emit_abc(OpCode::GetTable, 0, t, idx)?;
                e.k = ExpKind::Reloc(pc);
            }
            ExpKind::Call(_) => {
                self.set_one_ret(e);
            }
            ExpKind::Vararg(pc) => {
                Instruction::set_c(&mut self.fs().proto.code[pc as usize], 2);
                e.k = ExpKind::Reloc(pc);
            }
            _ => {}
        }
        Ok(())
    }

    /// LOADNIL with merge into an adjacent previous LOADNIL.
    fn emit_nil(&mut self, from: u32, n: u32) -> Result<(), String> {
        let fs = self.fs_ref();
        if fs.pc() > fs.last_target && fs.pc() > 0 {
            let prev_pc = fs.pc() as usize - 1;
            let prev = fs.proto.code[prev_pc];
            if Instruction::opcode(prev) == OpCode::LoadNil {
                let pfrom = Instruction::a(prev) as u32;
                let pto = pfrom + Instruction::b(prev) as u32;
                let to = from + n - 1;
                if pfrom <= from + 1 && from <= pto + 1 {
                    let nfrom = pfrom.min(from);
                    let nto = pto.max(to);
                    let code = &mut self.fs().proto.code[prev_pc];
                    Instruction::set_a(code, nfrom);
                    Instruction::set_b(code, nto - nfrom);
                    return Ok(());
                }
            }
        }
        self.emit_abc(OpCode::LoadNil, from, n - 1, 0)?;
        Ok(())
    }

    fn load_k(&mut self, reg: u32, k: u32) -> Result<(), String> {
        if k <= Instruction::MAX_BX {
            self.emit_abx(OpCode::LoadK, reg, k)?;
        } else {
            self.emit_abx(OpCode::LoadKX, reg, 0)?;
            self.emit_extraarg(k)?;
        }
        Ok(())
    }

    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), String> {
        self.discharge_vars(e)?;
        match e.k {
            ExpKind::Nil => self.emit_nil(reg, 1)?,
            ExpKind::False => {
                self.emit_abc(OpCode::LoadFalse, reg, 0, 0)?;
            }
            ExpKind::True => {
                self.emit_abc(OpCode::LoadTrue, reg, 0, 0)?;
            }
            ExpKind::KStr(id) => {
                let k = self.string_k(id);
                self.load_k(reg, k)?;
            }
            ExpKind::KInt(i) => {
                if fits_sbx(i) {
                    self.emit_asbx(OpCode::LoadI, reg, i as i32)?;
                } else {
                    let k = self.int_k(i);
                    self.load_k(reg, k)?;
                }
            }
            ExpKind::KFlt(f) => {
                let as_int = float_to_int(f, F2IMode::Exact);
                if let Some(i) = as_int.filter(|&i| fits_sbx(i)) {
                    self.emit_asbx(OpCode::LoadF, reg, i as i32)?;
                } else {
                    let k = self.float_k(f);
                    self.load_k(reg, k)?;
                }
            }
            ExpKind::K(k) => self.load_k(reg, k)?,
            ExpKind::Reloc(pc) => {
                Instruction::set_a(&mut self.fs().proto.code[pc as usize], reg);
            }
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.emit_abc(OpCode::Move, reg, r, 0)?;
                }
            }
            ExpKind::Jmp(_) => return Ok(()),
            ExpKind::Void | ExpKind::Call(_) | ExpKind::Vararg(_) => {
                unreachable!("expression not dischargeable")
            }
            _ => unreachable!("variable kinds are discharged above"),
        }
        e.k = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        if !matches!(e.k, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.fs_ref().freereg as u32 - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    /// Materializes `e` into the next free register.
    pub(crate) fn exp2nextreg(&mut self, e: &mut ExpDesc) -> Result<u32, String> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.fs_ref().freereg as u32 - 1;
        self.exp2reg(e, reg)?;
        Ok(reg)
    }

    /// Materializes `e` into some register and returns it.
    pub(crate) fn exp2anyreg(&mut self, e: &mut ExpDesc) -> Result<u32, String> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc(r) = e.k {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.reg_level(self.fs_ref().nactvar) as u32 {
                self.exp2reg(e, r)?;
                return Ok(r);
            }
        }
        self.exp2nextreg(e)
    }

    /// Like exp2anyreg but upvalues may stay as upvalues.
    pub(crate) fn exp2anyregup(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        if !matches!(e.k, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp2anyreg(e)?;
        }
        Ok(())
    }

    /// Values without register pressure: constants stay constants.
    pub(crate) fn exp2val(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        if e.has_jumps() {
            self.exp2anyreg(e)?;
        } else {
            self.discharge_vars(e)?;
        }
        Ok(())
    }

    /// The full materialization: value plus pending true/false jumps.
    pub(crate) fn exp2reg(&mut self, e: &mut ExpDesc, reg: u32) -> Result<(), String> {
        self.discharge_to_reg(e, reg)?;
        if let ExpKind::Jmp(pc) = e.k {
            let mut t = e.t;
            self.concat_jump(&mut t, pc)?;
            e.t = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.k, ExpKind::Jmp(_)) { NO_JUMP } else { self.emit_jump()? };
                self.get_label();
                p_f = self.emit_abc(OpCode::LFalseSkip, reg, 0, 0)?;
                self.get_label();
                p_t = self.emit_abc(OpCode::LoadTrue, reg, 0, 0)?;
                self.patch_to_here(fj)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, p_f)?;
            self.patch_list_aux(e.t, end, reg, p_t)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.k = ExpKind::NonReloc(reg);
        Ok(())
    }

    // ---- multiple results ----

    pub(crate) fn set_returns(&mut self, e: &mut ExpDesc, nresults: i32) -> Result<(), String> {
        match e.k {
            ExpKind::Call(pc) => {
                Instruction::set_c(&mut self.fs().proto.code[pc as usize], (nresults + 1) as u32);
            }
            ExpKind::Vararg(pc) => {
                let freereg = self.fs_ref().freereg as u32;
                let code = &mut self.fs().proto.code[pc as usize];
                Instruction::set_c(code, (nresults + 1) as u32);
                Instruction::set_a(code, freereg);
                self.reserve_regs(1)?;
            }
            _ => debug_assert!(false, "set_returns on a single-value expression"),
        }
        Ok(())
    }

    pub(crate) fn set_multret(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        self.set_returns(e, MULTRET)
    }

    pub(crate) fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.k {
            ExpKind::Call(pc) => {
                let a = Instruction::a(self.fs_ref().proto.code[pc as usize]);
                e.k = ExpKind::NonReloc(a as u32);
            }
            ExpKind::Vararg(pc) => {
                Instruction::set_c(&mut self.fs().proto.code[pc as usize], 2);
                e.k = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    // ---- stores ----

    pub(crate) fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> Result<(), String> {
        match var.k {
            ExpKind::Local { ridx, .. } => {
                self.free_exp(ex);
                self.exp2reg(ex, ridx)?;
            }
            ExpKind::Upval(i) => {
                let r = self.exp2anyreg(ex)?;
                self.emit_abc(OpCode::SetUpval, r, i, 0)?;
                self.free_exp(ex);
            }
            ExpKind::IndexUp { t, idx } => {
                let r = self.exp2anyreg(ex)?;
                self.emit_abc(OpCode::SetTabUp, t, idx, r)?;
                self.free_exp(ex);
            }
            ExpKind::IndexI { t, idx } => {
                let r = self.exp2anyreg(ex)?;
                self.emit_abc(OpCode::SetI, t, idx as u32, r)?;
                self.free_exp(ex);
            }
            ExpKind::IndexStr { t, idx } => {
                let r = self.exp2anyreg(ex)?;
                self.emit_abc(OpCode::SetField, t, idx, r)?;
                self.free_exp(ex);
            }
            ExpKind::Indexed { t, idx } => {
                let r = self.exp2anyreg(ex)?;
                self.emit_abc(OpCode::SetTable, t, idx, r)?;
                self.free_exp(ex);
            }
            _ => unreachable!("store into non-variable"),
        }
        Ok(())
    }

    /// `e:key(...)`: emits SELF, leaving receiver+method in two fresh
    /// registers.
    pub(crate) fn self_op(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> Result<(), String> {
        let ereg = self.exp2anyreg(e)?;
        self.free_exp(e);
        let base = self.fs_ref().freereg as u32;
        self.reserve_regs(2)?;
        if let ExpKind::KStr(id) = key.k {
            let kidx = self.string_k(id);
            if kidx <= Instruction::MAX_C {
                self.emit_abck(OpCode::SelfOp, base, ereg, kidx, true)?;
                e.k = ExpKind::NonReloc(base);
                return Ok(());
            }
        }
        let kreg = self.exp2anyreg(key)?;
        self.emit_abc(OpCode::SelfOp, base, ereg, kreg)?;
        self.free_exp(key);
        e.k = ExpKind::NonReloc(base);
        Ok(())
    }

    // ---- indexing ----

    /// Folds `t[k]` into the narrowest indexed descriptor.
    pub(crate) fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> Result<(), String> {
        debug_assert!(!t.has_jumps());
        if let (ExpKind::Upval(u), ExpKind::KStr(id)) = (t.k, k.k) {
            let kidx = self.string_k(id);
            if kidx <= Instruction::MAX_C {
                t.k = ExpKind::IndexUp { t: u, idx: kidx };
                return Ok(());
            }
        }
        let treg = self.exp2anyreg(t)?;
        match k.k {
            ExpKind::KStr(id) => {
                let kidx = self.string_k(id);
                if kidx <= Instruction::MAX_C {
                    t.k = ExpKind::IndexStr { t: treg, idx: kidx };
                    return Ok(());
                }
            }
            ExpKind::KInt(i) if (0..=Instruction::MAX_C as i64).contains(&i) => {
                t.k = ExpKind::IndexI { t: treg, idx: i };
                return Ok(());
            }
            _ => {}
        }
        let kreg = self.exp2anyreg(k)?;
        t.k = ExpKind::Indexed { t: treg, idx: kreg };
        Ok(())
    }

    // ---- boolean control flow ----

    fn negate_condition(&mut self, pc: i32) {
        let ipos = self.jump_control(pc);
        let inst = &mut self.fs().proto.code[ipos];
        debug_assert!(is_test_op(Instruction::opcode(*inst)));
        let k = Instruction::k(*inst);
        Instruction::set_k(inst, !k);
    }

    /// Emits a conditional test on `e`'s truth, returning the jump taken
    /// when the truth equals `cond`.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> Result<i32, String> {
        if let ExpKind::Reloc(pc) = e.k {
            let inst = self.fs_ref().proto.code[pc as usize];
            if Instruction::opcode(inst) == OpCode::Not && pc == self.fs_ref().pc() - 1 {
                // `not x` folds into the inverted test on x.
                let b = Instruction::b(inst) as u32;
                let fs = self.fs();
                fs.proto.code.truncate(pc as usize);
                fs.proto.line_info.truncate(pc as usize);
                while fs
                    .proto
                    .abs_line_info
                    .last()
                    .map(|a| a.pc as usize >= pc as usize)
                    .unwrap_or(false)
                {
                    fs.proto.abs_line_info.pop();
                }
                self.emit_abck(OpCode::Test, b, 0, 0, !cond)?;
                return self.emit_jump();
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let ExpKind::NonReloc(r) = e.k else { unreachable!() };
        self.emit_abck(OpCode::TestSet, NO_REG, r, 0, cond)?;
        self.emit_jump()
    }

    /// Control flow for `e and ...`: falls through on true.
    pub(crate) fn go_if_true(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        self.discharge_vars(e)?;
        let pc_false = match e.k {
            ExpKind::Jmp(pc) => {
                self.negate_condition(pc);
                pc
            }
            ExpKind::K(_)
            | ExpKind::KFlt(_)
            | ExpKind::KInt(_)
            | ExpKind::KStr(_)
            | ExpKind::True => NO_JUMP,
            _ => self.jump_on_cond(e, false)?,
        };
        let mut f = e.f;
        self.concat_jump(&mut f, pc_false)?;
        e.f = f;
        self.patch_to_here(e.t)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Control flow for `e or ...`: falls through on false.
    pub(crate) fn go_if_false(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        self.discharge_vars(e)?;
        let pc_true = match e.k {
            ExpKind::Jmp(pc) => pc,
            ExpKind::Nil | ExpKind::False => NO_JUMP,
            _ => self.jump_on_cond(e, true)?,
        };
        let mut t = e.t;
        self.concat_jump(&mut t, pc_true)?;
        e.t = t;
        self.patch_to_here(e.f)?;
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        match e.k {
            ExpKind::Nil | ExpKind::False => e.k = ExpKind::True,
            ExpKind::K(_)
            | ExpKind::KFlt(_)
            | ExpKind::KInt(_)
            | ExpKind::KStr(_)
            | ExpKind::True => e.k = ExpKind::False,
            ExpKind::Jmp(pc) => self.negate_condition(pc),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let ExpKind::NonReloc(r) = e.k else { unreachable!() };
                let pc = self.emit_abc(OpCode::Not, 0, r, 0)?;
                e.k = ExpKind::Reloc(pc);
            }
            _ => unreachable!("not on undischarged expression"),
        }
        // Interchange true and false lists; jumps no longer produce
        // values.
        std::mem::swap(&mut e.t, &mut e.f);
        let (t, f) = (e.t, e.f);
        self.remove_values(t);
        self.remove_values(f);
        Ok(())
    }

    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    // ---- operators ----

    pub(crate) fn prefix(&mut self, op: UnOpr, e: &mut ExpDesc) -> Result<(), String> {
        match op {
            UnOpr::Minus => {
                if let Some(v) = e.as_number() {
                    match fold_unm(v) {
                        Some(k) => {
                            e.k = k;
                            return Ok(());
                        }
                        None => {}
                    }
                }
                self.discharge_vars(e)?;
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let ExpKind::NonReloc(r) = e.k else { unreachable!() };
                let pc = self.emit_abc(OpCode::Unm, 0, r, 0)?;
                e.k = ExpKind::Reloc(pc);
            }
            UnOpr::BNot => {
                if let Some(i) = e.as_number().and_then(FoldValue::as_int_exact) {
                    e.k = ExpKind::KInt(!i);
                    return Ok(());
                }
                self.discharge_vars(e)?;
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let ExpKind::NonReloc(r) = e.k else { unreachable!() };
                let pc = self.emit_abc(OpCode::BNot, 0, r, 0)?;
                e.k = ExpKind::Reloc(pc);
            }
            UnOpr::Not => {
                self.discharge_vars(e)?;
                self.code_not(e)?;
            }
            UnOpr::Len => {
                self.discharge_vars(e)?;
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                let ExpKind::NonReloc(r) = e.k else { unreachable!() };
                let pc = self.emit_abc(OpCode::Len, 0, r, 0)?;
                e.k = ExpKind::Reloc(pc);
            }
        }
        Ok(())
    }

    /// Prepares the left operand before the right side is parsed.
    pub(crate) fn infix(&mut self, op: BinOpr, e: &mut ExpDesc) -> Result<(), String> {
        match op {
            BinOpr::And => self.go_if_true(e)?,
            BinOpr::Or => self.go_if_false(e)?,
            BinOpr::Concat => {
                self.exp2nextreg(e)?;
            }
            BinOpr::Eq | BinOpr::Ne => {
                if !e.is_const() {
                    self.exp2anyreg(e)?;
                }
            }
            _ => {
                if e.as_number().is_none() {
                    self.exp2anyreg(e)?;
                }
            }
        }
        Ok(())
    }

    /// Combines the operands once both are parsed.
    pub(crate) fn posfix(
        &mut self,
        op: BinOpr,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
    ) -> Result<(), String> {
        match op {
            BinOpr::And => {
                debug_assert!(e1.t == NO_JUMP);
                self.discharge_vars(e2)?;
                let mut f = e2.f;
                self.concat_jump(&mut f, e1.f)?;
                e2.f = f;
                *e1 = *e2;
            }
            BinOpr::Or => {
                debug_assert!(e1.f == NO_JUMP);
                self.discharge_vars(e2)?;
                let mut t = e2.t;
                self.concat_jump(&mut t, e1.t)?;
                e2.t = t;
                *e1 = *e2;
            }
            BinOpr::Concat => self.code_concat(e1, e2)?,
            BinOpr::Eq | BinOpr::Ne => self.code_eq(op, e1, e2)?,
            BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge => self.code_order(op, e1, e2)?,
            _ => {
                if let Some(folded) = const_fold(op, e1, e2) {
                    e1.k = folded;
                } else {
                    self.code_arith(op, e1, e2)?;
                }
            }
        }
        Ok(())
    }

    fn code_concat(&mut self, e1: &mut ExpDesc, e2: &mut ExpDesc) -> Result<(), String> {
        let ExpKind::NonReloc(r1) = e1.k else {
            unreachable!("concat left operand not materialized")
        };
        // Merge into a pending CONCAT when operands are adjacent.
        if let ExpKind::NonReloc(r2) = e2.k {
            let fs = self.fs_ref();
            if fs.pc() > 0 {
                let prev_pc = fs.pc() as usize - 1;
                let prev = fs.proto.code[prev_pc];
                if Instruction::opcode(prev) == OpCode::Concat
                    && Instruction::a(prev) as u32 == r1 + 1
                    && r2 >= r1 + 1
                {
                    let n = Instruction::b(prev);
                    self.free_exp(e2);
                    let code = &mut self.fs().proto.code[prev_pc];
                    Instruction::set_a(code, r1);
                    Instruction::set_b(code, n as u32 + 1);
                    e1.k = ExpKind::NonReloc(r1);
                    return Ok(());
                }
            }
        }
        self.exp2nextreg(e2)?;
        self.free_exp(e2);
        self.emit_abc(OpCode::Concat, r1, 2, 0)?;
        e1.k = ExpKind::NonReloc(r1);
        Ok(())
    }

    fn code_arith(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> Result<(), String> {
        let mut flip = false;
        if e1.as_number().is_some() && !matches!(e1.k, ExpKind::NonReloc(_)) {
            if op.commutative() {
                std::mem::swap(e1, e2);
                flip = true;
            } else {
                self.exp2anyreg(e1)?;
            }
        }
        let (gen_op, tm) = op.arith_op().expect("arith operator");

        // Immediate forms.
        if let ExpKind::KInt(i) = e2.k {
            match op {
                BinOpr::Add if Instruction::fits_sc(i) => {
                    return self.finish_bin_imm(OpCode::AddI, e1, i, tm, flip);
                }
                BinOpr::Shr if Instruction::fits_sc(i) => {
                    return self.finish_bin_imm(OpCode::ShrI, e1, i, tm, flip);
                }
                BinOpr::Shl if Instruction::fits_sc(-i) && Instruction::fits_sc(i) => {
                    // Left shift by k == right shift by -k; the bridge
                    // still carries the original operand.
                    let r1 = self.exp2anyreg(e1)?;
                    self.free_exp(e1);
                    let pc =
                        self.emit_abc(OpCode::ShrI, 0, r1, sc_encode(-i))?;
                    self.emit_abck(OpCode::MmBinI, r1, sc_encode(i), TmKind::Shl as u32, false)?;
                    e1.k = ExpKind::Reloc(pc);
                    return Ok(());
                }
                _ => {}
            }
        }
        if op == BinOpr::Shl {
            if let ExpKind::KInt(i) = e1.k {
                if Instruction::fits_sc(i) {
                    // Immediate shifted by a register: SHLI.
                    let r2 = self.exp2anyreg(e2)?;
                    self.free_exp(e2);
                    let pc = self.emit_abc(OpCode::ShlI, 0, r2, sc_encode(i))?;
                    self.emit_abck(OpCode::MmBinI, r2, sc_encode(i), TmKind::Shl as u32, true)?;
                    e1.k = ExpKind::Reloc(pc);
                    return Ok(());
                }
            }
        }

        // K forms: second operand folded into the constant pool.
        if let Some(kop) = op.k_op() {
            let k_ok = match e2.k {
                ExpKind::KInt(_) => true,
                ExpKind::KFlt(_) => !op.int_only(),
                _ => false,
            };
            if k_ok {
                let kidx = self.const_k(e2).expect("constant operand");
                if kidx <= Instruction::MAX_C {
                    let r1 = self.exp2anyreg(e1)?;
                    self.free_exp(e1);
                    let pc = self.emit_abc(kop, 0, r1, kidx)?;
                    self.emit_abck(OpCode::MmBinK, r1, kidx, tm as u32, flip)?;
                    e1.k = ExpKind::Reloc(pc);
                    return Ok(());
                }
            }
        }

        // Generic register form. The bridge's k flag restores source
        // operand order for the metamethod when a commutative swap
        // happened.
        let r1 = self.exp2anyreg(e1)?;
        let r2 = self.exp2anyreg(e2)?;
        self.free_exps(e1, e2);
        let pc = self.emit_abc(gen_op, 0, r1, r2)?;
        self.emit_abck(OpCode::MmBin, r1, r2, tm as u32, flip)?;
        e1.k = ExpKind::Reloc(pc);
        Ok(())
    }

    fn finish_bin_imm(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        imm: i64,
        tm: TmKind,
        flip: bool,
    ) -> Result<(), String> {
        let r1 = self.exp2anyreg(e1)?;
        self.free_exp(e1);
        let pc = self.emit_abc(op, 0, r1, sc_encode(imm))?;
        // The bridge carries the immediate in its signed B field.
        self.emit_abck(OpCode::MmBinI, r1, sc_encode(imm), tm as u32, flip)?;
        e1.k = ExpKind::Reloc(pc);
        Ok(())
    }

    fn code_eq(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> Result<(), String> {
        let k = op == BinOpr::Eq;
        if !matches!(e1.k, ExpKind::NonReloc(_)) {
            // Left side was constant: equality is symmetric.
            std::mem::swap(e1, e2);
        }
        let r1 = self.exp2anyreg(e1)?;
        let jmp = if let ExpKind::KInt(i) = e2.k {
            if Instruction::fits_sc(i) {
                self.free_exp(e1);
                self.emit_abck(OpCode::EqI, r1, sc_encode(i), 0, k)?;
                self.emit_jump()?
            } else {
                self.code_eq_k_or_reg(e1, e2, r1, k)?
            }
        } else {
            self.code_eq_k_or_reg(e1, e2, r1, k)?
        };
        e1.k = ExpKind::Jmp(jmp);
        Ok(())
    }

    fn code_eq_k_or_reg(
        &mut self,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        r1: u32,
        k: bool,
    ) -> Result<i32, String> {
        if e2.is_const() {
            if let Some(kidx) = self.const_k(e2) {
                if kidx <= Instruction::MAX_B {
                    self.free_exp(e1);
                    self.emit_abck(OpCode::EqK, r1, kidx, 0, k)?;
                    return self.emit_jump();
                }
            }
        }
        let r2 = self.exp2anyreg(e2)?;
        self.free_exps(e1, e2);
        self.emit_abck(OpCode::Eq, r1, r2, 0, k)?;
        self.emit_jump()
    }

    fn code_order(&mut self, op: BinOpr, e1: &mut ExpDesc, e2: &mut ExpDesc) -> Result<(), String> {
        // Normalize: a > b is b < a, a >= b is b <= a. Descriptors are
        // plain values, so work on copies and write the result into e1.
        let (le, mut lhs, mut rhs) = match op {
            BinOpr::Lt => (false, *e1, *e2),
            BinOpr::Le => (true, *e1, *e2),
            BinOpr::Gt => (false, *e2, *e1),
            BinOpr::Ge => (true, *e2, *e1),
            _ => unreachable!(),
        };
        // Immediate form when one side is a small integer against a
        // register.
        if let ExpKind::KInt(i) = rhs.k {
            if Instruction::fits_sc(i) && matches!(lhs.k, ExpKind::NonReloc(_)) {
                let ExpKind::NonReloc(r) = lhs.k else { unreachable!() };
                self.free_exp(&lhs);
                let iop = if le { OpCode::LeI } else { OpCode::LtI };
                self.emit_abck(iop, r, sc_encode(i), 0, true)?;
                let jmp = self.emit_jump()?;
                *e1 = ExpDesc { k: ExpKind::Jmp(jmp), t: NO_JUMP, f: NO_JUMP };
                return Ok(());
            }
        }
        if let ExpKind::KInt(i) = lhs.k {
            if Instruction::fits_sc(i) && matches!(rhs.k, ExpKind::NonReloc(_)) {
                // k < r  compiled as  r > k.
                let ExpKind::NonReloc(r) = rhs.k else { unreachable!() };
                self.free_exp(&rhs);
                let iop = if le { OpCode::GeI } else { OpCode::GtI };
                self.emit_abck(iop, r, sc_encode(i), 0, true)?;
                let jmp = self.emit_jump()?;
                *e1 = ExpDesc { k: ExpKind::Jmp(jmp), t: NO_JUMP, f: NO_JUMP };
                return Ok(());
            }
        }
        let r1 = self.exp2anyreg(&mut lhs)?;
        let r2 = self.exp2anyreg(&mut rhs)?;
        self.free_exps(&lhs, &rhs);
        let cop = if le { OpCode::Le } else { OpCode::Lt };
        self.emit_abck(cop, r1, r2, 0, true)?;
        let jmp = self.emit_jump()?;
        *e1 = ExpDesc { k: ExpKind::Jmp(jmp), t: NO_JUMP, f: NO_JUMP };
        Ok(())
    }

    // ---- table constructor sizing ----

    /// Patches a NEWTABLE/EXTRAARG pair with the final size hints.
    pub(crate) fn set_table_size(
        &mut self,
        pc: i32,
        asize: usize,
        hsize: usize,
    ) -> Result<(), String> {
        let b = if hsize > 0 { ceil_log2(hsize) as u32 + 1 } else { 0 };
        let c = (asize % (Instruction::MAX_C as usize + 1)) as u32;
        let extra = (asize / (Instruction::MAX_C as usize + 1)) as u32;
        let a = Instruction::a(self.fs_ref().proto.code[pc as usize]) as u32;
        self.fs().proto.code[pc as usize] =
            Instruction::abck(OpCode::NewTable, a, b, c, extra > 0);
        self.fs().proto.code[pc as usize + 1] = Instruction::ax_(OpCode::ExtraArg, extra);
        Ok(())
    }
}

#[inline]
fn fits_sbx(i: i64) -> bool {
    -(Instruction::OFFSET_SBX as i64) <= i && i <= Instruction::OFFSET_SBX as i64
}

/// Excess-encoded signed operand for the 8-bit B/C fields.
#[inline]
fn sc_encode(i: i64) -> u32 {
    debug_assert!(Instruction::fits_sc(i));
    (i + Instruction::OFFSET_SC as i64) as u32
}

fn is_test_op(op: OpCode) -> bool {
    use OpCode::*;
    matches!(op, Eq | Lt | Le | EqK | EqI | LtI | LeI | GtI | GeI | Test | TestSet)
}

fn fold_unm(v: FoldValue) -> Option<ExpKind> {
    match v {
        FoldValue::Int(i) => Some(ExpKind::KInt(i.wrapping_neg())),
        FoldValue::Float(f) => {
            let r = -f;
            if ok_fold_result(r) { Some(ExpKind::KFlt(r)) } else { None }
        }
    }
}

/// Folded float results must be well-behaved: no NaN, no minus zero
/// (those are left for the runtime to produce).
fn ok_fold_result(f: f64) -> bool {
    !f.is_nan() && !(f == 0.0 && f.is_sign_negative())
}

fn const_fold(op: BinOpr, e1: &ExpDesc, e2: &ExpDesc) -> Option<ExpKind> {
    use crate::vm::execute::arith::{floor_div, floor_mod, shift_left};
    let v1 = e1.as_number()?;
    let v2 = e2.as_number()?;
    match op {
        BinOpr::Add | BinOpr::Sub | BinOpr::Mul => {
            if let (FoldValue::Int(a), FoldValue::Int(b)) = (v1, v2) {
                return Some(ExpKind::KInt(match op {
                    BinOpr::Add => a.wrapping_add(b),
                    BinOpr::Sub => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                }));
            }
            let (a, b) = (v1.as_float(), v2.as_float());
            let r = match op {
                BinOpr::Add => a + b,
                BinOpr::Sub => a - b,
                _ => a * b,
            };
            ok_fold_result(r).then_some(ExpKind::KFlt(r))
        }
        BinOpr::Div => {
            let r = v1.as_float() / v2.as_float();
            ok_fold_result(r).then_some(ExpKind::KFlt(r))
        }
        BinOpr::Pow => {
            let r = v1.as_float().powf(v2.as_float());
            ok_fold_result(r).then_some(ExpKind::KFlt(r))
        }
        BinOpr::IDiv => match (v1, v2) {
            (FoldValue::Int(_), FoldValue::Int(0)) => None,
            (FoldValue::Int(a), FoldValue::Int(b)) => Some(ExpKind::KInt(floor_div(a, b))),
            _ => {
                let r = (v1.as_float() / v2.as_float()).floor();
                ok_fold_result(r).then_some(ExpKind::KFlt(r))
            }
        },
        BinOpr::Mod => match (v1, v2) {
            (FoldValue::Int(_), FoldValue::Int(0)) => None,
            (FoldValue::Int(a), FoldValue::Int(b)) => Some(ExpKind::KInt(floor_mod(a, b))),
            _ => {
                let (a, b) = (v1.as_float(), v2.as_float());
                let mut r = a % b;
                if r != 0.0 && (r < 0.0) != (b < 0.0) {
                    r += b;
                }
                ok_fold_result(r).then_some(ExpKind::KFlt(r))
            }
        },
        BinOpr::BAnd | BinOpr::BOr | BinOpr::BXor | BinOpr::Shl | BinOpr::Shr => {
            let a = v1.as_int_exact()?;
            let b = v2.as_int_exact()?;
            Some(ExpKind::KInt(match op {
                BinOpr::BAnd => a & b,
                BinOpr::BOr => a | b,
                BinOpr::BXor => a ^ b,
                BinOpr::Shl => shift_left(a, b),
                _ => shift_left(a, b.wrapping_neg()),
            }))
        }
        _ => None,
    }
}

fn ceil_log2(x: usize) -> usize {
    debug_assert!(x >= 1);
    (usize::BITS - (x - 1).leading_zeros()) as usize
}
