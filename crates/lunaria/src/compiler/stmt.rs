// Statement parsing: control structures, declarations, assignments.
// Loops and conditionals drive the jump-patch machinery; scope ends feed
// the close/tbc bookkeeping.

use crate::compiler::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use crate::compiler::token::Token;
use crate::compiler::{Parser, VarKind};
use crate::limits::MULTRET;
use crate::vm::opcode::{Instruction, OpCode};
use smol_str::SmolStr;

impl Parser<'_> {
    fn block_follow(&self, with_until: bool) -> bool {
        match self.lx.token {
            Token::Else | Token::Elseif | Token::End | Token::Eof => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    pub(crate) fn statlist(&mut self) -> Result<(), String> {
        while !self.block_follow(true) {
            if self.lx.token == Token::Return {
                self.ret_stat()?;
                return Ok(());
            }
            self.statement()?;
            // Temporaries die at statement boundaries.
            let level = self.reg_level(self.fs_ref().nactvar);
            debug_assert!(self.fs_ref().freereg >= level);
            self.fs().freereg = level;
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<(), String> {
        let line = self.line();
        match self.lx.token {
            Token::Semi => {
                self.lx.bump()?;
            }
            Token::If => self.if_stat(line)?,
            Token::While => self.while_stat(line)?,
            Token::Do => {
                self.lx.bump()?;
                self.block()?;
                self.check_match(Token::End, Token::Do, line)?;
            }
            Token::For => self.for_stat(line)?,
            Token::Repeat => self.repeat_stat(line)?,
            Token::Function => self.func_stat(line)?,
            Token::Local => {
                self.lx.bump()?;
                if self.test_next(&Token::Function)? {
                    self.local_func(line)?;
                } else {
                    self.local_stat()?;
                }
            }
            Token::DColon => {
                self.lx.bump()?;
                let name = self.check_name()?;
                self.check_next(Token::DColon)?;
                self.label_stat(name, line)?;
            }
            Token::Break => {
                self.lx.bump()?;
                self.goto_stat(SmolStr::new("break"), line)?;
            }
            Token::Goto => {
                self.lx.bump()?;
                let name = self.check_name()?;
                self.goto_stat(name, line)?;
            }
            _ => self.expr_stat()?,
        }
        Ok(())
    }

    pub(crate) fn block(&mut self) -> Result<(), String> {
        self.enter_block(false);
        self.statlist()?;
        self.leave_block()
    }

    // ---- if / while / repeat ----

    fn if_stat(&mut self, line: u32) -> Result<(), String> {
        let mut escapes = NO_JUMP;
        self.test_then_block(&mut escapes)?;
        while self.lx.token == Token::Elseif {
            self.test_then_block(&mut escapes)?;
        }
        if self.test_next(&Token::Else)? {
            self.block()?;
        }
        self.check_match(Token::End, Token::If, line)?;
        self.patch_to_here(escapes)?;
        Ok(())
    }

    fn test_then_block(&mut self, escapes: &mut i32) -> Result<(), String> {
        self.lx.bump()?; // skip 'if' or 'elseif'
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        self.check_next(Token::Then)?;
        self.go_if_true(&mut v)?;
        let condexit = v.f;
        self.enter_block(false);
        self.statlist()?;
        self.leave_block()?;
        if matches!(self.lx.token, Token::Else | Token::Elseif) {
            let j = self.emit_jump()?;
            self.concat_jump(escapes, j)?;
        }
        self.patch_to_here(condexit)?;
        Ok(())
    }

    fn while_stat(&mut self, line: u32) -> Result<(), String> {
        self.lx.bump()?; // skip 'while'
        let init = self.get_label();
        let condexit = self.cond()?;
        self.enter_block(true);
        self.check_next(Token::Do)?;
        self.block()?;
        let back = self.emit_jump()?;
        self.patch_list(back, init)?;
        self.check_match(Token::End, Token::While, line)?;
        self.leave_block()?;
        self.patch_to_here(condexit)?;
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> Result<(), String> {
        let repeat_init = self.get_label();
        self.enter_block(true); // loop
        self.enter_block(false); // scope (body locals visible in cond)
        self.lx.bump()?; // skip 'repeat'
        self.statlist()?;
        self.check_match(Token::Until, Token::Repeat, line)?;
        let mut condexit = self.cond()?;
        let (bl2_upval, bl2_nactvar) = {
            let bl = self.fs_ref().blocks.last().expect("repeat scope");
            (bl.upval, bl.nactvar)
        };
        if bl2_upval {
            // Repetition path must close the body's upvalues first.
            let exit = self.emit_jump()?;
            self.patch_to_here(condexit)?;
            let lvl = self.reg_level(bl2_nactvar);
            self.emit_abc(OpCode::Close, lvl as u32, 0, 0)?;
            condexit = self.emit_jump()?;
            self.patch_to_here(exit)?;
        }
        self.patch_list(condexit, repeat_init)?;
        self.leave_block()?; // scope
        self.leave_block()?; // loop
        Ok(())
    }

    // ---- for loops ----

    fn for_stat(&mut self, line: u32) -> Result<(), String> {
        self.lx.bump()?; // skip 'for'
        self.enter_block(true);
        let name = self.check_name()?;
        match self.lx.token {
            Token::Assign => self.for_num(name, line)?,
            Token::Comma | Token::In => self.for_list(name, line)?,
            _ => return Err(self.lx.error_near("'=' or 'in' expected")),
        }
        self.check_match(Token::End, Token::For, line)?;
        self.leave_block()
    }

    fn for_num(&mut self, name: SmolStr, _line: u32) -> Result<(), String> {
        let base = self.fs_ref().freereg as u32;
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        self.new_localvar(name, VarKind::Regular)?;
        self.lx.bump()?; // skip '='
        self.expr_to_next_reg()?; // initial
        self.check_next(Token::Comma)?;
        self.expr_to_next_reg()?; // limit
        if self.test_next(&Token::Comma)? {
            self.expr_to_next_reg()?; // step
        } else {
            self.emit_asbx(OpCode::LoadI, self.fs_ref().freereg as u32, 1)?;
            self.reserve_regs(1)?;
        }
        self.adjust_localvars(3);
        let prep = self.emit_abx(OpCode::ForPrep, base, 0)?;
        self.enter_block(false);
        self.adjust_localvars(1);
        self.reserve_regs(1)?;
        self.statlist()?;
        self.leave_block()?;
        // Back-patch both jump distances.
        let endfor = self.emit_abx(OpCode::ForLoop, base, 0)?;
        let prep_bx = (endfor - prep - 1) as u32;
        let loop_bx = (endfor - prep) as u32;
        Instruction::set_bx(&mut self.fs().proto.code[prep as usize], prep_bx);
        Instruction::set_bx(&mut self.fs().proto.code[endfor as usize], loop_bx);
        Ok(())
    }

    fn for_list(&mut self, first_name: SmolStr, _line: u32) -> Result<(), String> {
        let base = self.fs_ref().freereg as u32;
        // Control state: iterator, state, control, closing slot.
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        self.new_localvar(SmolStr::new("(for state)"), VarKind::Regular)?;
        let mut nvars = 1usize;
        self.new_localvar(first_name, VarKind::Regular)?;
        while self.test_next(&Token::Comma)? {
            let n = self.check_name()?;
            self.new_localvar(n, VarKind::Regular)?;
            nvars += 1;
        }
        self.check_next(Token::In)?;
        let mut e = ExpDesc::void();
        let nexps = self.exp_list(&mut e)?;
        self.adjust_assign(4, nexps, &mut e)?;
        self.adjust_localvars(4);
        // The closing slot may hold a to-be-closed value; the prep
        // instruction registers it at run time.
        let prep = self.emit_abx(OpCode::TForPrep, base, 0)?;
        self.enter_block(false);
        self.adjust_localvars(nvars);
        self.reserve_regs(nvars)?;
        self.statlist()?;
        self.leave_block()?;
        let call = self.emit_abc(OpCode::TForCall, base, 0, nvars as u32)?;
        let lop = self.emit_abx(OpCode::TForLoop, base + 2, 0)?;
        let prep_bx = (call - prep - 1) as u32;
        let loop_bx = (lop - prep) as u32;
        Instruction::set_bx(&mut self.fs().proto.code[prep as usize], prep_bx);
        Instruction::set_bx(&mut self.fs().proto.code[lop as usize], loop_bx);
        Ok(())
    }

    fn expr_to_next_reg(&mut self) -> Result<(), String> {
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        self.exp2nextreg(&mut e)?;
        Ok(())
    }

    // ---- functions ----

    fn func_stat(&mut self, line: u32) -> Result<(), String> {
        self.lx.bump()?; // skip 'function'
        let (mut var, is_method) = self.func_name()?;
        let mut body_exp = ExpDesc::void();
        self.body(&mut body_exp, is_method, line)?;
        self.check_readonly(&var)?;
        self.store_var(&var, &mut body_exp)?;
        Ok(())
    }

    fn func_name(&mut self) -> Result<(ExpDesc, bool), String> {
        let name = self.check_name()?;
        let mut e = self.single_var(&name)?;
        while self.lx.token == Token::Dot {
            self.lx.bump()?;
            let field = self.check_name()?;
            let v = self.string_value(field.as_bytes());
            let mut key = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
            self.exp2anyregup(&mut e)?;
            self.indexed(&mut e, &mut key)?;
        }
        let mut is_method = false;
        if self.lx.token == Token::Colon {
            self.lx.bump()?;
            let field = self.check_name()?;
            let v = self.string_value(field.as_bytes());
            let mut key = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
            self.exp2anyregup(&mut e)?;
            self.indexed(&mut e, &mut key)?;
            is_method = true;
        }
        Ok((e, is_method))
    }

    fn local_func(&mut self, line: u32) -> Result<(), String> {
        let name = self.check_name()?;
        self.new_localvar(name, VarKind::Regular)?;
        self.adjust_localvars(1); // visible inside its own body
        let mut b = ExpDesc::void();
        self.body(&mut b, false, line)?;
        self.exp2nextreg(&mut b)?;
        Ok(())
    }

    // ---- local declarations ----

    fn local_stat(&mut self) -> Result<(), String> {
        let mut nvars = 0usize;
        let mut toclose: Option<usize> = None;
        loop {
            let name = self.check_name()?;
            let kind = self.read_attrib()?;
            if kind == VarKind::Close {
                if toclose.is_some() {
                    return Err(self
                        .lx
                        .error("multiple to-be-closed variables in local list"));
                }
                toclose = Some(self.fs_ref().nactvar as usize + nvars);
            }
            self.new_localvar(name, kind)?;
            nvars += 1;
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let mut e = ExpDesc::void();
        let nexps = if self.test_next(&Token::Assign)? { self.exp_list(&mut e)? } else { 0 };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.adjust_localvars(nvars);
        if let Some(level) = toclose {
            // The variable's scope owns close duties from here on.
            let fs = self.fs();
            fs.needclose = true;
            if let Some(bl) = fs.blocks.last_mut() {
                bl.upval = true;
                bl.inside_tbc = true;
            }
            let reg = self.reg_level(level as u8);
            self.emit_abc(OpCode::Tbc, reg as u32, 0, 0)?;
        }
        Ok(())
    }

    fn read_attrib(&mut self) -> Result<VarKind, String> {
        if !self.test_next(&Token::Lt)? {
            return Ok(VarKind::Regular);
        }
        let attrib = self.check_name()?;
        self.check_next(Token::Gt)?;
        match attrib.as_str() {
            "const" => Ok(VarKind::Const),
            "close" => Ok(VarKind::Close),
            _ => Err(self.lx.error(format!("unknown attribute '{}'", attrib))),
        }
    }

    // ---- expression statements & assignment ----

    fn expr_stat(&mut self) -> Result<(), String> {
        let mut e = ExpDesc::void();
        self.suffixed_exp(&mut e)?;
        if matches!(self.lx.token, Token::Assign | Token::Comma) {
            self.rest_assign(e)?;
        } else {
            let ExpKind::Call(pc) = e.k else {
                return Err(self.lx.error_near("syntax error"));
            };
            // Call statement: discard all results.
            Instruction::set_c(&mut self.fs().proto.code[pc as usize], 1);
        }
        Ok(())
    }

    fn rest_assign(&mut self, first: ExpDesc) -> Result<(), String> {
        let mut targets = vec![first];
        while self.test_next(&Token::Comma)? {
            let mut e = ExpDesc::void();
            self.suffixed_exp(&mut e)?;
            targets.push(e);
        }
        for t in &targets {
            self.check_assignable(t)?;
            self.check_readonly(t)?;
        }
        self.check_next(Token::Assign)?;
        self.fix_assign_conflicts(&mut targets)?;
        let nvars = targets.len();
        let mut e = ExpDesc::void();
        let nexps = self.exp_list(&mut e)?;
        if nvars == 1 && nexps == 1 {
            self.store_var(&targets[0], &mut e)?;
            return Ok(());
        }
        self.adjust_assign(nvars, nexps, &mut e)?;
        // Values now occupy the top `nvars` registers; assign backwards.
        for t in targets.iter().rev() {
            let r = self.fs_ref().freereg as u32 - 1;
            let mut v = ExpDesc::new(ExpKind::NonReloc(r));
            self.store_var(t, &mut v)?;
        }
        Ok(())
    }

    fn check_assignable(&self, e: &ExpDesc) -> Result<(), String> {
        match e.k {
            ExpKind::Local { .. }
            | ExpKind::Upval(_)
            | ExpKind::Indexed { .. }
            | ExpKind::IndexUp { .. }
            | ExpKind::IndexI { .. }
            | ExpKind::IndexStr { .. } => Ok(()),
            _ => Err(self.lx.error_near("syntax error (cannot assign)")),
        }
    }

    fn check_readonly(&mut self, e: &ExpDesc) -> Result<(), String> {
        if let ExpKind::Local { vidx, .. } = e.k {
            let v = self.var_desc(self.fs.len() - 1, vidx as usize);
            if v.kind != VarKind::Regular {
                let name = v.name.clone();
                return Err(self
                    .lx
                    .error(format!("attempt to assign to const variable '{}'", name)));
            }
        }
        Ok(())
    }

    /// Multi-assignment aliasing: an indexed target whose table or key
    /// register is also a plain local target gets a private copy, so
    /// every left-hand side sees pre-assignment values.
    fn fix_assign_conflicts(&mut self, targets: &mut [ExpDesc]) -> Result<(), String> {
        let mut local_regs = Vec::new();
        for t in targets.iter() {
            if let ExpKind::Local { ridx, .. } = t.k {
                local_regs.push(ridx);
            }
        }
        if local_regs.is_empty() {
            return Ok(());
        }
        for i in 0..targets.len() {
            let mut fix = |p: &mut Parser, reg: u32| -> Result<u32, String> {
                if local_regs.contains(&reg) {
                    let new_reg = p.fs_ref().freereg as u32;
                    p.reserve_regs(1)?;
                    p.emit_abc(OpCode::Move, new_reg, reg, 0)?;
                    Ok(new_reg)
                } else {
                    Ok(reg)
                }
            };
            match &mut targets[i].k {
                ExpKind::Indexed { t, idx } => {
                    let (tv, iv) = (*t, *idx);
                    let nt = fix(self, tv)?;
                    let ni = fix(self, iv)?;
                    targets[i].k = ExpKind::Indexed { t: nt, idx: ni };
                }
                ExpKind::IndexStr { t, idx } => {
                    let (tv, iv) = (*t, *idx);
                    let nt = fix(self, tv)?;
                    targets[i].k = ExpKind::IndexStr { t: nt, idx: iv };
                }
                ExpKind::IndexI { t, idx } => {
                    let (tv, iv) = (*t, *idx);
                    let nt = fix(self, tv)?;
                    targets[i].k = ExpKind::IndexI { t: nt, idx: iv };
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub(crate) fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        e: &mut ExpDesc,
    ) -> Result<(), String> {
        let needed = nvars as i64 - nexps as i64;
        if e.is_multiret() {
            let extra = (needed + 1).max(0);
            self.set_returns(e, extra as i32)?;
        } else {
            if !matches!(e.k, ExpKind::Void) {
                self.exp2nextreg(e)?;
            }
            if needed > 0 {
                let free = self.fs_ref().freereg as u32;
                self.emit_nil_range(free, needed as u32)?;
            }
        }
        if needed > 0 {
            self.reserve_regs(needed as usize)?;
        } else {
            let fs = self.fs();
            fs.freereg = (fs.freereg as i64 + needed) as u8;
        }
        Ok(())
    }

    fn emit_nil_range(&mut self, from: u32, n: u32) -> Result<(), String> {
        self.emit_abc(OpCode::LoadNil, from, n - 1, 0)?;
        Ok(())
    }

    // ---- return ----

    fn ret_stat(&mut self) -> Result<(), String> {
        self.lx.bump()?; // skip 'return'
        let mut first = self.reg_level(self.fs_ref().nactvar) as u32;
        let nret: i32;
        if self.block_follow(true) || self.lx.token == Token::Semi {
            nret = 0;
        } else {
            let mut e = ExpDesc::void();
            let n = self.exp_list(&mut e)?;
            if e.is_multiret() {
                self.set_multret(&mut e)?;
                let inside_tbc =
                    self.fs_ref().blocks.last().map(|b| b.inside_tbc).unwrap_or(false);
                if let ExpKind::Call(pc) = e.k {
                    if n == 1 && !inside_tbc {
                        // Tail position: rewrite the CALL in place.
                        let code = &mut self.fs().proto.code[pc as usize];
                        *code = (*code & !0x7F) | OpCode::TailCall as u32;
                        debug_assert_eq!(Instruction::a(*code) as u32, first);
                    }
                }
                nret = MULTRET;
            } else if n == 1 {
                first = self.exp2anyreg(&mut e)?;
                nret = 1;
            } else {
                self.exp2nextreg(&mut e)?;
                nret = n as i32;
                debug_assert_eq!(self.fs_ref().freereg as u32, first + n as u32);
            }
        }
        if nret == MULTRET {
            self.emit_abc(OpCode::Return, first, 0, 0)?;
        } else {
            self.emit_return(first, nret as u32)?;
        }
        self.test_next(&Token::Semi)?;
        Ok(())
    }
}
