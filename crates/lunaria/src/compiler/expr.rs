// Expression parsing: operator precedence climbing over ExpDesc records,
// suffix chains (calls, indexing, method sugar), table constructors, and
// function bodies.

use crate::compiler::code::{BinOpr, UNARY_PRIORITY, UnOpr};
use crate::compiler::expdesc::{ExpDesc, ExpKind};
use crate::compiler::token::Token;
use crate::compiler::Parser;
use crate::limits::FIELDS_PER_FLUSH;
use crate::vm::opcode::{Instruction, OpCode};
use std::rc::Rc;

fn unop_of(t: &Token) -> Option<UnOpr> {
    match t {
        Token::Minus => Some(UnOpr::Minus),
        Token::Not => Some(UnOpr::Not),
        Token::Hash => Some(UnOpr::Len),
        Token::Tilde => Some(UnOpr::BNot),
        _ => None,
    }
}

fn binop_of(t: &Token) -> Option<BinOpr> {
    Some(match t {
        Token::Plus => BinOpr::Add,
        Token::Minus => BinOpr::Sub,
        Token::Star => BinOpr::Mul,
        Token::Slash => BinOpr::Div,
        Token::DSlash => BinOpr::IDiv,
        Token::Percent => BinOpr::Mod,
        Token::Caret => BinOpr::Pow,
        Token::Concat => BinOpr::Concat,
        Token::Amp => BinOpr::BAnd,
        Token::Pipe => BinOpr::BOr,
        Token::Tilde => BinOpr::BXor,
        Token::Shl => BinOpr::Shl,
        Token::Shr => BinOpr::Shr,
        Token::Eq => BinOpr::Eq,
        Token::Ne => BinOpr::Ne,
        Token::Lt => BinOpr::Lt,
        Token::Le => BinOpr::Le,
        Token::Gt => BinOpr::Gt,
        Token::Ge => BinOpr::Ge,
        Token::And => BinOpr::And,
        Token::Or => BinOpr::Or,
        _ => return None,
    })
}

impl Parser<'_> {
    pub(crate) fn expr(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        self.subexpr(e, 0)?;
        Ok(())
    }

    /// Precedence climbing; returns the operator that ended the climb.
    fn subexpr(&mut self, e: &mut ExpDesc, limit: u8) -> Result<Option<BinOpr>, String> {
        if let Some(uop) = unop_of(&self.lx.token) {
            self.lx.bump()?;
            self.subexpr(e, UNARY_PRIORITY)?;
            self.prefix(uop, e)?;
        } else {
            self.simple_exp(e)?;
        }
        let mut op = binop_of(&self.lx.token);
        while let Some(bop) = op {
            let (left, right) = bop.priority();
            if left <= limit {
                break;
            }
            self.lx.bump()?;
            self.infix(bop, e)?;
            let mut e2 = ExpDesc::void();
            let next = self.subexpr(&mut e2, right)?;
            self.posfix(bop, e, &mut e2)?;
            op = next;
        }
        Ok(op)
    }

    fn simple_exp(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        match &self.lx.token {
            Token::Int(i) => {
                *e = ExpDesc::new(ExpKind::KInt(*i));
                self.lx.bump()?;
            }
            Token::Float(f) => {
                *e = ExpDesc::new(ExpKind::KFlt(*f));
                self.lx.bump()?;
            }
            Token::Str(_) => {
                let Token::Str(bytes) = std::mem::replace(&mut self.lx.token, Token::Eof) else {
                    unreachable!()
                };
                let v = self.string_value(&bytes);
                *e = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
                self.lx.bump()?;
            }
            Token::Nil => {
                *e = ExpDesc::new(ExpKind::Nil);
                self.lx.bump()?;
            }
            Token::True => {
                *e = ExpDesc::new(ExpKind::True);
                self.lx.bump()?;
            }
            Token::False => {
                *e = ExpDesc::new(ExpKind::False);
                self.lx.bump()?;
            }
            Token::Dots => {
                if !self.fs_ref().proto.is_vararg {
                    return Err(self.lx.error_near("cannot use '...' outside a vararg function"));
                }
                let pc = self.emit_abc(OpCode::Vararg, 0, 0, 1)?;
                *e = ExpDesc::new(ExpKind::Vararg(pc));
                self.lx.bump()?;
            }
            Token::LBrace => self.constructor(e)?,
            Token::Function => {
                let line = self.line();
                self.lx.bump()?;
                self.body(e, false, line)?;
            }
            _ => self.suffixed_exp(e)?,
        }
        Ok(())
    }

    fn primary_exp(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        match &self.lx.token {
            Token::LParen => {
                let line = self.line();
                self.lx.bump()?;
                self.expr(e)?;
                self.check_match(Token::RParen, Token::LParen, line)?;
                // Parentheses truncate to a single value.
                self.discharge_vars(e)?;
            }
            Token::Name(_) => {
                let name = self.check_name()?;
                *e = self.single_var(&name)?;
            }
            _ => return Err(self.lx.error_near("unexpected symbol")),
        }
        Ok(())
    }

    pub(crate) fn suffixed_exp(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        let line = self.line();
        self.primary_exp(e)?;
        loop {
            match &self.lx.token {
                Token::Dot => {
                    self.lx.bump()?;
                    let name = self.check_name()?;
                    let v = self.string_value(name.as_bytes());
                    let mut key = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
                    self.exp2anyregup(e)?;
                    self.indexed(e, &mut key)?;
                }
                Token::LBracket => {
                    self.lx.bump()?;
                    self.exp2anyregup(e)?;
                    let mut key = ExpDesc::void();
                    self.expr(&mut key)?;
                    self.exp2val(&mut key)?;
                    self.check_next(Token::RBracket)?;
                    self.indexed(e, &mut key)?;
                }
                Token::Colon => {
                    self.lx.bump()?;
                    let name = self.check_name()?;
                    let v = self.string_value(name.as_bytes());
                    let mut key = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
                    self.self_op(e, &mut key)?;
                    self.func_args(e, line)?;
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    self.exp2nextreg(e)?;
                    self.func_args(e, line)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn func_args(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), String> {
        let ExpKind::NonReloc(base) = e.k else {
            unreachable!("callee not materialized before arguments")
        };
        let mut args = ExpDesc::void();
        match self.lx.token.clone() {
            Token::LParen => {
                self.lx.bump()?;
                if self.lx.token == Token::RParen {
                    args.k = ExpKind::Void;
                } else {
                    self.exp_list(&mut args)?;
                    if args.is_multiret() {
                        self.set_multret(&mut args)?;
                    }
                }
                self.check_match(Token::RParen, Token::LParen, line)?;
            }
            Token::Str(_) => {
                let Token::Str(bytes) = std::mem::replace(&mut self.lx.token, Token::Eof) else {
                    unreachable!()
                };
                let v = self.string_value(&bytes);
                args = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
                self.lx.bump()?;
            }
            Token::LBrace => {
                self.constructor(&mut args)?;
            }
            _ => return Err(self.lx.error_near("function arguments expected")),
        }
        let nparams = if args.is_multiret() {
            0 // open argument count
        } else {
            if !matches!(args.k, ExpKind::Void) {
                self.exp2nextreg(&mut args)?;
            }
            self.fs_ref().freereg as u32 - (base + 1) + 1
        };
        let pc = self.emit_abc(OpCode::Call, base, nparams, 2)?;
        e.k = ExpKind::Call(pc);
        e.t = crate::compiler::NO_JUMP;
        e.f = crate::compiler::NO_JUMP;
        // The call consumed its arguments; only the result slot remains.
        self.fs().freereg = base as u8 + 1;
        Ok(())
    }

    /// explist -> expr {',' expr}; leaves the last expression open in
    /// `e`, all earlier ones in consecutive registers.
    pub(crate) fn exp_list(&mut self, e: &mut ExpDesc) -> Result<usize, String> {
        let mut n = 1;
        self.expr(e)?;
        while self.test_next(&Token::Comma)? {
            self.exp2nextreg(e)?;
            self.expr(e)?;
            n += 1;
        }
        Ok(n)
    }

    /// Expression used as a condition: its false-list is the exit.
    pub(crate) fn cond(&mut self) -> Result<i32, String> {
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        if matches!(e.k, ExpKind::Nil) {
            e.k = ExpKind::False; // nil and false exit the same way
        }
        self.go_if_true(&mut e)?;
        Ok(e.f)
    }

    // ---- table constructors ----

    fn constructor(&mut self, e: &mut ExpDesc) -> Result<(), String> {
        let line = self.line();
        let reg = self.fs_ref().freereg as u32;
        self.reserve_regs(1)?;
        let pc = self.emit_abc(OpCode::NewTable, reg, 0, 0)?;
        self.emit_extraarg(0)?;
        *e = ExpDesc::new(ExpKind::NonReloc(reg));
        let mut last = ExpDesc::void(); // pending list item
        let mut na = 0usize; // committed array items
        let mut nh = 0usize;
        let mut tostore = 0usize;
        self.check_next(Token::LBrace)?;
        loop {
            if self.lx.token == Token::RBrace {
                break;
            }
            // Flush a full batch of list items.
            if tostore == FIELDS_PER_FLUSH {
                self.flush_list(reg, &mut last, &mut na, &mut tostore, false)?;
            }
            let record_field = matches!(self.lx.token, Token::Name(_))
                && matches!(self.lx.peek()?, Token::Assign);
            if record_field {
                let name = self.check_name()?;
                self.lx.bump()?; // '='
                let v = self.string_value(name.as_bytes());
                let key = ExpDesc::new(ExpKind::KStr(v.as_string_id()));
                self.rec_field(reg, key, &mut nh)?;
            } else if self.lx.token == Token::LBracket {
                self.lx.bump()?;
                let mut key = ExpDesc::void();
                self.expr(&mut key)?;
                self.exp2val(&mut key)?;
                self.check_next(Token::RBracket)?;
                self.check_next(Token::Assign)?;
                self.rec_field(reg, key, &mut nh)?;
            } else {
                // List item; the previous pending one becomes fixed.
                if !matches!(last.k, ExpKind::Void) {
                    self.exp2nextreg(&mut last)?;
                }
                self.expr(&mut last)?;
                tostore += 1;
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }
        self.check_match(Token::RBrace, Token::LBrace, line)?;
        if tostore > 0 {
            if last.is_multiret() {
                self.set_multret(&mut last)?;
                self.flush_list(reg, &mut last, &mut na, &mut tostore, true)?;
                // The open batch does not count a fixed array item.
                na = na.saturating_sub(1);
            } else {
                self.flush_list(reg, &mut last, &mut na, &mut tostore, false)?;
            }
        }
        self.set_table_size(pc, na, nh)?;
        self.fs().freereg = reg as u8 + 1;
        e.k = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn rec_field(&mut self, reg: u32, key: ExpDesc, nh: &mut usize) -> Result<(), String> {
        let free_before = self.fs_ref().freereg;
        let mut tab = ExpDesc::new(ExpKind::NonReloc(reg));
        let mut key = key;
        self.indexed(&mut tab, &mut key)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        self.store_var(&tab, &mut val)?;
        self.fs().freereg = free_before;
        *nh += 1;
        Ok(())
    }

    /// Emits a SETLIST for the accumulated list items.
    fn flush_list(
        &mut self,
        reg: u32,
        last: &mut ExpDesc,
        na: &mut usize,
        tostore: &mut usize,
        multret: bool,
    ) -> Result<(), String> {
        if !multret && !matches!(last.k, ExpKind::Void) {
            self.exp2nextreg(last)?;
        }
        *na += *tostore;
        let b = if multret { 0 } else { *tostore as u32 };
        let c_total = *na - *tostore;
        let c_low = (c_total % (Instruction::MAX_C as usize + 1)) as u32;
        let c_high = (c_total / (Instruction::MAX_C as usize + 1)) as u32;
        self.emit_abck(OpCode::SetList, reg, b, c_low, c_high > 0)?;
        if c_high > 0 {
            self.emit_extraarg(c_high)?;
        }
        *tostore = 0;
        *last = ExpDesc::void();
        self.fs().freereg = reg as u8 + 1;
        Ok(())
    }

    // ---- function bodies ----

    /// `function (...) body end`; for methods an implicit `self` leads
    /// the parameter list.
    pub(crate) fn body(
        &mut self,
        e: &mut ExpDesc,
        is_method: bool,
        line: u32,
    ) -> Result<(), String> {
        self.open_func(line, false);
        self.check_next(Token::LParen)?;
        if is_method {
            self.new_localvar(smol_str::SmolStr::new("self"), crate::compiler::VarKind::Regular)?;
            self.adjust_localvars(1);
        }
        self.par_list()?;
        self.check_next(Token::RParen)?;
        self.statlist()?;
        self.check_match(Token::End, Token::Function, line)?;
        let proto = self.close_func()?;
        let parent = self.fs();
        parent.proto.protos.push(Rc::new(proto));
        let idx = parent.proto.protos.len() as u32 - 1;
        let pc = self.emit_abx(OpCode::Closure, 0, idx)?;
        *e = ExpDesc::new(ExpKind::Reloc(pc));
        Ok(())
    }

    fn par_list(&mut self) -> Result<(), String> {
        let mut nparams = 0usize;
        let mut is_vararg = false;
        if self.lx.token != Token::RParen {
            loop {
                match &self.lx.token {
                    Token::Name(_) => {
                        let name = self.check_name()?;
                        self.new_localvar(name, crate::compiler::VarKind::Regular)?;
                        nparams += 1;
                    }
                    Token::Dots => {
                        self.lx.bump()?;
                        is_vararg = true;
                    }
                    _ => return Err(self.lx.error_near("<name> or '...' expected")),
                }
                if is_vararg || !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_localvars(nparams);
        let fs = self.fs();
        fs.proto.num_params = fs.nactvar;
        fs.proto.is_vararg = is_vararg;
        let n = self.fs_ref().nactvar as usize;
        let cur = self.fs_ref().freereg as usize;
        if n > cur {
            self.reserve_regs(n - cur)?;
        }
        if is_vararg {
            let np = self.fs_ref().proto.num_params as u32;
            self.emit_abc(OpCode::VarargPrep, np, 0, 0)?;
        }
        Ok(())
    }
}
